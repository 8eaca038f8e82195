use crate::model::Control;
use reqwest::Url;

/// Host the agent is confined to, e.g. `portal.azure.com`.
pub(crate) fn console_domain(console_url: &str) -> String {
    Url::parse(console_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| console_url.trim_end_matches('/').to_string())
}

/// Task handed to the browser agent for one control.
pub(crate) fn build_task_prompt(control: &Control, resource_name: &str, console_url: &str) -> String {
    let domain = console_domain(console_url);
    format!(
        "You are a security compliance agent checking cloud security benchmark controls.\n\
         Current control: {id} - {description}\n\
         Resource to audit: {resource_name}\n\
         Instructions:\n\
         1. You are already logged into {console_url}.\n\
         2. Navigate to the appropriate service in the console to check this control.\n\
         3. Verify if the control requirements are met for {resource_name}.\n\
         4. Return a JSON object with:\n   \
            - passed: boolean (true if control is met, false otherwise)\n   \
            - details: string (explain the findings)\n\
         5. Strictly do not visit any site other than {domain}.\n\
         Do not prefix or suffix the response with the word json and do not wrap it in code fences.\n",
        id = control.id,
        description = control.description,
    )
}

/// Second-pass prompt that reduces the agent's free text to `{passed, details}`.
pub(crate) fn build_extraction_prompt(agent_output: &str) -> String {
    format!(
        "Given the following compliance analysis result, extract a JSON object with:\n\
         - passed: boolean (true if the control is met, false otherwise)\n\
         - details: string (explain the findings)\n\
         \n\
         Text:\n\
         {agent_output}\n\
         \n\
         IMPORTANT: Return ONLY the raw JSON object without any markdown formatting, backticks, or additional text.\n"
    )
}
