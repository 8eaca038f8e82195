//! Audit report rendering.
//!
//! Produces a self-contained HTML document: a summary table followed by one printable page
//! per control, with evidence inlined as data URIs so the file can be moved around on its own.

use crate::model::ControlResult;
use crate::storage;
use crate::summary::AuditSummary;
use anyhow::{Context, Result};
use base64::Engine;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const DEFAULT_TITLE: &str = "Security Benchmark Audit Report";

/// Renders an ordered result list to `destination` and returns the path written.
pub trait ReportSink: Send + Sync {
    fn compile(&self, results: &[ControlResult], destination: &Path) -> Result<PathBuf>;
}

pub struct HtmlReport {
    title: String,
}

impl Default for HtmlReport {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
        }
    }
}

impl HtmlReport {
    pub fn with_title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    pub fn render(&self, results: &[ControlResult], generated_on: &str) -> String {
        let summary = AuditSummary::from_results(results);
        let mut out = String::with_capacity(4096 + results.len() * 1024);

        out.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        let _ = writeln!(out, "<title>{}</title>", escape(&self.title));
        out.push_str(STYLE);
        out.push_str("</head>\n<body>\n<section class=\"page\">\n");
        let _ = writeln!(out, "<h1>{}</h1>", escape(&self.title));
        let _ = writeln!(out, "<p>Generated on: {}</p>", escape(generated_on));
        out.push_str("<h2>Audit Summary</h2>\n<table class=\"summary\">\n");
        let rows = [
            ("Total Controls", summary.total.to_string()),
            ("Passed Controls", summary.passed.to_string()),
            ("Failed Controls", summary.failed.to_string()),
            ("Pass Rate", summary.pass_rate_label()),
        ];
        for (label, value) in rows {
            let _ = writeln!(out, "<tr><th>{label}</th><td>{value}</td></tr>");
        }
        out.push_str("</table>\n</section>\n");

        for result in results {
            render_control(&mut out, result);
        }

        out.push_str("</body>\n</html>\n");
        out
    }
}

impl ReportSink for HtmlReport {
    fn compile(&self, results: &[ControlResult], destination: &Path) -> Result<PathBuf> {
        let generated_on = storage::now_local()
            .format(time::macros::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap_or_else(|_| "unknown".into());
        let html = self.render(results, &generated_on);
        std::fs::write(destination, html)
            .with_context(|| format!("write report {}", destination.display()))?;
        Ok(destination.to_path_buf())
    }
}

fn render_control(out: &mut String, result: &ControlResult) {
    let (class, label) = if result.passed {
        ("passed", "PASSED")
    } else {
        ("failed", "FAILED")
    };
    out.push_str("<section class=\"page control\">\n");
    let _ = writeln!(out, "<h2>Control: {}</h2>", escape(&result.control_id));
    let _ = writeln!(
        out,
        "<p><strong>Description:</strong> {}</p>",
        escape(&result.description)
    );
    let _ = writeln!(
        out,
        "<p><strong>Status:</strong> <span class=\"{class}\">{label}</span></p>"
    );
    let _ = writeln!(
        out,
        "<p><strong>Details:</strong> {}</p>",
        escape(&result.details)
    );
    match evidence_block(result.evidence()) {
        Ok(Some(img)) => out.push_str(&img),
        Ok(None) => out.push_str("<p class=\"note\">No evidence captured.</p>\n"),
        Err(e) => {
            let _ = writeln!(
                out,
                "<p class=\"note\">Error loading screenshot: {}</p>",
                escape(&format!("{e:#}"))
            );
        }
    }
    out.push_str("</section>\n");
}

/// Inline the evidence image. A missing or unreadable file is an error for the caller to
/// turn into a note, never a report failure.
fn evidence_block(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(Some(format!(
        "<img class=\"evidence\" alt=\"Evidence for control\" src=\"data:{};base64,{}\">\n",
        mime_for(path),
        encoded
    )))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const STYLE: &str = r#"<style>
body { font-family: Helvetica, Arial, sans-serif; margin: 1in; color: #000; }
h1 { font-size: 24pt; margin-bottom: 30px; }
h2 { font-size: 16pt; margin-bottom: 12px; }
table.summary { border-collapse: collapse; }
table.summary th, table.summary td { border: 1px solid #000; background: #d3d3d3; padding: 6px 24px 12px; text-align: center; font-weight: bold; }
.passed { color: green; font-weight: bold; }
.failed { color: red; font-weight: bold; }
.note { font-style: italic; }
img.evidence { width: 6in; max-height: 4in; object-fit: contain; }
.page { page-break-after: always; break-after: page; }
.page:last-child { page-break-after: auto; break-after: auto; }
</style>
"#;
