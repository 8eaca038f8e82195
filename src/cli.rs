use crate::agent::{BrowserServiceClient, ChatModel, ModelCredentials, ModelProvider};
use crate::engine::Collaborators;
use crate::model::{resolve_controls, AuditConfig, Control};
use crate::orchestrator::{AuditController, RunHandle};
use crate::report::HtmlReport;
use crate::storage;
use crate::text_summary::build_text_summary;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::{Stream, StreamExt};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "compliance-audit",
    version,
    about = "Agent-driven compliance audits against a cloud console"
)]
pub struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Base URL of the browser agent service
    #[arg(long, global = true, env = "AGENT_URL", default_value = "http://127.0.0.1:9333")]
    pub agent_url: String,

    /// Console the agent is confined to
    #[arg(long, global = true, default_value = "https://portal.azure.com/")]
    pub console_url: String,

    /// Maximum browser actions per control
    #[arg(long, global = true, default_value_t = 50)]
    pub step_budget: u32,

    /// Directory that receives the per-run `audit_results_*` folders
    #[arg(long, global = true, default_value = ".")]
    pub output_root: PathBuf,

    /// Timeout for a single agent request (one control can take a while)
    #[arg(long, global = true, default_value = "15m")]
    pub agent_timeout: humantime::Duration,

    /// Timeout for a single model request
    #[arg(long, global = true, default_value = "2m")]
    pub model_timeout: humantime::Duration,

    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, global = true, env = "OPENAI_MODEL", default_value = "gpt-4")]
    pub openai_model: String,

    #[arg(long, global = true, env = "AZURE_OPENAI_KEY", hide_env_values = true)]
    pub azure_openai_key: Option<String>,

    #[arg(long, global = true, env = "AZURE_OPENAI_ENDPOINT")]
    pub azure_openai_endpoint: Option<String>,

    #[arg(long, global = true, env = "AZURE_OPENAI_DEPLOYMENT", default_value = "gpt-4o")]
    pub azure_openai_deployment: String,

    #[arg(long, global = true, default_value = "2024-10-21")]
    pub azure_api_version: String,

    /// Title printed at the top of the HTML report
    #[arg(long, global = true)]
    pub report_title: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Audit one resource from the terminal; Ctrl-C stops after the current control
    Run(RunArgs),
    /// Serve the HTTP API used by the dashboard
    Serve {
        #[arg(long, default_value = "127.0.0.1:8000")]
        listen: SocketAddr,
    },
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Name of the resource to audit
    #[arg(long)]
    pub resource: String,

    /// Benchmark file (`{"controls": [...]}`)
    #[arg(long, required_unless_present = "controls")]
    pub benchmark: Option<PathBuf>,

    /// Controls as a JSON array, used when no benchmark is given
    #[arg(long)]
    pub controls: Option<String>,

    /// Print the run outcome as JSON instead of the text summary
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let controller = build_controller(&args, cfg)?;

    match args.command {
        Command::Run(run_args) => run_audit(controller, run_args).await,
        Command::Serve { listen } => crate::server::serve(controller, listen).await,
    }
}

/// Build an `AuditConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> AuditConfig {
    AuditConfig {
        console_url: args.console_url.clone(),
        step_budget: args.step_budget,
        output_root: args.output_root.clone(),
        agent_url: args.agent_url.clone(),
        agent_timeout: Duration::from(args.agent_timeout),
        model_timeout: Duration::from(args.model_timeout),
        user_agent: format!("compliance-audit/{}", env!("CARGO_PKG_VERSION")),
    }
}

fn credentials(args: &Cli) -> ModelCredentials {
    ModelCredentials {
        openai_api_key: args.openai_api_key.clone(),
        openai_model: args.openai_model.clone(),
        azure_api_key: args.azure_openai_key.clone(),
        azure_endpoint: args.azure_openai_endpoint.clone(),
        azure_deployment: args.azure_openai_deployment.clone(),
        azure_api_version: args.azure_api_version.clone(),
    }
}

/// Wire the production collaborators: one agent service client serves as agent, evidence
/// source, and session.
fn build_controller(args: &Cli, cfg: AuditConfig) -> Result<AuditController> {
    let browser = Arc::new(BrowserServiceClient::new(&cfg)?);
    let provider = ModelProvider::select(&credentials(args))?;
    let model = Arc::new(ChatModel::new(
        provider,
        cfg.model_timeout,
        &cfg.user_agent,
    )?);
    info!(provider = ?model.provider(), "language model selected");
    let report = Arc::new(match args.report_title.as_deref() {
        Some(title) => HtmlReport::with_title(title),
        None => HtmlReport::default(),
    });

    let collaborators = Collaborators {
        agent: browser.clone(),
        model,
        capture: browser.clone(),
        report,
    };
    Ok(AuditController::new(cfg, collaborators, browser))
}

fn load_controls(args: &RunArgs) -> Result<Vec<Control>> {
    let benchmark = match args.benchmark.as_deref() {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("read benchmark {}", path.display()))?,
        ),
        None => None,
    };
    Ok(resolve_controls(
        benchmark.as_deref(),
        args.controls.as_deref(),
    )?)
}

async fn run_audit(controller: AuditController, args: RunArgs) -> Result<()> {
    let controls = load_controls(&args)?;
    let (out_tx, out_handle) = spawn_output_writer();

    if controller
        .session()
        .launch()
        .await
        .context("launch browser session")?
    {
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "Browser session opened on {}",
            controller.config().console_url
        )));
    }

    let handle = controller.start(controls, &args.resource)?;
    let _ = out_tx.send(OutputLine::Stderr(format!(
        "== Run {} ({}) ==",
        handle.run_id(),
        args.resource
    )));

    let stop_tx = out_tx.clone();
    let ctrl_c = tokio::spawn(watch_interrupts(
        interrupt_signals(),
        handle.cancel_token(),
        stop_tx,
    ));
    let progress = spawn_progress(&handle, out_tx.clone());

    let result = handle.wait().await;
    ctrl_c.abort();
    progress.abort();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            drop(out_tx);
            let _ = out_handle.await;
            return Err(e.into());
        }
    };

    if args.json {
        let out = serde_json::to_string_pretty(&outcome)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in build_text_summary(&outcome).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    let export = storage::results_path(&outcome.output_dir);
    if export.exists() {
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "Exported JSON: {}",
            export.display()
        )));
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

/// Ctrl-C presses as a stream; ends if the signal handler cannot be installed.
fn interrupt_signals() -> impl Stream<Item = ()> + Send + 'static {
    futures::stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|_| ((), ()))
    })
}

/// First interrupt stops the run after the current control; a second one exits the process.
async fn watch_interrupts<S>(
    interrupts: S,
    cancel: CancellationToken,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) where
    S: Stream<Item = ()>,
{
    if second_interrupt(interrupts, cancel, out_tx).await {
        eprintln!("Interrupted again; exiting without a report");
        std::process::exit(130);
    }
}

/// Returns true once a second interrupt arrives after the stop request.
async fn second_interrupt<S>(
    interrupts: S,
    cancel: CancellationToken,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) -> bool
where
    S: Stream<Item = ()>,
{
    futures::pin_mut!(interrupts);
    if interrupts.next().await.is_none() {
        return false;
    }
    let _ = out_tx.send(OutputLine::Stderr(
        "Stop requested; finishing the current control (Ctrl-C again to exit)".into(),
    ));
    cancel.cancel();
    interrupts.next().await.is_some()
}

/// Print PASS/FAIL lines and the control being analyzed until the run ends.
fn spawn_progress(
    handle: &RunHandle,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) -> tokio::task::JoinHandle<()> {
    let mut status_rx = handle.subscribe();
    tokio::spawn(async move {
        let mut reported = 0usize;
        let mut current: Option<String> = None;
        loop {
            let status = status_rx.borrow_and_update().clone();
            for r in status.results.iter().skip(reported) {
                let mark = if r.passed { "PASS" } else { "FAIL" };
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "{mark} {} ({:.0}%)",
                    r.control_id, status.progress_percent
                )));
            }
            reported = status.results.len();
            if status.current_control != current {
                if let Some(id) = status.current_control.as_deref() {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "Analyzing {id} ({}/{})",
                        reported + 1,
                        status.total_controls
                    )));
                }
                current = status.current_control;
            }
            if status.phase.is_terminal() || status_rx.changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_and_config() {
        let cli = Cli::try_parse_from([
            "compliance-audit",
            "--step-budget",
            "12",
            "--agent-timeout",
            "90s",
            "run",
            "--resource",
            "kv-prod",
            "--controls",
            r#"[{"id": "A"}]"#,
        ])
        .unwrap();
        let cfg = build_config(&cli);
        assert_eq!(cfg.step_budget, 12);
        assert_eq!(cfg.agent_timeout, Duration::from_secs(90));
        assert_eq!(cfg.console_url, "https://portal.azure.com/");
        assert!(cfg.user_agent.starts_with("compliance-audit/"));

        let Command::Run(run) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.resource, "kv-prod");
        assert_eq!(load_controls(&run).unwrap(), vec![Control::new("A", "No description provided")]);
    }

    #[test]
    fn run_requires_a_control_source() {
        assert!(Cli::try_parse_from(["compliance-audit", "run", "--resource", "vm"]).is_err());
    }

    #[test]
    fn serve_defaults_to_local_port_8000() {
        let cli = Cli::try_parse_from(["compliance-audit", "serve"]).unwrap();
        match cli.command {
            Command::Serve { listen } => assert_eq!(listen.to_string(), "127.0.0.1:8000"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn benchmark_file_is_read_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("asb.json");
        std::fs::write(
            &path,
            r#"{"controls": [{"id": "NS-1", "description": "NSG"}, {"id": "NS-2", "description": "Firewall"}]}"#,
        )
        .unwrap();
        let args = RunArgs {
            resource: "vm".into(),
            benchmark: Some(path),
            controls: None,
            json: false,
        };
        let controls = load_controls(&args).unwrap();
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[1].id, "NS-2");

        let missing = RunArgs {
            benchmark: Some(tmp.path().join("nope.json")),
            ..args
        };
        assert!(load_controls(&missing).is_err());
    }

    #[tokio::test]
    async fn first_interrupt_stops_second_one_exits() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let twice = futures::stream::iter([(), ()]);
        assert!(second_interrupt(twice, cancel.clone(), tx).await);
        assert!(cancel.is_cancelled());
        match rx.recv().await {
            Some(OutputLine::Stderr(msg)) => assert!(msg.contains("Ctrl-C again")),
            _ => panic!("expected a stop notice"),
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        assert!(!second_interrupt(futures::stream::iter([()]), cancel.clone(), tx).await);
        assert!(cancel.is_cancelled());

        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        assert!(!second_interrupt(futures::stream::empty::<()>(), cancel.clone(), tx).await);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn progress_lines_follow_the_run() {
        use crate::engine::testing::{FakeAgent, FakeCapture, FakeModel, FakeSession};

        let tmp = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "compliance-audit",
            "--output-root",
            tmp.path().to_str().unwrap(),
            "serve",
        ])
        .unwrap();
        let controller = AuditController::new(
            build_config(&cli),
            Collaborators {
                agent: Arc::new(FakeAgent::new()),
                model: Arc::new(FakeModel),
                capture: Arc::new(FakeCapture::Empty),
                report: Arc::new(HtmlReport::default()),
            },
            Arc::new(FakeSession::established()),
        );

        let handle = controller
            .start(vec![Control::new("A", "first"), Control::new("B", "second")], "vm")
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = spawn_progress(&handle, tx);
        handle.wait().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), progress)
            .await
            .unwrap()
            .unwrap();

        let mut lines = Vec::new();
        while let Ok(OutputLine::Stderr(line)) = rx.try_recv() {
            lines.push(line);
        }
        assert!(lines.iter().any(|l| l.contains(" A (")), "{lines:?}");
        assert!(lines.iter().any(|l| l.ends_with(" B (100%)")), "{lines:?}");
        let analyzing: Vec<_> = lines.iter().filter(|l| l.starts_with("Analyzing")).collect();
        assert!(analyzing.len() <= 2);
    }
}
