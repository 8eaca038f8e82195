mod agent;
mod cli;
mod engine;
mod error;
mod model;
mod orchestrator;
mod report;
mod server;
mod status;
mod storage;
mod summary;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing(args.verbose);
    cli::run(args).await
}

/// Logs go to stderr so `run --json` keeps stdout clean.
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,compliance_audit=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
