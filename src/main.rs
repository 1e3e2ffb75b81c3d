use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dcron::agent::{Agent, INTERNAL_ERROR_STATUS};
use dcron::config::Config;

#[derive(Parser, Debug)]
#[command(name = "dcron")]
#[command(about = "Distributed cron agent: elects one master per task and supervises the run")]
struct Args {
    /// Settings as KEY=VALUE, taking precedence over environment variables
    /// of the same name (e.g. DCRON_NAME=batch.report.%Y%m%d)
    #[arg(value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    /// The user program and its arguments, after `--`
    #[arg(last = true, required = true, num_args = 1..)]
    program: Vec<String>,
}

fn parse_override(token: &str) -> Result<(String, String), String> {
    match token.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {token:?}")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cfg = match Config::load(args.overrides) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            tracing::error!(error = %e, "configuration rejected");
            std::process::exit(INTERNAL_ERROR_STATUS);
        }
    };

    tracing::info!(
        id = %cfg.id,
        task = %cfg.name,
        hosts = %cfg.hosts,
        max_retry = cfg.max_retry,
        llap = cfg.llap,
        "starting invocation"
    );

    let agent = match Agent::bootstrap(cfg, args.program).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %e, "bootstrap failed");
            std::process::exit(INTERNAL_ERROR_STATUS);
        }
    };

    std::process::exit(agent.run().await);
}
