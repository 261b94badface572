//! Orchestrator - batch driver for the orchestration core.
//!
//! Reads JSON Lines of `{"source": "...", "event": {...}}` from a file or
//! stdin, feeds each through the kernel, runs a final fusion pass and prints
//! a JSON summary to stdout. Logs go to stderr.

use clap::Parser;
use orchestration_core::fusion::FusionRule;
use orchestration_core::kernel::OrchestrationKernel;
use orchestration_core::workflow::WorkflowInstance;
use orchestration_core::Config;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, env = "ORCHESTRATION_CONFIG")]
    config: Option<PathBuf>,

    /// JSON Lines event file; reads stdin when omitted
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Register the built-in fusion rule catalogue
    #[arg(long)]
    default_rules: bool,

    /// Pretty-print the summary
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Deserialize)]
struct EventLine {
    source: String,
    event: Value,
}

fn summarize(instance: &WorkflowInstance) -> Value {
    json!({
        "instance_id": instance.id,
        "template_id": instance.template_id,
        "status": instance.status,
        "error": instance.error,
    })
}

async fn drive<R>(kernel: &OrchestrationKernel, reader: R) -> Result<Value, Box<dyn std::error::Error>>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let (mut accepted, mut rejected, mut invalid) = (0u64, 0u64, 0u64);
    let mut workflows = Vec::new();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: EventLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("event_line_invalid: line={}, error={}", line_no, e);
                invalid += 1;
                continue;
            }
        };
        match kernel.ingest_event(&parsed.source, &parsed.event).await {
            Ok(outcome) if outcome.accepted => {
                accepted += 1;
                workflows.extend(outcome.workflows.iter().map(summarize));
            }
            Ok(_) => rejected += 1,
            Err(e) => {
                tracing::warn!("event_rejected: line={}, error={}", line_no, e);
                invalid += 1;
            }
        }
    }

    let cycle = kernel.flush_fusion().await?;
    workflows.extend(cycle.workflows.iter().map(summarize));

    Ok(json!({
        "events": {"accepted": accepted, "rejected": rejected, "invalid": invalid},
        "fused_events": cycle.result.fused_events,
        "workflows": workflows,
        "status": kernel.status().await,
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env_overrides();
    orchestration_core::observability::init_tracing_with(&config.observability);

    let kernel = OrchestrationKernel::new(config)?;
    if args.default_rules {
        for rule in FusionRule::default_catalogue() {
            kernel.fusion().add_rule(rule).await?;
        }
    }
    kernel.start().await?;

    let summary = match &args.events {
        Some(path) => drive(&kernel, tokio::fs::File::open(path).await?).await?,
        None => drive(&kernel, tokio::io::stdin()).await?,
    };
    kernel.stop().await?;

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&summary)?
    } else {
        serde_json::to_string(&summary)?
    };
    println!("{}", rendered);
    Ok(())
}
