use anyhow::{Context, Result};
use clap::Parser;
use runner::App;
use schemaforge_config::load_from_path;
use sinks::{MemAnalyticsClient, MemLogWorkspaceClient, SinkAdapters};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "schemaforge", about = "Schema-evolving record ingestion")]
struct Args {
    #[arg(short, long)]
    config: String,
    /// JSON-lines file; each line is published as one bus message.
    #[arg(short, long)]
    input: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = load_from_path(&args.config)
        .with_context(|| format!("load config {}", args.config))?;

    let _ = o11y::init_all(&o11y::O11yConfig {
        logging: cfg.logging.clone(),
        install_panic_hook: true,
    });
    info!(worker = %cfg.worker.name, topic = %cfg.worker.topic, "config loaded");

    // vendor clients are not linked into this binary
    warn!("analytics and log workspace sinks use in-memory clients");
    let adapters = SinkAdapters {
        analytics: Some(Arc::new(MemAnalyticsClient::new())),
        log_workspace: Some(Arc::new(MemLogWorkspaceClient::new())),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        on_signal.cancel();
    });

    let app = App::start(&cfg, &adapters, &cancel)?;

    match &args.input {
        Some(path) => {
            let contents = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read input {path}"))?;
            let mut published = 0usize;
            for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
                app.topic().publish(line);
                published += 1;
            }
            info!(input = %path, published, "input replayed");
        }
        None => {
            info!("no input file, waiting for ctrl-c");
            cancel.cancelled().await;
        }
    }

    for report in app.drain().await? {
        info!(
            sink = %report.sink_id,
            completed = report.stats.completed,
            abandoned = report.stats.abandoned,
            written = report.stats.records_written,
            skipped = report.stats.records_skipped,
            dead_lettered = report.dead_lettered,
            "worker exited"
        );
    }
    Ok(())
}
