use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt,
};

static INIT: Once = Once::new();

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Either a simple level like "info" or a full EnvFilter string
    /// e.g. "info,sinks=debug,leases=warn".
    pub level: Option<String>,
    /// Emit logs as JSON lines when true; otherwise ANSI text.
    pub json: bool,
    /// Include the event target in each line.
    pub with_targets: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: Some("info".to_owned()),
            json: false,
            with_targets: false,
        }
    }
}

/// Install the global subscriber. Only the first call has any effect;
/// `RUST_LOG` overrides the configured level.
pub fn init(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut outcome = Ok(());
    INIT.call_once(|| {
        let _ = LogTracer::init();

        let level = cfg.level.clone().unwrap_or_else(|| "info".into());
        let filter = EnvFilter::try_from_env("RUST_LOG")
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = if cfg.json {
            fmt::layer()
                .with_target(cfg.with_targets)
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .boxed()
        } else {
            fmt::layer()
                .with_target(cfg.with_targets)
                .with_ansi(true)
                .boxed()
        };

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        outcome = tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| e.to_string());
    });
    outcome.map_err(Into::into)
}
