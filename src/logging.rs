#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Initializes the process-wide tracing subscriber: structured JSON lines
/// appended to `<log_directory>/orchestrator.log` plus a compact console
/// layer. The level comes from the config and can be overridden with
/// `RUST_LOG`. Call once at startup.
pub fn init(config: &Config) -> anyhow::Result<()> {
    let dir = Path::new(&config.log_directory);
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let log_path = dir.join("orchestrator.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(Arc::new(file)))
        .with(fmt::layer().compact().with_writer(std::io::stdout))
        .try_init()
        .context("failed to initialize logging")?;

    Ok(())
}
