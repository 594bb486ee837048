use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sessionwatch::broadcast::Broadcaster;
use sessionwatch::config::MonitorConfig;
use sessionwatch::monitor::Monitor;
use sessionwatch::source::claude::ClaudeSource;
use sessionwatch::source::codex::CodexSource;
use sessionwatch::source::gemini::GeminiSource;
use sessionwatch::source::Source;
use sessionwatch::store::SessionStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sessionwatchd", about = "Unified live view of Claude Code, Codex, and Gemini CLI sessions")]
struct Cli {
    /// Path to a TOML config file; defaults are used for anything it omits.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the tracing log level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = match &cli.config {
        Some(path) => MonitorConfig::load(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => MonitorConfig::default(),
    };

    let home = dirs::home_dir().context("could not determine home directory")?;

    let sources: Vec<Box<dyn Source>> = vec![
        Box::new(ClaudeSource::with_home(&home, config.discover_window)),
        Box::new(CodexSource::from_env(&home, config.discover_window)),
        Box::new(GeminiSource::new(&home, config.discover_window)),
    ];

    let store = Arc::new(SessionStore::new());
    let health = Monitor::build_health_trackers(&sources, config.health_warning_threshold);

    let broadcaster = Broadcaster::spawn(
        store.clone(),
        health.iter().map(|(name, tracker)| (*name, tracker.clone())).collect(),
        config.max_connections,
        config.broadcast_throttle,
        config.snapshot_interval,
    );

    let monitor = Monitor::new(config, store, broadcaster, health, sources);

    let (_reconfigure_tx, reconfigure_rx) = tokio::sync::mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    monitor.run(reconfigure_rx, shutdown_rx).await;
    Ok(())
}

fn init_tracing(level_override: Option<&str>) {
    let filter = level_override
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
