mod broadcast;
mod config;
mod discovery;
mod lifecycle;
mod process_table;
mod registry;
mod retry;
#[cfg(feature = "serve")]
mod serve;
mod signals;
mod status;
mod supervisor;
mod tail;

use clap::Parser;
use config::WatchConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Watches a long-running coding agent: finds its processes, tails its
/// logs, and streams both to observers over HTTP.
#[derive(Parser, Debug)]
#[command(name = "agentwatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "agentwatch.toml")]
    config: PathBuf,

    /// Listening port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log directory to inventory and tail (overrides config)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Agent launcher script (overrides config)
    #[arg(long)]
    script: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "agentwatch=trace" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the current agent status as JSON and exit
    #[arg(long)]
    status: bool,
}

impl Cli {
    fn apply(&self, config: &mut WatchConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.log_dir {
            config.logs.dir = dir.clone();
        }
        if let Some(script) = &self.script {
            config.agent.script = script.clone();
        }
        if let Some(level) = &self.log_level {
            config.server.log_level = level.clone();
        }
    }
}

/// CLI flag, then RUST_LOG, then AGENTWATCH_LOG, then the config file.
fn init_tracing(cli_level: Option<&str>, env_level: Option<String>, config_level: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(env_level.as_deref().unwrap_or(config_level))),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let loaded = config::load_config(&cli.config);
    let config_level = match &loaded {
        Ok(cfg) => cfg.server.log_level.clone(),
        Err(_) => "info".to_string(),
    };
    init_tracing(
        cli.log_level.as_deref(),
        std::env::var("AGENTWATCH_LOG").ok(),
        &config_level,
    );
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("{e}; using defaults");
            WatchConfig::default()
        }
    };
    config.apply_env();
    cli.apply(&mut config);

    if let Err(e) = run(&cli, &config).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, config: &WatchConfig) -> Result<(), Box<dyn std::error::Error>> {
    if cli.status {
        let supervisor = supervisor::Supervisor::new(config)?;
        let report = supervisor.status().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    serve_http(config).await
}

#[cfg(feature = "serve")]
async fn serve_http(config: &WatchConfig) -> Result<(), Box<dyn std::error::Error>> {
    serve::run(config).await
}

#[cfg(not(feature = "serve"))]
async fn serve_http(_config: &WatchConfig) -> Result<(), Box<dyn std::error::Error>> {
    Err("built without the `serve` feature; only --status is available".into())
}
