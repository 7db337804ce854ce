use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use voxcpm_server::config_loader::{BackendKind, Settings};
use voxcpm_server::logging::{init_logging, LogFormat};
use voxcpm_server::server;

/// OpenAI-compatible VoxCPM speech server
#[derive(Debug, Parser)]
#[command(name = "voxcpm-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on (overrides config)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Directory holding <voice>.wav|mp3 + <voice>.txt pairs
    #[arg(long)]
    voices_dir: Option<PathBuf>,

    /// Model backend: tone or command
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_logging(&args.log_level, format);

    let mut settings = Settings::new(args.config.as_deref()).context("Failed to load settings")?;
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if let Some(dir) = args.voices_dir {
        settings.voices_dir = dir;
    }
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }
    settings.validate().context("Invalid settings")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %settings.bind_addr,
        backend = ?settings.backend,
        voices_dir = %settings.voices_dir.display(),
        "Starting speech server"
    );

    server::run(settings).await.context("Server failed")?;

    info!("Server shutdown complete");
    Ok(())
}
