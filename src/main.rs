use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use gb28181_proxy::{GbSipProxyBuilder, ProxyConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gb28181-proxy", about = "GB28181 SIP proxy gateway", version)]
struct Cli {
    /// Path to the JSON configuration file. Defaults to config.json next to
    /// the executable.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log at debug level instead of info.
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn config_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().context("locate executable")?;
        let dir = exe.parent().context("executable has no parent directory")?;
        Ok(dir.join("config.json"))
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let default_level = if debug { "debug" } else { "info" };
    let env_filter = if let Ok(value) = std::env::var(EnvFilter::DEFAULT_ENV) {
        EnvFilter::new(value)
    } else {
        EnvFilter::new(default_level)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = cli.config_path()?;
    let config = ProxyConfig::load(&config_path)
        .with_context(|| format!("load configuration from {}", config_path.display()))?;

    info!(config = %config_path.display(), "starting gb28181 proxy");

    let runtime = GbSipProxyBuilder::new(config)
        .build()
        .await
        .context("initialise proxy runtime")?;
    let handle = runtime.start().await.context("start proxy runtime")?;

    let mut sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("install SIGQUIT handler")?;

    tokio::select! {
        _ = sighup.recv() => info!("SIGHUP received"),
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigquit.recv() => info!("SIGQUIT received"),
    }

    info!("stopping proxy");
    handle.shutdown().await.context("proxy shutdown")?;
    info!("proxy stopped");
    Ok(())
}
