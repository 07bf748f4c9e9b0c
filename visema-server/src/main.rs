// visema-server: viseme-synchronized avatar render service

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use visema_core::{AssetBackend, RenderConfig, WebRtcBackend};
use visema_server::{build_state, create_router};

#[derive(Parser, Debug)]
#[command(name = "visema-server")]
#[command(about = "Renders talking-avatar video streams from viseme timelines", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, short, env = "VISEMA_CONFIG")]
    config: Option<String>,

    #[arg(long)]
    bind: Option<String>,

    #[arg(long, short)]
    port: Option<u16>,

    /// Serve avatars from this directory
    #[arg(long)]
    assets_dir: Option<String>,

    /// Fetch avatars from `<url>/<key>`
    #[arg(long, conflicts_with = "assets_dir")]
    assets_url: Option<String>,

    #[arg(long, value_enum)]
    webrtc: Option<WebRtcMode>,

    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WebRtcMode {
    Disabled,
    Loopback,
    Native,
}

impl From<WebRtcMode> for WebRtcBackend {
    fn from(mode: WebRtcMode) -> Self {
        match mode {
            WebRtcMode::Disabled => WebRtcBackend::Disabled,
            WebRtcMode::Loopback => WebRtcBackend::Loopback,
            WebRtcMode::Native => WebRtcBackend::Native,
        }
    }
}

/// defaults -> file -> environment -> command line
fn load_config(cli: &Cli) -> anyhow::Result<RenderConfig> {
    let mut config = match &cli.config {
        Some(path) => RenderConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => RenderConfig::default(),
    };
    config.apply_env();

    if let Some(bind) = &cli.bind {
        config.bind_address = bind.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = &cli.assets_dir {
        config.assets = AssetBackend::Directory { path: path.clone() };
    }
    if let Some(base_url) = &cli.assets_url {
        config.assets = AssetBackend::Http {
            base_url: base_url.clone(),
        };
    }
    if let Some(mode) = cli.webrtc {
        config.webrtc = mode.into();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    let addr = format!("{}:{}", config.bind_address, config.port);
    let reaper_interval = config.reaper_interval();
    let state = build_state(config).context("failed to initialise render service")?;
    let manager = state.manager.clone();

    let reaper = manager.spawn_reaper(reaper_interval);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("visema-server listening on {}", addr);

    let shutdown_manager = manager.clone();
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            // open streams never end on their own
            shutdown_manager.shutdown();
        })
        .await
        .context("HTTP server error")?;

    reaper.abort();
    // give draw loops a moment to flush their closing parts
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("visema-server stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
