//! singsync-id - Song identification microservice
//!
//! Accepts audio uploads and identifies the song with several engines in parallel:
//! lyrics transcription search, acoustic fingerprinting and local signal features.
//! Results are delivered over HTTP as one merged answer or as an SSE stream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use singsync_common::config::{mask_secret, TomlConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use singsync_id::delivery::IdentifyService;
use singsync_id::engines::genius::{GeniusClient, LyricsSearch};
use singsync_id::engines::EngineRegistry;
use singsync_id::merger::ResultMerger;
use singsync_id::orchestrator::Orchestrator;
use singsync_id::store::SampleStore;
use singsync_id::AppState;

/// How often expired samples are purged
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Command-line arguments for singsync-id
#[derive(Parser, Debug)]
#[command(name = "singsync-id")]
#[command(about = "Song identification microservice")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SINGSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides configuration)
    #[arg(short, long, env = "SINGSYNC_PORT")]
    port: Option<u16>,

    /// Address to bind (overrides configuration)
    #[arg(short, long, env = "SINGSYNC_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration: file, then environment, then command line
    let mut config = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.apply_env_overrides();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("singsync_id={},tower_http=info", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting singsync-id (Song Identification) microservice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Global timeout: {}s", config.global_timeout_secs);
    info!("Upload directory: {}", config.upload_dir.display());
    info!(
        acoustid_key = %mask_secret(config.engines.acoustid.api_key.as_deref()),
        openai_key = %mask_secret(config.engines.whisper_genius.openai_api_key.as_deref()),
        genius_token = %mask_secret(config.genius.api_token.as_deref()),
        "Credentials"
    );

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.upload_dir.display()))?;

    let lyrics: Arc<dyn LyricsSearch> =
        Arc::new(GeniusClient::from_config(&config.genius).context("Failed to initialize lyrics search")?);
    let registry = EngineRegistry::from_config(&config, Arc::clone(&lyrics))
        .context("Failed to initialize engines")?;

    let store = SampleStore::new();
    let service = IdentifyService::new(
        store.clone(),
        registry,
        Orchestrator::new(Duration::from_secs(config.global_timeout_secs)),
        ResultMerger::new(config.merge_priority.clone()),
        Some(lyrics),
    );

    let shutdown = CancellationToken::new();
    let sweeper = store.spawn_sweeper(
        Duration::from_secs(config.sample_ttl_secs),
        SWEEP_INTERVAL,
        shutdown.clone(),
    );

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind_address, config.port))?;

    let app = singsync_id::build_router(AppState::new(service, config));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!("Sample sweeper ended abnormally: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
