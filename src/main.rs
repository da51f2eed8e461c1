//! mockgcs — Google Cloud Storage emulator.
//!
//! Startup order: parse flags (with `FAKE_GCS_*` environment fallbacks),
//! initialize logging, construct the selected backend, seed it if a data
//! directory is configured, install the global notification config, then
//! serve until SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use mockgcs::backend::store::Storage;
use mockgcs::config::{BackendKind, Config};
use mockgcs::notify::{NotificationConfig, NotificationRegistry, PayloadFormat, PubsubSink};
use mockgcs::upload::{UploadManager, DEFAULT_SESSION_TTL};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_filter())),
        )
        .init();

    // Configuration errors and bind failures: one diagnostic line,
    // nonzero exit.
    if let Err(e) = run(config).await {
        eprintln!("mockgcs: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), String> {
    config.validate()?;

    let storage: Arc<dyn Storage> = match config.backend {
        BackendKind::Memory => {
            info!("in-memory storage backend initialized");
            Arc::new(mockgcs::backend::memory::MemoryBackend::new())
        }
        BackendKind::Filesystem => {
            let backend = mockgcs::backend::filesystem::FilesystemBackend::new(
                config.filesystem_root.clone(),
            )
            .map_err(|e| format!("initializing filesystem backend: {e}"))?;
            info!(
                "filesystem storage backend initialized at {}",
                config.filesystem_root.display()
            );
            Arc::new(backend)
        }
    };

    if let Some(data) = &config.data {
        mockgcs::seed::seed_from_directory(storage.as_ref(), data, &config.location)
            .await
            .map_err(|e| format!("seeding from {}: {e}", data.display()))?;
    }

    let notifications = Arc::new(NotificationRegistry::new(Arc::new(PubsubSink::new())));
    if let Some(global) = config.global_event_config()? {
        notifications
            .insert(
                &global.bucket,
                NotificationConfig {
                    id: String::new(),
                    topic: global.topic.clone(),
                    event_types: global.event_types,
                    object_name_prefix: global.object_prefix,
                    payload_format: PayloadFormat::JsonApiV1,
                    custom_attributes: Default::default(),
                },
            )
            .await;
        info!(
            "global notification config installed: bucket={} topic={}",
            global.bucket, global.topic
        );
    }

    let uploads = Arc::new(UploadManager::new(DEFAULT_SESSION_TTL));
    uploads.start_sweeper();

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(mockgcs::AppState {
        config,
        storage,
        uploads,
        notifications,
    });
    let app = mockgcs::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("binding {bind_addr}: {e}"))?;
    info!("mockgcs listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serving: {e}"))?;

    info!("mockgcs shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
}
