//! mailstore-rs daemon
//!
//! Opens the storage engine and runs the retention engine until Ctrl-C.
//! Protocol servers embed the library; this process owns the background
//! maintenance of a deployment.

use anyhow::Context;
use mailstore_rs::auth::{AuthStore, SqlAuthStore};
use mailstore_rs::config::{Config, LoggingConfig};
use mailstore_rs::engine::Engine;
use mailstore_rs::retention::RetentionConfig;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("mailstore_rs={}", config.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = if Path::new(&config_path).exists() {
        Config::from_file(&config_path)
            .with_context(|| format!("loading configuration from {}", config_path))?
    } else {
        Config::default()
    };

    init_logging(&config.logging);
    info!("Starting mailstore-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("  Index: {} ({})", config.index.driver, config.index.dsn);
    info!("  Blobs: {:?} {:?}", config.blobs.backend, config.blobs.path);

    let engine = Engine::open(&config)
        .await
        .context("opening storage engine")?;

    let auth: Option<Arc<dyn AuthStore>> = match &config.retention.auth_store {
        Some(dsn) => {
            let store = SqlAuthStore::connect(dsn)
                .await
                .context("opening auth store")?;
            Some(Arc::new(store))
        }
        None => None,
    };

    let retention = engine
        .retention(RetentionConfig::from(&config.retention), auth)
        .start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutting down");
    retention.stop().await;

    Ok(())
}
