use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use engine::Engine;
use rollcall_core::{LazyExtractor, OnnxExtractor};
use rollcall_store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        model = %config.model_path.display(),
        db = %config.db_path.display(),
        threshold = config.similarity_threshold,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?
        .with_overwrite_manual(config.overwrite_manual);

    // Loaded on the first recognition or enrollment, not at startup.
    let extractor_config = config.extractor_config();
    let extractor = Arc::new(LazyExtractor::new(move || {
        OnnxExtractor::load(&extractor_config)
    }));

    let engine = Arc::new(Engine::new(config.clone(), extractor, Arc::new(store)));
    let service = RollcallService::new(Arc::clone(&engine));

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    engine.shutdown().await;

    Ok(())
}
