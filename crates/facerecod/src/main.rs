use anyhow::{Context, Result};
use facereco_core::Store;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod pipeline;

use config::Config;
use dbus_interface::{RecognizerService, BUS_NAME, OBJECT_PATH};
use pipeline::TrackPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facerecod starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        mode = ?config.mode,
        threshold = config.distance_threshold,
        policy = ?config.search_policy(),
        "configuration loaded"
    );

    let store = Arc::new(Store::new());
    if config.db_path.exists() {
        store
            .load(&config.db_path)
            .with_context(|| format!("failed to load database {}", config.db_path.display()))?;
    } else {
        tracing::info!(path = %config.db_path.display(), "no database yet; starting empty");
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let matcher = engine::spawn_match_engine(
        Arc::clone(&store),
        config.distance_threshold,
        config.poll_interval,
        events_tx.clone(),
    )?;
    let ingest = engine::spawn_ingest_worker(Arc::clone(&store), config.poll_interval, events_tx)?;

    let pipeline = Arc::new(TrackPipeline::new(
        Arc::clone(&store),
        matcher,
        ingest,
        events_rx,
        config.mode,
        config.search_policy(),
    ));

    let service = RecognizerService::new(
        Arc::clone(&pipeline),
        config.db_path.clone(),
        config.distance_threshold,
    );
    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facerecod ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facerecod shutting down");
    pipeline.shutdown().await?;

    if config.autosave {
        pipeline
            .save(config.db_path.clone())
            .await
            .with_context(|| format!("failed to save database {}", config.db_path.display()))?;
    }

    Ok(())
}
