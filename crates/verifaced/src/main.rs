use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use veriface_core::{FilePersistence, Orchestrator, PolicyStore};

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{DecisionService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        policy = %config.policy_path.display(),
        gallery = %config.gallery_path.display(),
        "verifaced starting"
    );

    let store = Arc::new(PolicyStore::new(
        FilePersistence::new(&config.policy_path),
        config.policy_ttl(),
    ));
    let policy = store.initialize()?;
    tracing::info!(version = policy.version, "policy store initialized");

    let gallery_version = 1;
    let candidates = engine::load_gallery(&config.gallery_path, gallery_version)?;
    let engine = engine::spawn_engine(
        Orchestrator::new(config.orchestrator_config()),
        candidates,
        Arc::clone(&store),
    )?;

    let service = DecisionService::new(engine, store, config.gallery_path.clone(), gallery_version);
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "verifaced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("verifaced shutting down");

    Ok(())
}
