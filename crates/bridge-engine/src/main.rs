//! Process entry point: wires the event bus, Device Manager, Config Store, and the two
//! HTTP services (DLNA control URLs on `HTTP_PORT`, the web API on `WEB_PORT`) and runs
//! them to completion. Logging setup follows the secondary example's `bridge` binary
//! (`tracing_subscriber::fmt` + `EnvFilter` from the environment, falling back to a
//! crate-scoped default).

use bridge_core::EventBus;
use bridge_engine::{BridgeConfig, ConfigStore, DeviceManager, DlnaState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bridge_engine=info")))
        .init();

    let config = BridgeConfig::from_env();
    tracing::info!(?config, "starting bridge-engine");

    tokio::fs::create_dir_all(&config.cache_dir).await.ok();

    let bus = EventBus::default();

    let device_manager = DeviceManager::new(config.clone(), bus.clone());
    let device_manager_handle = tokio::spawn(device_manager.run());

    let config_store = ConfigStore::new(config.cache_dir.join("device-configs"), bus.clone());
    let config_store_handle = tokio::spawn(config_store.run());

    let dlna_state = DlnaState::new(bus.clone());
    let shared_snapshots = dlna_state.snapshots.clone();
    let dlna_router = dlna_state.router();
    let dlna_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "DLNA control service listening");
    let dlna_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(dlna_listener, dlna_router).await {
            tracing::error!("DLNA control service exited: {e}");
        }
    });

    let web_state = bridge_engine::web::AppState { bus: bus.clone(), snapshots: shared_snapshots };
    let web_router = bridge_engine::web::router(web_state);
    let web_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    tracing::info!(port = config.web_port, "web API listening");
    let web_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(web_listener, web_router).await {
            tracing::error!("web API service exited: {e}");
        }
    });

    tokio::select! {
        _ = device_manager_handle => tracing::warn!("device manager task exited"),
        _ = config_store_handle => tracing::warn!("config store task exited"),
        _ = dlna_handle => tracing::warn!("DLNA service task exited"),
        _ = web_handle => tracing::warn!("web API service task exited"),
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    Ok(())
}
