//! DLNA Service (§4.7): the UPnP control surface each Virtual Device exposes — SOAP
//! action dispatch for AVTransport/RenderingControl/ConnectionManager, and GENA eventing.
//! Device/service description XML and the SSDP responder are the external collaborators
//! named in §1; this module only needs to agree with them on `device_id` and the control
//! URL paths below.

mod gena;
mod soap;

pub use gena::GenaRegistry;

use bridge_core::{DeviceId, DeviceSnapshot, EventBus, StateEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read side shared by the SOAP synchronous query actions (`GetPositionInfo`,
/// `GetTransportInfo`, `GetMediaInfo`, `GetVolume`, `GetMute`) and GENA's LastChange
/// builder: a point-in-time snapshot per device, kept current by a background task that
/// only ever reads the bus, matching §5 "all readers get point-in-time snapshots".
#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<RwLock<HashMap<DeviceId, DeviceSnapshot>>>,
}

impl SnapshotCache {
    fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.inner.read().await.get(device_id).cloned()
    }

    pub async fn all(&self) -> Vec<DeviceSnapshot> {
        self.inner.read().await.values().cloned().collect()
    }

    async fn put(&self, device_id: DeviceId, snapshot: DeviceSnapshot) {
        self.inner.write().await.insert(device_id, snapshot);
    }

    async fn remove(&self, device_id: &str) {
        self.inner.write().await.remove(device_id);
    }
}

#[derive(Clone)]
pub struct DlnaState {
    pub bus: EventBus,
    pub snapshots: SnapshotCache,
    pub gena: GenaRegistry,
}

impl DlnaState {
    /// Spawns the background cache-refresh task and the GENA dispatch loop, and returns
    /// the state to be wired into the axum router.
    pub fn new(bus: EventBus) -> Self {
        let snapshots = SnapshotCache::new();
        let gena = GenaRegistry::new(bus.clone(), snapshots.clone());

        tokio::spawn(refresh_snapshot_cache(bus.subscribe(), snapshots.clone()));
        tokio::spawn(gena.clone().run());

        Self { bus, snapshots, gena }
    }

    pub fn router(self) -> axum::Router {
        soap::router().merge(gena::router()).with_state(self)
    }
}

async fn refresh_snapshot_cache(mut sub: bridge_core::EventSubscription, cache: SnapshotCache) {
    while let Some(event) = sub.recv_state().await {
        match event {
            StateEvent::TransportChanged { device_id, snapshot } => {
                cache.put(device_id, snapshot).await;
            }
            StateEvent::DeviceAdded { device_id, snapshot } => {
                cache.put(device_id, snapshot).await;
            }
            StateEvent::VolumeChanged { device_id, volume, muted } => {
                if let Some(mut snapshot) = cache.get(&device_id).await {
                    snapshot.volume = volume;
                    snapshot.muted = muted;
                    cache.put(device_id, snapshot).await;
                }
            }
            StateEvent::DspChanged { device_id, enabled, config } => {
                if let Some(mut snapshot) = cache.get(&device_id).await {
                    snapshot.dsp_enabled = enabled;
                    snapshot.dsp_config = config;
                    cache.put(device_id, snapshot).await;
                }
            }
            StateEvent::Error { device_id, error } => {
                if let Some(mut snapshot) = cache.get(&device_id).await {
                    snapshot.error = Some(error.to_string());
                    cache.put(device_id, snapshot).await;
                }
            }
            StateEvent::DeviceRemoved { device_id } => {
                cache.remove(&device_id).await;
            }
        }
    }
}
