//! Device Manager (§4.8): periodic AirPlay discovery that creates and destroys Virtual
//! Devices as receivers come and go, plus an optional single local-speaker device.
//! Grounded on `sinks::airplay::discovery` for the scan call shape and loosely on the
//! secondary example repo's periodic-scan/last-seen/removal pattern, adapted here to a
//! poll-and-diff loop since the event-streaming mDNS style browse that repo uses would
//! have to be re-debounced into the same "N consecutive misses" shape anyway.

use crate::config::BridgeConfig;
use crate::sink::OutputSink;
use crate::sinks::airplay::{discover_devices, AirPlayDevice};
use crate::sinks::airplay_lib::RaopAirPlayLibrary;
use crate::sinks::airplay_sink::AirPlaySink;
use crate::sinks::local::LocalSink;
use crate::virtual_device::{VirtualDevice, VirtualDeviceConfig};
use bridge_core::{DeviceId, DeviceKind, DeviceSnapshot, EventBus, StateEvent};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A receiver that disappears from this many consecutive scans is torn down. Chosen to
/// absorb a single dropped mDNS response without delaying removal of a genuinely gone
/// receiver by more than a couple of scan intervals.
const MISSING_SCAN_THRESHOLD: u32 = 2;
const DISCOVERY_TIMEOUT_S: u64 = 5;

struct ManagedDevice {
    handle: tokio::task::JoinHandle<()>,
    missing_scans: u32,
}

/// Owns the lifecycle of every Virtual Device this process creates: the AirPlay-bridged
/// ones found by discovery, and (if enabled) the one local-speaker device. Does not own
/// command routing itself — command delivery goes through the `EventBus`, same as every
/// other producer.
pub struct DeviceManager {
    config: BridgeConfig,
    bus: EventBus,
    cache_dir: PathBuf,
    devices: HashMap<DeviceId, ManagedDevice>,
}

impl DeviceManager {
    pub fn new(config: BridgeConfig, bus: EventBus) -> Self {
        let cache_dir = config.cache_dir.clone();
        Self { config, bus, cache_dir, devices: HashMap::new() }
    }

    /// Runs forever: an optional one-time local-speaker device, then a periodic AirPlay
    /// discovery scan on `discovery_interval_s`.
    pub async fn run(mut self) {
        if self.config.enable_server_speaker {
            self.spawn_local_speaker();
        }

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.discovery_interval_s));
        loop {
            interval.tick().await;
            self.scan_once().await;
        }
    }

    async fn scan_once(&mut self) {
        let found = match discover_devices(DISCOVERY_TIMEOUT_S).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("airplay discovery scan failed: {e}");
                return;
            }
        };

        let mut seen: std::collections::HashSet<DeviceId> = std::collections::HashSet::new();
        for device in found {
            let device_id = airplay_device_id(&device);
            seen.insert(device_id.clone());
            if let Some(managed) = self.devices.get_mut(&device_id) {
                managed.missing_scans = 0;
            } else {
                self.spawn_airplay_device(device_id, device);
            }
        }

        let mut to_remove = Vec::new();
        for (device_id, managed) in self.devices.iter_mut() {
            if seen.contains(device_id) {
                continue;
            }
            // Local-speaker entries never appear in an AirPlay scan; only age out
            // entries this manager itself created from a discovery result.
            if !device_id.starts_with("airplay:") {
                continue;
            }
            managed.missing_scans += 1;
            if managed.missing_scans >= MISSING_SCAN_THRESHOLD {
                to_remove.push(device_id.clone());
            }
        }
        for device_id in to_remove {
            self.remove_device(device_id);
        }
    }

    fn spawn_airplay_device(&mut self, device_id: DeviceId, device: AirPlayDevice) {
        info!(device_id = %device_id, name = %device.name, "discovered AirPlay receiver, creating device");
        let display_name = format!("{} [D]", device.name);
        let library = Box::new(RaopAirPlayLibrary::new());
        let sink: Box<dyn OutputSink> = Box::new(AirPlaySink::new(library, device));
        self.spawn_device(device_id, display_name, DeviceKind::Airplay, sink);
    }

    fn spawn_local_speaker(&mut self) {
        let device_id: DeviceId = "local-speaker".to_string();
        info!(device_id = %device_id, "creating local-speaker device");
        let sink: Box<dyn OutputSink> = Box::new(LocalSink::new(None));
        self.spawn_device(device_id, "Local Speaker [D]".to_string(), DeviceKind::LocalSpeaker, sink);
    }

    fn spawn_device(
        &mut self,
        device_id: DeviceId,
        display_name: String,
        kind: DeviceKind,
        sink: Box<dyn OutputSink>,
    ) {
        let device_config = VirtualDeviceConfig {
            device_id: device_id.clone(),
            display_name,
            kind,
            cache_dir: self.cache_dir.clone(),
            buffer_gate_bytes: self.config.buffer_gate_bytes,
        };
        let bus = self.bus.clone();
        let commands = bus.subscribe();
        let device = VirtualDevice::new(device_config, sink, bus.clone());
        let snapshot = device.snapshot();
        bus.publish_state(StateEvent::DeviceAdded { device_id: device_id.clone(), snapshot });

        let handle = tokio::spawn(device.run(commands));
        self.devices.insert(device_id, ManagedDevice { handle, missing_scans: 0 });
    }

    fn remove_device(&mut self, device_id: DeviceId) {
        if let Some(managed) = self.devices.remove(&device_id) {
            info!(device_id = %device_id, "AirPlay receiver disappeared, tearing down device");
            // The device's own `run()` loop tears itself down once its command
            // subscription closes (no more commands can reach a device nobody can name);
            // aborting here only reclaims the task if it is stuck on something the
            // subscription close wouldn't unblock.
            managed.handle.abort();
            self.bus.publish_state(StateEvent::DeviceRemoved { device_id });
        }
    }
}

fn airplay_device_id(device: &AirPlayDevice) -> DeviceId {
    format!("airplay:{}", device.hostname.trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn airplay_device_id_is_stable_across_rescans() {
        let a = AirPlayDevice {
            name: "Kitchen".to_string(),
            hostname: "kitchen.local.".to_string(),
            port: 7000,
            addresses: vec![],
            model: None,
            features: None,
        };
        let b = AirPlayDevice { hostname: "kitchen.local".to_string(), ..a.clone() };
        assert_eq!(airplay_device_id(&a), airplay_device_id(&b));
    }
}
