//! Config Store (§4.9): persists each device's DSP config, volume, and mute to a JSON
//! file keyed by device_id, and replays it on device (re)creation. New — the teacher has
//! no persistence layer at all — grounded in its general `serde`-derive-to-`serde_json`
//! style (seen throughout `bridge_core::model`) rather than any specific file-I/O code,
//! since writing the file itself is this crate's own addition.

use anyhow::{Context, Result};
use bridge_core::{Command, DeviceId, EventBus, PersistedDeviceConfig, StateEvent};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct ConfigStore {
    dir: PathBuf,
    bus: EventBus,
}

impl ConfigStore {
    pub fn new(dir: PathBuf, bus: EventBus) -> Self {
        Self { dir, bus }
    }

    /// Background task: subscribes to `DspChanged` and persists it, and to
    /// `DeviceAdded` so a newly (re)created device picks up any saved config.
    pub async fn run(self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), "failed to create config store directory: {e}");
        }

        let mut sub = self.bus.subscribe();
        while let Some(event) = sub.recv_state().await {
            match event {
                StateEvent::DspChanged { device_id, enabled, config } => {
                    let volume_muted = self.load(&device_id).await.map(|c| (c.volume, c.muted));
                    let (volume, muted) = volume_muted.unwrap_or((100, false));
                    let persisted = PersistedDeviceConfig { dsp_enabled: enabled, dsp_config: config, volume, muted };
                    self.save(&device_id, &persisted).await;
                }
                StateEvent::VolumeChanged { device_id, volume, muted } => {
                    let mut persisted = self.load(&device_id).await.unwrap_or_default();
                    persisted.volume = volume;
                    persisted.muted = muted;
                    self.save(&device_id, &persisted).await;
                }
                StateEvent::DeviceAdded { device_id, .. } => {
                    if let Some(persisted) = self.load(&device_id).await {
                        debug!(%device_id, "replaying persisted dsp config onto newly created device");
                        self.bus.publish_command(Command::SetDsp {
                            device_id: device_id.clone(),
                            enabled: persisted.dsp_enabled,
                            config: persisted.dsp_config,
                        });
                        self.bus.publish_command(Command::SetVolume { device_id: device_id.clone(), volume: persisted.volume });
                        self.bus.publish_command(Command::SetMute { device_id, muted: persisted.muted });
                    }
                }
                _ => {}
            }
        }
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_device_id(device_id)))
    }

    async fn load(&self, device_id: &str) -> Option<PersistedDeviceConfig> {
        load_config(&self.path_for(device_id)).await.ok()
    }

    async fn save(&self, device_id: &str, config: &PersistedDeviceConfig) {
        if let Err(e) = save_config(&self.path_for(device_id), config).await {
            warn!(%device_id, "failed to persist device config: {e}");
        }
    }
}

async fn load_config(path: &Path) -> Result<PersistedDeviceConfig> {
    let bytes = tokio::fs::read(path).await.context("reading persisted device config")?;
    serde_json::from_slice(&bytes).context("parsing persisted device config")
}

async fn save_config(path: &Path, config: &PersistedDeviceConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).context("serializing device config")?;
    tokio::fs::write(path, json).await.context("writing persisted device config")
}

/// Device ids of the form `airplay:host.local` contain characters that are awkward in a
/// filename; this keeps the on-disk key readable while staying filesystem-safe.
fn sanitize_device_id(device_id: &str) -> String {
    device_id.chars().map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::DspConfig;

    #[tokio::test]
    async fn round_trips_through_json_file() {
        let dir = std::env::temp_dir().join(format!("bridge-engine-config-store-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("test.json");

        let config = PersistedDeviceConfig { dsp_enabled: true, dsp_config: DspConfig::default(), volume: 42, muted: true };
        save_config(&path, &config).await.unwrap();
        let loaded = load_config(&path).await.unwrap();

        assert_eq!(loaded.volume, 42);
        assert!(loaded.muted);
        assert!(loaded.dsp_enabled);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[test]
    fn sanitize_device_id_keeps_it_filesystem_safe() {
        assert_eq!(sanitize_device_id("airplay:kitchen.local"), "airplay_kitchen_local");
    }
}
