use serde::{Deserialize, Serialize};

/// Stable identifier for a virtual device, used as the UPnP UDN seed, the cache
/// filename prefix, and the Config Store's persistence key.
pub type DeviceId = String;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Airplay,
    LocalSpeaker,
}

/// Transport states of §4.1. Only `VirtualDevice::apply` is allowed to change this.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    NoMediaPresent,
    Stopped,
    Playing,
    PausedPlayback,
    Transitioning,
}

impl Default for TransportState {
    fn default() -> Self {
        TransportState::NoMediaPresent
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub cover_url: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self { sample_rate: 44_100, channels: 2, bit_depth: 16 }
    }
}

/// A read-only, point-in-time view of one Virtual Device's state — what the Event Bus
/// hands to subscribers and what the Web API serializes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub display_name: String,
    pub kind: Option<DeviceKind>,
    pub transport_state: TransportState,
    pub uri: Option<String>,
    pub duration_s: f64,
    pub elapsed_s: f64,
    pub metadata: TrackMetadata,
    pub volume: u8,
    pub muted: bool,
    pub dsp_enabled: bool,
    pub dsp_config: DspConfig,
    pub format: Option<PcmFormat>,
    pub session_id: u64,
    pub error: Option<String>,
}

impl Default for DeviceKind {
    fn default() -> Self {
        DeviceKind::LocalSpeaker
    }
}

// --- DSP config schema (§6) ---

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EqEngineKind {
    Iir,
    Fft,
    Fir,
}

impl Default for EqEngineKind {
    fn default() -> Self {
        EqEngineKind::Iir
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandType {
    Peaking,
    LowShelf,
    HighShelf,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EqBand {
    pub freq_hz: f32,
    pub gain_db: f32,
    pub q: f32,
    #[serde(rename = "type")]
    pub band_type: BandType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EqConfig {
    pub engine: EqEngineKind,
    pub bands: Vec<EqBand>,
    pub block_size: Option<usize>,
    pub taps: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressorConfig {
    pub enabled: bool,
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_db: f32,
    pub knee_db: f32,
    pub link_stereo: bool,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_db: -18.0,
            ratio: 2.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            makeup_db: 0.0,
            knee_db: 6.0,
            link_stereo: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoConfig {
    pub enabled: bool,
    pub mid_gain_db: f32,
    pub side_gain_db: f32,
    pub haas_ms: f32,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self { enabled: false, mid_gain_db: 0.0, side_gain_db: 0.0, haas_ms: 0.0 }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DspConfig {
    pub eq: EqConfig,
    pub compressor: CompressorConfig,
    pub stereo: StereoConfig,
}

impl DspConfig {
    /// Validates a band list against the rejection policy of §7 (DSP-config-invalid).
    pub fn validate(&self) -> Result<(), String> {
        for band in &self.eq.bands {
            if band.freq_hz <= 0.0 || band.freq_hz > 48_000.0 {
                return Err(format!("band frequency out of range: {}", band.freq_hz));
            }
            if band.q <= 0.0 {
                return Err(format!("band Q must be positive: {}", band.q));
            }
            if !band.gain_db.is_finite() || band.gain_db.abs() > 48.0 {
                return Err(format!("band gain out of range: {}", band.gain_db));
            }
        }
        if let Some(taps) = self.eq.taps {
            if taps == 0 {
                return Err("fir taps must be > 0".into());
            }
        }
        if let Some(block) = self.eq.block_size {
            if block == 0 || !block.is_power_of_two() {
                return Err("fft block_size must be a power of two".into());
            }
        }
        if self.compressor.ratio < 1.0 {
            return Err("compressor ratio must be >= 1.0".into());
        }
        Ok(())
    }
}

/// Persisted per-device record the Config Store reads/writes (§4.9, §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedDeviceConfig {
    pub dsp_enabled: bool,
    pub dsp_config: DspConfig,
    pub volume: u8,
    pub muted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_eq_is_valid() {
        let cfg = DspConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_nonpositive_q() {
        let mut cfg = DspConfig::default();
        cfg.eq.bands.push(EqBand { freq_hz: 1000.0, gain_db: 3.0, q: 0.0, band_type: BandType::Peaking });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let mut cfg = DspConfig::default();
        cfg.eq.block_size = Some(3000);
        assert!(cfg.validate().is_err());
    }
}
