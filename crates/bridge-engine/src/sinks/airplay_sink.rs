//! AirPlay output sink (§4.4 "AirPlay sink"). Delegates all RTSP/RTP/ALAC/auth protocol
//! work to an `AirPlayLibrary` implementation (`airplay_lib.rs`) — this struct only owns
//! the `OutputSink` contract: PCM-in, device lifecycle, volume/mute.

use crate::pcm::PcmBlock;
use crate::sink::{OutputSink, WriteOutcome};
use crate::sinks::airplay::AirPlayDevice;
use crate::sinks::airplay_lib::AirPlayLibrary;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::debug;

pub struct AirPlaySink {
    device: Option<AirPlayDevice>,
    library: Box<dyn AirPlayLibrary>,
    is_open: bool,
}

impl AirPlaySink {
    pub fn new(library: Box<dyn AirPlayLibrary>, device: AirPlayDevice) -> Self {
        Self { device: Some(device), library, is_open: false }
    }
}

#[async_trait]
impl OutputSink for AirPlaySink {
    fn name(&self) -> &'static str {
        "airplay"
    }

    async fn open(&mut self, sample_rate: u32, channels: u16, _bit_depth: u16) -> Result<()> {
        debug!("opening AirPlay sink");
        let device = self.device.as_ref().ok_or_else(|| anyhow!("no device set"))?;
        self.library.connect(device, sample_rate, channels).await?;
        self.is_open = true;
        Ok(())
    }

    async fn write(&mut self, block: &PcmBlock) -> Result<WriteOutcome> {
        if !self.is_open {
            return Ok(WriteOutcome::Closed);
        }
        // AirPlay/ALAC operates on 16-bit PCM; the opaque library owns the re-encode.
        let samples: Vec<i16> =
            block.samples.iter().map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).collect();
        self.library.stream_raw_pcm(&samples).await?;
        Ok(WriteOutcome::Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.library.disconnect().await?;
        self.is_open = false;
        Ok(())
    }

    async fn set_volume(&mut self, volume: u8) -> Result<()> {
        // Open Question decision (DESIGN.md): linear 0..100 -> 0.0..1.0, no per-receiver
        // curve fitting — the opaque library owns the receiver-native mapping.
        self.library.set_volume(volume as f32 / 100.0).await
    }

    async fn set_mute(&mut self, muted: bool) -> Result<()> {
        self.library.set_volume(if muted { 0.0 } else { 1.0 }).await
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn latency_ms(&self) -> u32 {
        2000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    struct FakeLibrary {
        connected: bool,
        volume_calls: std::sync::Arc<std::sync::Mutex<Vec<f32>>>,
    }

    #[async_trait]
    impl AirPlayLibrary for FakeLibrary {
        async fn connect(&mut self, _device: &AirPlayDevice, _sample_rate: u32, _channels: u16) -> Result<()> {
            self.connected = true;
            Ok(())
        }
        async fn stream_raw_pcm(&mut self, _samples: &[i16]) -> Result<()> {
            if !self.connected {
                return Err(anyhow!("not connected"));
            }
            Ok(())
        }
        async fn set_volume(&mut self, volume: f32) -> Result<()> {
            self.volume_calls.lock().unwrap().push(volume);
            Ok(())
        }
        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }
    }

    fn fake_device() -> AirPlayDevice {
        AirPlayDevice {
            name: "Test".into(),
            hostname: "test.local".into(),
            port: 7000,
            addresses: vec!["127.0.0.1".parse::<IpAddr>().unwrap()],
            model: None,
            features: None,
        }
    }

    #[tokio::test]
    async fn write_before_open_is_closed_outcome() {
        let lib = Box::new(FakeLibrary { connected: false, volume_calls: Default::default() });
        let mut sink = AirPlaySink::new(lib, fake_device());
        let block = PcmBlock::new(vec![0.0; 4], 44100, 2);
        assert_eq!(sink.write(&block).await.unwrap(), WriteOutcome::Closed);
    }

    #[tokio::test]
    async fn open_then_write_succeeds() {
        let lib = Box::new(FakeLibrary { connected: false, volume_calls: Default::default() });
        let mut sink = AirPlaySink::new(lib, fake_device());
        sink.open(44100, 2, 16).await.unwrap();
        let block = PcmBlock::new(vec![0.1, -0.1, 0.2, -0.2], 44100, 2);
        assert_eq!(sink.write(&block).await.unwrap(), WriteOutcome::Ok);
    }

    #[tokio::test]
    async fn set_volume_maps_linearly() {
        let volume_calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let lib = Box::new(FakeLibrary { connected: false, volume_calls: volume_calls.clone() });
        let mut sink = AirPlaySink::new(lib, fake_device());
        sink.set_volume(50).await.unwrap();
        assert!((volume_calls.lock().unwrap()[0] - 0.5).abs() < 1e-6);
    }
}
