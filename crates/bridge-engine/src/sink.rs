use crate::pcm::PcmBlock;
use anyhow::Result;
use async_trait::async_trait;

/// Result of writing a PCM block to a Sink (§4.4). `Overrun` means the sink's internal
/// buffer is full; the caller (the decoder/DSP task) must stall rather than drop frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Ok,
    Overrun,
    Closed,
}

/// The one contract both Sink kinds implement (§4.4, §9 "polymorphic sinks as capability
/// sets"). `open` takes the format the Decoder will deliver; a Sink negotiates whatever
/// it needs internally (ALAC re-encode for AirPlay, line format for the local device).
#[async_trait]
pub trait OutputSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(&mut self, sample_rate: u32, channels: u16, bit_depth: u16) -> Result<()>;

    async fn write(&mut self, block: &PcmBlock) -> Result<WriteOutcome>;

    async fn close(&mut self) -> Result<()>;

    async fn set_volume(&mut self, volume: u8) -> Result<()>;

    async fn set_mute(&mut self, muted: bool) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Estimated end-to-end latency in milliseconds (buffering + device/protocol).
    fn latency_ms(&self) -> u32;
}

#[derive(Clone, Debug, Default)]
pub struct SinkStats {
    pub frames_written: u64,
    pub overruns: u64,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Hand-written fake sink, following the teacher's `MockSink` pattern
    /// (`sink.rs`), extended with volume/mute and write tracking so Virtual Device
    /// tests can assert on sink-observed calls.
    #[derive(Clone)]
    pub struct FakeSink {
        pub open: Arc<AtomicBool>,
        pub volume: Arc<AtomicU8>,
        pub muted: Arc<AtomicBool>,
        pub volume_calls: Arc<Mutex<Vec<u8>>>,
        pub frames_written: Arc<Mutex<u64>>,
        pub fail_open: bool,
    }

    impl FakeSink {
        pub fn new() -> Self {
            Self {
                open: Arc::new(AtomicBool::new(false)),
                volume: Arc::new(AtomicU8::new(0)),
                muted: Arc::new(AtomicBool::new(false)),
                volume_calls: Arc::new(Mutex::new(Vec::new())),
                frames_written: Arc::new(Mutex::new(0)),
                fail_open: false,
            }
        }
    }

    #[async_trait]
    impl OutputSink for FakeSink {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn open(&mut self, _sample_rate: u32, _channels: u16, _bit_depth: u16) -> Result<()> {
            if self.fail_open {
                anyhow::bail!("forced open failure");
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn write(&mut self, block: &PcmBlock) -> Result<WriteOutcome> {
            if !self.is_open() {
                return Ok(WriteOutcome::Closed);
            }
            *self.frames_written.lock().await += block.num_frames() as u64;
            Ok(WriteOutcome::Ok)
        }

        async fn close(&mut self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn set_volume(&mut self, volume: u8) -> Result<()> {
            self.volume.store(volume, Ordering::SeqCst);
            self.volume_calls.lock().await.push(volume);
            Ok(())
        }

        async fn set_mute(&mut self, muted: bool) -> Result<()> {
            self.muted.store(muted, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn latency_ms(&self) -> u32 {
            10
        }
    }
}
