//! Local speaker output sink (§4.4 "Local sink"), built on `cpal`. Grounded directly on
//! the teacher's `sinks/local_dac.rs` (`LocalDacSink`/`RingBuffer`), adapted to the f32
//! `PcmBlock` boundary and extended with `set_volume`/`set_mute` as a software gain
//! multiplier applied inside the cpal callback — cpal exposes no OS-mixer API, so there
//! is no hardware volume to delegate to (Open Question decision in DESIGN.md).

use crate::pcm::PcmBlock;
use crate::sink::{OutputSink, WriteOutcome};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct LocalSink {
    device_name: Option<String>,
    host: Host,
    device: Option<Device>,
    stream: Option<Stream>,
    buffer: Arc<Mutex<RingBuffer>>,
    volume: Arc<AtomicU8>,
    muted: Arc<AtomicBool>,
    sample_rate: u32,
    channels: u16,
    is_open: bool,
}

// cpal::Stream is not Send on some hosts; the Virtual Device only ever touches this
// sink from the single task that owns its pipeline, matching the teacher's rationale.
unsafe impl Send for LocalSink {}
unsafe impl Sync for LocalSink {}

struct RingBuffer {
    data: Vec<u8>,
    write_pos: usize,
    read_pos: usize,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity], write_pos: 0, read_pos: 0, capacity }
    }

    fn available_write(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.capacity - (self.write_pos - self.read_pos) - 1
        } else {
            self.read_pos - self.write_pos - 1
        }
    }

    fn available_read(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.capacity - (self.read_pos - self.write_pos)
        }
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.available_write());
        for &byte in &data[..to_write] {
            self.data[self.write_pos] = byte;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
        to_write
    }

    fn read(&mut self, output: &mut [u8]) -> usize {
        let to_read = output.len().min(self.available_read());
        for slot in output.iter_mut().take(to_read) {
            *slot = self.data[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.capacity;
        }
        to_read
    }
}

impl LocalSink {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            host: cpal::default_host(),
            device: None,
            stream: None,
            buffer: Arc::new(Mutex::new(RingBuffer::new(1024 * 1024))),
            volume: Arc::new(AtomicU8::new(100)),
            muted: Arc::new(AtomicBool::new(false)),
            sample_rate: 0,
            channels: 0,
            is_open: false,
        }
    }

    fn select_device(&self) -> Result<Device> {
        if let Some(ref name) = self.device_name {
            let devices = self.host.output_devices()?;
            for device in devices {
                if device.name().as_deref() == Ok(name.as_str()) {
                    info!("selected local output device: {}", name);
                    return Ok(device);
                }
            }
            warn!("device '{}' not found, using default", name);
        }
        self.host.default_output_device().ok_or_else(|| anyhow!("no output device available"))
    }
}

#[async_trait]
impl OutputSink for LocalSink {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open(&mut self, sample_rate: u32, channels: u16, _bit_depth: u16) -> Result<()> {
        debug!("opening local sink at {}Hz x{}ch", sample_rate, channels);
        let device = self.select_device()?;
        let stream_config =
            StreamConfig { channels, sample_rate: cpal::SampleRate(sample_rate), buffer_size: cpal::BufferSize::Default };

        let buffer = self.buffer.clone();
        let volume = self.volume.clone();
        let muted = self.muted.clone();

        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut buf = buffer.lock().unwrap();
                let bytes_needed = data.len() * 4;
                let mut bytes = vec![0u8; bytes_needed];
                let bytes_read = buf.read(&mut bytes);

                let gain = if muted.load(Ordering::Relaxed) { 0.0 } else { volume.load(Ordering::Relaxed) as f32 / 100.0 };

                for (i, chunk) in bytes[..bytes_read].chunks_exact(4).enumerate() {
                    data[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) * gain;
                }
                for sample in data.iter_mut().skip(bytes_read / 4) {
                    *sample = 0.0;
                }
            },
            |err| tracing::error!("local sink stream error: {err}"),
            None,
        )?;
        stream.play()?;

        self.device = Some(device);
        self.stream = Some(stream);
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.is_open = true;
        Ok(())
    }

    async fn write(&mut self, block: &PcmBlock) -> Result<WriteOutcome> {
        if !self.is_open {
            return Ok(WriteOutcome::Closed);
        }
        let mut bytes = Vec::with_capacity(block.samples.len() * 4);
        for &s in &block.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let written = self.buffer.lock().unwrap().write(&bytes);
        if written < bytes.len() {
            warn!("local sink buffer overflow: {} bytes dropped", bytes.len() - written);
            return Ok(WriteOutcome::Overrun);
        }
        Ok(WriteOutcome::Ok)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
        self.device = None;
        self.is_open = false;
        info!("local sink closed");
        Ok(())
    }

    async fn set_volume(&mut self, volume: u8) -> Result<()> {
        self.volume.store(volume.min(100), Ordering::Relaxed);
        Ok(())
    }

    async fn set_mute(&mut self, muted: bool) -> Result<()> {
        self.muted.store(muted, Ordering::Relaxed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn latency_ms(&self) -> u32 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let bytes_buffered = self.buffer.lock().unwrap().available_read();
        let samples_buffered = bytes_buffered / (4 * self.channels as usize);
        let ms = (samples_buffered as f64 / self.sample_rate as f64 * 1000.0) as u32;
        ms + 20
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_write_read_round_trips() {
        let mut buffer = RingBuffer::new(100);
        let data = vec![1u8, 2, 3, 4, 5];
        assert_eq!(buffer.write(&data), 5);
        let mut out = vec![0u8; 5];
        assert_eq!(buffer.read(&mut out), 5);
        assert_eq!(out, data);
    }

    #[test]
    fn ring_buffer_reports_partial_write_on_overflow() {
        let mut buffer = RingBuffer::new(10);
        let data = vec![1u8; 20];
        let written = buffer.write(&data);
        assert!(written < 20);
        assert!(written <= 9);
    }

    #[tokio::test]
    async fn fresh_sink_is_closed() {
        let sink = LocalSink::new(None);
        assert_eq!(sink.name(), "local");
        assert!(!sink.is_open());
    }
}
