//! Decoder stage (§4.3): spawns the external media tool to read the cache file and
//! produce raw PCM on stdout, read back in fixed-size blocks.

use crate::pcm::{bytes_to_pcm, PcmBlock, SampleFormat};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub const FRAMES_PER_BLOCK: usize = 4096;
const SHORT_READ_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Outcome of one `Decoder::read_block` call, distinguishing a genuine end-of-track
/// from a transient short read while the Downloader is still filling the cache file.
pub enum DecodedBlock {
    Block(PcmBlock),
    Eof,
}

pub struct Decoder {
    child: Child,
    stdout: tokio::process::ChildStdout,
    sample_rate: u32,
    channels: u16,
    format: SampleFormat,
    frame_bytes: usize,
    downloader_exited: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Decoder {
    /// Spawns `ffmpeg [-ss pos] -i <cache_path> -f <s16le|f32le> -ar <rate> -ac <channels>
    /// pipe:1`. `position_s` seeks within the (possibly still-growing) cache file, used
    /// by a Seek that reuses the existing Downloader rather than restarting it.
    pub fn spawn(
        cache_path: &PathBuf,
        position_s: f64,
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
        downloader_exited: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<Self> {
        let format_arg = match format {
            SampleFormat::S16LE => "s16le",
            SampleFormat::F32LE => "f32le",
        };

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y");
        if position_s > 0.0 {
            cmd.arg("-ss").arg(format!("{position_s:.3}"));
        }
        cmd.arg("-i")
            .arg(cache_path)
            .arg("-f")
            .arg(format_arg)
            .arg("-ar")
            .arg(sample_rate.to_string())
            .arg("-ac")
            .arg(channels.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().context("failed to spawn decoder process")?;
        let stdout = child.stdout.take().context("decoder process has no stdout pipe")?;

        let frame_bytes = format.bytes_per_sample() * channels.max(1) as usize;

        Ok(Self { child, stdout, sample_rate, channels, format, frame_bytes, downloader_exited })
    }

    /// Reads one fixed-size block. A short read (fewer bytes than a full block) is not
    /// itself end-of-track: it waits and retries unless the Downloader has already
    /// exited, in which case EOF is final (§4.3 "end-of-file... after the Downloader has
    /// exited cleanly marks end-of-track").
    pub async fn read_block(&mut self) -> Result<DecodedBlock> {
        let target_bytes = FRAMES_PER_BLOCK * self.frame_bytes;
        let mut buf = vec![0u8; target_bytes];
        let mut filled = 0usize;

        loop {
            let n = self.stdout.read(&mut buf[filled..]).await.context("decoder stdout read failed")?;
            if n == 0 {
                if filled == 0 {
                    if self.downloader_exited.load(std::sync::atomic::Ordering::Relaxed) {
                        return Ok(DecodedBlock::Eof);
                    }
                    debug!("decoder short read with downloader still running, waiting");
                    tokio::time::sleep(SHORT_READ_RETRY_DELAY).await;
                    continue;
                }
                // Partial final block: still deliver what decoded, rounded to whole frames.
                let usable_frames = filled / self.frame_bytes;
                buf.truncate(usable_frames * self.frame_bytes);
                break;
            }
            filled += n;
            if filled >= target_bytes {
                break;
            }
        }

        let pcm = bytes_to_pcm(&buf, self.format, self.sample_rate, self.channels);
        Ok(DecodedBlock::Block(pcm))
    }

    pub async fn shutdown(&mut self, grace: Duration) {
        if let Some(mut stdin) = self.child.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("decoder did not exit within grace period, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}
