//! Downloader stage (§4.2): spawns the external media tool in stream-copy mode so the
//! original bitstream lands on disk unmodified, for the Decoder to read behind it.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Shared, lock-free counter the buffer-gate step polls (§4.2 "readable bytes_downloaded
/// counter"). `Arc`'d so the spawning task and the polling caller both see live progress.
#[derive(Clone, Default)]
pub struct BytesDownloaded(Arc<AtomicU64>);

impl BytesDownloaded {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

pub struct Downloader {
    child: Child,
    pub cache_path: PathBuf,
    pub bytes_downloaded: BytesDownloaded,
}

impl Downloader {
    /// Spawns `ffmpeg -ss <position_s> -i <uri> -c copy -f matroska <cache_path>` (the
    /// teacher's external-tool invocation shape, adapted from stream-copy mode rather
    /// than transcode), and a background task that tails stderr only for diagnostics —
    /// the authoritative progress signal is the cache file's own growing size. `cancel`
    /// is the same `Notify` the caller fires on tear-down (or once the process exits on
    /// its own), so the file-size poll loop below never outlives its session.
    pub fn spawn(uri: &str, position_s: f64, cache_path: PathBuf, cancel: Arc<Notify>) -> Result<Self> {
        info!(uri, position_s, cache_path = %cache_path.display(), "spawning downloader");

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y");
        if position_s > 0.0 {
            cmd.arg("-ss").arg(format!("{position_s:.3}"));
        }
        cmd.arg("-i")
            .arg(uri)
            .arg("-c")
            .arg("copy")
            .arg("-f")
            .arg("matroska")
            .arg(&cache_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().context("failed to spawn downloader process")?;
        let bytes_downloaded = BytesDownloaded::default();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        // The downloaded-bytes counter is derived from the cache file's own size rather
        // than parsed from ffmpeg's progress output, so it stays meaningful even for
        // tools that don't print progress in a stable format.
        let path_for_poll = cache_path.clone();
        let counter = bytes_downloaded.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.notified() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                        if let Ok(meta) = tokio::fs::metadata(&path_for_poll).await {
                            counter.0.store(meta.len(), Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        Ok(Self { child, cache_path, bytes_downloaded })
    }

    /// Waits for the process to exit. Non-zero status maps to `UpstreamFetch` per §7.
    pub async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await.context("downloader process wait failed")?;
        if !status.success() {
            return Err(anyhow!("downloader exited with status {status}"));
        }
        Ok(())
    }

    /// Tear-down contract step 1/2 analogue: signal exit, give it a grace period, then
    /// force-kill (§4.1 tear-down contract, 2s soft timeout).
    pub async fn shutdown(&mut self, grace: std::time::Duration) {
        if let Some(id) = self.child.id() {
            debug!(pid = id, "signalling downloader to stop");
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("downloader did not exit within grace period, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

async fn drain_stderr(mut stderr: tokio::process::ChildStderr) {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        error!("failed reading downloader stderr: {e}");
        return;
    }
    if !buf.is_empty() {
        debug!(stderr = %String::from_utf8_lossy(&buf), "downloader process exited");
    }
}

/// Deletes the session's cache file, best-effort (§4.1 tear-down contract step 3,
/// §3 "cache file ownership").
pub async fn delete_cache_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "failed to delete cache file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_downloaded_starts_at_zero() {
        let counter = BytesDownloaded::default();
        assert_eq!(counter.get(), 0);
        counter.add(4096);
        assert_eq!(counter.get(), 4096);
    }
}
