//! Virtual Device (§4.1): the transport state machine. One task per device, owning its
//! Sink, DSP chain, and the current session's Downloader/Decoder. Consumes `Command`s
//! off the event bus in submission order and is the only publisher of `StateEvent`s for
//! its `device_id`.
//!
//! Grounded on the teacher's task-per-resource style (`tokio::sync::mpsc`-fed loop,
//! `tokio::spawn` per long-lived resource) and `manager.rs`/`sink.rs` for how sink
//! lifecycle calls are sequenced — but the shape here is one-device/one-sink/state-
//! machine rather than the teacher's one-manager/many-sinks registry.

use crate::decoder::{DecodedBlock, Decoder};
use crate::downloader::{delete_cache_file, Downloader};
use crate::dsp::DspChain;
use crate::pcm::SampleFormat;
use crate::sink::OutputSink;
use bridge_core::{
    BridgeError, Command, DeviceId, DeviceKind, DeviceSnapshot, DspConfig, EventBus, EventSubscription,
    PcmFormat, StateEvent, TrackMetadata, TransportState,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

const TEARDOWN_GRACE: Duration = Duration::from_secs(2);
const BUFFER_GATE_TIMEOUT: Duration = Duration::from_secs(10);
const SINK_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SAMPLE_RATE: u32 = 44_100;
const DEFAULT_CHANNELS: u16 = 2;
const DEFAULT_BIT_DEPTH: u16 = 16;

/// Everything a Virtual Device task needs at construction: its identity, its one Sink,
/// the event bus, and the filesystem/tuning knobs that would otherwise be global state.
pub struct VirtualDeviceConfig {
    pub device_id: DeviceId,
    pub display_name: String,
    pub kind: DeviceKind,
    pub cache_dir: PathBuf,
    pub buffer_gate_bytes: u64,
}

/// One play-from-URL lifecycle (§ Glossary "Session"). Downloader and Decoder are each
/// owned by their own task so a Seek can tear down and restart only the Decoder while
/// the Downloader keeps running (Open Question #1's "reuse" path).
struct Session {
    cache_path: PathBuf,
    downloader_exited: Arc<AtomicBool>,
    bytes_downloaded: crate::downloader::BytesDownloaded,
    downloader_cancel: Option<Arc<Notify>>,
    downloader_task: Option<tokio::task::JoinHandle<()>>,
    decoder_cancel: Arc<Notify>,
    decoder_task: Option<tokio::task::JoinHandle<()>>,
}

/// What interrupted an in-flight Play/Seek transition, discovered by draining the
/// command queue without blocking while this task is waiting on the buffer gate or the
/// decoder/sink open. A Play or Stop arriving mid-TRANSITIONING wins over whatever is
/// already in flight (§4.1 "A Play arriving during TRANSITIONING cancels the prior Play
/// and waits for tear-down before starting").
enum Interrupt {
    Superseded { uri: Option<String>, position_s: Option<f64> },
    Cancelled,
}

/// The running state a Virtual Device task mutates. Never touched from outside the
/// task — all external interaction is via `Command`s on the bus.
pub struct VirtualDevice {
    config: VirtualDeviceConfig,
    sink: Arc<Mutex<Box<dyn OutputSink>>>,
    bus: EventBus,
    state: TransportState,
    uri: Option<String>,
    metadata: TrackMetadata,
    duration_s: f64,
    elapsed_s: f64,
    volume: u8,
    muted: bool,
    dsp_enabled: Arc<AtomicBool>,
    dsp_config: DspConfig,
    dsp_chain: Option<Arc<Mutex<DspChain>>>,
    paused: Arc<AtomicBool>,
    pause_resume: Arc<Notify>,
    format: Option<PcmFormat>,
    session_id: u64,
    session: Option<Session>,
    error: Option<String>,
}

impl VirtualDevice {
    pub fn new(config: VirtualDeviceConfig, sink: Box<dyn OutputSink>, bus: EventBus) -> Self {
        Self {
            config,
            sink: Arc::new(Mutex::new(sink)),
            bus,
            state: TransportState::NoMediaPresent,
            uri: None,
            metadata: TrackMetadata::default(),
            duration_s: 0.0,
            elapsed_s: 0.0,
            volume: 100,
            muted: false,
            dsp_enabled: Arc::new(AtomicBool::new(false)),
            dsp_config: DspConfig::default(),
            dsp_chain: None,
            paused: Arc::new(AtomicBool::new(false)),
            pause_resume: Arc::new(Notify::new()),
            format: None,
            session_id: 0,
            session: None,
            error: None,
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.config.device_id.clone(),
            display_name: self.config.display_name.clone(),
            kind: Some(self.config.kind),
            transport_state: self.state,
            uri: self.uri.clone(),
            duration_s: self.duration_s,
            elapsed_s: self.elapsed_s,
            metadata: self.metadata.clone(),
            volume: self.volume,
            muted: self.muted,
            dsp_enabled: self.dsp_enabled.load(Ordering::Relaxed),
            dsp_config: self.dsp_config.clone(),
            format: self.format,
            session_id: self.session_id,
            error: self.error.clone(),
        }
    }

    fn publish_transport(&self) {
        self.bus.publish_state(StateEvent::TransportChanged {
            device_id: self.config.device_id.clone(),
            snapshot: self.snapshot(),
        });
    }

    /// Records the error on the device's own snapshot (so `GetTransportInfo`/the web API
    /// can see the last failure) and publishes the transient `Error` event alongside it.
    fn publish_error(&mut self, error: BridgeError) {
        self.error = Some(error.to_string());
        self.bus.publish_state(StateEvent::Error { device_id: self.config.device_id.clone(), error });
    }

    /// Runs until the command subscription closes (bus dropped). One command at a time,
    /// in submission order, per §4.1 "Command serialization" — though a Play/Seek may
    /// itself drain and apply further queued commands while it waits on I/O, see
    /// `poll_for_play_interrupt`.
    pub async fn run(mut self, mut commands: EventSubscription) {
        while let Some(cmd) = commands.recv_command_for(&self.config.device_id).await {
            self.apply(cmd, &mut commands).await;
        }
        self.teardown_session().await;
    }

    async fn apply(&mut self, cmd: Command, commands: &mut EventSubscription) {
        match cmd {
            Command::Stop { .. } => self.do_stop().await,
            Command::SetUri { uri, metadata, .. } => self.do_set_uri(uri, metadata).await,
            Command::Play { uri, position_s, .. } => self.do_play(uri, position_s, commands).await,
            Command::Pause { .. } => self.do_pause().await,
            Command::Seek { position_s, .. } => self.do_seek(position_s, commands).await,
            Command::SetVolume { volume, .. } => self.do_set_volume(volume).await,
            Command::SetMute { muted, .. } => self.do_set_mute(muted).await,
            Command::SetDsp { enabled, config, .. } => self.do_set_dsp(enabled, config).await,
            Command::ResetDsp { .. } => self.do_set_dsp(false, DspConfig::default()).await,
        }
    }

    /// Applies every command except Play/Stop, which `poll_for_play_interrupt` keeps for
    /// itself. Boxed at the `Seek` arm because `do_seek` can call back into `start_session`
    /// and this function, which would otherwise make the mutually recursive future
    /// infinitely sized — the recursion itself only happens in practice when a Seek is
    /// drained while this device is genuinely Playing/Paused, which `do_seek`'s own guard
    /// usually rules out mid-transition.
    async fn apply_non_play(&mut self, cmd: Command, commands: &mut EventSubscription) {
        match cmd {
            Command::SetUri { uri, metadata, .. } => self.do_set_uri(uri, metadata).await,
            Command::Pause { .. } => self.do_pause().await,
            Command::Seek { position_s, .. } => Box::pin(self.do_seek(position_s, commands)).await,
            Command::SetVolume { volume, .. } => self.do_set_volume(volume).await,
            Command::SetMute { muted, .. } => self.do_set_mute(muted).await,
            Command::SetDsp { enabled, config, .. } => self.do_set_dsp(enabled, config).await,
            Command::ResetDsp { .. } => self.do_set_dsp(false, DspConfig::default()).await,
            Command::Play { .. } | Command::Stop { .. } => {
                unreachable!("Play/Stop are consumed by poll_for_play_interrupt before reaching here")
            }
        }
    }

    /// Drains every command already queued for this device without blocking. The last
    /// Play or Stop seen wins and is handed back to the caller as an `Interrupt`; anything
    /// else is applied inline so it isn't lost while this task is busy transitioning.
    async fn poll_for_play_interrupt(&mut self, commands: &mut EventSubscription) -> Option<Interrupt> {
        let mut interrupt = None;
        while let Some(cmd) = commands.try_recv_command_for(&self.config.device_id) {
            match cmd {
                Command::Play { uri, position_s, .. } => {
                    interrupt = Some(Interrupt::Superseded { uri, position_s });
                }
                Command::Stop { .. } => {
                    interrupt = Some(Interrupt::Cancelled);
                }
                other => self.apply_non_play(other, commands).await,
            }
        }
        interrupt
    }

    // --- §4.1 transitions ---

    async fn do_stop(&mut self) {
        self.teardown_session().await;
        self.uri = None;
        self.metadata = TrackMetadata::default();
        self.elapsed_s = 0.0;
        self.session_id += 1;
        self.state = TransportState::Stopped;
        self.error = None;
        self.publish_transport();
    }

    async fn do_set_uri(&mut self, uri: String, metadata: TrackMetadata) {
        if !matches!(self.state, TransportState::Stopped | TransportState::NoMediaPresent) {
            self.publish_error(BridgeError::CommandMalformed(
                "SetURI only valid from STOPPED or NO_MEDIA_PRESENT".into(),
            ));
            return;
        }
        self.uri = Some(uri);
        self.metadata = metadata;
        self.elapsed_s = 0.0;
        self.state = TransportState::Stopped;
        self.error = None;
        self.publish_transport();
    }

    async fn do_play(&mut self, uri: Option<String>, position_s: Option<f64>, commands: &mut EventSubscription) {
        // Resume from pause: no new URI and a session already running.
        if self.state == TransportState::PausedPlayback && uri.is_none() && self.session.is_some() {
            self.paused.store(false, Ordering::Relaxed);
            self.pause_resume.notify_one();
            self.state = TransportState::Playing;
            self.error = None;
            self.publish_transport();
            return;
        }

        let mut target_uri = match uri.or_else(|| self.uri.clone()) {
            Some(u) => u,
            None => {
                self.publish_error(BridgeError::CommandMalformed("Play with no URI set".into()));
                return;
            }
        };
        let mut target_position = position_s.unwrap_or(0.0);

        // A Play arriving while TRANSITIONING supersedes the prior attempt as a whole.
        self.teardown_session().await;

        loop {
            self.uri = Some(target_uri.clone());
            self.session_id += 1;
            self.state = TransportState::Transitioning;
            self.publish_transport();

            match self.start_session(&target_uri, target_position, commands).await {
                Ok(Some(Interrupt::Superseded { uri: new_uri, position_s: new_pos })) => {
                    debug!(
                        device_id = %self.config.device_id,
                        "play superseded by a newer play while transitioning"
                    );
                    self.teardown_session().await;
                    target_uri = new_uri.unwrap_or(target_uri);
                    target_position = new_pos.unwrap_or(0.0);
                    continue;
                }
                Ok(Some(Interrupt::Cancelled)) => {
                    self.teardown_session().await;
                    self.state = TransportState::Stopped;
                    self.error = None;
                    self.publish_transport();
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(device_id = %self.config.device_id, "play failed: {e:#}");
                    self.teardown_session().await;
                    self.state = TransportState::Stopped;
                    self.publish_error(BridgeError::UpstreamFetch(e.to_string()));
                    self.publish_transport();
                    return;
                }
            }
            break;
        }

        self.state = TransportState::Playing;
        self.error = None;
        self.publish_transport();
    }

    async fn do_pause(&mut self) {
        if self.state != TransportState::Playing {
            return;
        }
        self.paused.store(true, Ordering::Relaxed);
        self.state = TransportState::PausedPlayback;
        self.publish_transport();
    }

    async fn do_seek(&mut self, position_s: f64, commands: &mut EventSubscription) {
        if !matches!(self.state, TransportState::Playing | TransportState::PausedPlayback) {
            self.publish_error(BridgeError::CommandMalformed("Seek only valid while playing/paused".into()));
            return;
        }
        let uri = match self.uri.clone() {
            Some(u) => u,
            None => return,
        };

        self.state = TransportState::Transitioning;
        self.publish_transport();

        // Open Question #1 decision: reuse the partial cache file when it already
        // covers the seek target; otherwise tear down fully and restart at `-ss pos`.
        let covers_target = self
            .session
            .as_ref()
            .map(|s| s.bytes_downloaded.get() as f64 >= position_s * bytes_per_second_estimate(self.format))
            .unwrap_or(false);

        self.elapsed_s = position_s;
        let result = if covers_target {
            self.reseek_decoder_only(position_s, commands).await
        } else {
            self.teardown_session().await;
            self.start_session(&uri, position_s, commands).await
        };

        match result {
            Ok(Some(Interrupt::Superseded { uri: new_uri, position_s: new_pos })) => {
                debug!(device_id = %self.config.device_id, "seek superseded by a newer play");
                self.teardown_session().await;
                // A fresh Play fully supersedes an in-flight Seek too (§4.1).
                Box::pin(self.do_play(new_uri.or(Some(uri)), new_pos, commands)).await;
                return;
            }
            Ok(Some(Interrupt::Cancelled)) => {
                self.teardown_session().await;
                self.state = TransportState::Stopped;
                self.error = None;
                self.publish_transport();
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(device_id = %self.config.device_id, "seek failed: {e:#}");
                self.teardown_session().await;
                self.state = TransportState::Stopped;
                self.publish_error(BridgeError::DecoderFailure(e.to_string()));
                self.publish_transport();
                return;
            }
        }

        self.state = TransportState::Playing;
        self.error = None;
        self.publish_transport();
    }

    async fn do_set_volume(&mut self, volume: u8) {
        let volume = volume.min(100);
        self.volume = volume;
        if let Err(e) = self.sink.lock().await.set_volume(volume).await {
            warn!("sink set_volume failed: {e:#}");
        }
        // Idempotent per §3, but still always emits a state event.
        self.bus.publish_state(StateEvent::VolumeChanged {
            device_id: self.config.device_id.clone(),
            volume: self.volume,
            muted: self.muted,
        });
    }

    async fn do_set_mute(&mut self, muted: bool) {
        self.muted = muted;
        if let Err(e) = self.sink.lock().await.set_mute(muted).await {
            warn!("sink set_mute failed: {e:#}");
        }
        self.bus.publish_state(StateEvent::VolumeChanged {
            device_id: self.config.device_id.clone(),
            volume: self.volume,
            muted: self.muted,
        });
    }

    async fn do_set_dsp(&mut self, enabled: bool, config: DspConfig) {
        if let Err(e) = config.validate() {
            self.publish_error(BridgeError::DspConfigInvalid(e));
            return;
        }
        self.dsp_enabled.store(enabled, Ordering::Relaxed);
        self.dsp_config = config.clone();
        // Rebuilds the live chain in place so a running decoder pump picks up the new
        // coefficients at its next block boundary (§4.5), instead of only applying to
        // whatever session starts next.
        if let Some(chain) = &self.dsp_chain {
            let format = self.format.unwrap_or_default();
            *chain.lock().await = DspChain::new(&self.dsp_config, format.sample_rate, format.channels);
        }
        self.bus.publish_state(StateEvent::DspChanged {
            device_id: self.config.device_id.clone(),
            enabled,
            config,
        });
    }

    // --- pipeline lifecycle ---

    /// Starts a brand new session: new cache file, new Downloader, new Decoder.
    async fn start_session(
        &mut self,
        uri: &str,
        position_s: f64,
        commands: &mut EventSubscription,
    ) -> anyhow::Result<Option<Interrupt>> {
        let nonce = self.session_id;
        let cache_path = self.config.cache_dir.join(format!("{}_{}.mkv", self.config.device_id, nonce));
        let _ = tokio::fs::create_dir_all(&self.config.cache_dir).await;

        let downloader_cancel = Arc::new(Notify::new());
        let downloader = Downloader::spawn(uri, position_s, cache_path.clone(), downloader_cancel.clone())?;
        let bytes_downloaded = downloader.bytes_downloaded.clone();

        if let Some(interrupt) = self.wait_for_buffer_gate(&bytes_downloaded, commands).await? {
            downloader_cancel.notify_one();
            downloader.shutdown(TEARDOWN_GRACE).await;
            delete_cache_file(&cache_path).await;
            return Ok(Some(interrupt));
        }

        let downloader_exited = Arc::new(AtomicBool::new(false));
        let downloader_task = spawn_downloader_task(downloader, downloader_exited.clone(), downloader_cancel.clone());

        let interrupt = self.open_decoder_stage(cache_path.clone(), 0.0, downloader_exited.clone(), commands).await?;

        self.session = self.session.take().map(|mut s| {
            s.cache_path = cache_path;
            s.bytes_downloaded = bytes_downloaded;
            s.downloader_exited = downloader_exited;
            s.downloader_cancel = Some(downloader_cancel);
            s.downloader_task = Some(downloader_task);
            s
        });

        Ok(interrupt)
    }

    /// Reuses the existing Downloader (§4.1 Seek row, Open Question #1: "reuse"). Only
    /// the Decoder is torn down and re-spawned against the same cache file at the new
    /// offset; the Downloader keeps appending to it undisturbed.
    async fn reseek_decoder_only(
        &mut self,
        position_s: f64,
        commands: &mut EventSubscription,
    ) -> anyhow::Result<Option<Interrupt>> {
        let Some(session) = self.session.take() else {
            anyhow::bail!("reseek requested with no active session");
        };
        session.decoder_cancel.notify_one();
        if let Some(task) = session.decoder_task {
            let _ = task.await;
        }
        let downloader_exited = session.downloader_exited.clone();
        let cache_path = session.cache_path.clone();
        let bytes_downloaded = session.bytes_downloaded.clone();
        let downloader_cancel = session.downloader_cancel.clone();

        let interrupt = self.open_decoder_stage(cache_path, position_s, downloader_exited, commands).await?;

        // `open_decoder_stage` rebuilds `Session` assuming a fresh Downloader; patch the
        // still-running Downloader's handles back in so tear-down later can reach them.
        self.session = self.session.take().map(|mut s| {
            s.bytes_downloaded = bytes_downloaded;
            s.downloader_cancel = downloader_cancel;
            s.downloader_task = session.downloader_task;
            s
        });

        Ok(interrupt)
    }

    async fn wait_for_buffer_gate(
        &mut self,
        bytes_downloaded: &crate::downloader::BytesDownloaded,
        commands: &mut EventSubscription,
    ) -> anyhow::Result<Option<Interrupt>> {
        let start = std::time::Instant::now();
        loop {
            if let Some(interrupt) = self.poll_for_play_interrupt(commands).await {
                return Ok(Some(interrupt));
            }
            if bytes_downloaded.get() >= self.config.buffer_gate_bytes {
                return Ok(None);
            }
            if start.elapsed() > BUFFER_GATE_TIMEOUT {
                anyhow::bail!("buffer gate timed out waiting for {} bytes", self.config.buffer_gate_bytes);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Spawns the Decoder and its pump task, opening the Sink on first entry into a
    /// session. Leaves a (possibly partially filled) `Session` in `self.session` holding
    /// only the decoder-side handles; callers fill in the downloader-side fields. Checks
    /// once for a queued Play/Stop right after the sink/decoder are up, since that await
    /// is the other place §4.1 calls out as a supersession point.
    async fn open_decoder_stage(
        &mut self,
        cache_path: PathBuf,
        position_s: f64,
        downloader_exited: Arc<AtomicBool>,
        commands: &mut EventSubscription,
    ) -> anyhow::Result<Option<Interrupt>> {
        let sample_rate = DEFAULT_SAMPLE_RATE;
        let channels = DEFAULT_CHANNELS;
        let format = SampleFormat::F32LE;

        let decoder =
            Decoder::spawn(&cache_path, position_s, sample_rate, channels, format, downloader_exited.clone())?;

        if !self.sink.lock().await.is_open() {
            tokio::time::timeout(
                SINK_OPEN_TIMEOUT,
                self.sink.lock().await.open(sample_rate, channels, DEFAULT_BIT_DEPTH),
            )
            .await
            .map_err(|_| anyhow::anyhow!("sink open timed out"))??;
        }
        self.format = Some(PcmFormat { sample_rate, channels, bit_depth: DEFAULT_BIT_DEPTH });

        let dsp_chain = Arc::new(Mutex::new(DspChain::new(&self.dsp_config, sample_rate, channels)));
        self.dsp_chain = Some(dsp_chain.clone());
        self.paused.store(false, Ordering::Relaxed);

        let decoder_cancel = Arc::new(Notify::new());
        let decoder_task = self.spawn_decoder_task(decoder, dsp_chain, decoder_cancel.clone());

        self.session = Some(Session {
            cache_path,
            downloader_exited,
            bytes_downloaded: crate::downloader::BytesDownloaded::default(),
            downloader_cancel: None,
            downloader_task: None,
            decoder_cancel,
            decoder_task: Some(decoder_task),
        });

        Ok(self.poll_for_play_interrupt(commands).await)
    }

    fn spawn_decoder_task(
        &self,
        mut decoder: Decoder,
        dsp_chain: Arc<Mutex<DspChain>>,
        cancel: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        let device_id = self.config.device_id.clone();
        let bus = self.bus.clone();
        let sink = self.sink.clone();
        let dsp_enabled = self.dsp_enabled.clone();
        let paused = self.paused.clone();
        let resume = self.pause_resume.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.notified() => {
                        debug!(device_id = %device_id, "decoder pump cancelled");
                        break;
                    }
                    block = decoder.read_block() => {
                        match block {
                            Ok(DecodedBlock::Block(mut pcm)) => {
                                if pcm.num_frames() == 0 {
                                    continue;
                                }

                                // §4.1 Pause: "Sink stops consuming; Downloader
                                // continues" — hold this already-decoded block here
                                // rather than writing it, until resumed or cancelled.
                                let mut cancelled = false;
                                while paused.load(Ordering::Relaxed) {
                                    tokio::select! {
                                        biased;
                                        _ = cancel.notified() => { cancelled = true; break; }
                                        _ = resume.notified() => {}
                                    }
                                }
                                if cancelled {
                                    break;
                                }

                                if dsp_enabled.load(Ordering::Relaxed) {
                                    dsp_chain.lock().await.process(&mut pcm.samples, pcm.channels);
                                }
                                match sink.lock().await.write(&pcm).await {
                                    Ok(crate::sink::WriteOutcome::Ok) => {}
                                    Ok(crate::sink::WriteOutcome::Overrun) => {
                                        // Backpressure: stall rather than drop frames (§4.4).
                                        tokio::time::sleep(Duration::from_millis(5)).await;
                                    }
                                    Ok(crate::sink::WriteOutcome::Closed) => {
                                        bus.publish_state(StateEvent::Error {
                                            device_id: device_id.clone(),
                                            error: BridgeError::SinkFailure("sink closed unexpectedly".into()),
                                        });
                                        bus.publish_command(Command::Stop { device_id: device_id.clone() });
                                        break;
                                    }
                                    Err(e) => {
                                        bus.publish_state(StateEvent::Error {
                                            device_id: device_id.clone(),
                                            error: BridgeError::SinkFailure(e.to_string()),
                                        });
                                        bus.publish_command(Command::Stop { device_id: device_id.clone() });
                                        break;
                                    }
                                }
                            }
                            Ok(DecodedBlock::Eof) => {
                                // No direct mutation from this task (§9 "no direct
                                // cross-component calls") — a synthetic Stop command
                                // routes end-of-track through the normal state machine.
                                debug!(device_id = %device_id, "decoder reached end of track");
                                bus.publish_command(Command::Stop { device_id: device_id.clone() });
                                break;
                            }
                            Err(e) => {
                                bus.publish_state(StateEvent::Error {
                                    device_id: device_id.clone(),
                                    error: BridgeError::DecoderFailure(e.to_string()),
                                });
                                bus.publish_command(Command::Stop { device_id: device_id.clone() });
                                break;
                            }
                        }
                    }
                }
            }
            decoder.shutdown(TEARDOWN_GRACE).await;
        })
    }

    /// Full tear-down contract (§4.1): Decoder, then Downloader, then cache file, then
    /// Sink. Used for Stop, superseded Play, and any Seek that cannot reuse the cache.
    async fn teardown_session(&mut self) {
        let Some(session) = self.session.take() else { return };
        session.decoder_cancel.notify_one();
        if let Some(task) = session.decoder_task {
            let _ = task.await;
        }
        if let Some(cancel) = session.downloader_cancel {
            cancel.notify_one();
        }
        if let Some(task) = session.downloader_task {
            let _ = task.await;
        }
        session.downloader_exited.store(true, Ordering::Relaxed);
        delete_cache_file(&session.cache_path).await;
        self.dsp_chain = None;
        self.paused.store(false, Ordering::Relaxed);
        if let Err(e) = self.sink.lock().await.close().await {
            warn!("sink close failed during teardown: {e:#}");
        }
    }
}

fn spawn_downloader_task(
    mut downloader: Downloader,
    downloader_exited: Arc<AtomicBool>,
    cancel: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.notified() => {}
            _ = downloader.wait() => {
                downloader_exited.store(true, Ordering::Relaxed);
                // Natural completion also retires the file-size poll loop inside
                // `Downloader` itself, not just the explicit tear-down path.
                cancel.notify_one();
            }
        }
        downloader.shutdown(TEARDOWN_GRACE).await;
    })
}

/// Estimated bytes needed per second of PCM for the current (or default) format, used
/// only to decide whether a partial cache file already covers a seek target (Open
/// Question #1); a rough bound is sufficient since a false negative only costs a
/// redundant re-download, never incorrect playback.
fn bytes_per_second_estimate(format: Option<PcmFormat>) -> f64 {
    let f = format.unwrap_or_default();
    f.sample_rate as f64 * f.channels as f64 * (f.bit_depth as f64 / 8.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_support::FakeSink;
    use bridge_core::EventBus;

    fn make_device(bus: EventBus) -> VirtualDevice {
        let config = VirtualDeviceConfig {
            device_id: "dev-1".into(),
            display_name: "Test Device".into(),
            kind: DeviceKind::LocalSpeaker,
            cache_dir: std::env::temp_dir().join("bridge-engine-tests"),
            buffer_gate_bytes: 0,
        };
        VirtualDevice::new(config, Box::new(FakeSink::new()), bus)
    }

    #[tokio::test]
    async fn stop_from_no_media_is_legal_and_clears_session_uri() {
        let bus = EventBus::new(16);
        let mut device = make_device(bus.clone());
        device.do_stop().await;
        assert_eq!(device.state, TransportState::Stopped);
        assert!(device.uri.is_none());
        assert_eq!(device.session_id, 1);
    }

    #[tokio::test]
    async fn set_uri_from_stopped_records_uri() {
        let bus = EventBus::new(16);
        let mut device = make_device(bus.clone());
        device.state = TransportState::Stopped;
        device.do_set_uri("http://example.com/a.flac".into(), TrackMetadata::default()).await;
        assert_eq!(device.uri.as_deref(), Some("http://example.com/a.flac"));
    }

    #[tokio::test]
    async fn volume_change_always_emits_state_event_even_when_unchanged() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let mut device = make_device(bus.clone());
        device.do_set_volume(50).await;
        device.do_set_volume(50).await;
        for _ in 0..2 {
            match sub.recv_state_for("dev-1").await.unwrap() {
                StateEvent::VolumeChanged { volume, .. } => assert_eq!(volume, 50),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn invalid_dsp_config_is_rejected_without_publishing_change() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let mut device = make_device(bus.clone());
        let mut bad = DspConfig::default();
        bad.eq.bands.push(bridge_core::EqBand {
            freq_hz: -1.0,
            gain_db: 0.0,
            q: 1.0,
            band_type: bridge_core::BandType::Peaking,
        });
        device.do_set_dsp(true, bad).await;
        let event = sub.recv_state_for("dev-1").await.unwrap();
        assert!(matches!(event, StateEvent::Error { .. }));
    }

    #[tokio::test]
    async fn set_uri_from_playing_is_rejected() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let mut device = make_device(bus.clone());
        device.state = TransportState::Playing;
        device.do_set_uri("http://example.com/b.flac".into(), TrackMetadata::default()).await;
        let event = sub.recv_state_for("dev-1").await.unwrap();
        assert!(matches!(event, StateEvent::Error { .. }));
    }

    #[tokio::test]
    async fn pause_sets_flag_without_tearing_down_session() {
        let bus = EventBus::new(16);
        let mut device = make_device(bus.clone());
        device.state = TransportState::Playing;
        device.do_pause().await;
        assert_eq!(device.state, TransportState::PausedPlayback);
        assert!(device.paused.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn pause_from_non_playing_state_is_a_no_op() {
        let bus = EventBus::new(16);
        let mut device = make_device(bus.clone());
        device.state = TransportState::Stopped;
        device.do_pause().await;
        assert_eq!(device.state, TransportState::Stopped);
        assert!(!device.paused.load(Ordering::Relaxed));
    }
}
