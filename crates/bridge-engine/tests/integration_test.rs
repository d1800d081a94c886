//! Cross-module integration tests (§8): drives the event bus and a running
//! `VirtualDevice` together through its public `Command`/`StateEvent` surface rather than
//! calling its private transition methods directly, the way a DLNA controller or the web
//! API would. The pipeline stages (`Downloader`/`Decoder`) that need an external media
//! tool are exercised indirectly through `#[ignore]`d scenarios — see each test's doc
//! comment — matching the teacher's own `#[ignore] // Requires network` convention in
//! `sinks/airplay/discovery.rs` for tests that need an environment this crate cannot
//! assume.

use async_trait::async_trait;
use bridge_core::{Command, DeviceKind, DeviceSnapshot, EventBus, StateEvent, TransportState};
use bridge_engine::pcm::PcmBlock;
use bridge_engine::sink::{OutputSink, WriteOutcome};
use bridge_engine::virtual_device::{VirtualDevice, VirtualDeviceConfig};
use std::time::Duration;

/// A minimal `OutputSink` for driving a `VirtualDevice` in-process without real audio
/// hardware, in the spirit of `airplay_sink.rs`'s own test-local `FakeLibrary`.
#[derive(Default)]
struct FakeSink {
    open: bool,
}

impl FakeSink {
    fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutputSink for FakeSink {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn open(&mut self, _sample_rate: u32, _channels: u16, _bit_depth: u16) -> anyhow::Result<()> {
        self.open = true;
        Ok(())
    }

    async fn write(&mut self, _block: &PcmBlock) -> anyhow::Result<WriteOutcome> {
        Ok(WriteOutcome::Ok)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.open = false;
        Ok(())
    }

    async fn set_volume(&mut self, _volume: u8) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_mute(&mut self, _muted: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn latency_ms(&self) -> u32 {
        0
    }
}

fn device_config(device_id: &str) -> VirtualDeviceConfig {
    VirtualDeviceConfig {
        device_id: device_id.to_string(),
        display_name: format!("{device_id} [D]"),
        kind: DeviceKind::LocalSpeaker,
        cache_dir: std::env::temp_dir().join("bridge-engine-integration-tests"),
        buffer_gate_bytes: 0,
    }
}

async fn recv_transport(sub: &mut bridge_core::EventSubscription, device_id: &str) -> DeviceSnapshot {
    loop {
        match sub.recv_state_for(device_id).await.expect("bus closed before event arrived") {
            StateEvent::TransportChanged { snapshot, .. } => return snapshot,
            _ => continue,
        }
    }
}

/// §8 "Transport legality": an out-of-order command (Seek with no media present) is
/// rejected with an `Error` event rather than silently mutating state, and the device
/// keeps serving subsequent legal commands on the same command stream.
#[tokio::test]
async fn illegal_seek_from_no_media_is_rejected_and_device_stays_usable() {
    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    let device = VirtualDevice::new(device_config("dev-a"), Box::new(FakeSink::new()), bus.clone());
    let handle = tokio::spawn(device.run(bus.subscribe()));

    bus.publish_command(Command::Seek { device_id: "dev-a".into(), position_s: 30.0 });
    match events.recv_state_for("dev-a").await.unwrap() {
        StateEvent::Error { .. } => {}
        other => panic!("expected a rejection, got {other:?}"),
    }

    bus.publish_command(Command::SetUri {
        device_id: "dev-a".into(),
        uri: "http://example.invalid/track.mp3".into(),
        metadata: Default::default(),
    });
    let snapshot = recv_transport(&mut events, "dev-a").await;
    assert_eq!(snapshot.transport_state, TransportState::Stopped);
    assert_eq!(snapshot.uri.as_deref(), Some("http://example.invalid/track.mp3"));

    bus.publish_command(Command::Stop { device_id: "dev-a".into() });
    handle.abort();
}

/// §8 "Volume idempotence": setting the same volume twice still emits two state events
/// (no dedup at the bus or device layer), because §3 documents `SetVolume` as emitting
/// unconditionally.
#[tokio::test]
async fn repeated_identical_volume_emits_an_event_each_time() {
    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    let device = VirtualDevice::new(device_config("dev-b"), Box::new(FakeSink::new()), bus.clone());
    let handle = tokio::spawn(device.run(bus.subscribe()));

    for _ in 0..2 {
        bus.publish_command(Command::SetVolume { device_id: "dev-b".into(), volume: 60 });
    }

    let mut seen = 0;
    for _ in 0..2 {
        match events.recv_state_for("dev-b").await.unwrap() {
            StateEvent::VolumeChanged { volume, .. } => {
                assert_eq!(volume, 60);
                seen += 1;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(seen, 2);

    bus.publish_command(Command::Stop { device_id: "dev-b".into() });
    handle.abort();
}

/// §8 "DSP set + persist": an invalid config publishes `Error` and never reaches
/// `DspChanged`, so a subscribed `ConfigStore` never persists a band list that would fail
/// `DspConfig::validate` on reload.
#[tokio::test]
async fn invalid_dsp_config_never_reaches_dsp_changed() {
    use bridge_core::{BandType, DspConfig, EqBand, EqConfig};

    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    let device = VirtualDevice::new(device_config("dev-c"), Box::new(FakeSink::new()), bus.clone());
    let handle = tokio::spawn(device.run(bus.subscribe()));

    let mut config = DspConfig::default();
    config.eq = EqConfig {
        bands: vec![EqBand { freq_hz: -10.0, gain_db: 0.0, q: 1.0, band_type: BandType::Peaking }],
        ..Default::default()
    };
    bus.publish_command(Command::SetDsp { device_id: "dev-c".into(), enabled: true, config });

    match events.recv_state_for("dev-c").await.unwrap() {
        StateEvent::Error { .. } => {}
        other => panic!("expected rejection, got {other:?}"),
    }

    bus.publish_command(Command::Stop { device_id: "dev-c".into() });
    handle.abort();
}

/// §8 "no cross-talk between devices": commands and events for one device_id never
/// reach a subscriber filtering on a different device_id, even when both devices are
/// live on the same bus at once.
#[tokio::test]
async fn two_devices_on_one_bus_do_not_cross_talk() {
    let bus = EventBus::new(64);
    let mut events_a = bus.subscribe();
    let mut events_b = bus.subscribe();

    let device_a = VirtualDevice::new(device_config("dev-x"), Box::new(FakeSink::new()), bus.clone());
    let device_b = VirtualDevice::new(device_config("dev-y"), Box::new(FakeSink::new()), bus.clone());
    let handle_a = tokio::spawn(device_a.run(bus.subscribe()));
    let handle_b = tokio::spawn(device_b.run(bus.subscribe()));

    bus.publish_command(Command::SetVolume { device_id: "dev-x".into(), volume: 10 });
    bus.publish_command(Command::SetVolume { device_id: "dev-y".into(), volume: 90 });

    let a = events_a.recv_state_for("dev-x").await.unwrap();
    let b = events_b.recv_state_for("dev-y").await.unwrap();
    match (a, b) {
        (StateEvent::VolumeChanged { volume: va, .. }, StateEvent::VolumeChanged { volume: vb, .. }) => {
            assert_eq!(va, 10);
            assert_eq!(vb, 90);
        }
        other => panic!("unexpected events: {other:?}"),
    }

    bus.publish_command(Command::Stop { device_id: "dev-x".into() });
    bus.publish_command(Command::Stop { device_id: "dev-y".into() });
    handle_a.abort();
    handle_b.abort();
}

/// §8.3 "Play supersedes Play while Transitioning": a second Play published before the
/// first has finished buffering must produce exactly one final `PLAYING` transport event,
/// carrying the second URI — never a `PLAYING(a)` followed by a `PLAYING(b)`. Needs a real
/// `ffmpeg` on PATH since it drives two full Downloader/Decoder pipelines.
#[tokio::test]
#[ignore = "requires ffmpeg on PATH and two reachable media URIs"]
async fn second_play_while_transitioning_supersedes_the_first() {
    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    let device = VirtualDevice::new(device_config("dev-sup"), Box::new(FakeSink::new()), bus.clone());
    let handle = tokio::spawn(device.run(bus.subscribe()));

    bus.publish_command(Command::Play {
        device_id: "dev-sup".into(),
        uri: Some("http://example.invalid/a.flac".into()),
        position_s: None,
    });
    bus.publish_command(Command::Play {
        device_id: "dev-sup".into(),
        uri: Some("http://example.invalid/b.flac".into()),
        position_s: None,
    });

    let mut playing_events = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(15));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv_state_for("dev-sup") => {
                if let Some(StateEvent::TransportChanged { snapshot, .. }) = event {
                    if snapshot.transport_state == TransportState::Playing {
                        playing_events.push(snapshot);
                        break;
                    }
                }
            }
            _ = &mut deadline => panic!("device never reached Playing"),
        }
    }

    assert_eq!(playing_events.len(), 1);
    assert_eq!(playing_events[0].uri.as_deref(), Some("http://example.invalid/b.flac"));

    bus.publish_command(Command::Stop { device_id: "dev-sup".into() });
    handle.abort();
}

/// §8 "cold Play" / "upstream fetch failure": Play against a URI no downloader can reach
/// transitions through Transitioning back to Stopped with an Error event, rather than
/// getting stuck. Needs a real `ffmpeg` on PATH to exercise the actual Downloader
/// subprocess spawn and its non-zero-exit failure path.
#[tokio::test]
#[ignore = "requires ffmpeg on PATH and a real (failing) network fetch"]
async fn play_against_unreachable_uri_falls_back_to_stopped_with_error() {
    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    let device = VirtualDevice::new(device_config("dev-z"), Box::new(FakeSink::new()), bus.clone());
    let handle = tokio::spawn(device.run(bus.subscribe()));

    bus.publish_command(Command::Play {
        device_id: "dev-z".into(),
        uri: Some("http://127.0.0.1:1/does-not-exist.mp3".into()),
        position_s: None,
    });

    let deadline = tokio::time::sleep(Duration::from_secs(15));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv_state_for("dev-z") => {
                if let Some(StateEvent::TransportChanged { snapshot, .. }) = event {
                    if snapshot.transport_state == TransportState::Stopped && snapshot.error.is_some() {
                        break;
                    }
                }
            }
            _ = &mut deadline => panic!("device never settled back to Stopped with an error"),
        }
    }

    handle.abort();
}

/// §4.1 Pause: "Sink stops consuming; Downloader continues" — once paused, no further
/// blocks reach the sink until Play resumes, even though the pipeline behind it keeps
/// running. Needs a real `ffmpeg` on PATH to produce an actual stream of decoded blocks.
#[tokio::test]
#[ignore = "requires ffmpeg on PATH and a reachable media URI"]
async fn pause_stops_sink_writes_until_resumed() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSink {
        open: bool,
        writes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OutputSink for CountingSink {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn open(&mut self, _sample_rate: u32, _channels: u16, _bit_depth: u16) -> anyhow::Result<()> {
            self.open = true;
            Ok(())
        }

        async fn write(&mut self, _block: &PcmBlock) -> anyhow::Result<WriteOutcome> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(WriteOutcome::Ok)
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.open = false;
            Ok(())
        }

        async fn set_volume(&mut self, _volume: u8) -> anyhow::Result<()> {
            Ok(())
        }

        async fn set_mute(&mut self, _muted: bool) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn latency_ms(&self) -> u32 {
            0
        }
    }

    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    let writes = Arc::new(AtomicUsize::new(0));
    let sink = CountingSink { open: false, writes: writes.clone() };
    let device = VirtualDevice::new(device_config("dev-pause"), Box::new(sink), bus.clone());
    let handle = tokio::spawn(device.run(bus.subscribe()));

    bus.publish_command(Command::Play {
        device_id: "dev-pause".into(),
        uri: Some("http://example.invalid/a.flac".into()),
        position_s: None,
    });
    let deadline = tokio::time::sleep(Duration::from_secs(15));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv_state_for("dev-pause") => {
                if let Some(StateEvent::TransportChanged { snapshot, .. }) = event {
                    if snapshot.transport_state == TransportState::Playing {
                        break;
                    }
                }
            }
            _ = &mut deadline => panic!("device never reached Playing"),
        }
    }

    bus.publish_command(Command::Pause { device_id: "dev-pause".into() });
    let deadline = tokio::time::sleep(Duration::from_secs(1));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv_state_for("dev-pause") => {
                if let Some(StateEvent::TransportChanged { snapshot, .. }) = event {
                    if snapshot.transport_state == TransportState::PausedPlayback {
                        break;
                    }
                }
            }
            _ = &mut deadline => break,
        }
    }

    let count_at_pause = writes.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(writes.load(Ordering::Relaxed), count_at_pause, "sink kept receiving writes while paused");

    bus.publish_command(Command::Stop { device_id: "dev-pause".into() });
    handle.abort();
}
