use crate::error::BridgeError;
use crate::model::{DeviceId, DeviceSnapshot, DspConfig, TrackMetadata};
use tokio::sync::broadcast;
use tracing::warn;

/// Commands are produced by controllers (DLNA SOAP, the web API, Device Manager) and
/// consumed exclusively by the target device's Virtual Device task. A second Play for
/// the same device while the first is still TRANSITIONING supersedes it — that
/// supersession is handled inside the Virtual Device, not the bus.
#[derive(Clone, Debug)]
pub enum Command {
    SetUri { device_id: DeviceId, uri: String, metadata: TrackMetadata },
    Play { device_id: DeviceId, uri: Option<String>, position_s: Option<f64> },
    Pause { device_id: DeviceId },
    Stop { device_id: DeviceId },
    Seek { device_id: DeviceId, position_s: f64 },
    SetVolume { device_id: DeviceId, volume: u8 },
    SetMute { device_id: DeviceId, muted: bool },
    SetDsp { device_id: DeviceId, enabled: bool, config: DspConfig },
    ResetDsp { device_id: DeviceId },
}

impl Command {
    pub fn device_id(&self) -> &str {
        match self {
            Command::SetUri { device_id, .. }
            | Command::Play { device_id, .. }
            | Command::Pause { device_id }
            | Command::Stop { device_id }
            | Command::Seek { device_id, .. }
            | Command::SetVolume { device_id, .. }
            | Command::SetMute { device_id, .. }
            | Command::SetDsp { device_id, .. }
            | Command::ResetDsp { device_id } => device_id,
        }
    }
}

/// State events are published exclusively by the Virtual Device that owns the device_id
/// they describe. Every other component only reacts to these.
#[derive(Clone, Debug)]
pub enum StateEvent {
    TransportChanged { device_id: DeviceId, snapshot: DeviceSnapshot },
    VolumeChanged { device_id: DeviceId, volume: u8, muted: bool },
    DspChanged { device_id: DeviceId, enabled: bool, config: DspConfig },
    Error { device_id: DeviceId, error: BridgeError },
    DeviceAdded { device_id: DeviceId, snapshot: DeviceSnapshot },
    DeviceRemoved { device_id: DeviceId },
}

impl StateEvent {
    pub fn device_id(&self) -> &str {
        match self {
            StateEvent::TransportChanged { device_id, .. }
            | StateEvent::VolumeChanged { device_id, .. }
            | StateEvent::DspChanged { device_id, .. }
            | StateEvent::Error { device_id, .. }
            | StateEvent::DeviceAdded { device_id, .. }
            | StateEvent::DeviceRemoved { device_id } => device_id,
        }
    }
}

#[derive(Clone, Debug)]
pub enum BusEvent {
    Command(Command),
    State(StateEvent),
}

/// Pub/sub core: one topic per EventType (command vs state), subscribers filter on
/// device_id themselves via the helper methods on `EventSubscription`. Publish is
/// non-blocking for the caller; delivery to each subscriber is serialized because each
/// subscriber owns its own receiver and consumes it from a single task.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish_command(&self, cmd: Command) {
        // No receivers yet is not an error — publish is fire-and-forget from the caller's
        // perspective per §4.6.
        let _ = self.tx.send(BusEvent::Command(cmd));
    }

    pub fn publish_state(&self, event: StateEvent) {
        let _ = self.tx.send(BusEvent::State(event));
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription { rx: self.tx.subscribe() }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<BusEvent>,
}

impl EventSubscription {
    /// Next event of any kind, skipping lag gaps with a warning (a lagged subscriber
    /// that cannot keep up loses only its own ordering guarantee, never another's).
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event bus subscriber lagged, dropping events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub async fn recv_state(&mut self) -> Option<StateEvent> {
        loop {
            match self.recv().await? {
                BusEvent::State(event) => return Some(event),
                BusEvent::Command(_) => continue,
            }
        }
    }

    pub async fn recv_state_for(&mut self, device_id: &str) -> Option<StateEvent> {
        loop {
            let event = self.recv_state().await?;
            if event.device_id() == device_id {
                return Some(event);
            }
        }
    }

    pub async fn recv_command_for(&mut self, device_id: &str) -> Option<Command> {
        loop {
            match self.recv().await? {
                BusEvent::Command(cmd) if cmd.device_id() == device_id => return Some(cmd),
                _ => continue,
            }
        }
    }

    /// Non-blocking drain of one already-queued command for `device_id`, if any. Lets a
    /// long-running command handler (a Play mid buffer-gate wait, say) notice a newer
    /// command arriving without waiting for its own work to finish first.
    pub fn try_recv_command_for(&mut self, device_id: &str) -> Option<Command> {
        loop {
            match self.rx.try_recv() {
                Ok(BusEvent::Command(cmd)) if cmd.device_id() == device_id => return Some(cmd),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event bus subscriber lagged, dropping events");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}
