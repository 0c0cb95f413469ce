//! Headset protocol client.
//!
//! Owns one device's session: the stream (split between the read loop and
//! the writer task), the command gate and the observed [`DeviceState`].
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──stream opened──► Connected
//!      ▲                          │                            │
//!      └──── open failed ─────────┘                            │
//!      └──── disconnect() / link lost / EOF ───────────────────┘
//! ```

use crate::domain::device_state::{AncLevel, DeviceState};
use crate::domain::models::{
    BatteryUpdate, ConnectionStatus, DeviceIdentity, DeviceSnapshot, LinkStatus,
};
use crate::domain::settings::ProtocolSettings;
use crate::error::{ProtocolError, Result};
use crate::infrastructure::bluetooth::connection::{RfcommConnector, RfcommEndpoint};
use crate::infrastructure::bluetooth::gate::{CommandGate, Dispatch, DEFAULT_DEBOUNCE};
use crate::infrastructure::bluetooth::protocol::{Command, Message, RFCOMM_CHANNEL};
use crate::infrastructure::bluetooth::reader::{
    FrameHandler, LoopExit, ReadLoop, DEFAULT_POLL_INTERVAL, DEFAULT_READ_TIMEOUT,
};
use crate::infrastructure::bluetooth::writer::spawn_writer_task;
use crate::infrastructure::events::{EventHub, Subscription};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands sent right after the stream opens, in this order
const HANDSHAKE: [Command; 3] = [Command::Connect, Command::QueryStatus, Command::QueryBattery];

/// Runtime configuration for a client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Command debounce window
    pub debounce: Duration,
    /// Pause between read loop polls
    pub poll_interval: Duration,
    /// Upper bound for reading one header or payload
    pub read_timeout: Duration,
    /// Upper bound for opening the stream
    pub connect_timeout: Duration,
    /// RFCOMM service channel
    pub rfcomm_channel: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            rfcomm_channel: RFCOMM_CHANNEL,
        }
    }
}

impl From<&ProtocolSettings> for ClientConfig {
    fn from(settings: &ProtocolSettings) -> Self {
        Self {
            debounce: Duration::from_millis(settings.debounce_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            rfcomm_channel: settings.rfcomm_channel,
        }
    }
}

/// State shared with the read loop
struct Shared {
    identity: DeviceIdentity,
    state: Mutex<DeviceState>,
    events: EventHub<Message>,
    battery: EventHub<BatteryUpdate>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply one inbound frame for a session. Nothing is applied or emitted
    /// once the session is cancelled; `disconnect` cancels before resetting
    /// the state, so a late frame cannot outlive the teardown.
    fn apply_frame(&self, message: Message, payload: &[u8], session: &CancellationToken) {
        let mut battery_update = None;
        {
            let mut state = self.lock_state();
            if session.is_cancelled() {
                debug!("{}: dropping {:?} after disconnect", self.identity.name, message);
                return;
            }
            match message {
                Message::ConnectAck => {
                    info!("{}: connect acknowledged", self.identity.name);
                    state.soft_connected = true;
                }
                Message::AncLevel => match state.apply_anc_report(payload) {
                    Ok(level) => debug!("{}: ANC {}", self.identity.name, level),
                    Err(e) => warn!("{}: {}", self.identity.name, e),
                },
                Message::BatteryLevel => match state.apply_battery_report(payload) {
                    Ok(level) => {
                        debug!("{}: battery {}%", self.identity.name, level);
                        battery_update = Some(level);
                    }
                    Err(e) => warn!("{}: {}", self.identity.name, e),
                },
                Message::Disconnect | Message::Unknown => return,
            }
        }

        if let Some(percentage) = battery_update {
            self.battery.emit(&BatteryUpdate {
                device_id: self.identity.id.clone(),
                percentage,
            });
        }
        // A battery callback may have disconnected the client
        if session.is_cancelled() {
            return;
        }
        self.events.emit(&message);
    }
}

/// Routes frames from one session's read loop
struct SessionFrames {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl FrameHandler for SessionFrames {
    fn handle_frame(&self, message: Message, payload: &[u8]) {
        self.shared.apply_frame(message, payload, &self.cancel);
    }
}

struct Session {
    cancel: CancellationToken,
    gate: CommandGate,
    last_anc_wire: Option<u8>,
}

struct Link {
    status: ConnectionStatus,
    /// Bumped by every connect attempt and disconnect; stale attempts and
    /// read loops compare against it before touching the link
    epoch: u64,
    session: Option<Session>,
}

struct ClientInner {
    shared: Arc<Shared>,
    config: ClientConfig,
    connector: Arc<dyn RfcommConnector>,
    link: Mutex<Link>,
    runtime: Handle,
}

impl ClientInner {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tear the session down. With `epoch`, only if the link still belongs
    /// to that connection.
    fn disconnect(&self, epoch: Option<u64>) {
        let was_active = {
            let mut link = self.lock_link();
            if epoch.is_some_and(|epoch| epoch != link.epoch) {
                return;
            }

            if let Some(session) = link.session.take() {
                session.cancel.cancel();
                session.gate.cancel();
            }
            let was_active = link.status != ConnectionStatus::Disconnected;
            link.status = ConnectionStatus::Disconnected;
            link.epoch += 1;
            was_active
        };

        self.shared.lock_state().reset_session();

        if was_active {
            info!("{}: disconnected", self.shared.identity.name);
            self.shared.events.emit(&Message::Disconnect);
        }
    }

    fn abort_connect(&self, epoch: u64) {
        let mut link = self.lock_link();
        if link.epoch == epoch && link.status == ConnectionStatus::Connecting {
            link.status = ConnectionStatus::Disconnected;
        }
    }
}

/// Client for one headset. Cloning shares the same connection.
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

impl ProtocolClient {
    /// Must be created inside a tokio runtime; background tasks run on it
    pub fn new(
        identity: DeviceIdentity,
        connector: Arc<dyn RfcommConnector>,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                shared: Arc::new(Shared {
                    identity,
                    state: Mutex::new(DeviceState::default()),
                    events: EventHub::new(),
                    battery: EventHub::new(),
                }),
                config,
                connector,
                link: Mutex::new(Link {
                    status: ConnectionStatus::Disconnected,
                    epoch: 0,
                    session: None,
                }),
                runtime: Handle::current(),
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.shared.identity
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock_link().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let status = self.status();
        let state = self.inner.shared.lock_state().clone();
        let identity = &self.inner.shared.identity;
        DeviceSnapshot {
            id: identity.id.clone(),
            name: identity.name.clone(),
            address: identity.address,
            status,
            connected: status == ConnectionStatus::Connected,
            soft_connected: state.soft_connected,
            anc_level: state.anc_level,
            battery_level: state.battery_level,
        }
    }

    /// Open the stream and start the session. Does nothing while a session
    /// exists or another attempt is in flight.
    pub async fn connect(&self) -> Result<()> {
        let epoch = {
            let mut link = self.inner.lock_link();
            if link.status != ConnectionStatus::Disconnected {
                debug!("Connect ignored: already {:?}", link.status);
                return Ok(());
            }
            link.status = ConnectionStatus::Connecting;
            link.epoch += 1;
            link.epoch
        };

        let identity = &self.inner.shared.identity;
        let endpoint =
            RfcommEndpoint::new(identity.address).with_channel(self.inner.config.rfcomm_channel);
        info!("Connecting to {} ({})", identity.name, endpoint);

        let opened = tokio::time::timeout(
            self.inner.config.connect_timeout,
            self.inner.connector.open(&endpoint),
        )
        .await;

        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", identity.name, e);
                self.inner.abort_connect(epoch);
                return Err(ProtocolError::ConnectFailed(e.to_string()));
            }
            Err(_) => {
                error!("Timed out connecting to {}", identity.name);
                self.inner.abort_connect(epoch);
                return Err(ProtocolError::ConnectTimeout);
            }
        };

        let mut link = self.inner.lock_link();
        if link.epoch != epoch || link.status != ConnectionStatus::Connecting {
            debug!("Connection attempt superseded; dropping stream");
            return Ok(());
        }

        let config = &self.inner.config;
        let (read_half, write_half) = tokio::io::split(stream);
        let cancel = CancellationToken::new();

        let (writer, _) = spawn_writer_task(write_half, cancel.clone());
        let gate = CommandGate::new(Arc::new(writer), config.debounce);
        for command in HANDSHAKE {
            if let Err(e) = gate.submit(command, &[], true) {
                warn!("Handshake {:?} not sent: {}", command, e);
            }
        }

        let mut read_loop = ReadLoop::new(
            read_half,
            config.poll_interval,
            config.read_timeout,
            cancel.clone(),
        );
        let frames = SessionFrames {
            shared: self.inner.shared.clone(),
            cancel: cancel.clone(),
        };
        let client: Weak<ClientInner> = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            let shared = &frames.shared;
            if let LoopExit::Disconnected(reason) = read_loop.run(&frames).await {
                match reason {
                    Some(e) => warn!("{}: link lost: {}", shared.identity.name, e),
                    None => info!("{}: stream closed by device", shared.identity.name),
                }
                if let Some(client) = client.upgrade() {
                    client.disconnect(Some(epoch));
                }
            }
        });

        link.session = Some(Session {
            cancel,
            gate,
            last_anc_wire: None,
        });
        link.status = ConnectionStatus::Connected;
        info!("Connected to {}", identity.name);
        Ok(())
    }

    /// Close the session. Safe to call repeatedly or before any connect.
    pub fn disconnect(&self) {
        self.inner.disconnect(None);
    }

    /// Radio-level status change reported by the OS
    pub fn handle_link_status(&self, status: LinkStatus) {
        match status {
            LinkStatus::Connected => {
                if self.status() != ConnectionStatus::Disconnected {
                    return;
                }
                let client = self.clone();
                self.inner.runtime.spawn(async move {
                    if let Err(e) = client.connect().await {
                        warn!("Reconnect after link up failed: {}", e);
                    }
                });
            }
            LinkStatus::Disconnected => self.disconnect(),
        }
    }

    /// Request a logical ANC level (0 = off, 1 = low, 2 = high)
    pub fn set_anc_level(&self, logical: u8) -> Result<()> {
        let level = AncLevel::from_logical(logical)?;
        self.set_anc(level).map(|_| ())
    }

    /// Returns the gate's decision, or `None` when nothing was sent
    pub fn set_anc(&self, level: AncLevel) -> Result<Option<Dispatch>> {
        let wire = level.to_wire();

        let mut link = self.inner.lock_link();
        let Some(session) = link.session.as_mut() else {
            debug!("ANC {} ignored: not connected", level);
            return Ok(None);
        };

        if session.last_anc_wire == Some(wire) {
            debug!("ANC {} already requested", level);
            return Ok(None);
        }

        session.last_anc_wire = Some(wire);
        session.gate.submit(Command::SetAnc, &[wire], false).map(Some)
    }

    pub fn query_status(&self) -> Result<()> {
        self.send_forced(Command::QueryStatus)
    }

    pub fn query_battery(&self) -> Result<()> {
        self.send_forced(Command::QueryBattery)
    }

    fn send_forced(&self, command: Command) -> Result<()> {
        let link = self.inner.lock_link();
        let session = link
            .session
            .as_ref()
            .ok_or(ProtocolError::TransportUnavailable)?;
        session.gate.submit(command, &[], true).map(|_| ())
    }

    /// Receive every message, plus `Message::Disconnect` on teardown
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.shared.events.subscribe(callback)
    }

    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Message>) {
        self.inner.shared.events.subscribe_channel()
    }

    /// Fires for every accepted battery report
    pub fn on_battery_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BatteryUpdate) + Send + Sync + 'static,
    {
        self.inner.shared.battery.subscribe(callback)
    }

    /// Last low-battery threshold the presentation layer notified about
    pub fn low_battery_notified(&self) -> u8 {
        self.inner.shared.lock_state().low_battery_notified
    }

    pub fn set_low_battery_notified(&self, threshold: u8) {
        self.inner.shared.lock_state().low_battery_notified = threshold;
    }
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("device", &self.inner.shared.identity.id)
            .field("status", &self.status())
            .finish()
    }
}
