//! Device session: the state machine that owns one modem.
//!
//! A [`DeviceSession`] is a handle to a worker task. The worker owns the
//! [`DeviceProfile`] and the AT IO task, brings the modem up, then serves
//! outbound payloads and polls for downlink datagrams until it is
//! disconnected or fails. Everything the worker observes is published on two
//! channels: a `watch` holding the current [`SessionStatus`] and a
//! `broadcast` of [`SessionEvent`]s. A slow broadcast subscriber can miss
//! events, so decoded downlink records are also forwarded without loss to
//! the receiver returned by [`DeviceSession::attach_inbound`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use imok::session::DeviceSessionBuilder;
//! use imok::{DeviceKind, NetworkSettings};
//!
//! # async fn example() -> imok::Result<()> {
//! let session = DeviceSessionBuilder::for_device(DeviceKind::NordicThingy91X, NetworkSettings::default())?
//!     .serial_port("/dev/ttyACM0")
//!     .connect()
//!     .await?;
//! session.wait_ready(Duration::from_secs(180)).await?;
//! session.send(b"I'm OK").await?;
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use imok_at::{AtIo, IoConfig, spawn_io_task};
use imok_core::codec::{self, Record};
use imok_core::device::{DeviceProfile, ProfileDescriptor};
use imok_core::error::{Error, Result};
use imok_core::events::SessionEvent;
use imok_core::message::{Direction, Location};
use imok_core::transport::Transport;
use imok_core::types::{
    DeviceKind, NetworkSettings, PayloadEncoding, SessionState, SessionStatus,
};

/// Delay between downlink polls once the session is ready.
pub const DEFAULT_DOWNLINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Largest raw payload the profile's link carries once encoded for the wire.
pub fn payload_budget(descriptor: &ProfileDescriptor) -> usize {
    match descriptor.encoding {
        PayloadEncoding::Binary => descriptor.mtu,
        PayloadEncoding::HexText => descriptor.mtu / 2,
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent builder for [`DeviceSession`].
///
/// Timeouts and notification prefixes default to the profile's descriptor.
pub struct DeviceSessionBuilder {
    profile: Box<dyn DeviceProfile>,
    serial_port: Option<String>,
    baud_rate: Option<u32>,
    registration_timeout: Option<Duration>,
    downlink_poll_interval: Duration,
    io_config: IoConfig,
    event_capacity: usize,
}

impl DeviceSessionBuilder {
    /// Start from an already-built profile.
    pub fn new(profile: Box<dyn DeviceProfile>) -> Self {
        let io_config = IoConfig::with_prefixes(profile.descriptor().notification_prefixes);
        DeviceSessionBuilder {
            profile,
            serial_port: None,
            baud_rate: None,
            registration_timeout: None,
            downlink_poll_interval: DEFAULT_DOWNLINK_POLL_INTERVAL,
            io_config,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Start from the profile the factory selects for `kind`.
    pub fn for_device(kind: DeviceKind, settings: NetworkSettings) -> Result<Self> {
        Ok(Self::new(crate::create_profile(kind, settings)?))
    }

    /// Serial device path (e.g. `/dev/ttyACM0` or `COM5`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the descriptor's baud rate.
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = Some(baud);
        self
    }

    /// Bound on network registration.
    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = Some(timeout);
        self
    }

    /// Delay between downlink polls once ready (default 1 s).
    pub fn downlink_poll_interval(mut self, interval: Duration) -> Self {
        self.downlink_poll_interval = interval;
        self
    }

    /// Re-sends of an unanswered AT command (default 2).
    pub fn max_retries(mut self, n: u32) -> Self {
        self.io_config.max_retries = n;
        self
    }

    /// How long each idle serial read waits for unsolicited lines.
    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.io_config.idle_poll_interval = interval;
        self
    }

    /// Events a broadcast subscriber may fall behind by before it lags
    /// (default 256).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Start the session over a caller-provided transport.
    ///
    /// This is the entry point for tests (pass a `MockTransport`).
    pub async fn connect_with_transport(self, transport: Box<dyn Transport>) -> Result<DeviceSession> {
        let descriptor = self.profile.descriptor();
        let registration_timeout = self
            .registration_timeout
            .unwrap_or(descriptor.registration_timeout);

        let (status_tx, status_rx) = watch::channel(SessionStatus::new(SessionState::Disconnected));
        let (event_tx, _) = broadcast::channel(self.event_capacity);
        let (location_tx, location_rx) = watch::channel(None);
        let inbound = InboundTap::default();
        let (request_tx, request_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        info!(device = descriptor.name, "starting device session");
        let at = spawn_io_task(transport, self.io_config);
        let worker = Worker {
            profile: self.profile,
            descriptor: descriptor.clone(),
            at,
            status: status_tx,
            events: event_tx.clone(),
            location: location_tx,
            inbound: inbound.clone(),
            requests: request_rx,
            cancel: cancel.clone(),
            registration_timeout,
            downlink_poll_interval: self.downlink_poll_interval,
        };
        let task = tokio::spawn(worker.run());

        Ok(DeviceSession {
            descriptor,
            requests: request_tx,
            status: status_rx,
            events: event_tx,
            location: location_rx,
            inbound,
            cancel,
            task: Some(task),
        })
    }

    /// Open the serial port and start the session.
    ///
    /// Requires [`serial_port()`](Self::serial_port).
    pub async fn connect(self) -> Result<DeviceSession> {
        let port = self
            .serial_port
            .as_deref()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for connect()".into()))?;
        let baud = self
            .baud_rate
            .unwrap_or(self.profile.descriptor().default_baud_rate);
        let transport = imok_transport::SerialTransport::open(port, baud).await?;
        self.connect_with_transport(Box::new(transport)).await
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum SessionRequest {
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Where the worker forwards decoded downlink records, once attached.
#[derive(Clone, Default)]
struct InboundTap(Arc<Mutex<Option<mpsc::UnboundedSender<Record>>>>);

impl InboundTap {
    fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Record>>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forward(&self, record: Record) {
        let mut tap = self.lock();
        if tap.as_ref().is_some_and(|tx| tx.send(record).is_err()) {
            *tap = None;
        }
    }
}

/// Handle to a running device session.
///
/// Dropping the handle disconnects the session.
pub struct DeviceSession {
    descriptor: Arc<ProfileDescriptor>,
    requests: mpsc::Sender<SessionRequest>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    location: watch::Receiver<Option<Location>>,
    inbound: InboundTap,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Descriptor of the device this session drives.
    pub fn descriptor(&self) -> Arc<ProfileDescriptor> {
        self.descriptor.clone()
    }

    /// Current state and failure reason.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// GNSS fix the modem reported during bring-up, if any.
    pub fn location(&self) -> Option<Location> {
        *self.location.borrow()
    }

    /// Receive every downlink record decoded from now on.
    ///
    /// Unlike [`subscribe`](Self::subscribe) this channel never drops
    /// records. Only the most recent receiver is fed.
    pub fn attach_inbound(&self) -> mpsc::UnboundedReceiver<Record> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        rx
    }

    /// Largest raw payload [`send`](Self::send) accepts.
    pub fn payload_budget(&self) -> usize {
        payload_budget(&self.descriptor)
    }

    /// Wait until the session is ready to send.
    ///
    /// Fails with [`Error::SessionFailed`] if bring-up fails and
    /// [`Error::Timeout`] if `timeout` elapses first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.status.clone();
        let wait = async {
            loop {
                let status = rx.borrow_and_update().clone();
                match status.state {
                    s if s.is_ready() => return Ok(()),
                    SessionState::Failed => {
                        return Err(Error::SessionFailed(status.reason.unwrap_or_default()));
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::NotConnected);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Hand one payload to the modem.
    ///
    /// The payload is checked against the link budget before anything is
    /// queued, so [`Error::PayloadTooLarge`] leaves the session untouched.
    /// Requests made during bring-up wait for the session to become ready.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let budget = self.payload_budget();
        if payload.len() > budget {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                mtu: budget,
            });
        }

        let (reply, rx) = oneshot::channel();
        self.requests
            .send(SessionRequest::Send {
                payload: payload.to_vec(),
                reply,
            })
            .await
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    fn closed_error(&self) -> Error {
        let status = self.status();
        match status.state {
            SessionState::Failed => Error::SessionFailed(status.reason.unwrap_or_default()),
            _ => Error::NotConnected,
        }
    }

    /// Stop the session and release the serial port.
    pub async fn disconnect(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    profile: Box<dyn DeviceProfile>,
    descriptor: Arc<ProfileDescriptor>,
    at: AtIo,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    location: watch::Sender<Option<Location>>,
    inbound: InboundTap,
    requests: mpsc::Receiver<SessionRequest>,
    cancel: CancellationToken,
    registration_timeout: Duration,
    downlink_poll_interval: Duration,
}

/// Why the worker loop ended.
enum Exit {
    Disconnect,
    Fail(String),
}

impl Worker {
    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Move to `to`, publishing the change. Refused transitions are logged
    /// and leave the state unchanged.
    fn transition(&self, to: SessionState, reason: Option<String>) -> bool {
        let from = self.state();
        if !from.can_transition_to(to) {
            warn!(%from, %to, "refusing session transition");
            return false;
        }
        debug!(%from, %to, "session transition");
        self.status.send_replace(SessionStatus {
            state: to,
            reason: reason.clone(),
        });
        let _ = self.events.send(SessionEvent::StateChanged { from, to, reason });
        true
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn run(mut self) {
        self.transition(SessionState::Connecting, None);

        let cancel = self.cancel.clone();
        let brought_up = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(None),
            result = self.bring_up() => result.map_err(|e| Some(e.to_string())),
        };
        let exit = match brought_up {
            Ok(()) => self.serve().await,
            Err(None) => Exit::Disconnect,
            Err(Some(reason)) => Exit::Fail(reason),
        };

        match exit {
            Exit::Disconnect => {
                self.transition(SessionState::Disconnected, None);
                info!(device = self.descriptor.name, "session disconnected");
            }
            Exit::Fail(reason) => {
                error!(device = self.descriptor.name, reason = %reason, "session failed");
                self.transition(SessionState::Failed, Some(reason.clone()));
                self.requests.close();
                while let Ok(SessionRequest::Send { reply, .. }) = self.requests.try_recv() {
                    let _ = reply.send(Err(Error::SessionFailed(reason.clone())));
                }
            }
        }

        match self.at.shutdown().await {
            Ok(mut transport) => {
                if let Err(e) = transport.close().await {
                    debug!(error = %e, "closing transport");
                }
            }
            Err(e) => debug!(error = %e, "AT IO task already stopped"),
        }
    }

    async fn bring_up(&mut self) -> Result<()> {
        self.profile.power_on_modem(&self.at).await?;
        if let Some(location) = self.profile.location() {
            info!(
                lat = location.latitude(),
                lon = location.longitude(),
                "GNSS fix available"
            );
            self.location.send_replace(Some(location));
            self.emit(SessionEvent::Location(location));
        }

        self.transition(SessionState::Registering, None);
        let registration = self
            .profile
            .register_network(&self.at, self.registration_timeout)
            .await?;
        info!(stat = registration.stat(), "registered");
        self.emit(SessionEvent::Registration(registration));

        self.profile.open_data_channel(&self.at).await?;
        self.transition(SessionState::Ready, None);
        Ok(())
    }

    async fn serve(&mut self) -> Exit {
        let cancel = self.cancel.clone();
        let mut tick = tokio::time::interval(self.downlink_poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Exit::Disconnect,

                req = self.requests.recv() => match req {
                    Some(SessionRequest::Send { payload, reply }) => {
                        let result = self.send(&payload).await;
                        if cancel.is_cancelled() {
                            let _ = reply.send(result);
                            return Exit::Disconnect;
                        }
                        let fatal = result
                            .as_ref()
                            .err()
                            .filter(|e| e.is_session_fatal())
                            .map(|e| e.to_string());
                        let _ = reply.send(result);
                        if let Some(reason) = fatal {
                            return Exit::Fail(reason);
                        }
                    }
                    None => return Exit::Disconnect,
                },

                _ = tick.tick() => {
                    self.drain_status();
                    if let Err(e) = self.poll().await {
                        if e.is_session_fatal() {
                            return Exit::Fail(e.to_string());
                        }
                        warn!(error = %e, "downlink poll failed");
                    }
                }
            }
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if !self.transition(SessionState::Sending, None) {
            return Err(Error::NotConnected);
        }
        let wire = match self.descriptor.encoding {
            PayloadEncoding::Binary => payload.to_vec(),
            PayloadEncoding::HexText => codec::armor(payload).into_bytes(),
        };

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::NotConnected),
            r = self.profile.send_payload(&self.at, &wire) => r,
        };
        match &result {
            Ok(()) => debug!(len = payload.len(), "payload handed to modem"),
            Err(e) => warn!(error = %e, "send failed"),
        }
        if !cancel.is_cancelled() && !result.as_ref().is_err_and(Error::is_session_fatal) {
            self.transition(SessionState::Ready, None);
        }
        result
    }

    async fn poll(&mut self) -> Result<()> {
        let Some(payload) = self.profile.poll_downlink(&self.at).await? else {
            return Ok(());
        };
        self.transition(SessionState::Receiving, None);
        match codec::decode_payload(&payload, Utc::now(), Direction::Downlink) {
            Ok(record) => {
                match &record {
                    Record::Message(message) => {
                        debug!(id = %message.id(), "downlink message");
                        self.emit(SessionEvent::Inbound(message.clone()));
                    }
                    Record::Ack { acked, .. } => {
                        debug!(acked = %acked, "downlink acknowledgment");
                        self.emit(SessionEvent::AckReceived { acked: *acked });
                    }
                }
                self.inbound.forward(record);
            }
            Err(e) => warn!(error = %e, len = payload.len(), "dropping undecodable downlink"),
        }
        self.transition(SessionState::Ready, None);
        Ok(())
    }

    /// Turn queued status notifications into events.
    fn drain_status(&self) {
        for prefix in self.descriptor.status_prefixes {
            while let Some(line) = self.at.notifications().take(prefix) {
                if let Some(quality) = self.profile.parse_signal_quality(&line) {
                    self.emit(SessionEvent::SignalQuality(quality));
                } else if let Some(registration) = self.profile.parse_registration(&line) {
                    if !registration.is_registered() {
                        warn!(stat = registration.stat(), "modem reports loss of registration");
                    }
                    self.emit(SessionEvent::Registration(registration));
                } else {
                    debug!(line = %line, "unparsed status notification");
                }
            }
        }
    }
}
