//! Dual-channel messenger: one ordered message stream per direction.
//!
//! The console side talks only to the relay: it polls stored uplink records
//! and submits downlink datagrams. The device side talks only to its
//! [`DeviceSession`], plus an optional UDP listener for downlinks delivered
//! to the host directly. Both present the same surface: `submit()` enqueues
//! a [`Message`] and returns its id at once, and everything that happens
//! afterwards arrives as [`MessengerEvent`]s on an unbounded receiver.
//!
//! Inbound messages are emitted in arrival order and at most once per
//! message id. Acknowledgment records travelling the other way mark the
//! matching outbound message [`Acknowledged`](DeliveryStatus::Acknowledged).
//! Delivery is best-effort: an acknowledgment may never arrive.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use imok::messenger::{ConsoleMessengerBuilder, MessengerEvent};
//! use imok::relay::SoracomRelay;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut soracom = SoracomRelay::new()?;
//! soracom.authenticate("keyId-...", "secret-...").await?;
//! soracom.select_sim("8942310022000012345");
//!
//! let (console, mut events) = ConsoleMessengerBuilder::new(Arc::new(soracom)).build();
//! console.submit(console.compose("Are you OK?"))?;
//! while let Some(event) = events.recv().await {
//!     if let MessengerEvent::Inbound(m) = event {
//!         println!("{}: {}", m.timestamp(), m.text());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use imok_core::codec::{self, Record};
use imok_core::error::{Error, Result};
use imok_core::events::SessionEvent;
use imok_core::message::{DeliveryStatus, Direction, Location, Message, MessageId, MessageIdGenerator};
use imok_core::relay::{RelayApi, RelayRecord};
use imok_core::types::{DOWNLINK_UDP_PORT, DeviceKind, PayloadEncoding};
use imok_relay::{RelayClient, RelayCursor};
use imok_transport::UdpTransport;

use crate::session::{DeviceSession, payload_budget};

/// Relay polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on the delay between failing relay polls.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Encoded-size budget for downlinks when the target device is unknown.
///
/// Matches the narrowest supported link.
pub const DEFAULT_DOWNLINK_BUDGET: usize = 128;

/// Message ids remembered for inbound deduplication.
const SEEN_CAPACITY: usize = 4096;

/// Sent messages kept waiting for an acknowledgment.
const ACK_WINDOW: usize = 1024;

/// Largest datagram the UDP listener reads.
const DATAGRAM_MAX: usize = 2048;

/// Something the messenger wants the application to know.
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    /// A message from the far side, delivered once.
    Inbound(Message),
    /// An outbound message changed delivery status.
    StatusChanged {
        id: MessageId,
        status: DeliveryStatus,
    },
    /// An outbound message could not be sent.
    Rejected { id: MessageId, error: String },
    /// Device side only: a session event other than a downlink record.
    Session(SessionEvent),
}

/// What `submit()` does with a message whose record exceeds the link budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OversizePolicy {
    /// Fail with [`Error::PayloadTooLarge`].
    #[default]
    Reject,
    /// Cut the text at a character boundary so the record fits.
    Truncate,
}

// ---------------------------------------------------------------------------
// Shared bookkeeping
// ---------------------------------------------------------------------------

/// Validate direction and size, then produce the binary record.
fn prepare(
    message: &Message,
    direction: Direction,
    budget: usize,
    policy: OversizePolicy,
) -> Result<Vec<u8>> {
    if message.direction() != direction {
        return Err(Error::InvalidParameter(format!(
            "expected a {direction:?} message, got {:?}",
            message.direction()
        )));
    }
    if message.delivery_status() != DeliveryStatus::Pending {
        return Err(Error::InvalidParameter(format!(
            "message {} was already submitted",
            message.id()
        )));
    }
    let len = codec::encoded_len(message);
    if len <= budget {
        return Ok(codec::encode(message));
    }
    match policy {
        OversizePolicy::Reject => Err(Error::PayloadTooLarge { len, mtu: budget }),
        OversizePolicy::Truncate => {
            warn!(id = %message.id(), len, budget, "truncating message text to fit link");
            codec::encode_truncated(message, budget)
        }
    }
}

/// Inbound dedup window.
#[derive(Default)]
struct SeenIds {
    set: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl SeenIds {
    /// Record `id`; false if it was already seen.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY
            && let Some(old) = self.order.pop_front()
        {
            self.set.remove(&old);
        }
        true
    }
}

/// Outbound messages and the events their progress produces.
struct Outbox {
    events: mpsc::UnboundedSender<MessengerEvent>,
    awaiting_ack: HashMap<MessageId, Message>,
    ack_order: VecDeque<MessageId>,
    ack_window: usize,
    seen: SeenIds,
}

impl Outbox {
    fn new(events: mpsc::UnboundedSender<MessengerEvent>) -> Self {
        Outbox {
            events,
            awaiting_ack: HashMap::new(),
            ack_order: VecDeque::new(),
            ack_window: ACK_WINDOW,
            seen: SeenIds::default(),
        }
    }

    fn emit(&self, event: MessengerEvent) {
        let _ = self.events.send(event);
    }

    fn advance(&self, message: &Message, status: DeliveryStatus) -> Option<Message> {
        match message.with_status(status) {
            Ok(next) => {
                self.emit(MessengerEvent::StatusChanged {
                    id: next.id(),
                    status,
                });
                Some(next)
            }
            Err(e) => {
                warn!(id = %message.id(), error = %e, "ignoring status change");
                None
            }
        }
    }

    fn sent(&mut self, message: &Message) {
        let Some(sent) = self.advance(message, DeliveryStatus::Sent) else {
            return;
        };
        self.ack_order.push_back(sent.id());
        self.awaiting_ack.insert(sent.id(), sent);
        // Oldest entries go first; an evicted message simply stays Sent.
        while self.ack_order.len() > self.ack_window {
            let Some(oldest) = self.ack_order.pop_front() else {
                break;
            };
            if self.awaiting_ack.remove(&oldest).is_some() {
                debug!(id = %oldest, "no longer waiting for acknowledgment");
            }
        }
    }

    fn failed(&self, message: &Message, error: &dyn std::fmt::Display) {
        self.advance(message, DeliveryStatus::Failed);
        self.emit(MessengerEvent::Rejected {
            id: message.id(),
            error: error.to_string(),
        });
    }

    fn acknowledged(&mut self, acked: MessageId) {
        match self.awaiting_ack.remove(&acked) {
            Some(message) => {
                self.ack_order.retain(|id| *id != acked);
                info!(id = %acked, "message acknowledged");
                self.advance(&message, DeliveryStatus::Acknowledged);
            }
            None => debug!(id = %acked, "acknowledgment for unknown message"),
        }
    }

    /// Emit `message` unless its id was seen before. Returns whether it was new.
    fn inbound(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id()) {
            debug!(id = %message.id(), "duplicate inbound message dropped");
            return false;
        }
        self.emit(MessengerEvent::Inbound(message));
        true
    }
}

fn ack_record(ids: &MessageIdGenerator, direction: Direction, acked: MessageId) -> Vec<u8> {
    codec::encode_ack(ids.next_id(), direction, acked, Utc::now())
}

// ---------------------------------------------------------------------------
// Console side
// ---------------------------------------------------------------------------

/// Fluent builder for [`ConsoleMessenger`].
pub struct ConsoleMessengerBuilder {
    relay: Arc<dyn RelayApi>,
    poll_interval: Duration,
    max_backoff: Duration,
    page_limit: usize,
    max_pages: usize,
    cursor: RelayCursor,
    budget: usize,
    encoding: PayloadEncoding,
    oversize: OversizePolicy,
    send_acks: bool,
    ids: MessageIdGenerator,
}

impl ConsoleMessengerBuilder {
    pub fn new(relay: Arc<dyn RelayApi>) -> Self {
        ConsoleMessengerBuilder {
            relay,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
            page_limit: imok_relay::client::DEFAULT_PAGE_LIMIT,
            max_pages: imok_relay::client::DEFAULT_MAX_PAGES,
            cursor: RelayCursor::default(),
            budget: DEFAULT_DOWNLINK_BUDGET,
            encoding: PayloadEncoding::Binary,
            oversize: OversizePolicy::default(),
            send_acks: false,
            ids: MessageIdGenerator::new(),
        }
    }

    /// Delay between relay polls (default 5 s).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Cap on the backoff after failing polls (default 60 s).
    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = cap;
        self
    }

    /// Records requested per relay page.
    pub fn page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit;
        self
    }

    /// Continuation pages followed per poll.
    pub fn max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages;
        self
    }

    /// Start polling from `cursor` instead of the beginning of the relay's
    /// history.
    pub fn cursor(mut self, cursor: RelayCursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Size downlinks for `kind`'s link and armor them if it carries text.
    pub fn target_device(mut self, kind: DeviceKind) -> Result<Self> {
        let descriptor = crate::descriptor_for(kind)?;
        self.budget = payload_budget(&descriptor);
        self.encoding = descriptor.encoding;
        Ok(self)
    }

    /// Encoded-size budget for downlink records.
    pub fn downlink_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// What to do with downlinks over the budget (default reject).
    pub fn oversize_policy(mut self, policy: OversizePolicy) -> Self {
        self.oversize = policy;
        self
    }

    /// Answer inbound messages with an acknowledgment downlink (default off).
    pub fn send_acks(mut self, enabled: bool) -> Self {
        self.send_acks = enabled;
        self
    }

    /// Use a fixed id origin instead of a random one.
    pub fn id_origin(mut self, origin: u32) -> Self {
        self.ids = MessageIdGenerator::with_origin(origin);
        self
    }

    /// Spawn the console loop.
    pub fn build(self) -> (ConsoleMessenger, mpsc::UnboundedReceiver<MessengerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let ids = Arc::new(self.ids);

        let console = ConsoleLoop {
            client: RelayClient::new(self.relay)
                .page_limit(self.page_limit)
                .max_pages(self.max_pages),
            cursor: self.cursor,
            poll_interval: self.poll_interval,
            max_backoff: self.max_backoff,
            encoding: self.encoding,
            send_acks: self.send_acks,
            ids: ids.clone(),
            outbox: Outbox::new(event_tx),
        };
        let task = tokio::spawn(console.run(submit_rx, cancel.clone()));

        (
            ConsoleMessenger {
                submit: submit_tx,
                ids,
                budget: self.budget,
                oversize: self.oversize,
                cancel,
                task: Some(task),
            },
            event_rx,
        )
    }
}

/// Console-side messenger.
///
/// Dropping the messenger stops its loop.
pub struct ConsoleMessenger {
    submit: mpsc::UnboundedSender<(Message, Vec<u8>)>,
    ids: Arc<MessageIdGenerator>,
    budget: usize,
    oversize: OversizePolicy,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConsoleMessenger {
    /// A new downlink text message with a fresh id.
    pub fn compose(&self, text: &str) -> Message {
        Message::new(self.ids.next_id(), Direction::Downlink, text)
    }

    /// Queue a downlink message. Returns its id; progress arrives as events.
    pub fn submit(&self, message: Message) -> Result<MessageId> {
        let record = prepare(&message, Direction::Downlink, self.budget, self.oversize)?;
        let id = message.id();
        self.submit
            .send((message, record))
            .map_err(|_| Error::NotConnected)?;
        Ok(id)
    }

    /// Stop polling and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConsoleMessenger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ConsoleLoop {
    client: RelayClient,
    cursor: RelayCursor,
    poll_interval: Duration,
    max_backoff: Duration,
    encoding: PayloadEncoding,
    send_acks: bool,
    ids: Arc<MessageIdGenerator>,
    outbox: Outbox,
}

impl ConsoleLoop {
    async fn run(
        mut self,
        mut submissions: mpsc::UnboundedReceiver<(Message, Vec<u8>)>,
        cancel: CancellationToken,
    ) {
        let mut next_poll = Instant::now();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some((message, record)) = submissions.recv() => {
                    match self.client.submit_downlink(&self.wire(record)).await {
                        Ok(_) => self.outbox.sent(&message),
                        Err(e) => {
                            warn!(id = %message.id(), error = %e, "downlink submission failed");
                            self.outbox.failed(&message, &e);
                        }
                    }
                }

                _ = tokio::time::sleep_until(next_poll) => {
                    let delay = match self.client.poll_uplink(&self.cursor).await {
                        Ok((records, cursor)) => {
                            failures = 0;
                            self.cursor = cursor;
                            for record in records {
                                self.handle_record(record).await;
                            }
                            self.poll_interval
                        }
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            let delay = backoff(self.poll_interval, failures, self.max_backoff);
                            warn!(error = %e, failures, retry_in = ?delay, "relay poll failed");
                            delay
                        }
                    };
                    next_poll = Instant::now() + delay;
                }
            }
        }
        debug!("console messenger stopped");
    }

    fn wire(&self, record: Vec<u8>) -> Vec<u8> {
        match self.encoding {
            PayloadEncoding::Binary => record,
            PayloadEncoding::HexText => codec::armor(&record).into_bytes(),
        }
    }

    async fn handle_record(&mut self, record: RelayRecord) {
        let stored_at = DateTime::from_timestamp_millis(record.time_ms).unwrap_or_else(Utc::now);
        match codec::decode_payload(&record.payload, stored_at, Direction::Uplink) {
            Ok(Record::Message(message)) => {
                let id = message.id();
                if self.outbox.inbound(message) && self.send_acks {
                    let ack = ack_record(&self.ids, Direction::Downlink, id);
                    if let Err(e) = self.client.submit_downlink(&self.wire(ack)).await {
                        warn!(id = %id, error = %e, "acknowledgment not delivered");
                    }
                }
            }
            Ok(Record::Ack { acked, .. }) => self.outbox.acknowledged(acked),
            Err(e) => warn!(key = %record.key, error = %e, "dropping undecodable uplink record"),
        }
    }
}

/// `base * 2^(failures-1)`, capped.
fn backoff(base: Duration, failures: u32, cap: Duration) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(cap)
}

// ---------------------------------------------------------------------------
// Device side
// ---------------------------------------------------------------------------

/// Fluent builder for [`DeviceMessenger`].
pub struct DeviceMessengerBuilder {
    session: DeviceSession,
    udp: Option<UdpTransport>,
    oversize: OversizePolicy,
    send_acks: bool,
    announce_location: bool,
    ids: MessageIdGenerator,
}

impl DeviceMessengerBuilder {
    /// Wrap a connected session.
    pub fn new(session: DeviceSession) -> Self {
        DeviceMessengerBuilder {
            session,
            udp: None,
            oversize: OversizePolicy::default(),
            send_acks: true,
            announce_location: true,
            ids: MessageIdGenerator::new(),
        }
    }

    /// Also accept downlinks on an already-bound UDP socket.
    pub fn udp_listener(mut self, udp: UdpTransport) -> Self {
        self.udp = Some(udp);
        self
    }

    /// Bind the downlink port on all interfaces and accept datagrams only
    /// from `source`.
    pub async fn listen_udp(self, source: Option<IpAddr>) -> Result<Self> {
        let mut udp = UdpTransport::bind_port(DOWNLINK_UDP_PORT).await?;
        if let Some(source) = source {
            udp = udp.with_allowed_source(source);
        }
        Ok(self.udp_listener(udp))
    }

    /// What to do with uplinks over the link budget (default reject).
    pub fn oversize_policy(mut self, policy: OversizePolicy) -> Self {
        self.oversize = policy;
        self
    }

    /// Answer inbound messages with an acknowledgment uplink (default on).
    pub fn send_acks(mut self, enabled: bool) -> Self {
        self.send_acks = enabled;
        self
    }

    /// Send the power-on GNSS fix once the session is ready (default on).
    pub fn announce_location(mut self, enabled: bool) -> Self {
        self.announce_location = enabled;
        self
    }

    /// Use a fixed id origin instead of a random one.
    pub fn id_origin(mut self, origin: u32) -> Self {
        self.ids = MessageIdGenerator::with_origin(origin);
        self
    }

    /// Spawn the device loop (and the UDP listener, if configured).
    pub fn build(self) -> (DeviceMessenger, mpsc::UnboundedReceiver<MessengerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let ids = Arc::new(self.ids);
        let budget = self.session.payload_budget();

        if let Some(udp) = self.udp {
            tokio::spawn(udp_listener(udp, datagram_tx, cancel.clone()));
        }

        // Subscribe before reading state so no change falls between the two.
        let session_events = self.session.subscribe();
        let inbound = self.session.attach_inbound();
        let ready = self.session.status().state.is_ready();
        let fix = self.session.location();
        let mut device = DeviceLoop {
            session_events,
            inbound,
            session: self.session,
            ready,
            announced: !self.announce_location,
            fix,
            send_acks: self.send_acks,
            ids: ids.clone(),
            pending: VecDeque::new(),
            outbox: Outbox::new(event_tx),
        };
        if device.ready && !device.announced {
            device.announce();
        }
        let task = tokio::spawn(device.run(submit_rx, datagram_rx, cancel.clone()));

        (
            DeviceMessenger {
                submit: submit_tx,
                ids,
                budget,
                oversize: self.oversize,
                cancel,
                task: Some(task),
            },
            event_rx,
        )
    }
}

/// Device-side messenger. Owns the session.
///
/// Dropping the messenger disconnects the session.
pub struct DeviceMessenger {
    submit: mpsc::UnboundedSender<(Message, Vec<u8>)>,
    ids: Arc<MessageIdGenerator>,
    budget: usize,
    oversize: OversizePolicy,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DeviceMessenger {
    /// A new uplink text message with a fresh id.
    pub fn compose(&self, text: &str) -> Message {
        Message::new(self.ids.next_id(), Direction::Uplink, text)
    }

    /// Queue an uplink message. Returns its id; progress arrives as events.
    ///
    /// Messages are sent in submission order once the session is ready.
    pub fn submit(&self, message: Message) -> Result<MessageId> {
        let record = prepare(&message, Direction::Uplink, self.budget, self.oversize)?;
        let id = message.id();
        self.submit
            .send((message, record))
            .map_err(|_| Error::NotConnected)?;
        Ok(id)
    }

    /// Stop the loop and disconnect the session.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DeviceMessenger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Outgoing {
    Message(Message, Vec<u8>),
    Ack(MessageId, Vec<u8>),
}

struct DeviceLoop {
    session: DeviceSession,
    session_events: broadcast::Receiver<SessionEvent>,
    inbound: mpsc::UnboundedReceiver<Record>,
    ready: bool,
    announced: bool,
    fix: Option<Location>,
    send_acks: bool,
    ids: Arc<MessageIdGenerator>,
    pending: VecDeque<Outgoing>,
    outbox: Outbox,
}

impl DeviceLoop {
    async fn run(
        mut self,
        mut submissions: mpsc::UnboundedReceiver<(Message, Vec<u8>)>,
        mut datagrams: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            self.flush().await;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = self.session_events.recv() => match event {
                    Ok(event) => self.handle_session_event(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "session events lagged");
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                Some(record) = self.inbound.recv() => self.handle_record(record),

                Some((message, record)) = submissions.recv() => {
                    self.pending.push_back(Outgoing::Message(message, record));
                }

                Some(datagram) = datagrams.recv() => {
                    match codec::decode_payload(&datagram, Utc::now(), Direction::Downlink) {
                        Ok(record) => self.handle_record(record),
                        Err(e) => warn!(error = %e, len = datagram.len(), "dropping undecodable datagram"),
                    }
                }
            }
        }

        for outgoing in self.pending.drain(..) {
            if let Outgoing::Message(message, _) = outgoing {
                self.outbox.failed(&message, &Error::NotConnected);
            }
        }
        self.session.disconnect().await;
        debug!("device messenger stopped");
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            // Downlink records arrive on the inbound channel.
            SessionEvent::Inbound(_) | SessionEvent::AckReceived { .. } => {}
            SessionEvent::StateChanged { to, .. } => {
                self.ready = to.is_ready();
                if to.is_ready() && !self.announced {
                    self.announce();
                }
                self.outbox.emit(MessengerEvent::Session(event));
            }
            SessionEvent::Location(location) => {
                self.fix = Some(location);
                if self.ready && !self.announced {
                    self.announce();
                }
                self.outbox.emit(MessengerEvent::Session(event));
            }
            other => self.outbox.emit(MessengerEvent::Session(other)),
        }
    }

    fn handle_record(&mut self, record: Record) {
        match record {
            Record::Message(message) => {
                let id = message.id();
                if self.outbox.inbound(message) && self.send_acks {
                    let ack = ack_record(&self.ids, Direction::Uplink, id);
                    self.pending.push_back(Outgoing::Ack(id, ack));
                }
            }
            Record::Ack { acked, .. } => self.outbox.acknowledged(acked),
        }
    }

    /// Re-read what lagged events would have told us.
    fn resync(&mut self) {
        self.ready = self.session.status().state.is_ready();
        if self.fix.is_none() {
            self.fix = self.session.location();
        }
        if self.ready && !self.announced {
            self.announce();
        }
    }

    /// Queue the power-on fix as a location-only uplink, once.
    fn announce(&mut self) {
        let Some(fix) = self.fix else {
            return;
        };
        self.announced = true;
        let message = Message::location_only(self.ids.next_id(), Direction::Uplink, fix);
        info!(id = %message.id(), "announcing GNSS fix");
        let record = codec::encode(&message);
        self.pending.push_front(Outgoing::Message(message, record));
    }

    /// Hand queued records to the session while it is ready.
    async fn flush(&mut self) {
        if self.session.status().state == imok_core::types::SessionState::Failed {
            let reason = self.session.status().reason.unwrap_or_default();
            for outgoing in self.pending.drain(..) {
                if let Outgoing::Message(message, _) = outgoing {
                    self.outbox.failed(&message, &Error::SessionFailed(reason.clone()));
                }
            }
            return;
        }

        while self.ready {
            let Some(outgoing) = self.pending.pop_front() else {
                break;
            };
            match outgoing {
                Outgoing::Message(message, record) => match self.session.send(&record).await {
                    Ok(()) => self.outbox.sent(&message),
                    Err(e) => {
                        warn!(id = %message.id(), error = %e, "uplink failed");
                        self.outbox.failed(&message, &e);
                    }
                },
                Outgoing::Ack(acked, record) => {
                    if let Err(e) = self.session.send(&record).await {
                        warn!(id = %acked, error = %e, "acknowledgment not sent");
                    }
                }
            }
        }
    }
}

async fn udp_listener(udp: UdpTransport, datagrams: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) {
    info!(local = %udp.local_addr(), "listening for downlink datagrams");
    let mut buf = vec![0u8; DATAGRAM_MAX];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = udp.recv_from(&mut buf, Duration::from_secs(1)) => match result {
                Ok((n, source)) => {
                    debug!(%source, bytes = n, "downlink datagram");
                    if datagrams.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(Error::Timeout) => {}
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imok_core::relay::{RelayError, RelayErrorKind};
    use imok_core::types::SessionState;
    use imok_test_harness::MockRelay;

    use crate::testing::{Script, descriptor, lock, start_session, start_session_with};

    fn uplink(origin: u32, seq: u32, text: &str) -> Message {
        Message::new(MessageId::new(origin, seq), Direction::Uplink, text)
    }

    fn stored(time_ms: i64, message: &Message) -> RelayRecord {
        RelayRecord::new(time_ms, codec::encode(message))
    }

    fn console(relay: &MockRelay) -> ConsoleMessengerBuilder {
        ConsoleMessengerBuilder::new(Arc::new(relay.clone()))
            .poll_interval(Duration::from_millis(10))
            .id_origin(0xC0)
    }

    async fn next_matching<F>(
        events: &mut mpsc::UnboundedReceiver<MessengerEvent>,
        mut pred: F,
    ) -> MessengerEvent
    where
        F: FnMut(&MessengerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("no matching event")
    }

    async fn inbound_texts(
        events: &mut mpsc::UnboundedReceiver<MessengerEvent>,
        count: usize,
    ) -> Vec<String> {
        let mut out = Vec::new();
        while out.len() < count {
            if let MessengerEvent::Inbound(m) =
                next_matching(events, |e| matches!(e, MessengerEvent::Inbound(_))).await
            {
                out.push(m.text().to_string());
            }
        }
        out
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff(base, 1, cap), Duration::from_secs(5));
        assert_eq!(backoff(base, 2, cap), Duration::from_secs(10));
        assert_eq!(backoff(base, 4, cap), Duration::from_secs(40));
        assert_eq!(backoff(base, 5, cap), cap);
        assert_eq!(backoff(base, 500, cap), cap);
    }

    #[test]
    fn prepare_checks_direction_and_size() {
        let m = uplink(1, 1, "hello");
        assert!(matches!(
            prepare(&m, Direction::Downlink, 128, OversizePolicy::Reject),
            Err(Error::InvalidParameter(_))
        ));

        let big = uplink(1, 2, &"x".repeat(10_000));
        assert!(matches!(
            prepare(&big, Direction::Uplink, 50, OversizePolicy::Reject),
            Err(Error::PayloadTooLarge { mtu: 50, .. })
        ));
        let cut = prepare(&big, Direction::Uplink, 50, OversizePolicy::Truncate).unwrap();
        assert_eq!(cut.len(), 50);

        let sent = m.with_status(DeliveryStatus::Sent).unwrap();
        assert!(prepare(&sent, Direction::Uplink, 128, OversizePolicy::Reject).is_err());
    }

    #[test]
    fn outbox_forgets_oldest_beyond_ack_window() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut outbox = Outbox::new(tx);
        outbox.ack_window = 2;
        let messages: Vec<_> = (1..=3).map(|seq| uplink(0xD0, seq, "x")).collect();
        for message in &messages {
            outbox.sent(message);
        }
        assert_eq!(outbox.awaiting_ack.len(), 2);
        assert!(!outbox.awaiting_ack.contains_key(&messages[0].id()));
        while rx.try_recv().is_ok() {}

        outbox.acknowledged(messages[0].id());
        assert!(rx.try_recv().is_err());

        outbox.acknowledged(messages[2].id());
        assert!(matches!(
            rx.try_recv(),
            Ok(MessengerEvent::StatusChanged { id, status: DeliveryStatus::Acknowledged })
                if id == messages[2].id()
        ));
        assert_eq!(outbox.ack_order, VecDeque::from([messages[1].id()]));
    }

    #[test]
    fn seen_ids_window() {
        let mut seen = SeenIds::default();
        assert!(seen.insert(MessageId(1)));
        assert!(!seen.insert(MessageId(1)));
        for i in 2..=(SEEN_CAPACITY as u64 + 1) {
            seen.insert(MessageId(i));
        }
        assert!(seen.insert(MessageId(1)));
    }

    #[tokio::test]
    async fn console_emits_overlapping_pages_once_in_order() {
        let (a, b, c) = (uplink(9, 1, "A"), uplink(9, 2, "B"), uplink(9, 3, "C"));
        let relay = MockRelay::new();
        relay.push_page(vec![stored(1000, &a), stored(2000, &b)]);
        relay.push_page(vec![stored(2000, &b), stored(3000, &c)]);

        let (messenger, mut events) = console(&relay).build();
        assert_eq!(inbound_texts(&mut events, 3).await, vec!["A", "B", "C"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, MessengerEvent::Inbound(_)), "duplicate: {event:?}");
        }
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_dedups_retransmitted_message() {
        let a = uplink(9, 1, "A");
        let relay = MockRelay::new();
        relay.push_page(vec![stored(1000, &a)]);
        relay.push_page(vec![stored(5000, &a), stored(6000, &uplink(9, 2, "B"))]);

        let (messenger, mut events) = console(&relay).build();
        assert_eq!(inbound_texts(&mut events, 2).await, vec!["A", "B"]);
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_decodes_legacy_records() {
        let relay = MockRelay::new();
        relay.push_page(vec![
            RelayRecord::new(1000, b"I'm OK".to_vec()),
            RelayRecord::new(2000, br#"["LOCATION","35.6812362","139.7671248"]"#.to_vec()),
            RelayRecord::new(3000, vec![0xA1, 0xFF]),
        ]);

        let (messenger, mut events) = console(&relay).build();
        let first = next_matching(&mut events, |e| matches!(e, MessengerEvent::Inbound(_))).await;
        let second = next_matching(&mut events, |e| matches!(e, MessengerEvent::Inbound(_))).await;
        let (MessengerEvent::Inbound(text), MessengerEvent::Inbound(loc)) = (first, second) else {
            unreachable!()
        };
        assert_eq!(text.text(), "I'm OK");
        assert_eq!(text.timestamp().timestamp_millis(), 1000);
        assert_eq!(loc.location().unwrap().lat_e7(), 356_812_362);
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_submit_marks_sent() {
        let relay = MockRelay::new();
        let (messenger, mut events) = console(&relay).build();

        let message = messenger.compose("Are you OK?");
        let id = messenger.submit(message.clone()).unwrap();
        assert_eq!(id.origin(), 0xC0);

        let event = next_matching(&mut events, |e| matches!(e, MessengerEvent::StatusChanged { .. })).await;
        assert!(matches!(
            event,
            MessengerEvent::StatusChanged { id: got, status: DeliveryStatus::Sent } if got == id
        ));
        assert_eq!(relay.submissions(), vec![codec::encode(&message)]);
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_submit_failure_is_reported() {
        let relay = MockRelay::new();
        relay.push_submit_error(RelayError::new(RelayErrorKind::Network, "connection reset"));
        let (messenger, mut events) = console(&relay).build();

        let id = messenger.submit(messenger.compose("hello")).unwrap();
        let status = next_matching(&mut events, |e| matches!(e, MessengerEvent::StatusChanged { .. })).await;
        assert!(matches!(
            status,
            MessengerEvent::StatusChanged { status: DeliveryStatus::Failed, .. }
        ));
        let rejected = next_matching(&mut events, |e| matches!(e, MessengerEvent::Rejected { .. })).await;
        let MessengerEvent::Rejected { id: got, error } = rejected else {
            unreachable!()
        };
        assert_eq!(got, id);
        assert!(error.contains("connection reset"));
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_rejects_oversized_and_wrong_direction() {
        let relay = MockRelay::new();
        let (messenger, _events) = console(&relay).downlink_budget(40).build();

        let long = messenger.compose(&"x".repeat(100));
        assert!(matches!(
            messenger.submit(long),
            Err(Error::PayloadTooLarge { mtu: 40, .. })
        ));
        assert!(matches!(
            messenger.submit(uplink(1, 1, "wrong way")),
            Err(Error::InvalidParameter(_))
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(relay.submissions().is_empty());
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_truncates_when_asked() {
        let relay = MockRelay::new();
        let (messenger, mut events) = console(&relay)
            .downlink_budget(40)
            .oversize_policy(OversizePolicy::Truncate)
            .build();

        messenger.submit(messenger.compose(&"x".repeat(100))).unwrap();
        next_matching(&mut events, |e| matches!(e, MessengerEvent::StatusChanged { .. })).await;
        assert_eq!(relay.submissions()[0].len(), 40);
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_marks_acknowledged() {
        let relay = MockRelay::new();
        let (messenger, mut events) = console(&relay).build();

        let id = messenger.submit(messenger.compose("ping")).unwrap();
        next_matching(&mut events, |e| {
            matches!(e, MessengerEvent::StatusChanged { status: DeliveryStatus::Sent, .. })
        })
        .await;

        let ack = codec::encode_ack(MessageId::new(9, 50), Direction::Uplink, id, Utc::now());
        relay.push_page(vec![RelayRecord::new(5000, ack)]);
        let event = next_matching(&mut events, |e| {
            matches!(e, MessengerEvent::StatusChanged { status: DeliveryStatus::Acknowledged, .. })
        })
        .await;
        assert!(matches!(event, MessengerEvent::StatusChanged { id: got, .. } if got == id));
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_acks_inbound_when_enabled() {
        let a = uplink(9, 1, "A");
        let relay = MockRelay::new();
        relay.push_page(vec![stored(1000, &a)]);
        let (messenger, mut events) = console(&relay).send_acks(true).build();

        inbound_texts(&mut events, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let submissions = relay.submissions();
        assert_eq!(submissions.len(), 1);
        match codec::decode(&submissions[0]).unwrap() {
            Record::Ack { acked, direction, .. } => {
                assert_eq!(acked, a.id());
                assert_eq!(direction, Direction::Downlink);
            }
            other => panic!("expected ack, got {other:?}"),
        }
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_recovers_after_poll_errors() {
        let relay = MockRelay::new();
        relay.push_fetch_error(RelayError::from_status(503, "maintenance"));
        relay.push_fetch_error(RelayError::new(RelayErrorKind::Network, "reset"));
        relay.push_page(vec![stored(1000, &uplink(9, 1, "after"))]);

        let (messenger, mut events) = console(&relay).max_backoff(Duration::from_millis(40)).build();
        assert_eq!(inbound_texts(&mut events, 1).await, vec!["after"]);
        assert!(relay.fetches().len() >= 3);
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn console_hex_target_armors_downlinks() {
        let relay = MockRelay::new();
        let (messenger, mut events) = console(&relay)
            .target_device(DeviceKind::NordicThingy91X)
            .unwrap()
            .build();

        let message = messenger.compose("hi");
        messenger.submit(message.clone()).unwrap();
        next_matching(&mut events, |e| matches!(e, MessengerEvent::StatusChanged { .. })).await;
        assert_eq!(
            relay.submissions()[0],
            codec::armor(&codec::encode(&message)).into_bytes()
        );
        messenger.shutdown().await;
    }

    async fn device(script: Script) -> (DeviceMessenger, mpsc::UnboundedReceiver<MessengerEvent>, crate::testing::SharedScript) {
        let (session, script, _) = start_session(descriptor(PayloadEncoding::Binary, 128), script).await;
        let (messenger, events) = DeviceMessengerBuilder::new(session).id_origin(0xD0).build();
        (messenger, events, script)
    }

    #[tokio::test]
    async fn device_sends_in_submission_order() {
        let (messenger, mut events, script) = device(Script::default()).await;

        let first = messenger.compose("one");
        let second = messenger.compose("two");
        messenger.submit(first.clone()).unwrap();
        messenger.submit(second.clone()).unwrap();

        for _ in 0..2 {
            next_matching(&mut events, |e| {
                matches!(e, MessengerEvent::StatusChanged { status: DeliveryStatus::Sent, .. })
            })
            .await;
        }
        assert_eq!(
            lock(&script).sent,
            vec![codec::encode(&first), codec::encode(&second)]
        );
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn device_inbound_is_deduplicated_and_acked() {
        let downlink = Message::new(MessageId::new(0xC0, 1), Direction::Downlink, "are you ok?");
        let mut script = Script::default();
        script.downlink.push_back(codec::encode(&downlink));
        script.downlink.push_back(codec::encode(&downlink));
        let (messenger, mut events, script) = device(script).await;

        let event = next_matching(&mut events, |e| matches!(e, MessengerEvent::Inbound(_))).await;
        assert!(matches!(event, MessengerEvent::Inbound(ref m) if m.id() == downlink.id()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, MessengerEvent::Inbound(_)));
        }
        let sent = lock(&script).sent.clone();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            codec::decode(&sent[0]).unwrap(),
            Record::Ack { acked, direction: Direction::Uplink, .. } if acked == downlink.id()
        ));
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn device_ack_marks_acknowledged() {
        let (messenger, mut events, script) = device(Script::default()).await;
        let id = messenger.submit(messenger.compose("I'm OK")).unwrap();
        next_matching(&mut events, |e| {
            matches!(e, MessengerEvent::StatusChanged { status: DeliveryStatus::Sent, .. })
        })
        .await;

        let ack = codec::encode_ack(MessageId::new(0xC0, 9), Direction::Downlink, id, Utc::now());
        lock(&script).downlink.push_back(ack);
        let event = next_matching(&mut events, |e| {
            matches!(e, MessengerEvent::StatusChanged { status: DeliveryStatus::Acknowledged, .. })
        })
        .await;
        assert!(matches!(event, MessengerEvent::StatusChanged { id: got, .. } if got == id));
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn device_announces_fix_once() {
        let fix = Location::from_degrees(35.6812362, 139.7671248).unwrap();
        let script = Script {
            location: Some(fix),
            ..Script::default()
        };
        let (messenger, mut events, script) = device(script).await;

        next_matching(&mut events, |e| {
            matches!(e, MessengerEvent::StatusChanged { status: DeliveryStatus::Sent, .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = lock(&script).sent.clone();
        assert_eq!(sent.len(), 1);
        let Record::Message(announced) = codec::decode(&sent[0]).unwrap() else {
            panic!("expected a message record");
        };
        assert_eq!(announced.location(), Some(&fix));
        assert!(announced.text().is_empty());
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn device_announces_fix_when_built_after_ready() {
        let fix = Location::from_degrees(35.6812362, 139.7671248).unwrap();
        let script = Script {
            location: Some(fix),
            ..Script::default()
        };
        let (session, script, _) = start_session(descriptor(PayloadEncoding::Binary, 128), script).await;
        session.wait_ready(Duration::from_secs(2)).await.unwrap();
        let (messenger, mut events) = DeviceMessengerBuilder::new(session).id_origin(0xD0).build();

        next_matching(&mut events, |e| {
            matches!(e, MessengerEvent::StatusChanged { status: DeliveryStatus::Sent, .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = lock(&script).sent.clone();
        assert_eq!(sent.len(), 1);
        let Record::Message(announced) = codec::decode(&sent[0]).unwrap() else {
            panic!("expected a message record");
        };
        assert_eq!(announced.location(), Some(&fix));
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn device_inbound_survives_session_event_lag() {
        let downlinks: Vec<_> = (1..=6)
            .map(|seq| Message::new(MessageId::new(0xC0, seq), Direction::Downlink, format!("m{seq}")))
            .collect();
        let mut script = Script::default();
        for message in &downlinks {
            script.downlink.push_back(codec::encode(message));
        }
        let (session, _, _) = start_session_with(
            descriptor(PayloadEncoding::Binary, 128),
            script,
            |b| b.event_capacity(1),
        )
        .await;
        let (messenger, mut events) = DeviceMessengerBuilder::new(session)
            .send_acks(false)
            .build();

        for expected in &downlinks {
            let event = next_matching(&mut events, |e| matches!(e, MessengerEvent::Inbound(_))).await;
            assert!(matches!(event, MessengerEvent::Inbound(ref m) if m.id() == expected.id()));
        }

        // Ready may only be known through the resync after a lag.
        let id = messenger.submit(messenger.compose("still here")).unwrap();
        let event = next_matching(&mut events, |e| {
            matches!(e, MessengerEvent::StatusChanged { status: DeliveryStatus::Sent, .. })
        })
        .await;
        assert!(matches!(event, MessengerEvent::StatusChanged { id: got, .. } if got == id));
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn device_forwards_session_events() {
        let (messenger, mut events, _) = device(Script::default()).await;
        let event = next_matching(&mut events, |e| {
            matches!(
                e,
                MessengerEvent::Session(SessionEvent::StateChanged { to: SessionState::Ready, .. })
            )
        })
        .await;
        assert!(matches!(event, MessengerEvent::Session(_)));
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn device_fails_queue_when_session_fails() {
        let script = Script {
            power_on: Some(Error::ModemInit("no boot event".into())),
            ..Script::default()
        };
        let (messenger, mut events, _) = device(script).await;
        let id = messenger.submit(messenger.compose("hello")).unwrap();

        let event = next_matching(&mut events, |e| matches!(e, MessengerEvent::Rejected { .. })).await;
        assert!(matches!(event, MessengerEvent::Rejected { id: got, .. } if got == id));
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn device_udp_listener_delivers_downlinks() {
        let (session, _, _) = start_session(descriptor(PayloadEncoding::Binary, 128), Script::default()).await;
        let udp = UdpTransport::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_allowed_source("127.0.0.1".parse().unwrap());
        let target = udp.local_addr();
        let (messenger, mut events) = DeviceMessengerBuilder::new(session)
            .udp_listener(udp)
            .send_acks(false)
            .build();

        let downlink = Message::new(MessageId::new(0xC0, 7), Direction::Downlink, "via udp");
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&codec::encode(&downlink), target).await.unwrap();

        let event = next_matching(&mut events, |e| matches!(e, MessengerEvent::Inbound(_))).await;
        assert!(matches!(event, MessengerEvent::Inbound(ref m) if m.text() == "via udp"));
        messenger.shutdown().await;
    }
}
