//! The uniform message model shared by the device and console sides.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Scale factor between degrees and the stored fixed-point value.
pub const COORD_SCALE: f64 = 1e7;

/// Globally unique message identifier.
///
/// The upper 32 bits identify the originating process, the lower 32 bits are
/// a per-process counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Compose an id from an origin tag and a sequence number.
    pub fn new(origin: u32, sequence: u32) -> Self {
        MessageId((u64::from(origin) << 32) | u64::from(sequence))
    }

    /// Deterministic id for records that carry none.
    ///
    /// Retransmissions of the same payload stored at the same time map to the
    /// same id so downstream deduplication recognises them.
    pub fn from_digest(time_ms: i64, payload: &[u8]) -> Self {
        let digest = Sha256::new()
            .chain_update(time_ms.to_be_bytes())
            .chain_update(payload)
            .finalize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        MessageId(u64::from_be_bytes(raw))
    }

    /// Origin tag.
    pub fn origin(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Sequence number within the origin.
    pub fn sequence(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Hands out monotonically increasing ids for one originating side.
#[derive(Debug)]
pub struct MessageIdGenerator {
    origin: u32,
    counter: AtomicU32,
}

impl MessageIdGenerator {
    /// A generator with a random origin tag.
    pub fn new() -> Self {
        Self::with_origin(rand::random())
    }

    /// A generator with a fixed origin tag.
    pub fn with_origin(origin: u32) -> Self {
        MessageIdGenerator {
            origin,
            counter: AtomicU32::new(1),
        }
    }

    /// Origin tag stamped into every id.
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Next id.
    pub fn next_id(&self) -> MessageId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        MessageId::new(self.origin, seq)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Which way a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Device to console.
    Uplink,
    /// Console to device.
    Downlink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => write!(f, "uplink"),
            Direction::Downlink => write!(f, "downlink"),
        }
    }
}

/// Delivery progress of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted for sending.
    Pending,
    /// Handed to the modem or queued by the relay.
    Sent,
    /// The far side confirmed receipt.
    Acknowledged,
    /// Could not be sent.
    Failed,
}

impl DeliveryStatus {
    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Failed) | (Sent, Acknowledged) | (Sent, Failed)
        )
    }

    /// No further transitions are possible.
    pub fn is_final(self) -> bool {
        matches!(self, DeliveryStatus::Acknowledged | DeliveryStatus::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Acknowledged => "acknowledged",
            DeliveryStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A GPS fix in fixed-point degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    lat_e7: i32,
    lon_e7: i32,
    accuracy_m: Option<u16>,
}

impl Location {
    /// Build from fixed-point values (degrees × 10⁷).
    pub fn from_e7(lat_e7: i32, lon_e7: i32) -> Result<Self> {
        if lat_e7.unsigned_abs() > 900_000_000 {
            return Err(Error::InvalidParameter(format!(
                "latitude out of range: {lat_e7}e-7"
            )));
        }
        if lon_e7.unsigned_abs() > 1_800_000_000 {
            return Err(Error::InvalidParameter(format!(
                "longitude out of range: {lon_e7}e-7"
            )));
        }
        Ok(Location {
            lat_e7,
            lon_e7,
            accuracy_m: None,
        })
    }

    /// Build from floating-point degrees, rounding to the nearest 10⁻⁷°.
    pub fn from_degrees(lat: f64, lon: f64) -> Result<Self> {
        if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
            return Err(Error::InvalidParameter(format!(
                "coordinates out of range: {lat},{lon}"
            )));
        }
        Self::from_e7(
            (lat * COORD_SCALE).round() as i32,
            (lon * COORD_SCALE).round() as i32,
        )
    }

    /// Attach a horizontal accuracy in metres.
    pub fn with_accuracy(mut self, metres: u16) -> Self {
        self.accuracy_m = Some(metres);
        self
    }

    /// Latitude × 10⁷.
    pub fn lat_e7(&self) -> i32 {
        self.lat_e7
    }

    /// Longitude × 10⁷.
    pub fn lon_e7(&self) -> i32 {
        self.lon_e7
    }

    /// Latitude in degrees.
    pub fn latitude(&self) -> f64 {
        f64::from(self.lat_e7) / COORD_SCALE
    }

    /// Longitude in degrees.
    pub fn longitude(&self) -> f64 {
        f64::from(self.lon_e7) / COORD_SCALE
    }

    /// Horizontal accuracy in metres, if known.
    pub fn accuracy_m(&self) -> Option<u16> {
        self.accuracy_m
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.7},{:.7}", self.latitude(), self.longitude())?;
        if let Some(acc) = self.accuracy_m {
            write!(f, " (±{acc} m)")?;
        }
        Ok(())
    }
}

/// Truncate a timestamp to whole milliseconds.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// A text and/or location message.
///
/// Values are immutable; a status change produces a new value through
/// [`Message::with_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    direction: Direction,
    timestamp: DateTime<Utc>,
    location: Option<Location>,
    text: String,
    delivery_status: DeliveryStatus,
}

impl Message {
    /// A new pending message stamped with the current time.
    pub fn new(id: MessageId, direction: Direction, text: impl Into<String>) -> Self {
        Message {
            id,
            direction,
            timestamp: truncate_to_millis(Utc::now()),
            location: None,
            text: text.into(),
            delivery_status: DeliveryStatus::Pending,
        }
    }

    /// A location-only message.
    pub fn location_only(id: MessageId, direction: Direction, location: Location) -> Self {
        Message::new(id, direction, "").with_location(location)
    }

    /// Replace the timestamp (truncated to milliseconds).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = truncate_to_millis(timestamp);
        self
    }

    /// Attach a location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Replace the text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Move to a new delivery status.
    ///
    /// Returns [`Error::InvalidTransition`] for a backward or repeated
    /// transition.
    pub fn with_status(&self, status: DeliveryStatus) -> Result<Message> {
        if !self.delivery_status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: self.delivery_status.to_string(),
                to: status.to_string(),
            });
        }
        let mut next = self.clone();
        next.delivery_status = status;
        Ok(next)
    }

    pub(crate) fn from_parts(
        id: MessageId,
        direction: Direction,
        timestamp: DateTime<Utc>,
        location: Option<Location>,
        text: String,
    ) -> Self {
        Message {
            id,
            direction,
            timestamp,
            location,
            text,
            delivery_status: DeliveryStatus::Pending,
        }
    }

    /// Message id.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Direction of travel.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Creation time, millisecond precision.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Attached GPS fix.
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Free text, possibly empty.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Current delivery status.
    pub fn delivery_status(&self) -> DeliveryStatus {
        self.delivery_status
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {}",
            self.id,
            self.direction,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.text
        )?;
        if let Some(loc) = &self.location {
            write!(f, " @ {loc}")?;
        }
        Ok(())
    }
}
