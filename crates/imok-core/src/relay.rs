//! Relay service abstraction.
//!
//! The relay stores uplink records and forwards downlink datagrams to the
//! device. [`RelayApi`] is the page-level contract a concrete service client
//! implements; cursor handling and deduplication live in `imok-relay`.

use std::fmt;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Classification of relay failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayErrorKind {
    /// Connection, DNS or TLS failure.
    Network,
    /// Credentials missing, expired or rejected (401/403).
    Auth,
    /// The service asked us to slow down (429).
    RateLimited,
    /// The service is temporarily unavailable (5xx).
    Unavailable,
    /// The service refused the request with this status.
    Rejected(u16),
    /// The response body could not be understood.
    Protocol,
}

impl fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayErrorKind::Network => write!(f, "network error"),
            RelayErrorKind::Auth => write!(f, "authentication error"),
            RelayErrorKind::RateLimited => write!(f, "rate limited"),
            RelayErrorKind::Unavailable => write!(f, "service unavailable"),
            RelayErrorKind::Rejected(status) => write!(f, "rejected with status {status}"),
            RelayErrorKind::Protocol => write!(f, "protocol error"),
        }
    }
}

/// A relay failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("relay {kind}: {message}")]
pub struct RelayError {
    kind: RelayErrorKind,
    message: String,
}

impl RelayError {
    /// Create an error of the given kind.
    pub fn new(kind: RelayErrorKind, message: impl Into<String>) -> Self {
        RelayError {
            kind,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => RelayErrorKind::Auth,
            429 => RelayErrorKind::RateLimited,
            500..=599 => RelayErrorKind::Unavailable,
            other => RelayErrorKind::Rejected(other),
        };
        RelayError::new(kind, message)
    }

    /// The failure classification.
    pub fn kind(&self) -> RelayErrorKind {
        self.kind
    }

    /// The failure detail.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            RelayErrorKind::Network | RelayErrorKind::RateLimited | RelayErrorKind::Unavailable
        )
    }
}

/// One stored uplink record as returned by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    /// Identifier used for deduplication across overlapping pages.
    pub key: String,
    /// Time the relay stored the record, ms since the Unix epoch.
    pub time_ms: i64,
    /// Raw payload bytes as sent by the device.
    pub payload: Vec<u8>,
}

impl RelayRecord {
    /// Build a record whose key is derived from its time and payload.
    ///
    /// The relay does not expose record ids, so identical payloads stored at
    /// the same millisecond are the same record.
    pub fn new(time_ms: i64, payload: Vec<u8>) -> Self {
        let digest = Sha256::new()
            .chain_update(time_ms.to_be_bytes())
            .chain_update(&payload)
            .finalize();
        let key = format!("{time_ms}:{}", hex::encode(&digest[..8]));
        RelayRecord {
            key,
            time_ms,
            payload,
        }
    }
}

/// One page of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayPage {
    /// Records in ascending time order.
    pub records: Vec<RelayRecord>,
    /// Continuation key when more records are available.
    pub next_key: Option<String>,
}

/// Confirmation that the relay queued a downlink datagram.
///
/// This does not mean the device received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Number of payload bytes queued.
    pub len: usize,
}

/// Page-level access to a relay service.
#[async_trait]
pub trait RelayApi: Send + Sync {
    /// Fetch up to `limit` records stored at or after `from_ms`.
    ///
    /// `next_key` continues a previous page of the same query.
    async fn fetch_page(
        &self,
        from_ms: i64,
        next_key: Option<&str>,
        limit: usize,
    ) -> std::result::Result<RelayPage, RelayError>;

    /// Queue one downlink datagram for the device.
    async fn submit(&self, payload: &[u8]) -> std::result::Result<Accepted, RelayError>;
}
