//! Byte-level transport to a modem.
//!
//! The [`Transport`] trait abstracts over the physical link to the modem.
//! `imok-transport` provides the serial implementation; `imok-test-harness`
//! provides a scripted mock.
//!
//! The AT IO task in `imok-at` is the only consumer: it owns a
//! `Box<dyn Transport>` exclusively for the lifetime of a session, which is
//! what guarantees one AT command in flight at a time.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a modem.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write all of `data` to the modem.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever bytes are available into `buf`, waiting up to `timeout`.
    ///
    /// Returns [`Error::Timeout`](crate::error::Error::Timeout) if nothing
    /// arrives before the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the link. Later calls return
    /// [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Whether the link is open.
    fn is_connected(&self) -> bool;
}
