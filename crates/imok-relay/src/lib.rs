//! imok-relay: relay client for IMOK.
//!
//! - [`RelayCursor`] -- where the next uplink poll starts
//! - [`RelayClient`] -- page following and deduplication over any
//!   [`RelayApi`](imok_core::RelayApi)
//! - [`SoracomRelay`] -- the Soracom REST API backend
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use imok_relay::{RelayClient, RelayCursor, SoracomRelay};
//!
//! # async fn example() -> Result<(), imok_core::RelayError> {
//! let mut soracom = SoracomRelay::new()?;
//! soracom.authenticate("keyId-...", "secret-...").await?;
//! soracom.select_sim("8942310022000012345");
//!
//! let client = RelayClient::new(Arc::new(soracom));
//! let (records, cursor) = client.poll_uplink(&RelayCursor::default()).await?;
//! for record in &records {
//!     println!("{} bytes at {}", record.payload.len(), record.time_ms);
//! }
//! # let _ = cursor;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cursor;
pub mod soracom;

pub use client::RelayClient;
pub use cursor::RelayCursor;
pub use soracom::{SimSummary, SoracomRelay};
