//! imok-core: Core traits, data model, errors and wire codec for imok.
//!
//! This crate defines the vendor-agnostic abstractions that the modem
//! profiles, the relay client and the messenger build on. Applications depend
//! on these types without pulling in a specific modem driver.
//!
//! # Key types
//!
//! - [`DeviceProfile`] -- uniform lifecycle over a vendor AT dialect
//! - [`AtChannel`] -- command/notification channel to a modem
//! - [`Transport`] -- byte-level link to a modem
//! - [`RelayApi`] -- page-level access to the relay service
//! - [`Message`] / [`codec`] -- the message model and its wire forms
//! - [`Error`] / [`Result`] -- error handling

pub mod at;
pub mod codec;
pub mod device;
pub mod error;
pub mod events;
pub mod message;
pub mod relay;
pub mod transport;
pub mod types;

pub use at::{AtChannel, AtCommand, AtResponse, FinalResult};
pub use codec::Record;
pub use device::{DeviceProfile, ProfileDescriptor};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use message::{DeliveryStatus, Direction, Location, Message, MessageId, MessageIdGenerator};
pub use relay::{Accepted, RelayApi, RelayError, RelayErrorKind, RelayPage, RelayRecord};
pub use transport::Transport;
pub use types::*;
