//! Murata Type 1SC-NTN device profile for imok.
//!
//! The Type 1SC-NTN reaches the network over NB-IoT satellite links. This
//! crate provides:
//!
//! - **Model definition** ([`models`]) -- descriptor and stage timeouts
//! - **Command builders** ([`commands`]) -- `%`-prefixed vendor commands,
//!   socket data hex framing, GNSS and signal-quality parsers
//! - **Profile** ([`profile`]) -- the [`DeviceProfile`](imok_core::DeviceProfile)
//!   implementation
//! - **Builder** ([`builder`]) -- fluent construction
//!
//! # Example
//!
//! ```
//! use imok_murata::commands::{cmd_send, parse_gnss_fix};
//!
//! assert_eq!(cmd_send(1, b"hi").text, "AT%SOCKETDATA=\"SEND\",1,2,\"6869\"");
//!
//! let fix = parse_gnss_fix(
//!     "%IGNSSEVU:\"FIX\",1,\"07:12:55\",\"2024/05/01\",\"41.2\",\"35.68\",\"139.76\"",
//! );
//! assert!(fix.is_some());
//! ```

pub mod builder;
pub mod commands;
pub mod models;
pub mod profile;

pub use builder::MurataBuilder;
pub use profile::MurataProfile;
