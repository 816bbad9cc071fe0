//! Nordic Thingy:91 X device profile for imok.
//!
//! The Thingy:91 X attaches over LTE-M and runs the Serial LTE Modem
//! firmware. This crate provides:
//!
//! - **Model definition** ([`models`]) -- the shared [`ProfileDescriptor`](imok_core::ProfileDescriptor)
//! - **Command builders** ([`commands`]) -- SLM commands and response parsers
//! - **Profile** ([`profile`]) -- the [`DeviceProfile`](imok_core::DeviceProfile)
//!   implementation
//! - **Builder** ([`builder`]) -- fluent construction with descriptor defaults
//!
//! # Example
//!
//! ```
//! use imok_nordic::commands::{cmd_send_to, parse_cesq};
//!
//! let cmd = cmd_send_to("harvest.soracom.io", 8514, "A1");
//! assert_eq!(cmd.text, "AT#XSENDTO=\"harvest.soracom.io\",8514,\"A1\"");
//!
//! let q = parse_cesq("%CESQ: 54,2,15,1").unwrap();
//! assert_eq!(q.rsrp_dbm, Some(-87));
//! ```

pub mod builder;
pub mod commands;
pub mod models;
pub mod profile;

pub use builder::NordicBuilder;
pub use profile::NordicProfile;
