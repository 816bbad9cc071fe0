//! AT command IO task for IMOK modems.
//!
//! This crate provides the single-IO-task pattern for `\r\n`-delimited AT
//! command protocols. One tokio task owns the transport exclusively and
//! handles command/response exchanges with bounded retry, queues unsolicited
//! notifications, and hands the transport back on shutdown.
//!
//! # Architecture
//!
//! - [`protocol`] -- command framing and response line classification
//! - [`notifications`] -- bounded notification queue with prefix waits
//! - [`io`] -- IO task types, spawn, and the select loop

pub mod io;
pub mod notifications;
pub mod protocol;

pub use io::{AtIo, IoConfig, spawn_io_task};
pub use notifications::NotificationQueue;
