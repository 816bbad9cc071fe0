//! Asynchronous session event types.
//!
//! Events are emitted by a device session through a
//! [`tokio::sync::broadcast`] channel. Consumers that fall behind may miss
//! events (the receiver reports lag); the current state is always available
//! from the session's status watch.

use crate::message::{Location, Message, MessageId};
use crate::types::{RegistrationStatus, SessionState, SignalQuality};

/// An event emitted by a device session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The state machine moved.
    StateChanged {
        /// State before the transition.
        from: SessionState,
        /// State after the transition.
        to: SessionState,
        /// Failure reason when `to` is `Failed`.
        reason: Option<String>,
    },

    /// A downlink message was received and decoded.
    Inbound(Message),

    /// The console confirmed receipt of an uplink message.
    AckReceived {
        /// Id of the confirmed message.
        acked: MessageId,
    },

    /// The modem reported signal quality.
    SignalQuality(SignalQuality),

    /// The modem reported a registration change.
    Registration(RegistrationStatus),

    /// A GNSS fix became available.
    Location(Location),
}
