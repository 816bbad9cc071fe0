//! Error types for imok.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Serial transport failures, AT protocol
//! failures, network-registration failures, codec failures and relay failures
//! are all captured here so that the session owner sees one taxonomy.

use std::time::Duration;

use crate::relay::RelayError;
use crate::types::SessionState;

/// The error type for all imok operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial I/O failed or a command exhausted its retry bound.
    ///
    /// A session that sees this error moves to `Failed`.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Timed out waiting for a response or a notification.
    #[error("timeout waiting for response")]
    Timeout,

    /// The modem answered, but not in the shape the command expects.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The modem rejected a command (`ERROR`, `+CME ERROR`, `+CMS ERROR`).
    #[error("command rejected: {command} ({reason})")]
    CommandRejected {
        /// The command text that was rejected.
        command: String,
        /// Final result code reported by the modem.
        reason: String,
    },

    /// The modem did not come up during power-on.
    #[error("modem initialisation failed: {0}")]
    ModemInit(String),

    /// Network registration did not complete in time.
    #[error("network registration timed out after {:.1}s", elapsed.as_secs_f32())]
    RegistrationTimeout {
        /// Time spent polling before giving up.
        elapsed: Duration,
    },

    /// The network permanently refused registration.
    #[error("network registration denied (stat={stat})")]
    RegistrationDenied {
        /// Last `+CEREG` status reported by the modem.
        stat: u8,
    },

    /// A payload exceeds the link MTU of the active profile.
    ///
    /// This is a caller error: no AT command is issued and the session
    /// state does not change.
    #[error("payload of {len} bytes exceeds link MTU of {mtu} bytes")]
    PayloadTooLarge {
        /// Length of the rejected payload.
        len: usize,
        /// MTU of the profile's link.
        mtu: usize,
    },

    /// Malformed wire data. Dropped and logged by the polling loops.
    #[error("decode error: {0}")]
    Decode(String),

    /// The relay service failed a poll or a submission.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// An invalid parameter was passed to an operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A state or status transition that the state graph does not allow.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// State before the attempted transition.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The session reached `Failed` and must be replaced.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// No connection to the modem has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the modem was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::InvalidTransition`] between two session states.
    pub fn invalid_state_transition(from: SessionState, to: SessionState) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether this error leaves the device session unusable.
    ///
    /// Fatal errors move a session to `Failed`; everything else is handled
    /// locally (drop-and-continue, reject back to the caller).
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ConnectionLost
                | Error::NotConnected
                | Error::Io(_)
                | Error::ModemInit(_)
                | Error::RegistrationTimeout { .. }
                | Error::RegistrationDenied { .. }
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
