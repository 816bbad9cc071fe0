//! AT command channel abstraction.
//!
//! [`AtChannel`] is the contract between device profiles and the AT IO task:
//! issue one command and get its parsed response, or consume unsolicited
//! notifications the modem emitted on its own. Profiles program against this
//! trait so that they can be driven by the real IO task in `imok-at` or by
//! anything else that speaks the same contract.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Default per-attempt timeout for an AT command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// One AT command to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtCommand {
    /// Command text without the line terminator (e.g. `AT+CEREG?`).
    pub text: String,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Information-line prefix the response must contain (e.g. `+CEREG:`).
    pub expect: Option<String>,
}

impl AtCommand {
    /// A command with the default timeout and no expected response line.
    pub fn new(text: impl Into<String>) -> Self {
        AtCommand {
            text: text.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            expect: None,
        }
    }

    /// Override the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Require an information line starting with `prefix` before `OK`.
    pub fn expect(mut self, prefix: impl Into<String>) -> Self {
        self.expect = Some(prefix.into());
        self
    }
}

impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Final result code that ends a command exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    /// `OK`
    Ok,
    /// `ERROR`
    Error,
    /// `+CME ERROR: <err>`
    CmeError(String),
    /// `+CMS ERROR: <err>`
    CmsError(String),
}

impl FinalResult {
    /// Recognise a final result code line.
    pub fn parse(line: &str) -> Option<FinalResult> {
        let line = line.trim();
        if line == "OK" {
            Some(FinalResult::Ok)
        } else if line == "ERROR" {
            Some(FinalResult::Error)
        } else if let Some(rest) = line.strip_prefix("+CME ERROR:") {
            Some(FinalResult::CmeError(rest.trim().to_string()))
        } else {
            line.strip_prefix("+CMS ERROR:")
                .map(|rest| FinalResult::CmsError(rest.trim().to_string()))
        }
    }

    /// Whether the exchange succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, FinalResult::Ok)
    }
}

impl fmt::Display for FinalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalResult::Ok => write!(f, "OK"),
            FinalResult::Error => write!(f, "ERROR"),
            FinalResult::CmeError(e) => write!(f, "+CME ERROR: {e}"),
            FinalResult::CmsError(e) => write!(f, "+CMS ERROR: {e}"),
        }
    }
}

/// Parsed response to a successful command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AtResponse {
    /// Information lines between the echo and the final result code.
    pub lines: Vec<String>,
}

impl AtResponse {
    /// The remainder of the first line starting with `prefix`, trimmed.
    pub fn line_with_prefix(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|line| line.strip_prefix(prefix).map(str::trim))
    }

    /// The line following the first line that starts with `prefix`.
    ///
    /// Some dialects put a header on one line and the payload on the next.
    pub fn line_after(&self, prefix: &str) -> Option<&str> {
        let idx = self.lines.iter().position(|line| line.starts_with(prefix))?;
        self.lines.get(idx + 1).map(String::as_str)
    }
}

/// Command/notification channel to a modem.
///
/// Implementations serialize commands: at most one is in flight, and each is
/// bounded by its timeout and the implementation's retry policy.
#[async_trait]
pub trait AtChannel: Send + Sync {
    /// Issue a command and wait for its final result code.
    ///
    /// Errors: [`Error::CommandRejected`](crate::Error::CommandRejected) on an
    /// error final code, [`Error::MalformedResponse`](crate::Error::MalformedResponse)
    /// when the expected line is missing, and
    /// [`Error::Transport`](crate::Error::Transport) once retries are exhausted.
    async fn send_command(&self, cmd: AtCommand) -> Result<AtResponse>;

    /// Wait for the oldest queued notification starting with `prefix`.
    ///
    /// Returns [`Error::Timeout`](crate::Error::Timeout) if none arrives.
    async fn wait_notification(&self, prefix: &str, timeout: Duration) -> Result<String>;

    /// Remove and return the oldest queued notification starting with `prefix`.
    fn take_notification(&self, prefix: &str) -> Option<String>;

    /// Drop every queued notification starting with `prefix`.
    ///
    /// Returns how many were dropped.
    fn discard_notifications(&self, prefix: &str) -> usize;
}
