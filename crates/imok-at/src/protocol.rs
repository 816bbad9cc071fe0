//! AT line protocol: framing and line classification.
//!
//! Modems answer with `\r\n`-delimited lines. A command exchange consists of
//! an optional echo of the command, zero or more information lines and one
//! final result code. Anything else that shows up on the line is an
//! unsolicited notification.

use imok_core::at::{AtCommand, FinalResult};
use tracing::warn;

/// Line terminator appended to every command.
pub const COMMAND_TERMINATOR: &str = "\r\n";

/// Frame a command for the wire.
pub fn encode_command(cmd: &AtCommand) -> Vec<u8> {
    let mut out = Vec::with_capacity(cmd.text.len() + COMMAND_TERMINATOR.len());
    out.extend_from_slice(cmd.text.as_bytes());
    out.extend_from_slice(COMMAND_TERMINATOR.as_bytes());
    out
}

/// Remove and return the next complete line from `buf`.
///
/// The terminator and surrounding whitespace are stripped. Returns `None`
/// while no `\n` has arrived yet; the partial line stays in the buffer.
/// Bytes that are not UTF-8 are replaced and logged.
pub fn next_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let raw: Vec<u8> = buf.drain(..=pos).collect();
    let line = match String::from_utf8(raw) {
        Ok(s) => s,
        Err(e) => {
            let lossy = String::from_utf8_lossy(e.as_bytes()).into_owned();
            warn!(line = %lossy.trim(), "non-UTF-8 bytes on the AT line");
            lossy
        }
    };
    Some(line.trim().to_string())
}

/// Role of a line received while a command is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// Empty line between frames.
    Blank,
    /// The modem echoing the command back.
    Echo,
    /// A final result code ending the exchange.
    Final(FinalResult),
    /// Part of the command's response.
    Info,
    /// Unsolicited notification interleaved with the response.
    Notification,
}

/// Classify one line against the command in flight.
///
/// The command's expected prefix wins over the notification prefixes, so a
/// query such as `AT+CEREG?` receives its `+CEREG:` line even though the
/// same prefix is also used unsolicited. Lines matching neither are treated
/// as information lines (e.g. raw datagram text following a header line).
pub fn classify(line: &str, cmd: &AtCommand, notification_prefixes: &[&str]) -> LineKind {
    if line.is_empty() {
        return LineKind::Blank;
    }
    if line == cmd.text {
        return LineKind::Echo;
    }
    if let Some(result) = FinalResult::parse(line) {
        return LineKind::Final(result);
    }
    if let Some(expect) = &cmd.expect {
        if line.starts_with(expect.as_str()) {
            return LineKind::Info;
        }
    }
    if is_notification(line, notification_prefixes) {
        return LineKind::Notification;
    }
    LineKind::Info
}

/// Whether `line` starts with one of the notification prefixes.
pub fn is_notification(line: &str, notification_prefixes: &[&str]) -> bool {
    notification_prefixes.iter().any(|p| line.starts_with(p))
}
