//! IO task types and implementation for AT-command modems.
//!
//! One tokio task owns the transport exclusively and processes all
//! command/response exchanges, reads unsolicited notifications while idle,
//! and hands the transport back on shutdown. Because only this task touches
//! the transport, a session can never have two AT commands in flight, and a
//! caller that gives up mid-command leaves nothing locked: the task finishes
//! the bounded exchange and drops the reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use imok_core::at::{AtChannel, AtCommand, AtResponse, FinalResult};
use imok_core::error::{Error, Result};
use imok_core::transport::Transport;

use crate::notifications::{DEFAULT_CAPACITY, NotificationQueue};
use crate::protocol::{self, LineKind};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for the AT IO task.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Re-sends of an unanswered command before giving up.
    pub max_retries: u32,
    /// Delay before a retry, multiplied by the attempt number.
    pub retry_backoff: Duration,
    /// Line prefixes the modem emits unsolicited.
    pub notification_prefixes: &'static [&'static str],
    /// Notification queue capacity.
    pub notification_capacity: usize,
    /// How long each idle read waits for unsolicited data.
    pub idle_poll_interval: Duration,
}

impl IoConfig {
    /// Defaults for a modem with the given notification prefixes.
    pub fn with_prefixes(notification_prefixes: &'static [&'static str]) -> Self {
        IoConfig {
            notification_prefixes,
            ..IoConfig::default()
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            max_retries: 2,
            retry_backoff: Duration::from_millis(20),
            notification_prefixes: &[],
            notification_capacity: DEFAULT_CAPACITY,
            idle_poll_interval: Duration::from_millis(100),
        }
    }
}

/// A request sent from the handle to the IO task.
pub enum Request {
    /// Issue one command and report its outcome.
    Command {
        cmd: AtCommand,
        reply: oneshot::Sender<Result<AtResponse>>,
    },
    /// Graceful shutdown; returns the transport for recovery.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Handle to the IO task. Owned by the device session.
pub struct AtIo {
    tx: mpsc::Sender<Request>,
    notifications: Arc<NotificationQueue>,
    max_retries: u32,
    retry_backoff: Duration,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AtIo {
    /// Send a command to the IO task and await its outcome.
    pub async fn command(&self, cmd: AtCommand) -> Result<AtResponse> {
        let attempts = self.max_retries + 1;
        let bound = cmd.timeout * attempts
            + self.retry_backoff * (attempts * attempts)
            + Duration::from_millis(500);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Command {
                cmd,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        match tokio::time::timeout(bound, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// The queue unsolicited notifications land in.
    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    /// Token that stops the IO task when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the IO task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Shut down the IO task and recover the transport.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Request::Shutdown { reply: reply_tx }).await;
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }
}

#[async_trait]
impl AtChannel for AtIo {
    async fn send_command(&self, cmd: AtCommand) -> Result<AtResponse> {
        self.command(cmd).await
    }

    async fn wait_notification(&self, prefix: &str, timeout: Duration) -> Result<String> {
        self.notifications.wait(prefix, timeout).await
    }

    fn take_notification(&self, prefix: &str) -> Option<String> {
        self.notifications.take(prefix)
    }

    fn discard_notifications(&self, prefix: &str) -> usize {
        self.notifications.discard(prefix)
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task. Returns the handle for sending commands.
pub fn spawn_io_task(transport: Box<dyn Transport>, config: IoConfig) -> AtIo {
    let (tx, rx) = mpsc::channel::<Request>(32);
    let notifications = Arc::new(NotificationQueue::new(config.notification_capacity));
    let cancel = CancellationToken::new();

    let max_retries = config.max_retries;
    let retry_backoff = config.retry_backoff;
    let task = tokio::spawn(io_loop(
        transport,
        config,
        notifications.clone(),
        rx,
        cancel.clone(),
    ));

    AtIo {
        tx,
        notifications,
        max_retries,
        retry_backoff,
        cancel,
        task,
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Maximum receive buffer size before reset to prevent unbounded growth.
const MAX_BUF: usize = 8192;

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Cancellation
/// 2. Command dispatch
/// 3. Idle notification reading
async fn io_loop(
    mut transport: Box<dyn Transport>,
    config: IoConfig,
    notifications: Arc<NotificationQueue>,
    mut rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    // Bytes received but not yet consumed as complete lines. Shared by
    // command exchanges and idle reads so nothing is lost between them.
    let mut line_buf = Vec::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("AT IO task cancelled");
                break;
            }

            req = rx.recv() => {
                match req {
                    Some(Request::Command { cmd, reply }) => {
                        let result = execute_command(
                            &mut *transport, &cmd, &config, &mut line_buf, &notifications,
                        ).await;
                        queue_complete_lines(&mut line_buf, &notifications);
                        if let Err(e) = &result {
                            debug!(command = %cmd, error = %e, "AT command failed");
                        }
                        let _ = reply.send(result);
                    }
                    Some(Request::Shutdown { reply }) => {
                        debug!("AT IO task shutdown requested");
                        let _ = reply.send(transport);
                        return;
                    }
                    None => {
                        debug!("command channel closed, exiting AT IO task");
                        break;
                    }
                }
            }

            // Idle: read unsolicited data from the serial port.
            _ = async {
                let mut chunk = [0u8; 256];
                match transport.receive(&mut chunk, config.idle_poll_interval).await {
                    Ok(n) if n > 0 => {
                        trace!(bytes = n, "idle read");
                        line_buf.extend_from_slice(&chunk[..n]);
                        if line_buf.len() > MAX_BUF {
                            warn!(len = line_buf.len(), "idle buffer overflow, resetting");
                            line_buf.clear();
                            return;
                        }
                        queue_complete_lines(&mut line_buf, &notifications);
                    }
                    _ => {
                        // Timeout or error: yield briefly so the loop
                        // can check for commands or cancellation.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            } => {}
        }
    }
}

/// Move every complete non-empty line in `buf` to the notification queue.
fn queue_complete_lines(buf: &mut Vec<u8>, notifications: &NotificationQueue) {
    while let Some(line) = protocol::next_line(buf) {
        if !line.is_empty() {
            notifications.push(line);
        }
    }
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

/// Execute one command on the transport.
///
/// Sends `<cmd>\r\n` and reads lines until a final result code. Unanswered
/// attempts are re-sent with the identical text up to `max_retries` times.
async fn execute_command(
    transport: &mut dyn Transport,
    cmd: &AtCommand,
    config: &IoConfig,
    buf: &mut Vec<u8>,
    notifications: &NotificationQueue,
) -> Result<AtResponse> {
    // Anything already complete arrived before this command was sent.
    queue_complete_lines(buf, notifications);

    let wire = protocol::encode_command(cmd);
    let mut chunk = [0u8; 256];

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            warn!(command = %cmd, attempt, "AT command unanswered, retrying");
            tokio::time::sleep(config.retry_backoff * attempt).await;
        }

        debug!(command = %cmd, "AT >>");
        transport.send(&wire).await?;

        let deadline = Instant::now() + cmd.timeout;
        let mut lines = Vec::new();

        loop {
            while let Some(line) = protocol::next_line(buf) {
                match protocol::classify(&line, cmd, config.notification_prefixes) {
                    LineKind::Blank | LineKind::Echo => {}
                    LineKind::Info => {
                        debug!(line = %line, "AT <<");
                        lines.push(line);
                    }
                    LineKind::Notification => notifications.push(line),
                    LineKind::Final(FinalResult::Ok) => {
                        return finish(cmd, lines);
                    }
                    LineKind::Final(other) => {
                        return Err(Error::CommandRejected {
                            command: cmd.text.clone(),
                            reason: other.to_string(),
                        });
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match transport.receive(&mut chunk, deadline - now).await {
                Ok(n) => {
                    trace!(bytes = n, "command read");
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.len() > MAX_BUF {
                        warn!(len = buf.len(), "response buffer overflow, clearing");
                        buf.clear();
                        break;
                    }
                }
                Err(Error::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
    }

    Err(Error::Transport(format!(
        "{} unanswered after {} attempts",
        cmd.text,
        config.max_retries + 1
    )))
}

/// Check the expected information line and build the response.
fn finish(cmd: &AtCommand, lines: Vec<String>) -> Result<AtResponse> {
    if let Some(expect) = &cmd.expect {
        if !lines.iter().any(|l| l.starts_with(expect.as_str())) {
            return Err(Error::MalformedResponse(format!(
                "{}: no {expect} line before OK",
                cmd.text
            )));
        }
    }
    Ok(AtResponse { lines })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use imok_test_harness::MockTransport;

    const PREFIXES: &[&str] = &["+CEREG:", "+CSCON:", "%CESQ:"];

    fn test_config() -> IoConfig {
        IoConfig {
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            notification_prefixes: PREFIXES,
            notification_capacity: 8,
            idle_poll_interval: Duration::from_millis(10),
        }
    }

    fn cmd(text: &str) -> AtCommand {
        AtCommand::new(text).timeout(Duration::from_millis(50))
    }

    // =======================================================================
    // Handle tests (channel-level, no IO loop)
    // =======================================================================

    #[tokio::test]
    async fn command_not_connected() {
        let (tx, rx) = mpsc::channel(32);
        drop(rx);

        let io = AtIo {
            tx,
            notifications: Arc::new(NotificationQueue::default()),
            max_retries: 0,
            retry_backoff: Duration::ZERO,
            cancel: CancellationToken::new(),
            task: tokio::spawn(async {}),
        };
        let result = io.command(cmd("AT")).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[test]
    fn io_config_defaults() {
        let config = IoConfig::with_prefixes(PREFIXES);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.notification_capacity, 64);
        assert_eq!(config.notification_prefixes.len(), 3);
    }

    // =======================================================================
    // IO task: command exchanges
    // =======================================================================

    #[tokio::test]
    async fn basic_command_ok() {
        let mut mock = MockTransport::new();
        mock.expect_at("AT", &["OK"]);
        let io = spawn_io_task(Box::new(mock), test_config());

        let resp = io.command(cmd("AT")).await.unwrap();
        assert!(resp.lines.is_empty());

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn echo_is_skipped_and_info_collected() {
        let mut mock = MockTransport::new();
        mock.expect(
            b"AT+CEREG?\r\n",
            b"AT+CEREG?\r\n\r\n+CEREG: 5,1,\"0140\",\"0A1B\",7\r\n\r\nOK\r\n",
        );
        let io = spawn_io_task(Box::new(mock), test_config());

        let resp = io.command(cmd("AT+CEREG?").expect("+CEREG:")).await.unwrap();
        assert_eq!(resp.lines, vec!["+CEREG: 5,1,\"0140\",\"0A1B\",7".to_string()]);
        assert_eq!(resp.line_with_prefix("+CEREG:"), Some("5,1,\"0140\",\"0A1B\",7"));

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn error_final_codes_reject() {
        let mut mock = MockTransport::new();
        mock.expect_at("AT+CPIN?", &["+CME ERROR: 10"]);
        mock.expect_at("AT%XBOGUS", &["ERROR"]);
        let io = spawn_io_task(Box::new(mock), test_config());

        match io.command(cmd("AT+CPIN?")).await {
            Err(Error::CommandRejected { command, reason }) => {
                assert_eq!(command, "AT+CPIN?");
                assert_eq!(reason, "+CME ERROR: 10");
            }
            other => panic!("expected CommandRejected, got {other:?}"),
        }
        assert!(matches!(
            io.command(cmd("AT%XBOGUS")).await,
            Err(Error::CommandRejected { .. })
        ));

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn missing_expected_line_is_malformed() {
        let mut mock = MockTransport::new();
        mock.expect_at("AT#XSENDTO=\"harvest.soracom.io\",8514,\"hi\"", &["OK"]);
        let io = spawn_io_task(Box::new(mock), test_config());

        let result = io
            .command(cmd("AT#XSENDTO=\"harvest.soracom.io\",8514,\"hi\"").expect("#XSENDTO:"))
            .await;
        assert!(matches!(result, Err(Error::MalformedResponse(_))));

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_retries_identical_text_then_fails() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        for _ in 0..3 {
            mock.expect_silence("AT+CFUN=1");
        }
        let io = spawn_io_task(Box::new(mock), test_config());

        let result = io.command(cmd("AT+CFUN=1")).await;
        match result {
            Err(Error::Transport(msg)) => assert!(msg.contains("3 attempts"), "{msg}"),
            other => panic!("expected Transport failure, got {other:?}"),
        }
        let sent = handle.sent_commands();
        assert_eq!(sent, vec!["AT+CFUN=1"; 3]);

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn retry_succeeds_after_one_silent_attempt() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        mock.expect_silence("AT");
        mock.expect_at("AT", &["OK"]);
        let io = spawn_io_task(Box::new(mock), test_config());

        assert!(io.command(cmd("AT")).await.is_ok());
        assert_eq!(handle.sent_commands().len(), 2);

        let _ = io.shutdown().await;
    }

    // =======================================================================
    // IO task: notifications
    // =======================================================================

    #[tokio::test]
    async fn interleaved_notification_is_queued() {
        let mut mock = MockTransport::new();
        mock.expect_at("AT%CESQ=1", &["+CSCON: 1", "OK"]);
        let io = spawn_io_task(Box::new(mock), test_config());

        let resp = io.command(cmd("AT%CESQ=1")).await.unwrap();
        assert!(resp.lines.is_empty());
        assert_eq!(io.take_notification("+CSCON:").as_deref(), Some("+CSCON: 1"));

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn lines_after_final_code_are_queued() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CFUN=1\r\n", b"\r\nOK\r\n\r\n+CEREG: 2\r\n");
        let io = spawn_io_task(Box::new(mock), test_config());

        io.command(cmd("AT+CFUN=1")).await.unwrap();
        assert_eq!(io.take_notification("+CEREG:").as_deref(), Some("+CEREG: 2"));

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn idle_notifications_reach_waiters() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let io = spawn_io_task(Box::new(mock), test_config());

        handle.push_unsolicited("%BOOTEV:0");
        let line = io
            .wait_notification("%BOOTEV:", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(line, "%BOOTEV:0");

        let err = io
            .wait_notification("%IGNSSEVU:", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn discard_notifications_drops_stale_entries() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let io = spawn_io_task(Box::new(mock), test_config());

        handle.push_unsolicited("+CSCON: 1");
        handle.push_unsolicited("+CSCON: 0");
        io.wait_notification("+CSCON: 0", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(io.discard_notifications("+CSCON:"), 1);
        assert!(io.take_notification("+CSCON:").is_none());

        let _ = io.shutdown().await;
    }

    // =======================================================================
    // Lifecycle
    // =======================================================================

    #[tokio::test]
    async fn shutdown_returns_transport() {
        let mock = MockTransport::new();
        let io = spawn_io_task(Box::new(mock), test_config());
        assert!(io.is_running());
        let transport = io.shutdown().await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn cancel_stops_task() {
        let mock = MockTransport::new();
        let io = spawn_io_task(Box::new(mock), test_config());
        io.cancel_token().cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!io.is_running());
        assert!(matches!(io.command(cmd("AT")).await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn dropped_caller_does_not_wedge_the_task() {
        let mut mock = MockTransport::new();
        mock.expect_silence("AT+CFUN=0");
        mock.expect_silence("AT+CFUN=0");
        mock.expect_silence("AT+CFUN=0");
        mock.expect_at("AT", &["OK"]);
        let io = spawn_io_task(Box::new(mock), test_config());

        let abandoned = tokio::time::timeout(Duration::from_millis(5), io.command(cmd("AT+CFUN=0"))).await;
        assert!(abandoned.is_err());

        assert!(io.command(cmd("AT")).await.is_ok());
        let _ = io.shutdown().await;
    }
}
