//! Mock serial transport for deterministic testing of AT exchanges.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. This lets you test command framing, response
//! parsing and the vendor command sequences without a modem attached.
//!
//! Once the transport has been moved into an IO task, a [`MockHandle`]
//! obtained beforehand still lets the test inject unsolicited lines and
//! inspect what was written.
//!
//! # Example
//!
//! ```
//! use imok_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the engine sends `AT+CEREG?\r\n`, answer with an info line and OK.
//! mock.expect_at("AT+CEREG?", &["+CEREG: 5,1", "OK"]);
//! let handle = mock.handle();
//! handle.push_unsolicited("+CSCON: 1");
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use imok_core::error::{Error, Result};
use imok_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes made readable once the matching request is received.
    response: Vec<u8>,
}

#[derive(Debug)]
struct State {
    /// Ordered queue of expected request/response pairs.
    expectations: VecDeque<Expectation>,
    /// Bytes waiting to be returned by `receive()`.
    readable: VecDeque<u8>,
    /// Whether the transport is "connected".
    connected: bool,
    /// Log of all bytes sent through this transport.
    sent_log: Vec<Vec<u8>>,
}

fn frame_lines(lines: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// A mock [`Transport`] for testing modem protocol engines without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation, and the
/// corresponding response becomes readable. `receive()` returns readable
/// bytes immediately, or waits out its timeout and returns
/// [`Error::Timeout`] when there are none.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

/// Shared view of a [`MockTransport`] that stays usable after the transport
/// has been handed to an IO task.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(State {
                expectations: VecDeque::new(),
                readable: VecDeque::new(),
                connected: true,
                sent_log: Vec::new(),
            })),
        }
    }

    /// A handle for injecting data and inspecting traffic later.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }

    /// Add an expected request/response pair of raw bytes.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        lock(&self.state).expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Expect the AT command `cmd` (sent as `<cmd>\r\n`) and answer with
    /// `lines`, each framed as `\r\n<line>\r\n`.
    pub fn expect_at(&mut self, cmd: &str, lines: &[&str]) {
        let request = format!("{cmd}\r\n");
        self.expect(request.as_bytes(), &frame_lines(lines));
    }

    /// Expect the AT command `cmd` and leave it unanswered.
    pub fn expect_silence(&mut self, cmd: &str) {
        let request = format!("{cmd}\r\n");
        self.expect(request.as_bytes(), &[]);
    }

    /// Return all data that has been sent through this transport.
    ///
    /// Each element is the byte slice from one `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.handle().sent_data()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.handle().remaining_expectations()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.handle().set_connected(connected);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandle {
    /// Make an unsolicited line readable, framed as `\r\n<line>\r\n`.
    pub fn push_unsolicited(&self, line: &str) {
        lock(&self.state).readable.extend(frame_lines(&[line]));
    }

    /// Make raw bytes readable.
    pub fn push_bytes(&self, bytes: &[u8]) {
        lock(&self.state).readable.extend(bytes.iter().copied());
    }

    /// Add an expected AT exchange after the transport has been moved.
    pub fn expect_at(&self, cmd: &str, lines: &[&str]) {
        let request = format!("{cmd}\r\n");
        lock(&self.state).expectations.push_back(Expectation {
            request: request.into_bytes(),
            response: frame_lines(lines),
        });
    }

    /// All data sent so far.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent_log.clone()
    }

    /// Sent data decoded as AT commands, terminators stripped.
    pub fn sent_commands(&self) -> Vec<String> {
        lock(&self.state)
            .sent_log
            .iter()
            .map(|b| String::from_utf8_lossy(b).trim_end().to_string())
            .collect()
    }

    /// Expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        lock(&self.state).expectations.len()
    }

    /// Simulate the cable being pulled or reconnected.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::NotConnected);
        }

        // Record what was sent.
        state.sent_log.push(data.to_vec());

        // Match against the next expectation.
        match state.expectations.pop_front() {
            Some(expectation) if data == expectation.request.as_slice() => {
                state.readable.extend(expectation.response);
                Ok(())
            }
            Some(expectation) => Err(Error::Transport(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            ))),
            None => Err(Error::Transport(format!(
                "no more expectations in mock transport (got {:?})",
                String::from_utf8_lossy(data)
            ))),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(Error::NotConnected);
            }
            if !state.readable.is_empty() {
                let n = state.readable.len().min(buf.len());
                for (slot, byte) in buf.iter_mut().zip(state.readable.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        tokio::time::sleep(timeout).await;
        Err(Error::Timeout)
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.readable.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_basic_send_receive() {
        let mut mock = MockTransport::new();
        mock.expect_at("AT+CEREG?", &["+CEREG: 5,1", "OK"]);

        mock.send(b"AT+CEREG?\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"\r\n+CEREG: 5,1\r\n\r\nOK\r\n");
    }

    #[tokio::test]
    async fn mock_transport_tracks_sent_data() {
        let mut mock = MockTransport::new();
        mock.expect_at("AT", &["OK"]);
        mock.expect_at("AT+CFUN=0", &["OK"]);

        mock.send(b"AT\r\n").await.unwrap();
        mock.send(b"AT+CFUN=0\r\n").await.unwrap();

        assert_eq!(mock.sent_data().len(), 2);
        assert_eq!(mock.sent_data()[0], b"AT\r\n");
        assert_eq!(mock.handle().sent_commands(), vec!["AT", "AT+CFUN=0"]);
    }

    #[tokio::test]
    async fn mock_transport_wrong_data_errors() {
        let mut mock = MockTransport::new();
        mock.expect_at("AT", &["OK"]);

        let result = mock.send(b"ATZ\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::Transport(_)));
    }

    #[tokio::test]
    async fn mock_transport_no_expectations_errors() {
        let mut mock = MockTransport::new();

        let result = mock.send(b"AT\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::Transport(_)));
    }

    #[tokio::test]
    async fn mock_transport_receive_without_send_times_out() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 64];

        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn mock_transport_silence_times_out() {
        let mut mock = MockTransport::new();
        mock.expect_silence("AT+CFUN=1");
        mock.send(b"AT+CFUN=1\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn mock_transport_unsolicited_via_handle() {
        let mut mock = MockTransport::new();
        let handle = mock.handle();
        handle.push_unsolicited("%BOOTEV:0");

        let mut buf = [0u8; 64];
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], b"\r\n%BOOTEV:0\r\n");
    }

    #[tokio::test]
    async fn mock_transport_disconnect() {
        let mut mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.close().await.unwrap();
        assert!(!mock.is_connected());

        let result = mock.send(b"AT\r\n").await;
        assert!(matches!(result.unwrap_err(), Error::NotConnected));
    }

    #[tokio::test]
    async fn mock_transport_set_connected() {
        let mut mock = MockTransport::new();
        mock.set_connected(false);
        assert!(!mock.is_connected());

        let mut buf = [0u8; 8];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::NotConnected));
    }

    #[tokio::test]
    async fn mock_transport_remaining_expectations() {
        let mut mock = MockTransport::new();
        mock.expect_at("AT", &["OK"]);
        mock.expect_at("ATZ", &["OK"]);
        assert_eq!(mock.remaining_expectations(), 2);

        mock.send(b"AT\r\n").await.unwrap();
        assert_eq!(mock.remaining_expectations(), 1);
    }

    #[tokio::test]
    async fn mock_transport_partial_receive() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"OKOK");
        mock.send(b"AT\r\n").await.unwrap();

        let mut buf = [0u8; 2];
        let n = mock.receive(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], b"OK");
        let n = mock.receive(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], b"OK");
    }
}
