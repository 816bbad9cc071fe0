//! Mock HTTP server for testing the relay's REST client.
//!
//! [`MockHttpServer`] listens on a random localhost port and answers requests
//! from an ordered script, recording each request for later assertions. It
//! speaks just enough HTTP/1.1 for a client that sends `Content-Length`
//! bodies; every response closes the connection.
//!
//! # Example
//!
//! ```no_run
//! use imok_test_harness::MockHttpServer;
//!
//! # async fn example() -> imok_core::Result<()> {
//! let server = MockHttpServer::start().await?;
//! server.expect("POST", "/v1/auth", 200, r#"{"apiKey":"k","token":"t"}"#);
//! let base = server.base_url();
//! // ... point the client at `base` and exercise it ...
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::warn;

use imok_core::error::{Error, Result};

/// A scripted response.
#[derive(Debug, Clone)]
struct HttpExpectation {
    method: String,
    path: String,
    status: u16,
    body: String,
    headers: Vec<(String, String)>,
}

/// A request as received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request target including the query string.
    pub target: String,
    /// Header names (lowercased) and values.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Path without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    /// Value of a query parameter, if present.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.target.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == name).then_some(v)
        })
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Debug, Default)]
struct State {
    expectations: VecDeque<HttpExpectation>,
    requests: Vec<RecordedRequest>,
}

/// A mock HTTP server with an ordered response script.
///
/// A request whose method or path does not match the next scripted entry is
/// answered with `500` and logged; the entry is still consumed.
pub struct MockHttpServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockHttpServer {
    /// Bind to a random localhost port and start serving.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock HTTP server: {e}")))?;
        let addr = listener.local_addr().map_err(Error::Io)?;
        let state = Arc::new(Mutex::new(State::default()));

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = task_state.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, state).await {
                        warn!(error = %e, "mock HTTP connection failed");
                    }
                });
            }
        });

        Ok(MockHttpServer { addr, state, task })
    }

    /// Script the next response.
    ///
    /// `path` is compared against the request path without the query.
    pub fn expect(&self, method: &str, path: &str, status: u16, body: &str) {
        self.expect_with_headers(method, path, status, body, &[]);
    }

    /// Script the next response with extra response headers.
    pub fn expect_with_headers(
        &self,
        method: &str,
        path: &str,
        status: u16,
        body: &str,
        headers: &[(&str, &str)],
    ) {
        lock(&self.state).expectations.push_back(HttpExpectation {
            method: method.to_string(),
            path: path.to_string(),
            status,
            body: body.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    /// `http://127.0.0.1:<port>`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state).requests.clone()
    }

    /// Scripted responses not yet used.
    pub fn remaining_expectations(&self) -> usize {
        lock(&self.state).expectations.len()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionLost);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionLost);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(RecordedRequest {
        method,
        target,
        headers,
        body,
    })
}

async fn serve_connection(mut stream: TcpStream, state: Arc<Mutex<State>>) -> Result<()> {
    let request = read_request(&mut stream).await?;

    let (status, body, headers) = {
        let mut state = lock(&state);
        let expectation = state.expectations.pop_front();
        let path = request.path().to_string();
        let method = request.method.clone();
        state.requests.push(request);
        match expectation {
            Some(e) if e.method == method && e.path == path => (e.status, e.body, e.headers),
            Some(e) => {
                warn!(expected = %format!("{} {}", e.method, e.path), got = %format!("{method} {path}"), "mock HTTP request mismatch");
                (500, format!("expected {} {}", e.method, e.path), Vec::new())
            }
            None => {
                warn!(got = %format!("{method} {path}"), "mock HTTP script exhausted");
                (500, "no more expectations".to_string(), Vec::new())
            }
        }
    };

    let mut response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        reason(status),
        body.len()
    );
    for (k, v) in &headers {
        response.push_str(&format!("{k}: {v}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(&body);

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}
