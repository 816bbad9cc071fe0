//! UDP datagram transport for downlink delivery.
//!
//! The relay pushes downlink payloads as UDP datagrams to port 55555 of the
//! device's IP address. When the host itself holds a relay-routed address
//! (for example a cellular router in bridge mode), the device messenger binds
//! a [`UdpTransport`] on that port and accepts datagrams from the relay's
//! downlink source address only.
//!
//! [`UdpTransport`] does not implement [`Transport`](imok_core::Transport):
//! datagrams carry a source address that callers need for filtering.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use imok_core::error::{Error, Result};
use tokio::net::UdpSocket;

/// Async UDP socket with timeout-bounded receive and source filtering.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    allowed_source: Option<IpAddr>,
}

impl UdpTransport {
    /// Bind a UDP socket to `addr` (e.g. `"0.0.0.0:55555"`).
    pub async fn bind(addr: &str) -> Result<Self> {
        tracing::debug!(addr = %addr, "Binding UDP socket");

        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "Failed to bind UDP socket");
            Error::Transport(format!("failed to bind UDP socket {addr}: {e}"))
        })?;
        let local_addr = socket.local_addr().map_err(Error::Io)?;

        tracing::info!(local = %local_addr, "UDP socket bound");

        Ok(Self {
            socket,
            local_addr,
            allowed_source: None,
        })
    }

    /// Bind to `0.0.0.0:<port>`. Port 0 picks an ephemeral port.
    pub async fn bind_port(port: u16) -> Result<Self> {
        Self::bind(&format!("0.0.0.0:{port}")).await
    }

    /// Only accept datagrams whose source IP is `source`.
    pub fn with_allowed_source(mut self, source: IpAddr) -> Self {
        self.allowed_source = Some(source);
        self
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The source filter, if any.
    pub fn allowed_source(&self) -> Option<IpAddr> {
        self.allowed_source
    }

    /// Send one datagram to `addr`.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        tracing::trace!(
            local = %self.local_addr,
            remote = %addr,
            bytes = data.len(),
            "Sending datagram"
        );

        self.socket.send_to(data, addr).await.map_err(|e| {
            tracing::error!(
                local = %self.local_addr,
                remote = %addr,
                error = %e,
                "Failed to send datagram"
            );
            Error::Io(e)
        })?;
        Ok(())
    }

    /// Receive one datagram, returning `(bytes_read, source_addr)`.
    ///
    /// Datagrams from sources other than the configured filter are dropped
    /// with a warning and do not reset the deadline. Bytes beyond
    /// `buf.len()` are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no accepted datagram arrives within
    /// `timeout`.
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, SocketAddr)> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let result = tokio::time::timeout_at(deadline, self.socket.recv_from(buf)).await;
            match result {
                Ok(Ok((n, src))) => {
                    if let Some(allowed) = self.allowed_source
                        && src.ip() != allowed
                    {
                        tracing::warn!(
                            local = %self.local_addr,
                            remote = %src,
                            allowed = %allowed,
                            bytes = n,
                            "Dropping datagram from unexpected source"
                        );
                        continue;
                    }
                    tracing::trace!(
                        local = %self.local_addr,
                        remote = %src,
                        bytes = n,
                        "Received datagram"
                    );
                    return Ok((n, src));
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        local = %self.local_addr,
                        error = %e,
                        "Failed to receive datagram"
                    );
                    return Err(Error::Io(e));
                }
                Err(_) => return Err(Error::Timeout),
            }
        }
    }

    /// Receive one datagram, ignoring the source address.
    pub async fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let (n, _src) = self.recv_from(buf, timeout).await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn bind_and_local_addr() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr();

        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0, "OS should assign a nonzero port");
    }

    #[tokio::test]
    async fn send_recv_loopback() {
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let receiver = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        sender.send_to(b"IMOK", receiver.local_addr()).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, src) = receiver
            .recv_from(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(&buf[..n], b"IMOK");
        assert_eq!(src, sender.local_addr());
    }

    #[tokio::test]
    async fn recv_timeout() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let mut buf = [0u8; 64];
        let result = transport.recv(&mut buf, Duration::from_millis(50)).await;

        assert!(
            matches!(result, Err(Error::Timeout)),
            "expected Timeout, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn source_filter_drops_other_senders() {
        let receiver = UdpTransport::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_allowed_source(IpAddr::V4(Ipv4Addr::new(100, 127, 10, 16)));
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_to(b"spoofed", receiver.local_addr())
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let result = receiver.recv(&mut buf, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn source_filter_accepts_matching_sender() {
        let receiver = UdpTransport::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_allowed_source(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        sender.send_to(b"ok", receiver.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf, Duration::from_secs(2)).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn bind_port_zero() {
        let transport = UdpTransport::bind_port(0).await.unwrap();
        assert_ne!(transport.local_addr().port(), 0);
        assert!(transport.allowed_source().is_none());
    }
}
