//! Transport implementations for IMOK modems.
//!
//! - [`SerialTransport`]: USB virtual COM ports the modems expose for their
//!   AT interface; implements [`Transport`](imok_core::Transport)
//! - [`UdpTransport`]: host-side UDP listener for relay downlink datagrams
//!
//! # Example
//!
//! ```no_run
//! use imok_transport::SerialTransport;
//! use imok_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> imok_core::Result<()> {
//! let mut transport = SerialTransport::open("/dev/ttyACM0", 115200).await?;
//!
//! transport.send(b"AT+CEREG?\r\n").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;
pub mod udp;

pub use serial::{
    DataBits, FlowControl, Parity, PortInfo, SerialConfig, SerialTransport, StopBits,
    available_ports,
};
pub use udp::UdpTransport;
