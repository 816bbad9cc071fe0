//! imok-test-harness: Test utilities and mock collaborators for imok.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of AT
//! exchanges without a modem attached, [`MockRelay`] for driving the relay
//! client and messenger from scripted pages, and [`MockHttpServer`] for
//! testing the relay's REST client against canned HTTP responses.

pub mod mock_http;
pub mod mock_relay;
pub mod mock_serial;

pub use mock_http::{MockHttpServer, RecordedRequest};
pub use mock_relay::MockRelay;
pub use mock_serial::{MockHandle, MockTransport};
