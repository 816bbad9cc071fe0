//! The `DeviceProfile` trait: one uniform lifecycle over vendor AT dialects.
//!
//! A profile knows *which* commands to issue and how to read the answers;
//! the [`AtChannel`] it is handed knows *how* to get them to the modem. The
//! session worker in the `imok` facade owns both and calls the profile
//! strictly sequentially, which is why the lifecycle methods take
//! `&mut self`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::at::{AtChannel, AtCommand};
use crate::error::{Error, Result};
use crate::message::Location;
use crate::types::{DeviceKind, PayloadEncoding, RegistrationStatus, SignalQuality};

/// Static description of a device type.
///
/// Built once per device type and shared by every session of that type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileDescriptor {
    /// Which device this describes.
    pub kind: DeviceKind,
    /// Model name.
    pub name: &'static str,
    /// Manufacturer name.
    pub manufacturer: &'static str,
    /// Default serial baud rate.
    pub default_baud_rate: u32,
    /// Largest payload the link accepts in one transmission, in bytes.
    pub mtu: usize,
    /// How payload bytes are carried over the AT link.
    pub encoding: PayloadEncoding,
    /// Per-attempt timeout for ordinary commands.
    pub command_timeout: Duration,
    /// How long to wait for the modem to report ready after a reset.
    pub boot_timeout: Duration,
    /// Delay between `AT+CEREG?` polls.
    pub registration_poll_interval: Duration,
    /// Default bound on network registration.
    pub registration_timeout: Duration,
    /// Consecutive denied polls tolerated before giving up.
    pub denied_polls_before_failure: u32,
    /// Line prefixes the modem emits unsolicited.
    pub notification_prefixes: &'static [&'static str],
    /// Notification prefixes carrying signal or registration status.
    pub status_prefixes: &'static [&'static str],
}

/// Uniform async lifecycle over a vendor AT dialect.
#[async_trait]
pub trait DeviceProfile: Send + Sync {
    /// Static description of this device type.
    fn descriptor(&self) -> Arc<ProfileDescriptor>;

    /// Run the vendor boot and configuration sequence.
    ///
    /// Fails with [`Error::ModemInit`] when the modem never reports ready.
    async fn power_on_modem(&mut self, at: &dyn AtChannel) -> Result<()>;

    /// Wait for the modem to attach to the network.
    ///
    /// The default polls `AT+CEREG?` per the descriptor's interval and
    /// denied-poll threshold.
    async fn register_network(
        &mut self,
        at: &dyn AtChannel,
        timeout: Duration,
    ) -> Result<RegistrationStatus> {
        poll_registration(at, &self.descriptor(), timeout).await
    }

    /// Set up the PDP context and the UDP sockets used for payloads.
    async fn open_data_channel(&mut self, at: &dyn AtChannel) -> Result<()>;

    /// Hand one payload to the modem for transmission.
    ///
    /// Fails with [`Error::PayloadTooLarge`] before any command is issued
    /// when the payload exceeds the link MTU.
    async fn send_payload(&mut self, at: &dyn AtChannel, payload: &[u8]) -> Result<()>;

    /// Read one buffered downlink datagram, if the modem announced one.
    ///
    /// Never blocks waiting for data.
    async fn poll_downlink(&mut self, at: &dyn AtChannel) -> Result<Option<Vec<u8>>>;

    /// Interpret a signal-quality notification.
    fn parse_signal_quality(&self, line: &str) -> Option<SignalQuality>;

    /// Interpret a `+CEREG` notification.
    fn parse_registration(&self, line: &str) -> Option<RegistrationStatus> {
        parse_cereg_notification(line)
    }

    /// GNSS fix obtained during power-on, if the device has a receiver.
    fn location(&self) -> Option<Location> {
        None
    }
}

/// Reject a payload that does not fit the link.
pub fn check_mtu(descriptor: &ProfileDescriptor, payload: &[u8]) -> Result<()> {
    if payload.len() > descriptor.mtu {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            mtu: descriptor.mtu,
        });
    }
    Ok(())
}

/// Reclassify a failed boot step as [`Error::ModemInit`].
///
/// Rejections, malformed answers and timeouts mean the modem is not
/// ready; link failures are passed through unchanged.
pub fn init_error(step: &str, err: Error) -> Error {
    match err {
        Error::CommandRejected { .. } | Error::MalformedResponse(_) | Error::Timeout => {
            Error::ModemInit(format!("{step}: {err}"))
        }
        other => other,
    }
}

fn leading_numbers(fields: &str) -> impl Iterator<Item = Option<u8>> + '_ {
    fields.split(',').map(|f| f.trim().trim_matches('"').parse().ok())
}

/// Parse the body of an `AT+CEREG?` response: `<n>,<stat>[,...]`.
pub fn parse_cereg_query(body: &str) -> Option<RegistrationStatus> {
    let mut fields = leading_numbers(body);
    fields.next()??;
    fields.next()?.map(RegistrationStatus::from_stat)
}

/// Parse a `+CEREG: <stat>[,...]` notification line.
pub fn parse_cereg_notification(line: &str) -> Option<RegistrationStatus> {
    let body = line.trim().strip_prefix("+CEREG:")?;
    leading_numbers(body)
        .next()?
        .map(RegistrationStatus::from_stat)
}

/// Poll `AT+CEREG?` until the modem is registered.
///
/// Returns [`Error::RegistrationDenied`] after the descriptor's number of
/// consecutive denied polls and [`Error::RegistrationTimeout`] once
/// `timeout` has elapsed.
pub async fn poll_registration(
    at: &dyn AtChannel,
    descriptor: &ProfileDescriptor,
    timeout: Duration,
) -> Result<RegistrationStatus> {
    let start = Instant::now();
    let mut denied = 0u32;

    loop {
        let resp = at
            .send_command(
                AtCommand::new("AT+CEREG?")
                    .timeout(descriptor.command_timeout)
                    .expect("+CEREG:"),
            )
            .await?;
        let body = resp.line_with_prefix("+CEREG:").unwrap_or_default();
        let status = parse_cereg_query(body)
            .ok_or_else(|| Error::MalformedResponse(format!("+CEREG: {body}")))?;
        debug!(stat = status.stat(), "registration poll");

        if status.is_registered() {
            return Ok(status);
        }
        if status == RegistrationStatus::Denied {
            denied += 1;
            warn!(denied, "network denied registration");
            if denied >= descriptor.denied_polls_before_failure {
                return Err(Error::RegistrationDenied {
                    stat: status.stat(),
                });
            }
        } else {
            denied = 0;
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::RegistrationTimeout { elapsed });
        }
        tokio::time::sleep(descriptor.registration_poll_interval.min(timeout - elapsed)).await;
    }
}
