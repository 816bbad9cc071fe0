//! NordicProfile -- the [`DeviceProfile`] implementation for the Thingy:91 X.
//!
//! Boot is a plain `AT` readiness check followed by the radio configuration
//! block. Uplinks go out through `AT#XSENDTO` to the relay's ingestion
//! endpoint; downlinks are read with `AT#XRECVFROM` after the modem reports
//! an RRC connection (`+CSCON: 1`), which is how the network pages it when
//! a datagram is waiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use imok_core::at::AtChannel;
use imok_core::device::{DeviceProfile, ProfileDescriptor, check_mtu, init_error};
use imok_core::error::{Error, Result};
use imok_core::types::{NetworkSettings, SignalQuality};

use crate::commands;

/// A Thingy:91 X driven over its SLM AT interface.
///
/// Constructed via [`NordicBuilder`](crate::builder::NordicBuilder).
pub struct NordicProfile {
    descriptor: Arc<ProfileDescriptor>,
    settings: NetworkSettings,
    command_timeout: Duration,
    boot_timeout: Duration,
}

impl NordicProfile {
    pub(crate) fn new(
        descriptor: Arc<ProfileDescriptor>,
        settings: NetworkSettings,
        command_timeout: Duration,
        boot_timeout: Duration,
    ) -> Self {
        NordicProfile {
            descriptor,
            settings,
            command_timeout,
            boot_timeout,
        }
    }

    /// Network settings this profile was built with.
    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    async fn read_datagram(&self, at: &dyn AtChannel) -> Result<Option<Vec<u8>>> {
        let cmd = commands::cmd_receive_from(self.settings.udp_buffer_size, self.command_timeout);
        let resp = match at.send_command(cmd).await {
            Ok(resp) => resp,
            Err(Error::CommandRejected { reason, .. }) => {
                debug!(%reason, "no datagram buffered");
                return Ok(None);
            }
            Err(Error::MalformedResponse(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(header) = resp
            .line_with_prefix("#XRECVFROM:")
            .and_then(commands::parse_recv_header)
        else {
            warn!(lines = ?resp.lines, "unparseable #XRECVFROM header");
            return Ok(None);
        };

        if let Some(allowed) = self.settings.downlink_source.as_deref()
            && header.source != allowed
        {
            warn!(
                source = %header.source,
                allowed = %allowed,
                "dropping datagram from unexpected source"
            );
            return Ok(None);
        }

        let Some(data) = resp.line_after("#XRECVFROM:") else {
            warn!(size = header.size, "datagram header without data line");
            return Ok(None);
        };
        debug!(size = header.size, source = %header.source, port = header.port, "downlink datagram");
        Ok(Some(data.as_bytes().to_vec()))
    }
}

#[async_trait]
impl DeviceProfile for NordicProfile {
    fn descriptor(&self) -> Arc<ProfileDescriptor> {
        self.descriptor.clone()
    }

    async fn power_on_modem(&mut self, at: &dyn AtChannel) -> Result<()> {
        info!(device = self.descriptor.name, "connecting");
        at.send_command(commands::cmd_attention(self.boot_timeout))
            .await
            .map_err(|e| Error::ModemInit(format!("modem did not answer AT: {e}")))?;

        let timeout = self.command_timeout;
        let mut steps = vec![commands::cmd_functionality(0, timeout)];
        steps.extend(commands::cmd_network_config(timeout));
        steps.push(commands::cmd_functionality(1, timeout));

        for cmd in steps {
            let text = cmd.text.clone();
            debug!(command = %text, "init step");
            at.send_command(cmd)
                .await
                .map_err(|e| init_error(&text, e))?;
        }

        info!(device = self.descriptor.name, "modem configured");
        Ok(())
    }

    async fn open_data_channel(&mut self, at: &dyn AtChannel) -> Result<()> {
        let timeout = self.command_timeout;
        at.send_command(commands::cmd_pdp_context(&self.settings.apn, timeout))
            .await?;
        at.send_command(commands::cmd_subscribe_signal(timeout)).await?;
        at.send_command(commands::cmd_open_udp_socket(timeout)).await?;
        at.send_command(commands::cmd_bind(self.settings.downlink_port, timeout))
            .await?;
        info!(
            apn = %self.settings.apn,
            port = self.settings.downlink_port,
            "data channel open"
        );
        Ok(())
    }

    async fn send_payload(&mut self, at: &dyn AtChannel, payload: &[u8]) -> Result<()> {
        check_mtu(&self.descriptor, payload)?;
        if !commands::is_sendable_text(payload) {
            return Err(Error::InvalidParameter(
                "payload must be printable text without quotes".into(),
            ));
        }
        // is_sendable_text guarantees ASCII.
        let text = String::from_utf8_lossy(payload);

        let resp = at
            .send_command(commands::cmd_send_to(
                &self.settings.ingest_host,
                self.settings.ingest_port,
                &text,
            ))
            .await?;
        let sent = resp
            .line_with_prefix("#XSENDTO:")
            .and_then(commands::parse_sent_size);
        debug!(len = payload.len(), ?sent, "payload queued");
        Ok(())
    }

    async fn poll_downlink(&mut self, at: &dyn AtChannel) -> Result<Option<Vec<u8>>> {
        let mut paged = false;
        while let Some(line) = at.take_notification("+CSCON:") {
            paged |= commands::is_rrc_connected(&line);
        }
        if !paged {
            return Ok(None);
        }
        debug!("RRC connected, reading downlink");
        self.read_datagram(at).await
    }

    fn parse_signal_quality(&self, line: &str) -> Option<SignalQuality> {
        commands::parse_cesq(line)
    }
}
