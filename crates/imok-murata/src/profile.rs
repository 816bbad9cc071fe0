//! MurataProfile -- the [`DeviceProfile`] implementation for the Type 1SC-NTN.
//!
//! Power-on follows the module's NTN bring-up: two configuration resets, the
//! SIM plan switch, RAT and band selection, then a GNSS restart. The module
//! needs its own position to compute satellite timing, so the fix it reports
//! is kept and exposed through [`DeviceProfile::location`]. A missing fix or
//! a missing SIB31 broadcast is logged and tolerated; registration polling
//! decides whether the attach worked.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use imok_core::at::{AtChannel, AtCommand};
use imok_core::device::{DeviceProfile, ProfileDescriptor, check_mtu, init_error};
use imok_core::error::{Error, Result};
use imok_core::message::Location;
use imok_core::types::{NetworkSettings, SignalQuality};

use crate::commands;

/// Per-stage timeouts for the NTN bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub command: Duration,
    pub boot: Duration,
    pub gnss_fix: Duration,
    pub sib31: Duration,
    pub ping: Duration,
}

/// A Type 1SC-NTN driven over its AT interface.
///
/// Constructed via [`MurataBuilder`](crate::builder::MurataBuilder).
pub struct MurataProfile {
    descriptor: Arc<ProfileDescriptor>,
    settings: NetworkSettings,
    timeouts: Timeouts,
    location: Option<Location>,
    send_socket: Option<u8>,
    listen_socket: Option<u8>,
    rx_pending: bool,
}

impl MurataProfile {
    pub(crate) fn new(
        descriptor: Arc<ProfileDescriptor>,
        settings: NetworkSettings,
        timeouts: Timeouts,
    ) -> Self {
        MurataProfile {
            descriptor,
            settings,
            timeouts,
            location: None,
            send_socket: None,
            listen_socket: None,
            rx_pending: false,
        }
    }

    /// Network settings this profile was built with.
    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Stage timeouts this profile was built with.
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Socket ids `(send, listen)` once the data channel is open.
    pub fn sockets(&self) -> (Option<u8>, Option<u8>) {
        (self.send_socket, self.listen_socket)
    }

    /// `ATZ`, then wait for `%BOOTEV:0`.
    async fn reset(&self, at: &dyn AtChannel) -> Result<()> {
        at.discard_notifications("%BOOTEV:");
        at.send_command(commands::cmd_reset(self.timeouts.command))
            .await
            .map_err(|e| init_error("ATZ", e))?;

        let deadline = Instant::now() + self.timeouts.boot;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match at.wait_notification("%BOOTEV:", remaining).await {
                Ok(line) if commands::is_boot_complete(&line) => {
                    debug!("boot complete");
                    return Ok(());
                }
                Ok(line) => debug!(line = %line, "boot event"),
                Err(Error::Timeout) => {
                    return Err(Error::ModemInit(format!(
                        "no %BOOTEV:0 within {}s of ATZ",
                        self.timeouts.boot.as_secs()
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Issue settings whose rejection is not fatal.
    async fn apply_settings(&self, at: &dyn AtChannel, cmds: Vec<AtCommand>) -> Result<()> {
        for cmd in cmds {
            let text = cmd.text.clone();
            match at.send_command(cmd).await {
                Ok(_) => debug!(command = %text, "applied"),
                Err(e @ (Error::CommandRejected { .. } | Error::MalformedResponse(_))) => {
                    warn!(command = %text, error = %e, "setting not applied, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn wait_for_fix(&mut self, at: &dyn AtChannel) -> Result<()> {
        info!(timeout_s = self.timeouts.gnss_fix.as_secs(), "waiting for GNSS fix");
        match at
            .wait_notification("%IGNSSEVU:\"FIX\"", self.timeouts.gnss_fix)
            .await
        {
            Ok(line) => match commands::parse_gnss_fix(&line) {
                Some(location) => {
                    info!(%location, "GNSS fix acquired");
                    self.location = Some(location);
                }
                None => warn!(line = %line, "unparseable GNSS fix"),
            },
            Err(Error::Timeout) => warn!("GNSS fix timeout, continuing without location"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn wait_for_sib31(&self, at: &dyn AtChannel) -> Result<()> {
        let deadline = Instant::now() + self.timeouts.sib31;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match at.wait_notification("%NOTIFYEV:", remaining).await {
                Ok(line) if commands::is_sib31(&line) => {
                    info!("satellite broadcast received");
                    return Ok(());
                }
                Ok(line) => debug!(line = %line, "modem event"),
                Err(Error::Timeout) => {
                    warn!("no SIB31 broadcast yet, continuing to registration");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Allocate a socket and read its id from the `%SOCKETCMD` notification.
    async fn allocate_socket(&self, at: &dyn AtChannel, cmd: AtCommand) -> Result<u8> {
        at.discard_notifications("%SOCKETCMD:");
        let text = cmd.text.clone();
        at.send_command(cmd).await?;
        let line = at
            .wait_notification("%SOCKETCMD:", self.timeouts.command)
            .await
            .map_err(|e| match e {
                Error::Timeout => Error::MalformedResponse(format!("no socket id after {text}")),
                other => other,
            })?;
        commands::parse_socket_id(&line).ok_or(Error::MalformedResponse(line))
    }

    async fn check_data_path(&self, at: &dyn AtChannel) -> Result<()> {
        let target = &self.settings.ping_target;
        at.discard_notifications("%PINGCMD:");
        at.send_command(commands::cmd_ping(target, self.timeouts.command))
            .await?;
        let line = at
            .wait_notification("%PINGCMD:", self.timeouts.ping)
            .await
            .map_err(|e| match e {
                Error::Timeout => Error::ModemInit(format!("no ping reply from {target}")),
                other => other,
            })?;
        info!(target = %target, rtt_ms = ?commands::parse_ping_rtt(&line), "data path up");
        Ok(())
    }
}

#[async_trait]
impl DeviceProfile for MurataProfile {
    fn descriptor(&self) -> Arc<ProfileDescriptor> {
        self.descriptor.clone()
    }

    async fn power_on_modem(&mut self, at: &dyn AtChannel) -> Result<()> {
        info!(device = self.descriptor.name, "connecting");
        self.location = None;
        self.reset(at).await?;

        let resp = at
            .send_command(commands::cmd_sim_state(self.timeouts.command))
            .await
            .map_err(|e| init_error("SIM check", e))?;
        let sim = resp.line_with_prefix("+CPIN:").unwrap_or_default();
        if sim != "READY" {
            return Err(Error::ModemInit(format!("SIM not ready: {sim}")));
        }

        let timeout = self.timeouts.command;
        self.apply_settings(at, commands::cmd_boot_config(timeout))
            .await?;
        self.reset(at).await?;

        self.apply_settings(at, commands::cmd_ntn_config(timeout))
            .await?;
        self.reset(at).await?;

        self.apply_settings(at, commands::cmd_radio_setup(&self.settings.ntn_band, timeout))
            .await?;
        self.wait_for_fix(at).await?;

        for cmd in commands::cmd_radio_on(timeout) {
            let text = cmd.text.clone();
            at.send_command(cmd).await.map_err(|e| init_error(&text, e))?;
        }
        self.wait_for_sib31(at).await?;

        info!(device = self.descriptor.name, band = %self.settings.ntn_band, "radio enabled");
        Ok(())
    }

    async fn open_data_channel(&mut self, at: &dyn AtChannel) -> Result<()> {
        let timeout = self.timeouts.command;
        at.send_command(commands::cmd_pdp_context(&self.settings.apn, timeout))
            .await?;
        self.check_data_path(at).await?;

        at.send_command(commands::cmd_socket_events(timeout)).await?;

        let send = self
            .allocate_socket(
                at,
                commands::cmd_allocate_sender(
                    &self.settings.ingest_host,
                    self.settings.ingest_port,
                    timeout,
                ),
            )
            .await?;
        at.send_command(commands::cmd_activate(send, timeout)).await?;
        self.send_socket = Some(send);

        let listen = self
            .allocate_socket(
                at,
                commands::cmd_allocate_listener(self.settings.downlink_port, timeout),
            )
            .await?;
        at.send_command(commands::cmd_activate(listen, timeout)).await?;
        self.listen_socket = Some(listen);
        self.rx_pending = false;

        self.apply_settings(at, vec![commands::cmd_measure_signal(timeout)])
            .await?;

        info!(
            send_socket = send,
            listen_socket = listen,
            port = self.settings.downlink_port,
            "data channel open"
        );
        Ok(())
    }

    async fn send_payload(&mut self, at: &dyn AtChannel, payload: &[u8]) -> Result<()> {
        check_mtu(&self.descriptor, payload)?;
        let socket = self.send_socket.ok_or(Error::NotConnected)?;
        at.send_command(commands::cmd_send(socket, payload)).await?;
        debug!(socket, len = payload.len(), "payload queued");
        Ok(())
    }

    async fn poll_downlink(&mut self, at: &dyn AtChannel) -> Result<Option<Vec<u8>>> {
        let Some(listen) = self.listen_socket else {
            return Ok(None);
        };

        while let Some(line) = at.take_notification("%SOCKETEV:") {
            match commands::parse_socket_event(&line) {
                Some(ev) if ev.is_data_available() && ev.socket_id == listen => {
                    self.rx_pending = true;
                }
                Some(ev) => debug!(event = ev.event, socket = ev.socket_id, "socket event"),
                None => warn!(line = %line, "unparseable socket event"),
            }
        }
        if !self.rx_pending {
            return Ok(None);
        }
        self.rx_pending = false;

        let resp = match at
            .send_command(commands::cmd_receive(listen, self.timeouts.command))
            .await
        {
            Ok(resp) => resp,
            Err(Error::CommandRejected { reason, .. }) => {
                debug!(%reason, "no datagram buffered");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let body = resp.line_with_prefix("%SOCKETDATA:").unwrap_or_default();
        let data = match commands::parse_socket_data(body) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "dropping unreadable socket data");
                return Ok(None);
            }
        };
        self.rx_pending = data.more;

        if let (Some(allowed), Some(source)) =
            (self.settings.downlink_source.as_deref(), data.source.as_deref())
            && source != allowed
        {
            warn!(source = %source, allowed = %allowed, "dropping datagram from unexpected source");
            return Ok(None);
        }
        if data.payload.is_empty() {
            return Ok(None);
        }
        debug!(len = data.payload.len(), more = data.more, "downlink datagram");
        Ok(Some(data.payload))
    }

    fn parse_signal_quality(&self, line: &str) -> Option<SignalQuality> {
        commands::parse_meas(line)
    }

    fn location(&self) -> Option<Location> {
        self.location
    }
}
