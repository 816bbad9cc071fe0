//! Type 1SC-NTN command builders and response parsers.
//!
//! The module's vendor commands use a `%` prefix and quoted string
//! arguments. Socket payloads are uppercase hex in both directions.

use std::time::Duration;

use imok_core::at::AtCommand;
use imok_core::error::{Error, Result};
use imok_core::message::Location;
use imok_core::types::SignalQuality;

/// Socket data exchanges can wait for a satellite pass.
pub const SOCKET_DATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest datagram `%SOCKETDATA="RECEIVE"` returns in one read.
pub const RECEIVE_MAX: usize = 1500;

/// `AT+CSIM` APDU switching the SIM to its NTN subscription plan.
pub const NTN_PLAN_APDU: &str = "80C2000015D613190103820282811B0100130799F08900010001";

// ---------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------

/// `ATZ`: soft reset. The module answers `OK`, then `%BOOTEV:0` once up.
pub fn cmd_reset(timeout: Duration) -> AtCommand {
    AtCommand::new("ATZ").timeout(timeout)
}

/// `AT+CPIN?`
pub fn cmd_sim_state(timeout: Duration) -> AtCommand {
    AtCommand::new("AT+CPIN?").timeout(timeout).expect("+CPIN:")
}

/// Boot-event reporting and SIM selection policy, applied before the
/// first reset.
pub fn cmd_boot_config(timeout: Duration) -> Vec<AtCommand> {
    [
        "AT%SETACFG=\"manager.urcBootEv.enabled\",\"true\"",
        "AT%SETCFG=\"SIM_INIT_SELECT_POLICY\",\"0\"",
    ]
    .into_iter()
    .map(|text| AtCommand::new(text).timeout(timeout))
    .collect()
}

/// Radio manager and location service settings for NTN operation.
pub fn cmd_ntn_config(timeout: Duration) -> Vec<AtCommand> {
    [
        "AT%SETACFG=\"radiom.config.multi_rat_enable\",\"true\"",
        "AT%SETACFG=\"radiom.config.preferred_rat_list\",\"none\"",
        "AT%SETACFG=\"radiom.config.auto_preference_mode\",\"none\"",
        "AT%SETACFG=\"locsrv.operation.locsrv_enable\",\"true\"",
        "AT%SETACFG=\"locsrv.internal_gnss.auto_restart\",\"enable\"",
        "AT%SETACFG=\"modem_apps.Mode.AutoConnectMode\",\"true\"",
    ]
    .into_iter()
    .map(|text| AtCommand::new(text).timeout(timeout))
    .collect()
}

/// Commands run after the second reset, up to and including GNSS restart.
///
/// NTN plan, RAT image, band lock, radio off, fix and SIB31 notifications,
/// then an iGNSS off/on cycle.
pub fn cmd_radio_setup(band: &str, timeout: Duration) -> Vec<AtCommand> {
    [
        format!("AT+CSIM=52,\"{NTN_PLAN_APDU}\""),
        "AT%RATIMGSEL=2".to_string(),
        "AT%RATACT=\"NBNTN\",\"1\"".to_string(),
        format!("AT%SETCFG=\"BAND\",\"{band}\""),
        "AT+CFUN=0".to_string(),
        "AT%IGNSSEV=\"FIX\",1".to_string(),
        "AT%NOTIFYEV=\"SIB31\",1".to_string(),
        "AT%IGNSSACT=0".to_string(),
        "AT%IGNSSACT=1".to_string(),
    ]
    .into_iter()
    .map(|text| AtCommand::new(text).timeout(timeout))
    .collect()
}

/// `AT+CEREG=2` then `AT+CFUN=1`.
pub fn cmd_radio_on(timeout: Duration) -> Vec<AtCommand> {
    ["AT+CEREG=2", "AT+CFUN=1"]
        .into_iter()
        .map(|text| AtCommand::new(text).timeout(timeout))
        .collect()
}

/// `AT+CGDCONT=1,"IP","<apn>"`
pub fn cmd_pdp_context(apn: &str, timeout: Duration) -> AtCommand {
    AtCommand::new(format!("AT+CGDCONT=1,\"IP\",\"{apn}\"")).timeout(timeout)
}

/// `AT%PINGCMD=0,"<target>",1,50,30`: one 50-byte ping, 30 s timeout.
pub fn cmd_ping(target: &str, timeout: Duration) -> AtCommand {
    AtCommand::new(format!("AT%PINGCMD=0,\"{target}\",1,50,30")).timeout(timeout)
}

/// `AT%SOCKETEV=0,1`: enable socket event notifications.
pub fn cmd_socket_events(timeout: Duration) -> AtCommand {
    AtCommand::new("AT%SOCKETEV=0,1").timeout(timeout)
}

/// Allocate a UDP socket that sends to `host:port`.
pub fn cmd_allocate_sender(host: &str, port: u16, timeout: Duration) -> AtCommand {
    AtCommand::new(format!(
        "AT%SOCKETCMD=\"ALLOCATE\",1,\"UDP\",\"OPEN\",\"{host}\",{port}"
    ))
    .timeout(timeout)
}

/// Allocate a UDP socket listening on `port`.
pub fn cmd_allocate_listener(port: u16, timeout: Duration) -> AtCommand {
    AtCommand::new(format!(
        "AT%SOCKETCMD=\"ALLOCATE\",1,\"UDP\",\"LISTEN\",\"0.0.0.0\",,{port}"
    ))
    .timeout(timeout)
}

/// `AT%SOCKETCMD="ACTIVATE",<id>`
pub fn cmd_activate(socket_id: u8, timeout: Duration) -> AtCommand {
    AtCommand::new(format!("AT%SOCKETCMD=\"ACTIVATE\",{socket_id}")).timeout(timeout)
}

/// `AT%MEAS="8"`: request signal quality reports.
pub fn cmd_measure_signal(timeout: Duration) -> AtCommand {
    AtCommand::new("AT%MEAS=\"8\"").timeout(timeout)
}

/// `AT%SOCKETDATA="SEND",<id>,<len>,"<HEX>"`
pub fn cmd_send(socket_id: u8, payload: &[u8]) -> AtCommand {
    AtCommand::new(format!(
        "AT%SOCKETDATA=\"SEND\",{socket_id},{},\"{}\"",
        payload.len(),
        hex::encode_upper(payload)
    ))
    .timeout(SOCKET_DATA_TIMEOUT)
}

/// `AT%SOCKETDATA="RECEIVE",<id>,1500`
pub fn cmd_receive(socket_id: u8, timeout: Duration) -> AtCommand {
    AtCommand::new(format!(
        "AT%SOCKETDATA=\"RECEIVE\",{socket_id},{RECEIVE_MAX}"
    ))
    .timeout(timeout)
    .expect("%SOCKETDATA:")
}

// ---------------------------------------------------------------
// Response parsers
// ---------------------------------------------------------------

fn fields(body: &str) -> Vec<&str> {
    body.split(',').map(|f| f.trim().trim_matches('"')).collect()
}

/// Whether a line is the `%BOOTEV:0` boot-complete event.
pub fn is_boot_complete(line: &str) -> bool {
    line.trim()
        .strip_prefix("%BOOTEV:")
        .is_some_and(|body| body.trim() == "0")
}

/// Parse a socket id from `%SOCKETCMD:<id>`.
pub fn parse_socket_id(line: &str) -> Option<u8> {
    let body = line.trim().strip_prefix("%SOCKETCMD:")?;
    fields(body).first()?.parse().ok()
}

/// A `%SOCKETEV:<event>,<socket>` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEvent {
    /// Event code; 1 means data is available.
    pub event: u8,
    /// Socket the event refers to.
    pub socket_id: u8,
}

impl SocketEvent {
    /// Whether this event announces buffered data.
    pub fn is_data_available(&self) -> bool {
        self.event == 1
    }
}

/// Parse `%SOCKETEV:<event>,<socket>`.
pub fn parse_socket_event(line: &str) -> Option<SocketEvent> {
    let body = line.trim().strip_prefix("%SOCKETEV:")?;
    let f = fields(body);
    Some(SocketEvent {
        event: f.first()?.parse().ok()?,
        socket_id: f.get(1)?.parse().ok()?,
    })
}

/// A datagram read with `%SOCKETDATA="RECEIVE"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    /// Socket it was read from.
    pub socket_id: u8,
    /// Decoded payload.
    pub payload: Vec<u8>,
    /// Whether more data remains buffered.
    pub more: bool,
    /// Source IP, when the module reports it.
    pub source: Option<String>,
    /// Source port, when the module reports it.
    pub source_port: Option<u16>,
}

/// Parse the body of `%SOCKETDATA:<id>,<len>,<more>,"<hex>"[,"<ip>",<port>]`.
pub fn parse_socket_data(body: &str) -> Result<ReceivedData> {
    let f = fields(body);
    let malformed = || Error::MalformedResponse(format!("%SOCKETDATA:{body}"));
    if f.len() < 4 {
        return Err(malformed());
    }
    let socket_id = f[0].parse().map_err(|_| malformed())?;
    let len: usize = f[1].parse().map_err(|_| malformed())?;
    let more = f[2].parse::<u8>().map_err(|_| malformed())? != 0;
    let payload = hex::decode(f[3])
        .map_err(|e| Error::Decode(format!("socket data is not hex: {e}")))?;
    if payload.len() != len {
        return Err(Error::Decode(format!(
            "socket data length {} does not match declared {len}",
            payload.len()
        )));
    }
    Ok(ReceivedData {
        socket_id,
        payload,
        more,
        source: f.get(4).filter(|s| !s.is_empty()).map(|s| s.to_string()),
        source_port: f.get(5).and_then(|s| s.parse().ok()),
    })
}

/// Parse `%PINGCMD:<id>,"<ip>",<rtt>,<ttl>`; returns the round trip in ms.
pub fn parse_ping_rtt(line: &str) -> Option<u32> {
    let body = line.trim().strip_prefix("%PINGCMD:")?;
    fields(body).get(2)?.parse().ok()
}

fn measurement(body: &str, key: &str) -> Option<i16> {
    let start = body.find(key)? + key.len();
    let rest = body[start..].trim_start();
    let end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map_or(rest.len(), |(i, _)| i);
    rest[..end].parse().ok()
}

/// Parse `%MEAS: Signal Quality:RSRP=<n>,RSRQ=<n>,SINR=<n>,RSSI=<n>`.
pub fn parse_meas(line: &str) -> Option<SignalQuality> {
    let body = line.trim().strip_prefix("%MEAS:")?;
    let q = SignalQuality {
        rsrp_dbm: measurement(body, "RSRP="),
        rsrq: measurement(body, "RSRQ="),
        sinr: measurement(body, "SINR="),
        rssi: measurement(body, "RSSI="),
    };
    (q.rsrp_dbm.is_some() || q.rssi.is_some()).then_some(q)
}

/// Parse a GNSS fix notification.
///
/// `%IGNSSEVU:"FIX",<n>,"<time>","<date>","<alt>","<lat>","<lon>",...`
pub fn parse_gnss_fix(line: &str) -> Option<Location> {
    let body = line.trim().strip_prefix("%IGNSSEVU:")?;
    let f = fields(body);
    if f.first() != Some(&"FIX") {
        return None;
    }
    let lat = f.get(5)?.parse().ok()?;
    let lon = f.get(6)?.parse().ok()?;
    Location::from_degrees(lat, lon).ok()
}

/// Whether a `%NOTIFYEV` line reports the SIB31 satellite broadcast.
pub fn is_sib31(line: &str) -> bool {
    line.trim()
        .strip_prefix("%NOTIFYEV:")
        .is_some_and(|body| body.contains("SIB31"))
}
