//! Serial LTE Modem command builders and response parsers.
//!
//! Builders return [`AtCommand`] values with the timeout and expected
//! response prefix already set; parsers are pure functions over single
//! response or notification lines.

use std::time::Duration;

use imok_core::at::AtCommand;
use imok_core::types::SignalQuality;

/// RSRP index offset: `dBm = index - 141`.
const RSRP_OFFSET: i16 = 141;

/// Index value meaning "not known or not detectable".
const UNKNOWN_INDEX: u16 = 255;

/// How long `AT#XSENDTO` may take while the modem sets up the RRC connection.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------

/// Plain `AT`: answers `OK` once the firmware is up.
pub fn cmd_attention(timeout: Duration) -> AtCommand {
    AtCommand::new("AT").timeout(timeout)
}

/// `AT+CFUN=<mode>`: 0 = radio off, 1 = full functionality.
pub fn cmd_functionality(mode: u8, timeout: Duration) -> AtCommand {
    AtCommand::new(format!("AT+CFUN={mode}")).timeout(timeout)
}

/// The configuration issued between `AT+CFUN=0` and `AT+CFUN=1`.
///
/// Registration URCs with PSM detail, RRC connection URCs, and LTE-M with
/// GNSS enabled.
pub fn cmd_network_config(timeout: Duration) -> Vec<AtCommand> {
    ["AT+CEREG=5", "AT+CSCON=1", "AT%XSYSTEMMODE=1,0,1,0"]
        .into_iter()
        .map(|text| AtCommand::new(text).timeout(timeout))
        .collect()
}

/// `AT+CGDCONT=1,"IP","<apn>"`
pub fn cmd_pdp_context(apn: &str, timeout: Duration) -> AtCommand {
    AtCommand::new(format!("AT+CGDCONT=1,\"IP\",\"{apn}\"")).timeout(timeout)
}

/// `AT%CESQ=1`: subscribe to signal quality notifications.
pub fn cmd_subscribe_signal(timeout: Duration) -> AtCommand {
    AtCommand::new("AT%CESQ=1").timeout(timeout)
}

/// `AT#XSOCKET=1,2,0`: open an IPv4 datagram socket as a client.
pub fn cmd_open_udp_socket(timeout: Duration) -> AtCommand {
    AtCommand::new("AT#XSOCKET=1,2,0").timeout(timeout)
}

/// `AT#XBIND=<port>`: bind the socket for downlink reception.
pub fn cmd_bind(port: u16, timeout: Duration) -> AtCommand {
    AtCommand::new(format!("AT#XBIND={port}")).timeout(timeout)
}

/// `AT#XSENDTO="<host>",<port>,"<text>"`
pub fn cmd_send_to(host: &str, port: u16, text: &str) -> AtCommand {
    AtCommand::new(format!("AT#XSENDTO=\"{host}\",{port},\"{text}\""))
        .timeout(SEND_TIMEOUT)
        .expect("#XSENDTO:")
}

/// `AT#XRECVFROM=<size>`: read one buffered datagram.
pub fn cmd_receive_from(size: usize, timeout: Duration) -> AtCommand {
    AtCommand::new(format!("AT#XRECVFROM={size}"))
        .timeout(timeout)
        .expect("#XRECVFROM:")
}

// ---------------------------------------------------------------
// Response parsers
// ---------------------------------------------------------------

/// Header of an `AT#XRECVFROM` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvHeader {
    /// Datagram length reported by the modem.
    pub size: usize,
    /// Source IP address.
    pub source: String,
    /// Source UDP port.
    pub port: u16,
}

/// Parse the body of `#XRECVFROM: <size>,"<ip>",<port>`.
pub fn parse_recv_header(body: &str) -> Option<RecvHeader> {
    let mut fields = body.splitn(3, ',');
    let size = fields.next()?.trim().parse().ok()?;
    let source = fields.next()?.trim().trim_matches('"').to_string();
    let port = fields.next()?.trim().parse().ok()?;
    if source.is_empty() {
        return None;
    }
    Some(RecvHeader { size, source, port })
}

/// Parse the body of `#XSENDTO: <size>`.
pub fn parse_sent_size(body: &str) -> Option<usize> {
    body.trim().parse().ok()
}

fn index(field: Option<&str>) -> Option<u16> {
    field?.trim().parse().ok()
}

/// Parse a `%CESQ: <rsrp>,<rsrq>,<snr>,<rscp>` notification.
///
/// RSRP is converted from its index to dBm; the other fields are reported
/// as raw indices. An index of 255 means unknown.
pub fn parse_cesq(line: &str) -> Option<SignalQuality> {
    let body = line.trim().strip_prefix("%CESQ:")?;
    let mut fields = body.split(',');
    let rsrp = index(fields.next())?;
    let rsrq = index(fields.next())?;
    let snr = index(fields.next())?;

    let known = |v: u16| (v != UNKNOWN_INDEX).then_some(v);
    Some(SignalQuality {
        rsrp_dbm: known(rsrp).map(|v| v as i16 - RSRP_OFFSET),
        rsrq: known(rsrq).map(|v| v as i16),
        sinr: known(snr).map(|v| v as i16),
        rssi: None,
    })
}

/// Whether a `+CSCON` notification reports an RRC connection.
///
/// The modem connects when the network pages it for downlink data.
pub fn is_rrc_connected(line: &str) -> bool {
    line.trim()
        .strip_prefix("+CSCON:")
        .and_then(|body| body.split(',').next())
        .is_some_and(|mode| mode.trim() == "1")
}

/// Whether a payload can be carried inside `AT#XSENDTO`'s quoted argument.
pub fn is_sendable_text(payload: &[u8]) -> bool {
    payload
        .iter()
        .all(|&b| (b.is_ascii_graphic() && b != b'"') || b == b' ')
}
