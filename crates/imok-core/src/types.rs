//! Core types used throughout imok.
//!
//! These types provide a vendor-agnostic layer over the AT dialects of the
//! supported modems and over the relay service.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// UDP port on which the device receives downlink datagrams.
pub const DOWNLINK_UDP_PORT: u16 = 55555;

/// Relay ingestion endpoint for uplink datagrams.
pub const DEFAULT_INGEST_HOST: &str = "harvest.soracom.io";

/// Relay ingestion port for uplink datagrams.
pub const DEFAULT_INGEST_PORT: u16 = 8514;

/// Source address of relay-originated downlink datagrams.
pub const DEFAULT_DOWNLINK_SOURCE: &str = "100.127.10.16";

/// Access point name used for the PDP context.
pub const DEFAULT_APN: &str = "soracom.io";

/// Supported device types.
///
/// The factory in the `imok` facade crate selects a profile implementation
/// purely from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Nordic Semiconductor Thingy:91 X running the Serial LTE Modem firmware.
    #[serde(rename = "nordic_thingy91x")]
    NordicThingy91X,
    /// Murata Type 1SC-NTN satellite module.
    #[serde(rename = "murata_type1sc_ntng")]
    MurataType1Sc,
}

impl DeviceKind {
    /// All supported device kinds.
    pub const ALL: [DeviceKind; 2] = [DeviceKind::NordicThingy91X, DeviceKind::MurataType1Sc];

    /// Configuration key for this device kind.
    pub fn key(&self) -> &'static str {
        match self {
            DeviceKind::NordicThingy91X => "nordic_thingy91x",
            DeviceKind::MurataType1Sc => "murata_type1sc_ntng",
        }
    }

    /// Human-readable device name.
    pub fn display_name(&self) -> &'static str {
        match self {
            DeviceKind::NordicThingy91X => "Nordic Thingy:91 X",
            DeviceKind::MurataType1Sc => "Murata Type 1SC-NTN",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Error returned when a string cannot be parsed into a [`DeviceKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDeviceKindError(String);

impl fmt::Display for ParseDeviceKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported device type: {}", self.0)
    }
}

impl std::error::Error for ParseDeviceKindError {}

impl FromStr for DeviceKind {
    type Err = ParseDeviceKindError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "nordic_thingy91x" | "nordic" | "thingy91x" => Ok(DeviceKind::NordicThingy91X),
            "murata_type1sc_ntng" | "murata_type1sc" | "murata" => Ok(DeviceKind::MurataType1Sc),
            _ => Err(ParseDeviceKindError(s.to_string())),
        }
    }
}

/// How a profile's link carries payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadEncoding {
    /// Arbitrary bytes (the modem hex-decodes before transmitting).
    Binary,
    /// Printable text only; binary records are hex-armored.
    HexText,
}

/// Device session state.
///
/// See [`SessionState::can_transition_to`] for the allowed graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No serial handle is open.
    Disconnected,
    /// Serial handle open, modem powering on.
    Connecting,
    /// Modem up, waiting for network registration.
    Registering,
    /// Registered and idle.
    Ready,
    /// An uplink payload is being handed to the modem.
    Sending,
    /// A downlink payload is being read from the modem.
    Receiving,
    /// Terminal: a new session is required.
    Failed,
}

impl SessionState {
    /// Whether the state graph permits moving from `self` to `next`.
    ///
    /// `Failed` is terminal. `Ready` can only reach `Registering` again by
    /// passing through `Disconnected` and `Connecting`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Registering | Disconnected | Failed)
                | (Registering, Ready | Disconnected | Failed)
                | (Ready, Sending | Receiving | Disconnected | Failed)
                | (Sending, Ready | Disconnected | Failed)
                | (Receiving, Ready | Disconnected | Failed)
        )
    }

    /// Whether the session can accept outbound payloads in this state.
    pub fn is_ready(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Sending | SessionState::Receiving)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Registering => "REGISTERING",
            SessionState::Ready => "READY",
            SessionState::Sending => "SENDING",
            SessionState::Receiving => "RECEIVING",
            SessionState::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Session state plus the reason for the last terminal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// Why the session reached `Failed`, if it did.
    pub reason: Option<String>,
}

impl SessionStatus {
    /// A status with no reason attached.
    pub fn new(state: SessionState) -> Self {
        SessionStatus {
            state,
            reason: None,
        }
    }
}

/// EPS network registration status (`+CEREG` `<stat>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationStatus {
    /// 0: not registered, not searching.
    NotRegistered,
    /// 1: registered, home network.
    RegisteredHome,
    /// 2: not registered, searching.
    Searching,
    /// 3: registration denied.
    Denied,
    /// 4: unknown (e.g. out of coverage).
    Unknown,
    /// 5: registered, roaming.
    RegisteredRoaming,
    /// Any other value the modem reports.
    Other(u8),
}

impl RegistrationStatus {
    /// Map a raw `<stat>` value.
    pub fn from_stat(stat: u8) -> Self {
        match stat {
            0 => RegistrationStatus::NotRegistered,
            1 => RegistrationStatus::RegisteredHome,
            2 => RegistrationStatus::Searching,
            3 => RegistrationStatus::Denied,
            4 => RegistrationStatus::Unknown,
            5 => RegistrationStatus::RegisteredRoaming,
            n => RegistrationStatus::Other(n),
        }
    }

    /// Raw `<stat>` value.
    pub fn stat(&self) -> u8 {
        match self {
            RegistrationStatus::NotRegistered => 0,
            RegistrationStatus::RegisteredHome => 1,
            RegistrationStatus::Searching => 2,
            RegistrationStatus::Denied => 3,
            RegistrationStatus::Unknown => 4,
            RegistrationStatus::RegisteredRoaming => 5,
            RegistrationStatus::Other(n) => *n,
        }
    }

    /// Whether the modem is attached (home or roaming).
    pub fn is_registered(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegisteredHome | RegistrationStatus::RegisteredRoaming
        )
    }
}

/// Signal quality reported by the modem's measurement notifications.
///
/// Fields the dialect does not report are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SignalQuality {
    /// Reference signal received power, dBm.
    pub rsrp_dbm: Option<i16>,
    /// Reference signal received quality (raw or dB, per dialect).
    pub rsrq: Option<i16>,
    /// Signal to interference plus noise ratio.
    pub sinr: Option<i16>,
    /// Received signal strength indicator, dBm.
    pub rssi: Option<i16>,
}

/// Network endpoints and identifiers used by device profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    /// PDP context access point name.
    pub apn: String,
    /// Relay ingestion host for uplink datagrams.
    pub ingest_host: String,
    /// Relay ingestion port for uplink datagrams.
    pub ingest_port: u16,
    /// Local UDP port bound for downlink datagrams.
    pub downlink_port: u16,
    /// Only datagrams from this source are accepted, if set.
    pub downlink_source: Option<String>,
    /// Receive buffer size passed to the modem's read command.
    pub udp_buffer_size: usize,
    /// Satellite band lock (NTN profiles only).
    pub ntn_band: String,
    /// Address pinged to verify the data path (NTN profiles only).
    pub ping_target: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            apn: DEFAULT_APN.to_string(),
            ingest_host: DEFAULT_INGEST_HOST.to_string(),
            ingest_port: DEFAULT_INGEST_PORT,
            downlink_port: DOWNLINK_UDP_PORT,
            downlink_source: Some(DEFAULT_DOWNLINK_SOURCE.to_string()),
            udp_buffer_size: 256,
            ntn_band: "256".to_string(),
            ping_target: "100.127.100.127".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_parse() {
        assert_eq!(
            "nordic_thingy91x".parse::<DeviceKind>().unwrap(),
            DeviceKind::NordicThingy91X
        );
        assert_eq!(
            "murata-type1sc-ntng".parse::<DeviceKind>().unwrap(),
            DeviceKind::MurataType1Sc
        );
        assert!("quectel".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn device_kind_key_round_trips_through_from_str() {
        for kind in DeviceKind::ALL {
            assert_eq!(kind.key().parse::<DeviceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn device_kind_serde_uses_config_keys() {
        let json = serde_json::to_string(&DeviceKind::MurataType1Sc).unwrap();
        assert_eq!(json, "\"murata_type1sc_ntng\"");
    }

    #[test]
    fn session_graph_happy_path() {
        use SessionState::*;
        let path = [Disconnected, Connecting, Registering, Ready, Sending, Ready, Receiving, Ready, Disconnected];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn session_graph_ready_cannot_reregister_directly() {
        assert!(!SessionState::Ready.can_transition_to(SessionState::Registering));
        assert!(!SessionState::Ready.can_transition_to(SessionState::Connecting));
        assert!(!SessionState::Sending.can_transition_to(SessionState::Receiving));
    }

    #[test]
    fn session_graph_failed_is_terminal() {
        use SessionState::*;
        for next in [Disconnected, Connecting, Registering, Ready, Sending, Receiving, Failed] {
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn registration_status_mapping() {
        assert!(RegistrationStatus::from_stat(1).is_registered());
        assert!(RegistrationStatus::from_stat(5).is_registered());
        assert!(!RegistrationStatus::from_stat(2).is_registered());
        assert_eq!(RegistrationStatus::from_stat(3), RegistrationStatus::Denied);
        assert_eq!(RegistrationStatus::from_stat(90).stat(), 90);
    }

    #[test]
    fn network_settings_defaults() {
        let settings = NetworkSettings::default();
        assert_eq!(settings.downlink_port, 55555);
        assert_eq!(settings.ingest_host, "harvest.soracom.io");
        assert_eq!(settings.ingest_port, 8514);
        assert_eq!(settings.apn, "soracom.io");
    }
}
