//! Murata Type 1SC-NTN device description.
//!
//! The Type 1SC-NTN attaches to NB-IoT over satellite (NB-NTN). Its socket
//! commands take hex-encoded bytes, so payloads travel as raw binary, but the
//! satellite link limits a transmission to 128 bytes. Boot and registration
//! are slow: the module resets twice and must wait for a GNSS fix and a
//! satellite broadcast (SIB31) before it can attach.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use imok_core::device::ProfileDescriptor;
use imok_core::types::{DeviceKind, PayloadEncoding};

/// Unsolicited lines the module emits.
pub const NOTIFICATION_PREFIXES: &[&str] = &[
    "%BOOTEV:",
    "%IGNSSEVU:",
    "%NOTIFYEV:",
    "%SOCKETEV:",
    "%SOCKETCMD:",
    "%PINGCMD:",
    "%MEAS:",
    "+CEREG:",
];

/// Notifications the session turns into status events.
pub const STATUS_PREFIXES: &[&str] = &["+CEREG:", "%MEAS:"];

/// How long to wait for a GNSS fix during power-on.
pub const GNSS_FIX_TIMEOUT: Duration = Duration::from_secs(300);

/// How long to wait for the satellite broadcast after enabling the radio.
pub const SIB31_TIMEOUT: Duration = Duration::from_secs(120);

/// How long the connectivity ping may take.
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the Type 1SC-NTN descriptor.
pub fn type1sc_ntn() -> ProfileDescriptor {
    ProfileDescriptor {
        kind: DeviceKind::MurataType1Sc,
        name: "Type 1SC-NTN",
        manufacturer: "Murata",
        default_baud_rate: 115_200,
        mtu: 128,
        encoding: PayloadEncoding::Binary,
        command_timeout: Duration::from_secs(10),
        boot_timeout: Duration::from_secs(30),
        registration_poll_interval: Duration::from_secs(5),
        registration_timeout: Duration::from_secs(120),
        denied_polls_before_failure: 3,
        notification_prefixes: NOTIFICATION_PREFIXES,
        status_prefixes: STATUS_PREFIXES,
    }
}

static DESCRIPTOR: LazyLock<Arc<ProfileDescriptor>> =
    LazyLock::new(|| Arc::new(type1sc_ntn()));

/// The descriptor shared by every Type 1SC-NTN session.
pub fn descriptor() -> Arc<ProfileDescriptor> {
    DESCRIPTOR.clone()
}
