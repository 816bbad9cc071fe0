//! Nordic Thingy:91 X device description.
//!
//! The Thingy:91 X runs Nordic's Serial LTE Modem (SLM) firmware on the
//! nRF9151 and exposes it as a USB CDC-ACM port. Payloads travel through
//! `AT#XSENDTO` as quoted text, so binary records are hex-armored and the
//! link MTU is counted in armored characters.
//!
//! | Parameter               | Value        |
//! |-------------------------|--------------|
//! | Baud                    | 115200       |
//! | MTU                     | 1024 chars   |
//! | Encoding                | hex text     |
//! | Registration poll       | every 2 s    |
//! | Registration timeout    | 120 s        |

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use imok_core::device::ProfileDescriptor;
use imok_core::types::{DeviceKind, PayloadEncoding};

/// Unsolicited lines the SLM firmware emits.
pub const NOTIFICATION_PREFIXES: &[&str] = &["+CEREG:", "+CSCON:", "%CESQ:", "Ready"];

/// Notifications the session turns into status events.
pub const STATUS_PREFIXES: &[&str] = &["+CEREG:", "%CESQ:"];

/// Build the Thingy:91 X descriptor.
pub fn thingy91x() -> ProfileDescriptor {
    ProfileDescriptor {
        kind: DeviceKind::NordicThingy91X,
        name: "Thingy:91 X",
        manufacturer: "Nordic Semiconductor",
        default_baud_rate: 115_200,
        mtu: 1024,
        encoding: PayloadEncoding::HexText,
        command_timeout: Duration::from_secs(10),
        boot_timeout: Duration::from_secs(5),
        registration_poll_interval: Duration::from_secs(2),
        registration_timeout: Duration::from_secs(120),
        denied_polls_before_failure: 3,
        notification_prefixes: NOTIFICATION_PREFIXES,
        status_prefixes: STATUS_PREFIXES,
    }
}

static DESCRIPTOR: LazyLock<Arc<ProfileDescriptor>> = LazyLock::new(|| Arc::new(thingy91x()));

/// The descriptor shared by every Thingy:91 X session.
pub fn descriptor() -> Arc<ProfileDescriptor> {
    DESCRIPTOR.clone()
}
