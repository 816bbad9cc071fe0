//! # imok -- "I'm OK" messaging over cellular and satellite IoT modems
//!
//! `imok` moves short status messages between a field device and an
//! operator console. The device side drives a modem over its AT command
//! port and sends UDP datagrams to the Soracom relay; the console side
//! polls the relay's stored uplinks and submits downlinks through its
//! REST API.
//!
//! ## Architecture
//!
//! | Crate               | Purpose                                              |
//! |---------------------|------------------------------------------------------|
//! | `imok-core`         | Messages, wire codec, profile trait, relay trait, errors |
//! | `imok-transport`    | Serial and UDP transports                            |
//! | `imok-at`           | AT command engine with URC routing                   |
//! | `imok-nordic`       | Nordic Thingy:91 X profile (LTE-M, hex text payloads) |
//! | `imok-murata`       | Murata Type 1SC-NTN profile (satellite NB-IoT)       |
//! | `imok-relay`        | Soracom REST client and cursor-based polling         |
//! | **`imok`**          | This crate -- session worker, messengers, profile factory |
//!
//! ## Device side
//!
//! ```no_run
//! use std::time::Duration;
//! use imok::{DeviceKind, NetworkSettings};
//! use imok::messenger::DeviceMessengerBuilder;
//! use imok::session::DeviceSessionBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = DeviceSessionBuilder::for_device(
//!         DeviceKind::NordicThingy91X,
//!         NetworkSettings::default(),
//!     )?
//!     .serial_port("/dev/ttyACM0")
//!     .connect()
//!     .await?;
//!     session.wait_ready(Duration::from_secs(180)).await?;
//!
//!     let (messenger, _events) = DeviceMessengerBuilder::new(session).build();
//!     messenger.submit(messenger.compose("I'm OK"))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Enables                       | Default |
//! |----------|-------------------------------|---------|
//! | `nordic` | [`nordic`] module and profile | yes     |
//! | `murata` | [`murata`] module and profile | yes     |

use std::sync::Arc;

pub use imok_core::*;

pub mod messenger;
pub mod session;

#[cfg(test)]
mod testing;

/// Relay API types and the Soracom client.
pub mod relay {
    pub use imok_core::relay::*;
    pub use imok_relay::*;
}

/// Nordic Thingy:91 X profile.
///
/// LTE-M with the Serial LTE Modem firmware. Payloads travel as hex text
/// inside `#XSENDTO`, so the usable budget is half the link MTU.
#[cfg(feature = "nordic")]
pub mod nordic {
    pub use imok_nordic::*;
}

/// Murata Type 1SC-NTN profile.
///
/// NB-IoT over satellite. Boot includes a GNSS fix and a SIB31 wait before
/// registration, and payloads travel as binary socket data.
#[cfg(feature = "murata")]
pub mod murata {
    pub use imok_murata::*;
}

/// Build the profile for `kind`.
///
/// Fails with [`Error::InvalidParameter`] when the profile's feature is
/// disabled.
pub fn create_profile(
    kind: DeviceKind,
    settings: NetworkSettings,
) -> Result<Box<dyn DeviceProfile>> {
    match kind {
        #[cfg(feature = "nordic")]
        DeviceKind::NordicThingy91X => {
            Ok(Box::new(nordic::NordicBuilder::new().settings(settings).build()))
        }
        #[cfg(feature = "murata")]
        DeviceKind::MurataType1Sc => {
            Ok(Box::new(murata::MurataBuilder::new().settings(settings).build()))
        }
        #[allow(unreachable_patterns)]
        other => {
            let _ = settings;
            Err(Error::InvalidParameter(format!(
                "{} support is not compiled in",
                other.display_name()
            )))
        }
    }
}

/// Static descriptor for `kind`.
pub fn descriptor_for(kind: DeviceKind) -> Result<Arc<ProfileDescriptor>> {
    match kind {
        #[cfg(feature = "nordic")]
        DeviceKind::NordicThingy91X => Ok(nordic::models::descriptor()),
        #[cfg(feature = "murata")]
        DeviceKind::MurataType1Sc => Ok(murata::models::descriptor()),
        #[allow(unreachable_patterns)]
        other => Err(Error::InvalidParameter(format!(
            "{} support is not compiled in",
            other.display_name()
        ))),
    }
}

/// Every device whose profile is compiled in.
///
/// ```
/// for d in imok::supported_devices() {
///     println!("{} {} (mtu {})", d.manufacturer, d.name, d.mtu);
/// }
/// ```
pub fn supported_devices() -> Vec<Arc<ProfileDescriptor>> {
    DeviceKind::ALL
        .iter()
        .filter_map(|kind| descriptor_for(*kind).ok())
        .collect()
}
