//! NordicBuilder -- fluent builder for [`NordicProfile`] instances.
//!
//! # Example
//!
//! ```
//! use imok_nordic::NordicBuilder;
//! use std::time::Duration;
//!
//! let profile = NordicBuilder::new()
//!     .apn("soracom.io")
//!     .command_timeout(Duration::from_secs(5))
//!     .build();
//! ```

use std::sync::Arc;
use std::time::Duration;

use imok_core::device::ProfileDescriptor;
use imok_core::types::NetworkSettings;

use crate::models;
use crate::profile::NordicProfile;

/// Fluent builder for [`NordicProfile`].
///
/// Timeouts default to the values in the Thingy:91 X descriptor; network
/// settings default to the Soracom endpoints.
pub struct NordicBuilder {
    descriptor: Arc<ProfileDescriptor>,
    settings: NetworkSettings,
    command_timeout: Option<Duration>,
    boot_timeout: Option<Duration>,
}

impl NordicBuilder {
    /// Start from the shared Thingy:91 X descriptor.
    pub fn new() -> Self {
        NordicBuilder {
            descriptor: models::descriptor(),
            settings: NetworkSettings::default(),
            command_timeout: None,
            boot_timeout: None,
        }
    }

    /// Replace the descriptor, e.g. to tighten the MTU or poll interval.
    pub fn descriptor(mut self, descriptor: ProfileDescriptor) -> Self {
        self.descriptor = Arc::new(descriptor);
        self
    }

    /// Replace all network settings.
    pub fn settings(mut self, settings: NetworkSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the PDP context APN.
    pub fn apn(mut self, apn: &str) -> Self {
        self.settings.apn = apn.to_string();
        self
    }

    /// Set the relay ingestion endpoint for uplinks.
    pub fn ingest_endpoint(mut self, host: &str, port: u16) -> Self {
        self.settings.ingest_host = host.to_string();
        self.settings.ingest_port = port;
        self
    }

    /// Set the per-attempt timeout for ordinary commands.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Set how long to wait for the first `AT` to be answered.
    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = Some(timeout);
        self
    }

    /// Build the profile.
    pub fn build(self) -> NordicProfile {
        let command_timeout = self
            .command_timeout
            .unwrap_or(self.descriptor.command_timeout);
        let boot_timeout = self.boot_timeout.unwrap_or(self.descriptor.boot_timeout);
        NordicProfile::new(self.descriptor, self.settings, command_timeout, boot_timeout)
    }
}

impl Default for NordicBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imok_core::device::DeviceProfile;

    #[test]
    fn defaults_from_descriptor() {
        let profile = NordicBuilder::new().build();
        assert_eq!(profile.descriptor().mtu, 1024);
        assert_eq!(profile.settings().ingest_host, "harvest.soracom.io");
        assert_eq!(profile.settings().downlink_port, 55555);
    }

    #[test]
    fn overrides() {
        let profile = NordicBuilder::new()
            .apn("iot.example")
            .ingest_endpoint("10.0.0.1", 9000)
            .build();
        assert_eq!(profile.settings().apn, "iot.example");
        assert_eq!(profile.settings().ingest_port, 9000);
    }
}
