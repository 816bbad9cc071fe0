//! MurataBuilder -- fluent builder for [`MurataProfile`] instances.
//!
//! The NTN bring-up has more stages than a terrestrial modem, each with its
//! own bound. All of them default to values that work on a live satellite
//! link; tests shrink them.
//!
//! # Example
//!
//! ```
//! use imok_murata::MurataBuilder;
//! use std::time::Duration;
//!
//! let profile = MurataBuilder::new()
//!     .ntn_band("256")
//!     .gnss_fix_timeout(Duration::from_secs(120))
//!     .build();
//! ```

use std::sync::Arc;
use std::time::Duration;

use imok_core::device::ProfileDescriptor;
use imok_core::types::NetworkSettings;

use crate::models::{self, GNSS_FIX_TIMEOUT, PING_TIMEOUT, SIB31_TIMEOUT};
use crate::profile::{MurataProfile, Timeouts};

/// Fluent builder for [`MurataProfile`].
pub struct MurataBuilder {
    descriptor: Arc<ProfileDescriptor>,
    settings: NetworkSettings,
    command_timeout: Option<Duration>,
    boot_timeout: Option<Duration>,
    gnss_fix_timeout: Duration,
    sib31_timeout: Duration,
    ping_timeout: Duration,
}

impl MurataBuilder {
    /// Start from the shared Type 1SC-NTN descriptor.
    pub fn new() -> Self {
        MurataBuilder {
            descriptor: models::descriptor(),
            settings: NetworkSettings::default(),
            command_timeout: None,
            boot_timeout: None,
            gnss_fix_timeout: GNSS_FIX_TIMEOUT,
            sib31_timeout: SIB31_TIMEOUT,
            ping_timeout: PING_TIMEOUT,
        }
    }

    /// Replace the descriptor.
    pub fn descriptor(mut self, descriptor: ProfileDescriptor) -> Self {
        self.descriptor = Arc::new(descriptor);
        self
    }

    /// Replace all network settings.
    pub fn settings(mut self, settings: NetworkSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the satellite band lock (default `"256"`).
    pub fn ntn_band(mut self, band: &str) -> Self {
        self.settings.ntn_band = band.to_string();
        self
    }

    /// Set the address pinged to verify the data path.
    pub fn ping_target(mut self, target: &str) -> Self {
        self.settings.ping_target = target.to_string();
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Bound on each `ATZ` → `%BOOTEV:0` wait.
    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = Some(timeout);
        self
    }

    /// Bound on the GNSS fix wait (default 300 s). Expiry is not fatal.
    pub fn gnss_fix_timeout(mut self, timeout: Duration) -> Self {
        self.gnss_fix_timeout = timeout;
        self
    }

    /// Bound on the SIB31 wait (default 120 s). Expiry is not fatal.
    pub fn sib31_timeout(mut self, timeout: Duration) -> Self {
        self.sib31_timeout = timeout;
        self
    }

    /// Bound on the connectivity ping (default 60 s).
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Build the profile.
    pub fn build(self) -> MurataProfile {
        let timeouts = Timeouts {
            command: self
                .command_timeout
                .unwrap_or(self.descriptor.command_timeout),
            boot: self.boot_timeout.unwrap_or(self.descriptor.boot_timeout),
            gnss_fix: self.gnss_fix_timeout,
            sib31: self.sib31_timeout,
            ping: self.ping_timeout,
        };
        MurataProfile::new(self.descriptor, self.settings, timeouts)
    }
}

impl Default for MurataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imok_core::device::DeviceProfile;

    #[test]
    fn defaults() {
        let profile = MurataBuilder::new().build();
        let t = profile.timeouts();
        assert_eq!(t.boot, Duration::from_secs(30));
        assert_eq!(t.gnss_fix, GNSS_FIX_TIMEOUT);
        assert_eq!(profile.descriptor().mtu, 128);
        assert_eq!(profile.settings().ntn_band, "256");
        assert_eq!(profile.sockets(), (None, None));
        assert!(profile.location().is_none());
    }

    #[test]
    fn overrides() {
        let profile = MurataBuilder::new()
            .ntn_band("255")
            .ping_target("8.8.8.8")
            .boot_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(profile.settings().ntn_band, "255");
        assert_eq!(profile.settings().ping_target, "8.8.8.8");
        assert_eq!(profile.timeouts().boot, Duration::from_secs(5));
    }
}
