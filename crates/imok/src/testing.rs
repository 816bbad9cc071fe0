//! Scripted device profile shared by the session and messenger tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use imok_core::at::AtChannel;
use imok_core::device::{DeviceProfile, ProfileDescriptor};
use imok_core::error::{Error, Result};
use imok_core::message::Location;
use imok_core::types::{DeviceKind, PayloadEncoding, RegistrationStatus, SignalQuality};
use imok_test_harness::{MockHandle, MockTransport};

use crate::session::{DeviceSession, DeviceSessionBuilder};

const PREFIXES: &[&str] = &["+CEREG:", "%MEAS:"];

/// Outcomes the fake profile hands out, and what it was asked to send.
#[derive(Default)]
pub struct Script {
    pub power_on: Option<Error>,
    pub register: Option<Error>,
    pub stall_power_on: bool,
    pub stall_send: bool,
    pub send: VecDeque<Result<()>>,
    pub downlink: VecDeque<Vec<u8>>,
    pub location: Option<Location>,
    pub sent: Vec<Vec<u8>>,
}

pub type SharedScript = Arc<Mutex<Script>>;

pub fn lock(script: &SharedScript) -> MutexGuard<'_, Script> {
    script.lock().unwrap()
}

pub fn descriptor(encoding: PayloadEncoding, mtu: usize) -> ProfileDescriptor {
    ProfileDescriptor {
        kind: DeviceKind::MurataType1Sc,
        name: "Fake",
        manufacturer: "Test",
        default_baud_rate: 115_200,
        mtu,
        encoding,
        command_timeout: Duration::from_millis(100),
        boot_timeout: Duration::from_millis(100),
        registration_poll_interval: Duration::from_millis(5),
        registration_timeout: Duration::from_millis(500),
        denied_polls_before_failure: 3,
        notification_prefixes: PREFIXES,
        status_prefixes: PREFIXES,
    }
}

pub struct FakeProfile {
    descriptor: Arc<ProfileDescriptor>,
    script: SharedScript,
}

#[async_trait]
impl DeviceProfile for FakeProfile {
    fn descriptor(&self) -> Arc<ProfileDescriptor> {
        self.descriptor.clone()
    }

    async fn power_on_modem(&mut self, _at: &dyn AtChannel) -> Result<()> {
        let (stall, err) = {
            let mut s = lock(&self.script);
            (s.stall_power_on, s.power_on.take())
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        err.map_or(Ok(()), Err)
    }

    async fn register_network(
        &mut self,
        _at: &dyn AtChannel,
        _timeout: Duration,
    ) -> Result<RegistrationStatus> {
        match lock(&self.script).register.take() {
            Some(e) => Err(e),
            None => Ok(RegistrationStatus::RegisteredHome),
        }
    }

    async fn open_data_channel(&mut self, _at: &dyn AtChannel) -> Result<()> {
        Ok(())
    }

    async fn send_payload(&mut self, _at: &dyn AtChannel, payload: &[u8]) -> Result<()> {
        let (stall, result) = {
            let mut s = lock(&self.script);
            s.sent.push(payload.to_vec());
            (s.stall_send, s.send.pop_front().unwrap_or(Ok(())))
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        result
    }

    async fn poll_downlink(&mut self, _at: &dyn AtChannel) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.script).downlink.pop_front())
    }

    fn parse_signal_quality(&self, line: &str) -> Option<SignalQuality> {
        let rsrp = line.strip_prefix("%MEAS: ")?.parse().ok()?;
        Some(SignalQuality {
            rsrp_dbm: Some(rsrp),
            ..SignalQuality::default()
        })
    }

    fn location(&self) -> Option<Location> {
        lock(&self.script).location
    }
}

/// Start a session over a fake profile with fast polling.
pub async fn start_session(
    descriptor: ProfileDescriptor,
    script: Script,
) -> (DeviceSession, SharedScript, MockHandle) {
    start_session_with(descriptor, script, |b| b).await
}

/// [`start_session`] with extra builder settings applied last.
pub async fn start_session_with(
    descriptor: ProfileDescriptor,
    script: Script,
    configure: impl FnOnce(DeviceSessionBuilder) -> DeviceSessionBuilder,
) -> (DeviceSession, SharedScript, MockHandle) {
    let script = Arc::new(Mutex::new(script));
    let profile = FakeProfile {
        descriptor: Arc::new(descriptor),
        script: script.clone(),
    };
    let mock = MockTransport::new();
    let handle = mock.handle();
    let builder = DeviceSessionBuilder::new(Box::new(profile))
        .downlink_poll_interval(Duration::from_millis(10))
        .idle_poll_interval(Duration::from_millis(5));
    let session = configure(builder)
        .connect_with_transport(Box::new(mock))
        .await
        .unwrap();
    (session, script, handle)
}
