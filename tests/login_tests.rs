//! Login negotiation tests: CHAP authentication, session uniqueness
//! and failure status reporting.

use iscsi_target_core::{
    AuthConfig, ChapCredentials, IscsiClient, IscsiTarget, ScsiResult, StorageDevice,
};
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

const INITIATOR: &str = "iqn.2026-08.test:initiator";
const TARGET: &str = "iqn.2026-08.test:storage.disk0";

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

struct TinyDevice {
    data: Vec<u8>,
}

impl TinyDevice {
    fn new() -> Self {
        TinyDevice { data: vec![0u8; 64 * 512] }
    }
}

impl StorageDevice for TinyDevice {
    fn read_blocks(&mut self, lba: u64, blocks: u32) -> ScsiResult<Vec<u8>> {
        let offset = (lba * 512) as usize;
        Ok(self.data[offset..offset + (blocks * 512) as usize].to_vec())
    }

    fn write_blocks(&mut self, lba: u64, data: &[u8]) -> ScsiResult<()> {
        let offset = (lba * 512) as usize;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        64
    }

    fn block_size(&self) -> u32 {
        512
    }

    fn flush(&mut self) -> ScsiResult<()> {
        Ok(())
    }
}

struct TestTarget {
    handle: iscsi_target_core::TargetHandle,
    addr: SocketAddr,
    server: Option<thread::JoinHandle<ScsiResult<()>>>,
}

impl TestTarget {
    fn start(auth: AuthConfig) -> Self {
        Lazy::force(&LOGGER);
        let target = IscsiTarget::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .add_target(TARGET, TinyDevice::new())
            .auth(auth)
            .build()
            .unwrap();
        let bound = target.bind().unwrap();
        let addr = bound.local_addr().unwrap();
        let handle = bound.handle().unwrap();
        let server = thread::spawn(move || bound.serve());
        TestTarget { handle, addr, server: Some(server) }
    }

    fn client(&self) -> IscsiClient {
        IscsiClient::connect(self.addr).unwrap()
    }
}

impl Drop for TestTarget {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

fn chap_auth() -> AuthConfig {
    AuthConfig::Chap { credentials: ChapCredentials::new("initiator-user", "initiator-secret-12") }
}

#[test]
fn chap_login_succeeds_with_correct_secret() {
    let target = TestTarget::start(chap_auth());
    let mut client = target.client();
    client
        .login_with_chap(INITIATOR, TARGET, "initiator-user", "initiator-secret-12")
        .unwrap();

    // the session really is in full feature phase
    let echoed = client.ping(b"authenticated".to_vec()).unwrap();
    assert_eq!(echoed, b"authenticated");
    client.logout().unwrap();
}

#[test]
fn chap_login_fails_with_wrong_secret() {
    let target = TestTarget::start(chap_auth());
    let mut client = target.client();
    let err = client
        .login_with_chap(INITIATOR, TARGET, "initiator-user", "not-the-secret")
        .unwrap_err();
    assert!(err.to_string().contains("0x02"), "expected initiator-error class, got: {err}");
}

#[test]
fn plain_login_refused_when_chap_required() {
    let target = TestTarget::start(chap_auth());
    let mut client = target.client();
    assert!(client.login(INITIATOR, TARGET).is_err());
}

#[test]
fn login_to_unknown_target_fails() {
    let target = TestTarget::start(AuthConfig::None);
    let mut client = target.client();
    let err = client.login(INITIATOR, "iqn.2026-08.test:no.such.disk").unwrap_err();
    assert!(err.to_string().contains("0x02"), "expected initiator-error class, got: {err}");
    assert_eq!(target.handle.session_count(), 0);
}

#[test]
fn duplicate_isid_is_rejected_and_original_survives() {
    let target = TestTarget::start(AuthConfig::None);

    let mut first = target.client();
    first.login(INITIATOR, TARGET).unwrap();
    assert_eq!(target.handle.session_count(), 1);

    let mut second = target.client();
    second.set_isid(first.isid());
    let err = second.login(INITIATOR, TARGET).unwrap_err();
    assert!(err.to_string().contains("0x08"), "expected session-exists detail, got: {err}");

    // the established session is untouched
    assert_eq!(target.handle.session_count(), 1);
    let echoed = first.ping(b"still here".to_vec()).unwrap();
    assert_eq!(echoed, b"still here");

    first.logout().unwrap();
    // give the connection thread a moment to drain the registry
    for _ in 0..100 {
        if target.handle.session_count() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(target.handle.session_count(), 0);
}

#[test]
fn isid_reusable_after_abrupt_disconnect() {
    let target = TestTarget::start(AuthConfig::None);

    let mut first = target.client();
    first.login(INITIATOR, TARGET).unwrap();
    let isid = first.isid();
    assert_eq!(target.handle.session_count(), 1);

    // no logout: close the socket mid-session and let the connection
    // thread hit the single teardown path
    drop(first);
    for _ in 0..100 {
        if target.handle.session_count() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(target.handle.session_count(), 0);

    // the registry entry must not outlive the connection
    let mut second = target.client();
    second.set_isid(isid);
    second.login(INITIATOR, TARGET).unwrap();
    second.logout().unwrap();
}

#[test]
fn distinct_isids_get_distinct_sessions() {
    let target = TestTarget::start(AuthConfig::None);

    let mut first = target.client();
    first.login(INITIATOR, TARGET).unwrap();
    let mut second = target.client();
    second.login(INITIATOR, TARGET).unwrap();

    assert_ne!(first.isid(), second.isid());
    assert_ne!(first.tsih(), second.tsih());
    assert_eq!(target.handle.session_count(), 2);

    first.logout().unwrap();
    second.logout().unwrap();
}
