//! Session: connections sharing one initiator session identifier
//!
//! A session owns the command sequence-number domain (`ExpCmdSN`), the
//! session-wide negotiated settings, the bound storage handle, and the
//! identity fixed by the leading connection's login (session type and
//! target name). With one-login-one-session semantics a session has a
//! single member connection, but the attach/detach accounting keeps
//! teardown exactly-once regardless of how the connection exits.

use crate::scsi::StorageDevice;
use crate::serial::{self, SerialNumber};
use crate::settings::{SessionKind, SessionSettingsNegotiator};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

/// Command window width: MaxCmdSN = ExpCmdSN + CMD_WINDOW - 1.
pub const CMD_WINDOW: u32 = 32;

/// Storage handle shared between the session and the target registry.
pub type SharedStorage = Arc<Mutex<Box<dyn StorageDevice>>>;

/// Verdict on an incoming command's CmdSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdDisposition {
    /// In window; `ExpCmdSN` has been advanced past it.
    Accept,
    /// Below `ExpCmdSN`: a duplicate or stale delivery, to be dropped
    /// without advancing state.
    Duplicate,
    /// Beyond `MaxCmdSN`: dropped, the initiator overran the window.
    OutOfWindow,
}

pub struct Session {
    isid: [u8; 6],
    tsih: u16,
    negotiator: Arc<SessionSettingsNegotiator>,
    exp_cmd_sn: Mutex<SerialNumber>,
    kind: Mutex<SessionKind>,
    target_name: Mutex<Option<String>>,
    storage: Mutex<Option<SharedStorage>>,
    live_connections: AtomicU32,
    torn_down: AtomicBool,
}

impl Session {
    pub(crate) fn new(isid: [u8; 6], tsih: u16, initial_cmd_sn: u32) -> Arc<Self> {
        Arc::new(Session {
            isid,
            tsih,
            negotiator: Arc::new(SessionSettingsNegotiator::new()),
            exp_cmd_sn: Mutex::new(SerialNumber::new(initial_cmd_sn)),
            kind: Mutex::new(SessionKind::Normal),
            target_name: Mutex::new(None),
            storage: Mutex::new(None),
            live_connections: AtomicU32::new(0),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn isid(&self) -> [u8; 6] {
        self.isid
    }

    pub fn tsih(&self) -> u16 {
        self.tsih
    }

    pub fn kind(&self) -> SessionKind {
        *self.kind.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn target_name(&self) -> Option<String> {
        self.target_name.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn negotiator(&self) -> Arc<SessionSettingsNegotiator> {
        self.negotiator.clone()
    }

    /// Fix the session identity once the leading connection's login
    /// completes. The session negotiator is sealed at the same moment
    /// by the phase driver.
    pub(crate) fn bind_identity(
        &self,
        kind: SessionKind,
        target_name: Option<String>,
        storage: Option<SharedStorage>,
    ) {
        *self.kind.lock().unwrap_or_else(|p| p.into_inner()) = kind;
        *self.target_name.lock().unwrap_or_else(|p| p.into_inner()) = target_name;
        *self.storage.lock().unwrap_or_else(|p| p.into_inner()) = storage;
    }

    pub fn storage(&self) -> Option<SharedStorage> {
        self.storage.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Reset `ExpCmdSN` from a login round. Login requests are counted:
    /// the next non-immediate command must carry `cmd_sn + 1`.
    pub(crate) fn register_login_cmd_sn(&self, cmd_sn: u32) {
        *self.exp_cmd_sn.lock().unwrap_or_else(|p| p.into_inner()) =
            SerialNumber::new(cmd_sn.wrapping_add(1));
    }

    /// Apply the command window rule to an incoming CmdSN.
    ///
    /// Immediate PDUs bypass the window and never advance `ExpCmdSN`.
    /// Everything else must match or exceed `ExpCmdSN` within the
    /// window; on acceptance `ExpCmdSN` moves to `cmd_sn + 1`.
    pub fn check_and_advance_cmd_sn(&self, cmd_sn: u32, immediate: bool) -> CmdDisposition {
        if immediate {
            return CmdDisposition::Accept;
        }
        let mut exp = self.exp_cmd_sn.lock().unwrap_or_else(|p| p.into_inner());
        let current = exp.current();
        match serial::compare(cmd_sn, current) {
            Ordering::Less => CmdDisposition::Duplicate,
            _ => {
                let max = current.wrapping_add(CMD_WINDOW - 1);
                if serial::compare(cmd_sn, max) == Ordering::Greater {
                    CmdDisposition::OutOfWindow
                } else {
                    *exp = SerialNumber::new(cmd_sn.wrapping_add(1));
                    CmdDisposition::Accept
                }
            }
        }
    }

    /// Current (ExpCmdSN, MaxCmdSN) pair for response headers.
    pub fn sn_window(&self) -> (u32, u32) {
        let exp = self.exp_cmd_sn.lock().unwrap_or_else(|p| p.into_inner()).current();
        (exp, exp.wrapping_add(CMD_WINDOW - 1))
    }

    pub(crate) fn attach(&self) {
        self.live_connections.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Detach one connection. When the last connection detaches the
    /// storage handle is closed; returns `true` exactly once, for the
    /// caller that performed the teardown (it then removes the session
    /// from the registry).
    pub(crate) fn detach(&self) -> bool {
        let remaining = self.live_connections.fetch_sub(1, AtomicOrdering::AcqRel) - 1;
        if remaining > 0 {
            return false;
        }
        if self.torn_down.swap(true, AtomicOrdering::AcqRel) {
            return false;
        }
        if let Some(storage) = self.storage.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let mut device = storage.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = device.close() {
                log::warn!("storage close failed during session teardown: {e}");
            }
        }
        log::info!("session tsih {} torn down", self.tsih);
        true
    }

    /// Close the storage handle of a session that did not drain before
    /// the shutdown deadline. Marks the session torn down, so the
    /// straggling connection's own detach will not close a second time.
    pub(crate) fn force_close(&self) {
        if self.torn_down.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        if let Some(storage) = self.storage.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let mut device = storage.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = device.close() {
                log::warn!("storage close failed during forced session close: {e}");
            }
        }
        log::warn!("session tsih {} force-closed", self.tsih);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("isid", &self.isid)
            .field("tsih", &self.tsih)
            .field("kind", &self.kind())
            .field("target_name", &self.target_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScsiResult;
    use std::sync::atomic::AtomicU32 as Counter;

    #[test]
    fn test_window_accepts_match_and_advances() {
        let session = Session::new([0; 6], 1, 5);
        assert_eq!(session.check_and_advance_cmd_sn(5, false), CmdDisposition::Accept);
        assert_eq!(session.sn_window().0, 6);
    }

    #[test]
    fn test_window_drops_duplicate_without_advancing() {
        let session = Session::new([0; 6], 1, 5);
        assert_eq!(session.check_and_advance_cmd_sn(4, false), CmdDisposition::Duplicate);
        assert_eq!(session.sn_window().0, 5);
    }

    #[test]
    fn test_window_accepts_skip_ahead_within_window() {
        let session = Session::new([0; 6], 1, 5);
        assert_eq!(session.check_and_advance_cmd_sn(10, false), CmdDisposition::Accept);
        assert_eq!(session.sn_window().0, 11);
    }

    #[test]
    fn test_window_rejects_beyond_max() {
        let session = Session::new([0; 6], 1, 5);
        assert_eq!(
            session.check_and_advance_cmd_sn(5 + CMD_WINDOW, false),
            CmdDisposition::OutOfWindow
        );
        assert_eq!(session.sn_window().0, 5);
    }

    #[test]
    fn test_immediate_bypasses_window() {
        let session = Session::new([0; 6], 1, 5);
        assert_eq!(session.check_and_advance_cmd_sn(3, true), CmdDisposition::Accept);
        assert_eq!(session.check_and_advance_cmd_sn(200, true), CmdDisposition::Accept);
        assert_eq!(session.sn_window().0, 5);
    }

    #[test]
    fn test_window_across_wraparound() {
        let session = Session::new([0; 6], 1, u32::MAX - 1);
        assert_eq!(session.check_and_advance_cmd_sn(u32::MAX - 1, false), CmdDisposition::Accept);
        assert_eq!(session.sn_window().0, u32::MAX);
        assert_eq!(session.check_and_advance_cmd_sn(u32::MAX, false), CmdDisposition::Accept);
        assert_eq!(session.sn_window().0, 0);
    }

    struct CountingDevice {
        closes: Arc<Counter>,
    }

    impl StorageDevice for CountingDevice {
        fn read_blocks(&mut self, _lba: u64, blocks: u32) -> ScsiResult<Vec<u8>> {
            Ok(vec![0; (blocks * 512) as usize])
        }
        fn write_blocks(&mut self, _lba: u64, _data: &[u8]) -> ScsiResult<()> {
            Ok(())
        }
        fn block_count(&self) -> u64 {
            16
        }
        fn block_size(&self) -> u32 {
            512
        }
        fn close(&mut self) -> ScsiResult<()> {
            self.closes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_last_detach_closes_storage_exactly_once() {
        let closes = Arc::new(Counter::new(0));
        let session = Session::new([1; 6], 7, 0);
        let device: Box<dyn StorageDevice> = Box::new(CountingDevice { closes: closes.clone() });
        session.bind_identity(
            SessionKind::Normal,
            Some("iqn.example:disk0".to_string()),
            Some(Arc::new(Mutex::new(device))),
        );

        session.attach();
        session.attach();
        assert!(!session.detach());
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 0);
        assert!(session.detach());
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);

        // a straggling detach must not close again
        session.attach();
        assert!(!session.detach());
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_force_close_then_detach_closes_once() {
        let closes = Arc::new(Counter::new(0));
        let session = Session::new([2; 6], 9, 0);
        let device: Box<dyn StorageDevice> = Box::new(CountingDevice { closes: closes.clone() });
        session.bind_identity(
            SessionKind::Normal,
            Some("iqn.example:disk0".to_string()),
            Some(Arc::new(Mutex::new(device))),
        );

        session.attach();
        session.force_close();
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
        session.force_close();
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);

        // the connection that missed the deadline eventually detaches
        assert!(!session.detach());
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
    }
}
