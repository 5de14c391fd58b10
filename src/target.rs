//! Target server: registries, builder, accept loop
//!
//! [`IscsiTargetBuilder`] assembles the server configuration (portal
//! address, named storage targets, authentication policy). The bound
//! server runs a blocking accept loop spawning one thread per
//! connection; a [`TargetHandle`] supports controlled shutdown by
//! flipping the running flag and requesting a cooperative stop from
//! every live connection.

use crate::auth::AuthConfig;
use crate::connection::{self, ConnectionHandle};
use crate::error::{IscsiError, ScsiResult};
use crate::phase::Phase;
use crate::scsi::StorageDevice;
use crate::serial::TransferTagGenerator;
use crate::session::{Session, SharedStorage};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Name → storage handle map, shared across all connection threads.
#[derive(Default)]
pub struct TargetRegistry {
    entries: Mutex<HashMap<String, SharedStorage>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, name: String, storage: SharedStorage) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).insert(name, storage);
    }

    pub fn lookup(&self, name: &str) -> Option<SharedStorage> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).get(name).cloned()
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.entries.lock().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry").field("names", &self.list_names()).finish()
    }
}

/// Live sessions keyed by ISID.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<[u8; 6], Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, isid: &[u8; 6]) -> bool {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).contains_key(isid)
    }

    pub fn find(&self, isid: &[u8; 6]) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).get(isid).cloned()
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).insert(session.isid(), session);
    }

    pub(crate) fn remove(&self, isid: &[u8; 6]) {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).remove(isid);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Server-wide state threaded through every connection thread.
pub(crate) struct TargetContext {
    pub registry: TargetRegistry,
    pub sessions: SessionRegistry,
    pub auth: AuthConfig,
    pub transfer_tags: TransferTagGenerator,
    tsih: AtomicU16,
    running: AtomicBool,
    connections: Mutex<Vec<ConnectionHandle>>,
}

impl TargetContext {
    fn new(registry: TargetRegistry, auth: AuthConfig) -> Self {
        TargetContext {
            registry,
            sessions: SessionRegistry::new(),
            auth,
            transfer_tags: TransferTagGenerator::new(),
            tsih: AtomicU16::new(1),
            running: AtomicBool::new(true),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Assign the next TSIH, skipping 0 (which means "new session" on
    /// the wire).
    pub(crate) fn next_tsih(&self) -> u16 {
        loop {
            let tsih = self.tsih.fetch_add(1, Ordering::Relaxed);
            if tsih != 0 {
                return tsih;
            }
        }
    }

    pub(crate) fn register_connection(&self, handle: ConnectionHandle) {
        let mut connections = self.connections.lock().unwrap_or_else(|p| p.into_inner());
        connections.retain(|h| h.phase() != Phase::Closed);
        connections.push(handle);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Builder for an iSCSI target server.
pub struct IscsiTargetBuilder {
    bind_addr: SocketAddr,
    targets: Vec<(String, Box<dyn StorageDevice>)>,
    auth: AuthConfig,
}

impl IscsiTargetBuilder {
    pub fn new() -> Self {
        IscsiTargetBuilder {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3260)),
            targets: Vec::new(),
            auth: AuthConfig::None,
        }
    }

    /// Portal address to listen on. Use port 0 to let the OS pick.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Register a named target backed by `device`. Names must be
    /// iqn- or eui-qualified.
    pub fn add_target(mut self, name: impl Into<String>, device: impl StorageDevice + 'static) -> Self {
        self.targets.push((name.into(), Box::new(device)));
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn build(self) -> ScsiResult<IscsiTarget> {
        let registry = TargetRegistry::new();
        let mut seen = Vec::new();
        for (name, device) in self.targets {
            if !name.starts_with("iqn.") && !name.starts_with("eui.") {
                return Err(IscsiError::Config(format!(
                    "target name \"{name}\" is not iqn- or eui-qualified"
                )));
            }
            if seen.contains(&name) {
                return Err(IscsiError::Config(format!("duplicate target name \"{name}\"")));
            }
            seen.push(name.clone());
            registry.insert(name, Arc::new(Mutex::new(device)));
        }
        Ok(IscsiTarget {
            bind_addr: self.bind_addr,
            ctx: Arc::new(TargetContext::new(registry, self.auth)),
        })
    }
}

impl Default for IscsiTargetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured target server, not yet listening.
pub struct IscsiTarget {
    bind_addr: SocketAddr,
    ctx: Arc<TargetContext>,
}

impl IscsiTarget {
    pub fn builder() -> IscsiTargetBuilder {
        IscsiTargetBuilder::new()
    }

    /// Bind the listening socket. Separated from [`serve`] so callers
    /// can learn the assigned port before the accept loop starts.
    ///
    /// [`serve`]: BoundTarget::serve
    pub fn bind(self) -> ScsiResult<BoundTarget> {
        let listener = TcpListener::bind(self.bind_addr)?;
        log::info!("listening on {}", listener.local_addr()?);
        Ok(BoundTarget { listener, ctx: self.ctx })
    }
}

/// A listening target server.
pub struct BoundTarget {
    listener: TcpListener,
    ctx: Arc<TargetContext>,
}

impl BoundTarget {
    pub fn local_addr(&self) -> ScsiResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ScsiResult<TargetHandle> {
        Ok(TargetHandle { ctx: self.ctx.clone(), addr: self.local_addr()? })
    }

    /// Accept loop: one spawned thread per connection, until the
    /// handle's [`shutdown`](TargetHandle::shutdown) is called.
    pub fn serve(self) -> ScsiResult<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.ctx.is_running() {
                        // the shutdown wake-up connection, or a late client
                        drop(stream);
                        break;
                    }
                    let ctx = self.ctx.clone();
                    thread::Builder::new()
                        .name(format!("iscsi-conn-{peer}"))
                        .spawn(move || {
                            // establish logs its own outcome
                            let _ = connection::establish(stream, &ctx);
                        })?;
                }
                Err(e) => {
                    if !self.ctx.is_running() {
                        break;
                    }
                    log::warn!("accept failed: {e}");
                }
            }
        }
        log::info!("accept loop stopped");
        Ok(())
    }
}

/// Shutdown handle for a running server.
#[derive(Clone)]
pub struct TargetHandle {
    ctx: Arc<TargetContext>,
    addr: SocketAddr,
}

impl TargetHandle {
    /// Controlled shutdown with a one second drain deadline.
    /// See [`shutdown_within`](TargetHandle::shutdown_within).
    pub fn shutdown(&self) -> Vec<SocketAddr> {
        self.shutdown_within(Duration::from_secs(1))
    }

    /// Controlled shutdown: stop accepting, request a cooperative stop
    /// from every live connection, then wait up to `timeout` for the
    /// session registry to drain. Sessions still live at the deadline
    /// have their storage handle force-closed and leave the registry.
    /// Returns the peers whose stop request failed (connections not in
    /// Full-Feature Phase).
    pub fn shutdown_within(&self, timeout: Duration) -> Vec<SocketAddr> {
        self.ctx.running.store(false, Ordering::Release);
        // wake the blocking accept call
        let _ = TcpStream::connect(self.addr);

        let mut refused = Vec::new();
        {
            let connections = self.ctx.connections.lock().unwrap_or_else(|p| p.into_inner());
            for handle in connections.iter() {
                if handle.phase() == Phase::Closed {
                    continue;
                }
                if !handle.stop() {
                    log::warn!(
                        "stop request refused by {} (phase {})",
                        handle.peer(),
                        handle.phase()
                    );
                    refused.push(handle.peer());
                }
            }
        }

        let deadline = Instant::now() + timeout;
        while !self.ctx.sessions.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        for session in self.ctx.sessions.snapshot() {
            log::warn!("session tsih {} did not drain before the deadline", session.tsih());
            session.force_close();
            self.ctx.sessions.remove(&session.isid());
        }
        refused
    }

    pub fn session_count(&self) -> usize {
        self.ctx.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScsiResult as Result_;

    struct NullDevice;

    impl StorageDevice for NullDevice {
        fn read_blocks(&mut self, _lba: u64, blocks: u32) -> Result_<Vec<u8>> {
            Ok(vec![0; (blocks * 512) as usize])
        }
        fn write_blocks(&mut self, _lba: u64, _data: &[u8]) -> Result_<()> {
            Ok(())
        }
        fn block_count(&self) -> u64 {
            8
        }
        fn block_size(&self) -> u32 {
            512
        }
    }

    #[test]
    fn test_builder_rejects_unqualified_name() {
        let err = IscsiTarget::builder().add_target("disk0", NullDevice).build().err();
        assert!(matches!(err, Some(IscsiError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_duplicate_name() {
        let err = IscsiTarget::builder()
            .add_target("iqn.2026-08.example:disk0", NullDevice)
            .add_target("iqn.2026-08.example:disk0", NullDevice)
            .build()
            .err();
        assert!(matches!(err, Some(IscsiError::Config(_))));
    }

    #[test]
    fn test_registry_lookup_and_names() {
        let target = IscsiTarget::builder()
            .add_target("iqn.2026-08.example:b", NullDevice)
            .add_target("iqn.2026-08.example:a", NullDevice)
            .build()
            .unwrap();
        assert!(target.ctx.registry.lookup("iqn.2026-08.example:a").is_some());
        assert!(target.ctx.registry.lookup("iqn.2026-08.example:missing").is_none());
        assert_eq!(
            target.ctx.registry.list_names(),
            vec!["iqn.2026-08.example:a".to_string(), "iqn.2026-08.example:b".to_string()]
        );
    }

    #[test]
    fn test_tsih_assignment_skips_zero() {
        let ctx = TargetContext::new(TargetRegistry::new(), AuthConfig::None);
        ctx.tsih.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(ctx.next_tsih(), u16::MAX);
        // wrapped past 0
        assert_ne!(ctx.next_tsih(), 0);
    }
}
