//! Connection: one socket, one StatSN stream, one negotiator
//!
//! A connection is the unit of concurrency: the server spawns one
//! thread per accepted socket and that thread drives [`establish`] to
//! completion. Whatever the exit path (logout, protocol violation, I/O
//! failure, stop request), the session detach and socket close run
//! exactly once.
//!
//! The receive path intercepts NOP-Out pings before the active stage
//! sees them, so liveness probes are never queued behind a slow
//! multi-PDU exchange.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{login_status, IscsiPdu, Opcode};
use crate::phase::Phase;
use crate::serial::{SerialNumber, RESERVED_TAG};
use crate::session::{CmdDisposition, Session};
use crate::settings::{ConnectionSettingsNegotiator, SessionSettingsNegotiator};
use crate::stage;
use crate::target::TargetContext;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Phase and stop-flag state shared between a connection and its
/// [`ConnectionHandle`].
#[derive(Debug)]
pub struct PhaseIndicator {
    phase: AtomicU8,
    stop: AtomicBool,
}

impl PhaseIndicator {
    fn new() -> Arc<Self> {
        Arc::new(PhaseIndicator {
            phase: AtomicU8::new(Phase::Unauthenticated.to_u8()),
            stop: AtomicBool::new(false),
        })
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.to_u8(), Ordering::Release);
    }
}

/// External view of a live connection, used for cooperative shutdown.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    indicator: Arc<PhaseIndicator>,
    peer: SocketAddr,
}

impl ConnectionHandle {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.indicator.phase()
    }

    /// Request a cooperative stop. Only honored in Full-Feature Phase;
    /// returns `false` (request failed) for any other phase. The
    /// connection observes the flag at its next loop boundary, not
    /// mid-receive.
    pub fn stop(&self) -> bool {
        if self.indicator.phase() == Phase::FullFeature {
            self.indicator.stop.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    negotiator: ConnectionSettingsNegotiator,
    stat_sn: SerialNumber,
    cid: u16,
    is_leading: bool,
    indicator: Arc<PhaseIndicator>,
}

impl Connection {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        session_negotiator: Arc<SessionSettingsNegotiator>,
        cid: u16,
        is_leading: bool,
    ) -> Self {
        Connection {
            stream,
            peer,
            negotiator: ConnectionSettingsNegotiator::new(session_negotiator, is_leading),
            stat_sn: SerialNumber::new(0),
            cid,
            is_leading,
            indicator: PhaseIndicator::new(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn is_leading(&self) -> bool {
        self.is_leading
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        log::debug!("connection {} phase -> {}", self.peer, phase);
        self.indicator.set_phase(phase);
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle { indicator: self.indicator.clone(), peer: self.peer }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.indicator.stop.load(Ordering::Acquire)
    }

    pub fn negotiator(&self) -> &ConnectionSettingsNegotiator {
        &self.negotiator
    }

    pub(crate) fn negotiator_mut(&mut self) -> &mut ConnectionSettingsNegotiator {
        &mut self.negotiator
    }

    /// Freeze session-wide parameters. Only the leading connection
    /// holds this privilege; for any other connection this is a no-op.
    pub(crate) fn seal_session_settings(&self) {
        if self.is_leading() {
            self.negotiator.seal_session();
        }
    }

    /// Adopt the initiator's ExpStatSN as this connection's initial
    /// StatSN, per the first login request.
    fn init_stat_sn(&mut self, exp_stat_sn: u32) {
        self.stat_sn = SerialNumber::new(exp_stat_sn);
    }

    /// Consume one StatSN for a status-bearing response.
    pub(crate) fn next_stat_sn(&mut self) -> u32 {
        self.stat_sn.advance()
    }

    /// Current StatSN without consuming it, for PDUs that report but
    /// do not carry status (R2T, intermediate Data-In).
    pub(crate) fn current_stat_sn(&self) -> u32 {
        self.stat_sn.current()
    }

    pub fn send(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        if let Some(op) = pdu.kind() {
            log::trace!("-> {} to {} ({} data bytes)", op, self.peer, pdu.data.len());
        }
        pdu.write_to(&mut self.stream)
    }

    /// Receive the next PDU for the caller, servicing NOP-Out pings
    /// out-of-band: a ping is gated through the session's command
    /// window, answered immediately, and the originally awaited
    /// receive then resumes.
    pub fn receive(&mut self, session: &Session) -> ScsiResult<IscsiPdu> {
        loop {
            let pdu = IscsiPdu::read_from(&mut self.stream)?;
            if pdu.kind() == Some(Opcode::NopOut) {
                let ping = pdu.parse_nop_out()?;
                if ping.itt == RESERVED_TAG {
                    // the initiator's unsolicited answer to our NOP-In
                    log::trace!("absorbing NOP-Out reply from {}", self.peer);
                    continue;
                }
                match session.check_and_advance_cmd_sn(ping.cmd_sn, pdu.immediate) {
                    CmdDisposition::Accept => {
                        log::debug!("answering ping from {} out-of-band", self.peer);
                        stage::answer_ping(self, session, &ping)?;
                    }
                    disposition => {
                        log::warn!("dropping ping with CmdSN {}: {disposition:?}", ping.cmd_sn);
                    }
                }
                continue;
            }
            if let Some(op) = pdu.kind() {
                log::trace!("<- {} from {} ({} data bytes)", op, self.peer, pdu.data.len());
            }
            return Ok(pdu);
        }
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Drive one accepted socket through its whole lifecycle: first-PDU
/// validation, session resolution, Login Phase, Full-Feature Phase,
/// and the single detach-and-close teardown.
pub(crate) fn establish(stream: TcpStream, ctx: &TargetContext) -> ScsiResult<()> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let mut stream = stream;

    let first = IscsiPdu::read_from(&mut stream)?;
    if first.kind() != Some(Opcode::LoginRequest) {
        return Err(IscsiError::ProtocolViolation(format!(
            "first PDU from {peer} was opcode {:#04x}, not a login request",
            first.opcode
        )));
    }
    let req = first.parse_login_request()?;

    // one login = one new session; reinstatement is not supported
    if ctx.sessions.contains(&req.isid) {
        log::warn!("rejecting login from {peer}: ISID {:02x?} already has a live session", req.isid);
        let reject = IscsiPdu::login_response(
            req.isid,
            0,
            req.exp_stat_sn,
            req.cmd_sn,
            req.cmd_sn.wrapping_add(1),
            login_status::INITIATOR_ERROR,
            login_status::DETAIL_CANT_INCLUDE_IN_SESSION,
            req.csg,
            req.csg,
            false,
            first.itt,
            Vec::new(),
        );
        let _ = reject.write_to(&mut stream);
        return Err(IscsiError::ProtocolViolation(
            "login for an ISID already bound to a live session".to_string(),
        ));
    }

    let session = crate::session::Session::new(req.isid, ctx.next_tsih(), req.cmd_sn);
    ctx.sessions.insert(session.clone());
    session.attach();

    // nothing fallible between attach and the teardown block below,
    // or the registry entry for this ISID would leak
    let mut conn = Connection::new(stream, peer, session.negotiator(), req.cid, true);
    conn.init_stat_sn(req.exp_stat_sn);
    ctx.register_connection(conn.handle());
    log::info!("connection accepted from {peer} (cid {}, tsih {})", req.cid, session.tsih());

    let result = crate::phase::run_login_phase(&mut conn, &session, ctx, first)
        .and_then(|()| crate::phase::run_full_feature_phase(&mut conn, &session, ctx));

    // single teardown path for every exit
    conn.set_phase(Phase::Closed);
    if session.detach() {
        ctx.sessions.remove(&session.isid());
    }
    conn.shutdown();

    match &result {
        Ok(()) => log::info!("connection {peer} (cid {}) closed", conn.cid()),
        Err(e) => log::warn!("connection {peer} (cid {}) terminated: {e}", conn.cid()),
    }
    result
}
