//! Phases: the connection's macro state machine
//!
//! `Unauthenticated → Login → FullFeature → Closed`, never backward.
//! [`run_login_phase`] drives the CSG/NSG login flag protocol over the
//! security and operational stages; [`run_full_feature_phase`] loops
//! receive → CmdSN window check → opcode dispatch until logout, stop
//! request, or a fatal error.

use crate::connection::Connection;
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{login_stage, login_status, reject_reason, IscsiPdu, Opcode};
use crate::session::{CmdDisposition, Session};
use crate::settings::SessionKind;
use crate::stage::{
    self, LogoutStage, OperationalNegotiationStage, ScsiCommandStage, SecurityNegotiationStage,
    StageOutcome, TaskManagementStage, TextNegotiationStage,
};
use crate::target::TargetContext;

/// Connection macro state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    Login,
    FullFeature,
    Closed,
}

impl Phase {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Phase::Unauthenticated => 0,
            Phase::Login => 1,
            Phase::FullFeature => 2,
            Phase::Closed => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Phase::Login,
            2 => Phase::FullFeature,
            3 => Phase::Closed,
            _ => Phase::Unauthenticated,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Unauthenticated => "Unauthenticated",
            Phase::Login => "Login",
            Phase::FullFeature => "FullFeature",
            Phase::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// A login failure with the status class/detail pair to report before
/// the connection is torn down.
struct LoginFailure {
    status_class: u8,
    status_detail: u8,
    error: IscsiError,
}

impl From<IscsiError> for LoginFailure {
    fn from(error: IscsiError) -> Self {
        let (status_class, status_detail) = match &error {
            IscsiError::Auth(_) => (login_status::INITIATOR_ERROR, login_status::DETAIL_AUTH_FAILURE),
            IscsiError::Negotiation(_) | IscsiError::ProtocolViolation(_) => {
                (login_status::INITIATOR_ERROR, 0x00)
            }
            _ => (login_status::TARGET_ERROR, 0x00),
        };
        LoginFailure { status_class, status_detail, error }
    }
}

/// Run Login Phase starting from the connection's first PDU.
///
/// On success the session identity is bound, the session negotiator is
/// sealed, and the final login response (carrying the TSIH) has been
/// sent. On failure a login response with the matching status class
/// and detail is sent best-effort before the error propagates.
pub(crate) fn run_login_phase(
    conn: &mut Connection,
    session: &Session,
    ctx: &TargetContext,
    first_pdu: IscsiPdu,
) -> ScsiResult<()> {
    conn.set_phase(Phase::Login);
    let mut security = SecurityNegotiationStage::new(ctx.auth.clone());
    let mut operational = OperationalNegotiationStage::new();
    let mut pdu = first_pdu;
    let mut first_response = true;

    loop {
        let req = pdu.parse_login_request()?;
        session.register_login_cmd_sn(req.cmd_sn);

        let step_result = match req.csg {
            login_stage::SECURITY_NEGOTIATION => {
                security.step(conn.negotiator_mut(), &req.parameters).map_err(LoginFailure::from)
            }
            login_stage::OPERATIONAL_NEGOTIATION => {
                if !security.complete() {
                    Err(LoginFailure::from(IscsiError::Auth(
                        "operational negotiation attempted before authentication".to_string(),
                    )))
                } else {
                    operational
                        .step(conn.negotiator_mut(), &req.parameters)
                        .map_err(LoginFailure::from)
                }
            }
            other => Err(LoginFailure::from(IscsiError::ProtocolViolation(format!(
                "invalid login CSG {other}"
            )))),
        };

        let mut step = match step_result {
            Ok(step) => step,
            Err(failure) => return fail_login(conn, session, &req, pdu.itt, failure),
        };
        if first_response {
            step.reply.push(("TargetPortalGroupTag".to_string(), "1".to_string()));
            first_response = false;
        }

        let transit = req.transit && step.ready && req.nsg > req.csg;
        if transit && req.nsg == login_stage::FULL_FEATURE {
            if let Err(failure) = finalize_login(conn, session, ctx) {
                return fail_login(conn, session, &req, pdu.itt, failure);
            }
            let (exp, max) = session.sn_window();
            let response = IscsiPdu::login_response(
                req.isid,
                session.tsih(),
                conn.next_stat_sn(),
                exp,
                max,
                login_status::SUCCESS,
                login_status::DETAIL_SUCCESS,
                req.csg,
                req.nsg,
                true,
                pdu.itt,
                crate::pdu::encode_text_keys(&step.reply),
            );
            conn.send(&response)?;
            log::info!(
                "login complete for {} (tsih {}, {:?} session)",
                conn.peer(),
                session.tsih(),
                session.kind()
            );
            return Ok(());
        }

        // stage echo, or a granted transit into operational negotiation
        let nsg = if transit { req.nsg } else { req.csg };
        let (exp, max) = session.sn_window();
        let response = IscsiPdu::login_response(
            req.isid,
            0,
            conn.next_stat_sn(),
            exp,
            max,
            login_status::SUCCESS,
            login_status::DETAIL_SUCCESS,
            req.csg,
            nsg,
            transit,
            pdu.itt,
            crate::pdu::encode_text_keys(&step.reply),
        );
        conn.send(&response)?;

        pdu = conn.receive(session)?;
        if pdu.kind() != Some(Opcode::LoginRequest) {
            return Err(IscsiError::ProtocolViolation(format!(
                "non-login PDU (opcode {:#04x}) during login phase",
                pdu.opcode
            )));
        }
    }
}

/// Bind session identity and storage at the transit into Full Feature.
fn finalize_login(
    conn: &mut Connection,
    session: &Session,
    ctx: &TargetContext,
) -> Result<(), LoginFailure> {
    let settings = conn.negotiator().settings().map_err(LoginFailure::from)?;
    match settings.session_kind {
        SessionKind::Discovery => {
            session.bind_identity(SessionKind::Discovery, None, None);
        }
        SessionKind::Normal => {
            let Some(name) = settings.target_name.clone() else {
                return Err(LoginFailure::from(IscsiError::Negotiation(
                    "Normal session login carried no TargetName".to_string(),
                )));
            };
            let Some(storage) = ctx.registry.lookup(&name) else {
                return Err(LoginFailure {
                    status_class: login_status::INITIATOR_ERROR,
                    status_detail: login_status::DETAIL_TARGET_NOT_FOUND,
                    error: IscsiError::Negotiation(format!("unknown target \"{name}\"")),
                });
            };
            session.bind_identity(SessionKind::Normal, Some(name), Some(storage));
        }
    }
    // session-wide parameters are frozen from here on
    conn.seal_session_settings();
    Ok(())
}

/// Report a login failure to the initiator (best effort) and surface
/// the underlying error.
fn fail_login(
    conn: &mut Connection,
    session: &Session,
    req: &crate::pdu::LoginRequest,
    itt: u32,
    failure: LoginFailure,
) -> ScsiResult<()> {
    log::warn!("login failed for {}: {}", conn.peer(), failure.error);
    let (exp, max) = session.sn_window();
    let response = IscsiPdu::login_response(
        req.isid,
        0,
        conn.next_stat_sn(),
        exp,
        max,
        failure.status_class,
        failure.status_detail,
        req.csg,
        req.csg,
        false,
        itt,
        Vec::new(),
    );
    if let Err(e) = conn.send(&response) {
        log::debug!("could not deliver login failure response: {e}");
    }
    Err(failure.error)
}

/// Run Full-Feature Phase until logout, stop request, or fatal error.
pub(crate) fn run_full_feature_phase(
    conn: &mut Connection,
    session: &Session,
    ctx: &TargetContext,
) -> ScsiResult<()> {
    conn.set_phase(Phase::FullFeature);
    let settings = conn.negotiator().settings()?;
    let mut scsi_stage = ScsiCommandStage::new(settings.clone());
    let mut text_stage = TextNegotiationStage;
    let mut task_stage = TaskManagementStage;
    let mut logout_stage = LogoutStage::new(settings);

    loop {
        if conn.stop_requested() {
            log::info!("stop request honored for {}", conn.peer());
            return Ok(());
        }

        let pdu = conn.receive(session)?;
        let Some(op) = pdu.kind() else {
            stage::send_reject(conn, session, reject_reason::COMMAND_NOT_SUPPORTED, &pdu)?;
            return Err(IscsiError::ProtocolViolation(format!(
                "unknown opcode {:#04x}",
                pdu.opcode
            )));
        };

        if let Some(cmd_sn) = pdu.cmd_sn() {
            match session.check_and_advance_cmd_sn(cmd_sn, pdu.immediate) {
                CmdDisposition::Accept => {}
                disposition => {
                    log::warn!("dropping {op} with CmdSN {cmd_sn}: {disposition:?}");
                    continue;
                }
            }
        }

        let outcome = match op {
            Opcode::ScsiCommand => scsi_stage.execute(conn, session, ctx, &pdu)?,
            Opcode::TextRequest => text_stage.execute(conn, session, ctx, &pdu)?,
            Opcode::TaskManagementRequest => task_stage.execute(conn, session, &pdu)?,
            Opcode::LogoutRequest => logout_stage.execute(conn, session, &pdu)?,
            // pings are answered inside the receive path
            Opcode::NopOut => StageOutcome::Continue,
            other => {
                stage::send_reject(conn, session, reject_reason::PROTOCOL_ERROR, &pdu)?;
                return Err(IscsiError::ProtocolViolation(format!(
                    "unexpected {other} in full feature phase"
                )));
            }
        };

        match outcome {
            StageOutcome::Continue | StageOutcome::Advance => {}
            StageOutcome::Terminate => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_u8_round_trip() {
        for phase in [Phase::Unauthenticated, Phase::Login, Phase::FullFeature, Phase::Closed] {
            assert_eq!(Phase::from_u8(phase.to_u8()), phase);
        }
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::FullFeature.to_string(), "FullFeature");
        assert_eq!(Phase::Login.to_string(), "Login");
    }
}
