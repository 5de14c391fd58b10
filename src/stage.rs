//! Stages: single request/response exchanges bound to one PDU opcode
//!
//! Login Phase composes [`SecurityNegotiationStage`] and
//! [`OperationalNegotiationStage`]; Full-Feature Phase dispatches each
//! received PDU to the stage matching its opcode. A stage may perform
//! further sends and receives of its own (R2T solicitation, segmented
//! Data-In) before returning its [`StageOutcome`].

use crate::auth::{decode_binary_value, AuthConfig, ChapChallenge};
use crate::connection::Connection;
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{logout, task_mgmt, IscsiPdu, NopOutPdu};
use crate::scsi;
use crate::serial::RESERVED_TAG;
use crate::session::Session;
use crate::settings::{ConnectionSettingsNegotiator, Settings};
use crate::target::TargetContext;
use byteorder::{BigEndian, ByteOrder};

/// What the phase loop should do after a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stay in the current phase and process the next PDU.
    Continue,
    /// Move to the next phase.
    Advance,
    /// The connection is closing.
    Terminate,
}

/// Result of one login negotiation round.
#[derive(Debug)]
pub struct LoginStep {
    /// Key pairs to echo in the login response data segment.
    pub reply: Vec<(String, String)>,
    /// Whether the stage permits a phase transit in this round.
    pub ready: bool,
}

// ============================================================================
// Login Phase stages
// ============================================================================

#[derive(Debug)]
enum ChapState {
    Start,
    MethodChosen,
    Challenged(ChapChallenge),
    Complete,
}

/// Security negotiation stage (CSG 0): AuthMethod selection and the
/// CHAP exchange when the target's [`AuthConfig`] demands one.
pub struct SecurityNegotiationStage {
    auth: AuthConfig,
    state: ChapState,
}

impl SecurityNegotiationStage {
    pub fn new(auth: AuthConfig) -> Self {
        SecurityNegotiationStage { auth, state: ChapState::Start }
    }

    /// `true` once the initiator has satisfied the authentication
    /// policy, making a transit out of the security stage legal.
    pub fn complete(&self) -> bool {
        matches!(self.state, ChapState::Complete) || !self.auth.requires_auth()
    }

    pub fn step(
        &mut self,
        negotiator: &mut ConnectionSettingsNegotiator,
        params: &[(String, String)],
    ) -> ScsiResult<LoginStep> {
        let mut reply = Vec::new();
        let mut chap_name: Option<&str> = None;
        let mut chap_response: Option<&str> = None;
        let mut counter_identifier: Option<&str> = None;
        let mut counter_challenge: Option<&str> = None;

        for (key, value) in params {
            match key.as_str() {
                "AuthMethod" => {
                    let method = self.select_method(value)?;
                    reply.push(("AuthMethod".to_string(), method.to_string()));
                }
                "CHAP_A" => {
                    if !matches!(self.state, ChapState::MethodChosen) {
                        return Err(IscsiError::ProtocolViolation(
                            "CHAP_A before AuthMethod=CHAP was agreed".to_string(),
                        ));
                    }
                    if !value.split(',').any(|a| a == "5") {
                        return Err(IscsiError::Auth(format!(
                            "no supported CHAP algorithm in \"{value}\""
                        )));
                    }
                    let challenge = ChapChallenge::generate();
                    reply.push(("CHAP_A".to_string(), "5".to_string()));
                    reply.push(("CHAP_I".to_string(), challenge.identifier_text()));
                    reply.push(("CHAP_C".to_string(), challenge.challenge_text()));
                    self.state = ChapState::Challenged(challenge);
                }
                "CHAP_N" => chap_name = Some(value),
                "CHAP_R" => chap_response = Some(value),
                "CHAP_I" => counter_identifier = Some(value),
                "CHAP_C" => counter_challenge = Some(value),
                _ => {
                    if let Some(pair) = negotiator.apply(key, value)? {
                        reply.push(pair);
                    }
                }
            }
        }

        if let (Some(name), Some(response)) = (chap_name, chap_response) {
            let ChapState::Challenged(challenge) = &self.state else {
                return Err(IscsiError::ProtocolViolation(
                    "CHAP_R received with no challenge outstanding".to_string(),
                ));
            };
            let Some(creds) = self.auth.credentials() else {
                return Err(IscsiError::Auth("CHAP response but no credentials configured".to_string()));
            };
            let digest = decode_binary_value(response)?;
            if name != creds.username || !challenge.verify(&digest, &creds.secret) {
                log::warn!("CHAP verification failed for initiator user \"{name}\"");
                return Err(IscsiError::Auth("CHAP response rejected".to_string()));
            }
            log::info!("CHAP authentication succeeded for user \"{name}\"");

            // mutual CHAP: the initiator counter-challenged us
            if let (Some(id), Some(chal)) = (counter_identifier, counter_challenge) {
                let Some(target_creds) = self.auth.target_credentials() else {
                    return Err(IscsiError::Auth(
                        "initiator requested mutual CHAP but no target credentials configured"
                            .to_string(),
                    ));
                };
                let counter = ChapChallenge::from_wire(id, chal)?;
                reply.push(("CHAP_N".to_string(), target_creds.username.clone()));
                reply.push((
                    "CHAP_R".to_string(),
                    crate::auth::encode_binary_value(&counter.expected_response(&target_creds.secret)),
                ));
            }
            self.state = ChapState::Complete;
        }

        Ok(LoginStep { reply, ready: self.complete() })
    }

    fn select_method(&mut self, offered: &str) -> ScsiResult<&'static str> {
        let offers: Vec<&str> = offered.split(',').collect();
        if self.auth.requires_auth() {
            if offers.contains(&"CHAP") {
                self.state = ChapState::MethodChosen;
                Ok("CHAP")
            } else {
                Err(IscsiError::Auth(format!(
                    "authentication required but initiator offered only \"{offered}\""
                )))
            }
        } else if offers.contains(&"None") {
            self.state = ChapState::Complete;
            Ok("None")
        } else {
            Err(IscsiError::Negotiation(format!(
                "no acceptable AuthMethod in \"{offered}\""
            )))
        }
    }
}

/// Login operational negotiation stage (CSG 1): runs parameter rounds
/// through the connection negotiator and declares the target's own
/// receive limit once.
pub struct OperationalNegotiationStage {
    declared_target_limits: bool,
}

impl OperationalNegotiationStage {
    pub fn new() -> Self {
        OperationalNegotiationStage { declared_target_limits: false }
    }

    pub fn step(
        &mut self,
        negotiator: &mut ConnectionSettingsNegotiator,
        params: &[(String, String)],
    ) -> ScsiResult<LoginStep> {
        let mut reply = Vec::new();
        for (key, value) in params {
            log::debug!("login negotiation {key}={value}");
            if let Some(pair) = negotiator.apply(key, value)? {
                reply.push(pair);
            }
        }
        if !self.declared_target_limits {
            reply.push(("MaxRecvDataSegmentLength".to_string(), "8192".to_string()));
            self.declared_target_limits = true;
        }
        Ok(LoginStep { reply, ready: true })
    }
}

impl Default for OperationalNegotiationStage {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Full-Feature Phase stages
// ============================================================================

/// SCSI command stage: executes the CDB against the session's storage,
/// soliciting Data-Out with R2T for writes and segmenting Data-In for
/// reads.
pub struct ScsiCommandStage {
    settings: Settings,
}

impl ScsiCommandStage {
    pub fn new(settings: Settings) -> Self {
        ScsiCommandStage { settings }
    }

    pub fn execute(
        &mut self,
        conn: &mut Connection,
        session: &Session,
        ctx: &TargetContext,
        pdu: &IscsiPdu,
    ) -> ScsiResult<StageOutcome> {
        let req = pdu.parse_scsi_command()?;
        let Some(storage) = session.storage() else {
            return Err(IscsiError::ProtocolViolation(
                "SCSI command on a session with no bound storage".to_string(),
            ));
        };

        let data_out = if req.write {
            Some(self.collect_data_out(conn, session, ctx, &req, &pdu.data)?)
        } else {
            None
        };

        let reply = {
            let mut device = storage.lock().unwrap_or_else(|p| p.into_inner());
            scsi::execute(device.as_mut(), &req.cdb, data_out.as_deref())
        };

        let (exp, max) = session.sn_window();
        if reply.status == scsi::status::GOOD && req.read && !reply.data.is_empty() {
            self.send_data_in(conn, session, &req, reply.data)?;
        } else {
            let sense = reply.sense.map(|s| s.to_bytes());
            let response = IscsiPdu::scsi_response(
                req.itt,
                conn.next_stat_sn(),
                exp,
                max,
                0,
                reply.status,
                sense.as_deref(),
            );
            conn.send(&response)?;
        }
        Ok(StageOutcome::Continue)
    }

    /// Assemble the full write payload: immediate data from the command
    /// PDU, then R2T-solicited Data-Out until the buffer is complete.
    fn collect_data_out(
        &self,
        conn: &mut Connection,
        session: &Session,
        ctx: &TargetContext,
        req: &crate::pdu::ScsiCommandRequest,
        immediate_data: &[u8],
    ) -> ScsiResult<Vec<u8>> {
        let expected = req.expected_data_length as usize;
        // the transfer length is initiator-controlled; bound it by the
        // negotiated burst before sizing the buffer
        if expected > self.settings.max_burst_length as usize {
            return Err(IscsiError::ProtocolViolation(format!(
                "write of {expected} bytes exceeds negotiated MaxBurstLength {}",
                self.settings.max_burst_length
            )));
        }
        let mut buffer = vec![0u8; expected];
        let head = immediate_data.len().min(expected);
        buffer[..head].copy_from_slice(&immediate_data[..head]);
        let mut received = head;

        if received < expected {
            let ttt = ctx.transfer_tags.next_tag();
            let (exp, max) = session.sn_window();
            // R2T carries no status, so StatSN is reported unconsumed
            let r2t = IscsiPdu::ready_to_transfer(
                req.lun,
                req.itt,
                ttt,
                conn.current_stat_sn(),
                exp,
                max,
                0,
                received as u32,
                (expected - received) as u32,
            );
            conn.send(&r2t)?;

            loop {
                let pdu = conn.receive(session)?;
                let out = pdu.parse_data_out()?;
                if out.itt != req.itt {
                    return Err(IscsiError::ProtocolViolation(format!(
                        "Data-Out for task {:#x} while task {:#x} is transferring",
                        out.itt, req.itt
                    )));
                }
                let offset = out.buffer_offset as usize;
                if offset + out.data.len() > expected {
                    return Err(IscsiError::ProtocolViolation(format!(
                        "Data-Out overruns buffer: offset {offset} + {} > {expected}",
                        out.data.len()
                    )));
                }
                buffer[offset..offset + out.data.len()].copy_from_slice(&out.data);
                received += out.data.len();
                if out.final_flag {
                    if received < expected {
                        return Err(IscsiError::ProtocolViolation(format!(
                            "final Data-Out with only {received} of {expected} bytes"
                        )));
                    }
                    break;
                }
            }
        }
        Ok(buffer)
    }

    /// Send the Data-In sequence, piggybacking GOOD status on the final
    /// PDU (S bit) so no separate SCSI Response is needed.
    fn send_data_in(
        &self,
        conn: &mut Connection,
        session: &Session,
        req: &crate::pdu::ScsiCommandRequest,
        mut data: Vec<u8>,
    ) -> ScsiResult<()> {
        data.truncate(req.expected_data_length as usize);
        let segment = self.settings.max_recv_data_segment_length.max(1) as usize;
        let total = data.len();
        let mut offset = 0usize;
        let mut data_sn = 0u32;

        while offset < total || total == 0 {
            let end = (offset + segment).min(total);
            let last = end == total;
            let (exp, max) = session.sn_window();
            let stat_sn = if last { conn.next_stat_sn() } else { conn.current_stat_sn() };
            let pdu = IscsiPdu::scsi_data_in(
                req.itt,
                stat_sn,
                exp,
                max,
                data_sn,
                offset as u32,
                data[offset..end].to_vec(),
                last,
                if last { Some(scsi::status::GOOD) } else { None },
            );
            conn.send(&pdu)?;
            data_sn += 1;
            offset = end;
            if last {
                break;
            }
        }
        Ok(())
    }
}

/// Text negotiation stage: answers SendTargets discovery requests with
/// the registered target names.
pub struct TextNegotiationStage;

impl TextNegotiationStage {
    pub fn execute(
        &mut self,
        conn: &mut Connection,
        session: &Session,
        ctx: &TargetContext,
        pdu: &IscsiPdu,
    ) -> ScsiResult<StageOutcome> {
        let req = pdu.parse_text_request()?;
        let mut reply = Vec::new();
        for (key, value) in &req.parameters {
            if key == "SendTargets" {
                let names = ctx.registry.list_names();
                log::debug!("SendTargets={value}: answering with {} target(s)", names.len());
                for name in names {
                    if value == "All" || value.is_empty() || *value == name {
                        reply.push(("TargetName".to_string(), name));
                    }
                }
            } else {
                reply.push((key.clone(), "NotUnderstood".to_string()));
            }
        }

        let (exp, max) = session.sn_window();
        let response = IscsiPdu::text_response(
            req.itt,
            RESERVED_TAG,
            conn.next_stat_sn(),
            exp,
            max,
            true,
            crate::pdu::encode_text_keys(&reply),
        );
        conn.send(&response)?;
        Ok(StageOutcome::Continue)
    }
}

/// Task management stage. With recovery level 0 nothing can actually be
/// aborted mid-flight, so every function is answered "not supported".
pub struct TaskManagementStage;

impl TaskManagementStage {
    pub fn execute(
        &mut self,
        conn: &mut Connection,
        session: &Session,
        pdu: &IscsiPdu,
    ) -> ScsiResult<StageOutcome> {
        let req = pdu.parse_task_mgmt_request()?;
        log::debug!("task management function {} answered as not supported", req.function);
        let (exp, max) = session.sn_window();
        let response = IscsiPdu::task_mgmt_response(
            req.itt,
            conn.next_stat_sn(),
            exp,
            max,
            task_mgmt::FUNCTION_NOT_SUPPORTED,
        );
        conn.send(&response)?;
        Ok(StageOutcome::Continue)
    }
}

/// Logout stage: acknowledge and terminate the connection.
pub struct LogoutStage {
    settings: Settings,
}

impl LogoutStage {
    pub fn new(settings: Settings) -> Self {
        LogoutStage { settings }
    }

    pub fn execute(
        &mut self,
        conn: &mut Connection,
        session: &Session,
        pdu: &IscsiPdu,
    ) -> ScsiResult<StageOutcome> {
        let req = pdu.parse_logout_request()?;
        log::info!("logout request from {} (reason {})", conn.peer(), req.reason);
        let (exp, max) = session.sn_window();
        let response = IscsiPdu::logout_response(
            req.itt,
            conn.next_stat_sn(),
            exp,
            max,
            logout::RESPONSE_SUCCESS,
            self.settings.default_time2wait,
            self.settings.default_time2retain,
        );
        conn.send(&response)?;
        Ok(StageOutcome::Terminate)
    }
}

/// Answer an intercepted NOP-Out ping with a NOP-In echoing its
/// payload. Runs synchronously inside the receive path so a ping is
/// never queued behind the stage currently awaiting its own PDU.
pub(crate) fn answer_ping(
    conn: &mut Connection,
    session: &Session,
    ping: &NopOutPdu,
) -> ScsiResult<()> {
    let (exp, max) = session.sn_window();
    let reply = IscsiPdu::nop_in(
        ping.lun,
        ping.itt,
        RESERVED_TAG,
        conn.next_stat_sn(),
        exp,
        max,
        ping.data.clone(),
    );
    conn.send(&reply)
}

/// Reject an unexpected or unknown PDU, echoing its header back. Used
/// by the Full-Feature loop before failing the connection.
pub(crate) fn send_reject(
    conn: &mut Connection,
    session: &Session,
    reason: u8,
    offending: &IscsiPdu,
) -> ScsiResult<()> {
    let header = offending.to_bytes();
    let mut bhs = [0u8; crate::pdu::BHS_SIZE];
    bhs.copy_from_slice(&header[..crate::pdu::BHS_SIZE]);
    // the echoed header must announce no data segment
    bhs[5] = 0;
    BigEndian::write_u16(&mut bhs[6..8], 0);
    let (exp, max) = session.sn_window();
    let reject = IscsiPdu::reject(reason, conn.next_stat_sn(), exp, max, &bhs);
    conn.send(&reject)
}
