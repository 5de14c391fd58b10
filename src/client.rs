//! Initiator-side client
//!
//! A minimal blocking initiator used by the end-to-end tests and
//! usable as a diagnostic tool: login (with or without CHAP),
//! SendTargets discovery, SCSI reads and writes, NOP ping, logout.
//! The raw send/receive methods allow tests to inject arbitrary PDUs.

use crate::auth::{decode_binary_value, encode_binary_value, ChapChallenge};
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{encode_text_keys, login_stage, logout, IscsiPdu, LoginResponse, Opcode};
use crate::scsi::status as scsi_status;
use crate::serial::RESERVED_TAG;
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use std::net::{TcpStream, ToSocketAddrs};

/// Outcome of one SCSI command as seen by the initiator.
#[derive(Debug, Clone)]
pub struct CommandStatus {
    pub status: u8,
    /// Data-In payload for read commands.
    pub data: Vec<u8>,
    /// Raw sense bytes when status is CHECK CONDITION.
    pub sense: Option<Vec<u8>>,
}

impl CommandStatus {
    pub fn is_good(&self) -> bool {
        self.status == scsi_status::GOOD
    }
}

pub struct IscsiClient {
    stream: TcpStream,
    isid: [u8; 6],
    tsih: u16,
    cid: u16,
    itt: u32,
    cmd_sn: u32,
    exp_stat_sn: u32,
}

impl IscsiClient {
    pub fn connect(addr: impl ToSocketAddrs) -> ScsiResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut rng = rand::thread_rng();
        // random-type ISID (t = 0b10)
        let isid = [0x80, 0x00, rng.gen(), rng.gen(), rng.gen(), rng.gen()];
        Ok(IscsiClient { stream, isid, tsih: 0, cid: 1, itt: 1, cmd_sn: 1, exp_stat_sn: 0 })
    }

    pub fn isid(&self) -> [u8; 6] {
        self.isid
    }

    pub fn tsih(&self) -> u16 {
        self.tsih
    }

    pub fn cmd_sn(&self) -> u32 {
        self.cmd_sn
    }

    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn
    }

    /// Override the ISID before login, for session-collision tests.
    pub fn set_isid(&mut self, isid: [u8; 6]) {
        self.isid = isid;
    }

    fn next_itt(&mut self) -> u32 {
        let itt = self.itt;
        self.itt = self.itt.wrapping_add(1);
        itt
    }

    pub fn send_raw(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        pdu.write_to(&mut self.stream)
    }

    pub fn receive_raw(&mut self) -> ScsiResult<IscsiPdu> {
        IscsiPdu::read_from(&mut self.stream)
    }

    /// Log in to a Normal session against `target_name` without
    /// authentication, transiting straight through operational
    /// negotiation into Full-Feature Phase.
    pub fn login(&mut self, initiator_name: &str, target_name: &str) -> ScsiResult<()> {
        let params = vec![
            ("InitiatorName".to_string(), initiator_name.to_string()),
            ("SessionType".to_string(), "Normal".to_string()),
            ("TargetName".to_string(), target_name.to_string()),
            ("HeaderDigest".to_string(), "None".to_string()),
            ("DataDigest".to_string(), "None".to_string()),
            ("ImmediateData".to_string(), "Yes".to_string()),
            ("MaxRecvDataSegmentLength".to_string(), "8192".to_string()),
        ];
        let resp = self.login_round(
            login_stage::OPERATIONAL_NEGOTIATION,
            login_stage::FULL_FEATURE,
            true,
            &params,
        )?;
        self.finish_login(&resp)
    }

    /// Log in to a Discovery session (no target name required).
    pub fn login_discovery(&mut self, initiator_name: &str) -> ScsiResult<()> {
        let params = vec![
            ("InitiatorName".to_string(), initiator_name.to_string()),
            ("SessionType".to_string(), "Discovery".to_string()),
            ("HeaderDigest".to_string(), "None".to_string()),
            ("DataDigest".to_string(), "None".to_string()),
        ];
        let resp = self.login_round(
            login_stage::OPERATIONAL_NEGOTIATION,
            login_stage::FULL_FEATURE,
            true,
            &params,
        )?;
        self.finish_login(&resp)
    }

    /// Log in with one-way CHAP: security negotiation rounds first,
    /// then operational negotiation.
    pub fn login_with_chap(
        &mut self,
        initiator_name: &str,
        target_name: &str,
        username: &str,
        secret: &str,
    ) -> ScsiResult<()> {
        // round 1: offer CHAP and declare our identity
        let params = vec![
            ("AuthMethod".to_string(), "CHAP".to_string()),
            ("InitiatorName".to_string(), initiator_name.to_string()),
            ("SessionType".to_string(), "Normal".to_string()),
            ("TargetName".to_string(), target_name.to_string()),
        ];
        let resp = self.login_round(
            login_stage::SECURITY_NEGOTIATION,
            login_stage::SECURITY_NEGOTIATION,
            false,
            &params,
        )?;
        let method = resp
            .parameters
            .iter()
            .find(|(k, _)| k == "AuthMethod")
            .map(|(_, v)| v.as_str())
            .unwrap_or("");
        if method != "CHAP" {
            return Err(IscsiError::Negotiation(format!(
                "target selected AuthMethod \"{method}\", expected CHAP"
            )));
        }

        // round 2: algorithm proposal, target answers with the challenge
        let params = vec![("CHAP_A".to_string(), "5".to_string())];
        let resp = self.login_round(
            login_stage::SECURITY_NEGOTIATION,
            login_stage::SECURITY_NEGOTIATION,
            false,
            &params,
        )?;
        let find = |key: &str| {
            resp.parameters
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| IscsiError::Auth(format!("target omitted {key}")))
        };
        let challenge = ChapChallenge {
            identifier: find("CHAP_I")?
                .parse()
                .map_err(|_| IscsiError::Auth("bad CHAP_I from target".to_string()))?,
            challenge: decode_binary_value(&find("CHAP_C")?)?,
        };

        // round 3: digest, transiting to operational negotiation
        let params = vec![
            ("CHAP_N".to_string(), username.to_string()),
            ("CHAP_R".to_string(), encode_binary_value(&challenge.expected_response(secret))),
        ];
        self.login_round(
            login_stage::SECURITY_NEGOTIATION,
            login_stage::OPERATIONAL_NEGOTIATION,
            true,
            &params,
        )?;

        // operational round into Full Feature
        let params = vec![
            ("HeaderDigest".to_string(), "None".to_string()),
            ("DataDigest".to_string(), "None".to_string()),
            ("MaxRecvDataSegmentLength".to_string(), "8192".to_string()),
        ];
        let resp = self.login_round(
            login_stage::OPERATIONAL_NEGOTIATION,
            login_stage::FULL_FEATURE,
            true,
            &params,
        )?;
        self.finish_login(&resp)
    }

    fn login_round(
        &mut self,
        csg: u8,
        nsg: u8,
        transit: bool,
        params: &[(String, String)],
    ) -> ScsiResult<LoginResponse> {
        let itt = self.next_itt();
        let request = IscsiPdu::login_request(
            self.isid,
            self.tsih,
            self.cid,
            self.cmd_sn,
            self.exp_stat_sn,
            csg,
            nsg,
            transit,
            itt,
            encode_text_keys(params),
        );
        self.send_raw(&request)?;

        let pdu = self.receive_raw()?;
        let resp = pdu.parse_login_response()?;
        self.exp_stat_sn = resp.stat_sn.wrapping_add(1);
        if resp.status_class != 0 {
            return Err(IscsiError::Negotiation(format!(
                "login rejected: status class {:#04x} detail {:#04x}",
                resp.status_class, resp.status_detail
            )));
        }
        Ok(resp)
    }

    fn finish_login(&mut self, resp: &LoginResponse) -> ScsiResult<()> {
        if !resp.transit || resp.nsg != login_stage::FULL_FEATURE {
            return Err(IscsiError::Negotiation(
                "target did not transit to full feature phase".to_string(),
            ));
        }
        self.tsih = resp.tsih;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        log::debug!("logged in, tsih {}", self.tsih);
        Ok(())
    }

    /// SendTargets discovery over an established Discovery session.
    pub fn discover(&mut self) -> ScsiResult<Vec<String>> {
        let itt = self.next_itt();
        let request = IscsiPdu::text_request(
            itt,
            RESERVED_TAG,
            self.cmd_sn,
            self.exp_stat_sn,
            encode_text_keys(&[("SendTargets".to_string(), "All".to_string())]),
        );
        self.send_raw(&request)?;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);

        let pdu = self.receive_raw()?;
        let names = pdu.parse_text_request_response()?;
        self.exp_stat_sn = BigEndian::read_u32(&pdu.specific[4..8]).wrapping_add(1);
        Ok(names)
    }

    /// NOP-Out ping; returns the payload echoed by the target.
    pub fn ping(&mut self, payload: Vec<u8>) -> ScsiResult<Vec<u8>> {
        let itt = self.next_itt();
        let request =
            IscsiPdu::nop_out(0, itt, RESERVED_TAG, self.cmd_sn, self.exp_stat_sn, false, payload);
        self.send_raw(&request)?;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);

        let pdu = self.receive_raw()?;
        if pdu.kind() != Some(Opcode::NopIn) {
            return Err(IscsiError::ProtocolViolation(format!(
                "expected NOP-In, got opcode {:#04x}",
                pdu.opcode
            )));
        }
        self.exp_stat_sn = BigEndian::read_u32(&pdu.specific[4..8]).wrapping_add(1);
        Ok(pdu.data)
    }

    /// TEST UNIT READY.
    pub fn test_unit_ready(&mut self) -> ScsiResult<CommandStatus> {
        self.execute_nondata(&[0u8; 6])
    }

    /// READ CAPACITY (10): (last LBA, block size).
    pub fn read_capacity(&mut self) -> ScsiResult<(u32, u32)> {
        let cdb = [0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let status = self.execute_read(&cdb, 8)?;
        if !status.is_good() || status.data.len() < 8 {
            return Err(IscsiError::ProtocolViolation("READ CAPACITY failed".to_string()));
        }
        Ok((BigEndian::read_u32(&status.data[0..4]), BigEndian::read_u32(&status.data[4..8])))
    }

    /// READ (10) of `blocks` blocks starting at `lba`.
    pub fn read_blocks(&mut self, lba: u32, blocks: u16, block_size: u32) -> ScsiResult<CommandStatus> {
        let mut cdb = [0u8; 10];
        cdb[0] = 0x28;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        self.execute_read(&cdb, blocks as u32 * block_size)
    }

    /// WRITE (10) of `payload` (a whole number of blocks) at `lba`.
    /// Sends no immediate data, so the target solicits via R2T.
    pub fn write_blocks(&mut self, lba: u32, payload: &[u8], block_size: u32) -> ScsiResult<CommandStatus> {
        let blocks = (payload.len() as u32 / block_size) as u16;
        let mut cdb = [0u8; 10];
        cdb[0] = 0x2A;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        self.execute_write(&cdb, payload)
    }

    /// Issue a read-direction command and collect the Data-In sequence.
    pub fn execute_read(&mut self, cdb: &[u8], expected_len: u32) -> ScsiResult<CommandStatus> {
        let itt = self.next_itt();
        let request = IscsiPdu::scsi_command(
            0,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
            expected_len,
            cdb,
            true,
            false,
            Vec::new(),
        );
        self.send_raw(&request)?;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);

        let mut data = Vec::new();
        loop {
            let pdu = self.receive_raw()?;
            match pdu.kind() {
                Some(Opcode::ScsiDataIn) => {
                    data.extend_from_slice(&pdu.data);
                    let has_status = pdu.flags & crate::pdu::flags::STATUS != 0;
                    if has_status {
                        self.exp_stat_sn =
                            BigEndian::read_u32(&pdu.specific[4..8]).wrapping_add(1);
                    }
                    if pdu.flags & crate::pdu::flags::FINAL != 0 {
                        let status =
                            if has_status { pdu.opcode_bytes[1] } else { scsi_status::GOOD };
                        return Ok(CommandStatus { status, data, sense: None });
                    }
                }
                Some(Opcode::ScsiResponse) => return Ok(self.unpack_response(&pdu, data)),
                other => {
                    return Err(IscsiError::ProtocolViolation(format!(
                        "unexpected {other:?} while awaiting Data-In"
                    )));
                }
            }
        }
    }

    /// Issue a write-direction command, answering R2T solicitations
    /// with Data-Out until the target responds.
    pub fn execute_write(&mut self, cdb: &[u8], payload: &[u8]) -> ScsiResult<CommandStatus> {
        let itt = self.next_itt();
        let request = IscsiPdu::scsi_command(
            0,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
            payload.len() as u32,
            cdb,
            false,
            true,
            Vec::new(),
        );
        self.send_raw(&request)?;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);

        loop {
            let pdu = self.receive_raw()?;
            match pdu.kind() {
                Some(Opcode::ReadyToTransfer) => {
                    let ttt = BigEndian::read_u32(&pdu.specific[0..4]);
                    let offset = BigEndian::read_u32(&pdu.specific[20..24]) as usize;
                    let desired = BigEndian::read_u32(&pdu.specific[24..28]) as usize;
                    let end = (offset + desired).min(payload.len());
                    let out = IscsiPdu::data_out(
                        0,
                        itt,
                        ttt,
                        self.exp_stat_sn,
                        0,
                        offset as u32,
                        payload[offset..end].to_vec(),
                        true,
                    );
                    self.send_raw(&out)?;
                }
                Some(Opcode::ScsiResponse) => return Ok(self.unpack_response(&pdu, Vec::new())),
                other => {
                    return Err(IscsiError::ProtocolViolation(format!(
                        "unexpected {other:?} while awaiting R2T or response"
                    )));
                }
            }
        }
    }

    fn execute_nondata(&mut self, cdb: &[u8]) -> ScsiResult<CommandStatus> {
        let itt = self.next_itt();
        let request = IscsiPdu::scsi_command(
            0,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
            0,
            cdb,
            false,
            false,
            Vec::new(),
        );
        self.send_raw(&request)?;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);

        let pdu = self.receive_raw()?;
        if pdu.kind() != Some(Opcode::ScsiResponse) {
            return Err(IscsiError::ProtocolViolation(format!(
                "expected SCSI Response, got opcode {:#04x}",
                pdu.opcode
            )));
        }
        Ok(self.unpack_response(&pdu, Vec::new()))
    }

    fn unpack_response(&mut self, pdu: &IscsiPdu, data: Vec<u8>) -> CommandStatus {
        self.exp_stat_sn = BigEndian::read_u32(&pdu.specific[4..8]).wrapping_add(1);
        let status = pdu.opcode_bytes[1];
        let sense = if pdu.data.len() > 2 {
            Some(pdu.data[2..].to_vec())
        } else {
            None
        };
        CommandStatus { status, data, sense }
    }

    /// Log out, closing the session.
    pub fn logout(&mut self) -> ScsiResult<()> {
        let itt = self.next_itt();
        let request = IscsiPdu::logout_request(
            logout::REASON_CLOSE_SESSION,
            self.cid,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
        );
        self.send_raw(&request)?;

        let pdu = self.receive_raw()?;
        if pdu.kind() != Some(Opcode::LogoutResponse) {
            return Err(IscsiError::ProtocolViolation(format!(
                "expected Logout Response, got opcode {:#04x}",
                pdu.opcode
            )));
        }
        self.exp_stat_sn = BigEndian::read_u32(&pdu.specific[4..8]).wrapping_add(1);
        Ok(())
    }
}

impl IscsiPdu {
    /// Client-side helper: extract TargetName values from a Text
    /// Response to a SendTargets request.
    fn parse_text_request_response(&self) -> ScsiResult<Vec<String>> {
        if self.kind() != Some(Opcode::TextResponse) {
            return Err(IscsiError::ProtocolViolation(format!(
                "expected Text Response, got opcode {:#04x}",
                self.opcode
            )));
        }
        Ok(crate::pdu::decode_text_keys(&self.data)
            .into_iter()
            .filter(|(k, _)| k == "TargetName")
            .map(|(_, v)| v)
            .collect())
    }
}
