//! iSCSI PDU framing, parsing and construction
//!
//! Byte-exact codec for the RFC 3720 Basic Header Segment plus data
//! segment. The lifecycle core is agnostic to most of the wire layout;
//! what it needs from this module is opcode identification, the
//! sequence-number fields, and the request/response builders used by
//! the stages.

// Response builders mirror RFC 3720 field lists
#![allow(clippy::too_many_arguments)]

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Write};

/// Basic Header Segment size in bytes
pub const BHS_SIZE: usize = 48;

/// PDU opcodes the core understands (RFC 3720 Section 10)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    // initiator → target
    NopOut,
    ScsiCommand,
    TaskManagementRequest,
    LoginRequest,
    TextRequest,
    ScsiDataOut,
    LogoutRequest,
    // target → initiator
    NopIn,
    ScsiResponse,
    TaskManagementResponse,
    LoginResponse,
    TextResponse,
    ScsiDataIn,
    LogoutResponse,
    ReadyToTransfer,
    Reject,
}

impl Opcode {
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Opcode::NopOut),
            0x01 => Some(Opcode::ScsiCommand),
            0x02 => Some(Opcode::TaskManagementRequest),
            0x03 => Some(Opcode::LoginRequest),
            0x04 => Some(Opcode::TextRequest),
            0x05 => Some(Opcode::ScsiDataOut),
            0x06 => Some(Opcode::LogoutRequest),
            0x20 => Some(Opcode::NopIn),
            0x21 => Some(Opcode::ScsiResponse),
            0x22 => Some(Opcode::TaskManagementResponse),
            0x23 => Some(Opcode::LoginResponse),
            0x24 => Some(Opcode::TextResponse),
            0x25 => Some(Opcode::ScsiDataIn),
            0x26 => Some(Opcode::LogoutResponse),
            0x31 => Some(Opcode::ReadyToTransfer),
            0x3F => Some(Opcode::Reject),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Opcode::NopOut => 0x00,
            Opcode::ScsiCommand => 0x01,
            Opcode::TaskManagementRequest => 0x02,
            Opcode::LoginRequest => 0x03,
            Opcode::TextRequest => 0x04,
            Opcode::ScsiDataOut => 0x05,
            Opcode::LogoutRequest => 0x06,
            Opcode::NopIn => 0x20,
            Opcode::ScsiResponse => 0x21,
            Opcode::TaskManagementResponse => 0x22,
            Opcode::LoginResponse => 0x23,
            Opcode::TextResponse => 0x24,
            Opcode::ScsiDataIn => 0x25,
            Opcode::LogoutResponse => 0x26,
            Opcode::ReadyToTransfer => 0x31,
            Opcode::Reject => 0x3F,
        }
    }

    /// `true` for initiator requests whose BHS carries a CmdSN field at
    /// bytes 24-27.
    pub fn carries_cmd_sn(self) -> bool {
        matches!(
            self,
            Opcode::NopOut
                | Opcode::ScsiCommand
                | Opcode::TaskManagementRequest
                | Opcode::LoginRequest
                | Opcode::TextRequest
                | Opcode::LogoutRequest
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Opcode::NopOut => "NOP-Out",
            Opcode::ScsiCommand => "SCSI Command",
            Opcode::TaskManagementRequest => "Task Management Request",
            Opcode::LoginRequest => "Login Request",
            Opcode::TextRequest => "Text Request",
            Opcode::ScsiDataOut => "SCSI Data-Out",
            Opcode::LogoutRequest => "Logout Request",
            Opcode::NopIn => "NOP-In",
            Opcode::ScsiResponse => "SCSI Response",
            Opcode::TaskManagementResponse => "Task Management Response",
            Opcode::LoginResponse => "Login Response",
            Opcode::TextResponse => "Text Response",
            Opcode::ScsiDataIn => "SCSI Data-In",
            Opcode::LogoutResponse => "Logout Response",
            Opcode::ReadyToTransfer => "Ready To Transfer",
            Opcode::Reject => "Reject",
        };
        f.write_str(name)
    }
}

/// Flag bits shared across PDU types
pub mod flags {
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command directions
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;

    // Login transit bit
    pub const TRANSIT: u8 = 0x80;

    // Data-In status bit
    pub const STATUS: u8 = 0x01;
}

/// Login stage numbers carried in the CSG/NSG flag fields
pub mod login_stage {
    pub const SECURITY_NEGOTIATION: u8 = 0;
    pub const OPERATIONAL_NEGOTIATION: u8 = 1;
    pub const FULL_FEATURE: u8 = 3;
}

/// Login status classes and details (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;

    pub const DETAIL_SUCCESS: u8 = 0x00;
    pub const DETAIL_AUTH_FAILURE: u8 = 0x01;
    pub const DETAIL_TARGET_NOT_FOUND: u8 = 0x03;
    pub const DETAIL_CANT_INCLUDE_IN_SESSION: u8 = 0x08;
    pub const DETAIL_SERVICE_UNAVAILABLE: u8 = 0x01;
}

/// Logout reason codes (request) and response codes
pub mod logout {
    pub const REASON_CLOSE_SESSION: u8 = 0;
    pub const REASON_CLOSE_CONNECTION: u8 = 1;

    pub const RESPONSE_SUCCESS: u8 = 0;
    pub const RESPONSE_CID_NOT_FOUND: u8 = 1;
}

/// Task management response codes
pub mod task_mgmt {
    pub const FUNCTION_COMPLETE: u8 = 0;
    pub const FUNCTION_NOT_SUPPORTED: u8 = 5;
}

/// Reject reason codes
pub mod reject_reason {
    pub const PROTOCOL_ERROR: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x05;
}

/// One framed message unit of the transport.
///
/// The 48-byte BHS is kept mostly raw: byte 0 is split into the
/// immediate bit and opcode, bytes 2-3 (version/response/status,
/// depending on opcode) live in `opcode_bytes`, and bytes 20-47 in
/// `specific`. Typed views are provided by the `parse_*` methods.
#[derive(Debug, Clone)]
pub struct IscsiPdu {
    /// Raw opcode (lower 6 bits of byte 0); may be outside [`Opcode`]
    pub opcode: u8,
    /// Immediate delivery bit (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 of the BHS
    pub opcode_bytes: [u8; 2],
    /// Total AHS length in 4-byte units (byte 4)
    pub ahs_length: u8,
    /// LUN or opcode-specific field (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47)
    pub specific: [u8; 28],
    /// Data segment, unpadded
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiPdu {
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            opcode_bytes: [0; 2],
            ahs_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    /// Typed opcode, or `None` for codes the core does not know.
    pub fn kind(&self) -> Option<Opcode> {
        Opcode::from_wire(self.opcode)
    }

    /// The CmdSN field for request PDUs that carry one.
    ///
    /// All such requests place CmdSN at BHS bytes 24-27.
    pub fn cmd_sn(&self) -> Option<u32> {
        match self.kind() {
            Some(op) if op.carries_cmd_sn() => Some(BigEndian::read_u32(&self.specific[4..8])),
            _ => None,
        }
    }

    /// Parse a PDU from a complete buffer (BHS + optional AHS + padded
    /// data segment).
    pub fn from_bytes(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::ProtocolViolation(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let immediate = (buf[0] & 0x40) != 0;
        let opcode = buf[0] & 0x3F;
        let flags = buf[1];
        let opcode_bytes = [buf[2], buf[3]];
        let ahs_length = buf[4];
        let data_length = ((buf[5] as u32) << 16) | BigEndian::read_u16(&buf[6..8]) as u32;
        let lun = BigEndian::read_u64(&buf[8..16]);
        let itt = BigEndian::read_u32(&buf[16..20]);
        let mut specific = [0u8; 28];
        specific.copy_from_slice(&buf[20..48]);

        let ahs_bytes = (ahs_length as usize) * 4;
        let padded_data_len = (data_length as usize).div_ceil(4) * 4;
        let total_len = BHS_SIZE + ahs_bytes + padded_data_len;
        if buf.len() < total_len {
            return Err(IscsiError::ProtocolViolation(format!(
                "PDU incomplete: {} bytes, need {}",
                buf.len(),
                total_len
            )));
        }

        let data_start = BHS_SIZE + ahs_bytes;
        let data = buf[data_start..data_start + data_length as usize].to_vec();

        Ok(IscsiPdu { opcode, immediate, flags, opcode_bytes, ahs_length, lun, itt, specific, data })
    }

    /// Serialize to the wire format, padding the data segment to a
    /// 4-byte boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        let padded_data_len = self.data.len().div_ceil(4) * 4;
        let mut buf = Vec::with_capacity(BHS_SIZE + padded_data_len);

        buf.push((if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F));
        buf.push(self.flags);
        buf.extend_from_slice(&self.opcode_bytes);
        buf.push(self.ahs_length);

        let data_len = self.data.len() as u32;
        buf.push(((data_len >> 16) & 0xFF) as u8);
        buf.extend_from_slice(&((data_len & 0xFFFF) as u16).to_be_bytes());

        buf.extend_from_slice(&self.lun.to_be_bytes());
        buf.extend_from_slice(&self.itt.to_be_bytes());
        buf.extend_from_slice(&self.specific);

        buf.extend_from_slice(&self.data);
        buf.resize(BHS_SIZE + padded_data_len, 0);

        buf
    }

    /// Receive one PDU from a blocking byte stream: the fixed BHS
    /// first, then the padded data segment it announces.
    pub fn read_from<R: Read>(reader: &mut R) -> ScsiResult<Self> {
        let mut buf = vec![0u8; BHS_SIZE];
        reader.read_exact(&mut buf)?;

        let ahs_bytes = (buf[4] as usize) * 4;
        let data_len = ((buf[5] as usize) << 16) | BigEndian::read_u16(&buf[6..8]) as usize;
        let trailer = ahs_bytes + data_len.div_ceil(4) * 4;
        if trailer > 0 {
            let start = buf.len();
            buf.resize(start + trailer, 0);
            reader.read_exact(&mut buf[start..])?;
        }

        Self::from_bytes(&buf)
    }

    /// Serialize and send this PDU over a blocking byte stream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> ScsiResult<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// Login
// ============================================================================

/// Parsed Login Request
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub parameters: Vec<(String, String)>,
}

impl IscsiPdu {
    /// Build a Login Request PDU (initiator side).
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: u8,
        nsg: u8,
        transit: bool,
        itt: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::LoginRequest.to_wire();
        pdu.immediate = true;
        pdu.flags = (if transit { flags::TRANSIT } else { 0 }) | ((csg & 0x03) << 2) | (nsg & 0x03);
        // bytes 2-3: Version-max / Version-active, both 0x00
        pdu.lun = isid_tsih_field(isid, tsih);
        pdu.itt = itt;
        BigEndian::write_u16(&mut pdu.specific[0..2], cid);
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        pdu.data = data;
        pdu
    }

    pub fn parse_login_request(&self) -> ScsiResult<LoginRequest> {
        self.expect_kind(Opcode::LoginRequest)?;

        let lun_bytes = self.lun.to_be_bytes();
        let mut isid = [0u8; 6];
        isid.copy_from_slice(&lun_bytes[0..6]);

        Ok(LoginRequest {
            isid,
            tsih: BigEndian::read_u16(&lun_bytes[6..8]),
            cid: BigEndian::read_u16(&self.specific[0..2]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            transit: (self.flags & flags::TRANSIT) != 0,
            cont: (self.flags & flags::CONTINUE) != 0,
            csg: (self.flags >> 2) & 0x03,
            nsg: self.flags & 0x03,
            parameters: decode_text_keys(&self.data),
        })
    }

    /// Build a Login Response PDU.
    pub fn login_response(
        isid: [u8; 6],
        tsih: u16,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status_class: u8,
        status_detail: u8,
        csg: u8,
        nsg: u8,
        transit: bool,
        itt: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::LoginResponse.to_wire();
        pdu.flags = (if transit { flags::TRANSIT } else { 0 }) | ((csg & 0x03) << 2) | (nsg & 0x03);
        pdu.lun = isid_tsih_field(isid, tsih);
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        pdu.specific[16] = status_class;
        pdu.specific[17] = status_detail;
        pdu.data = data;
        pdu
    }
}

/// Parsed Login Response (initiator side)
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub tsih: u16,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status_class: u8,
    pub status_detail: u8,
    pub transit: bool,
    pub csg: u8,
    pub nsg: u8,
    pub parameters: Vec<(String, String)>,
}

impl IscsiPdu {
    pub fn parse_login_response(&self) -> ScsiResult<LoginResponse> {
        self.expect_kind(Opcode::LoginResponse)?;

        let lun_bytes = self.lun.to_be_bytes();
        Ok(LoginResponse {
            tsih: BigEndian::read_u16(&lun_bytes[6..8]),
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_cmd_sn: BigEndian::read_u32(&self.specific[8..12]),
            max_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            status_class: self.specific[16],
            status_detail: self.specific[17],
            transit: (self.flags & flags::TRANSIT) != 0,
            csg: (self.flags >> 2) & 0x03,
            nsg: self.flags & 0x03,
            parameters: decode_text_keys(&self.data),
        })
    }
}

fn isid_tsih_field(isid: [u8; 6], tsih: u16) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[0..6].copy_from_slice(&isid);
    bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
    u64::from_be_bytes(bytes)
}

// ============================================================================
// SCSI command / response / data movement
// ============================================================================

/// Parsed SCSI Command request
#[derive(Debug, Clone)]
pub struct ScsiCommandRequest {
    pub lun: u64,
    pub itt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub expected_data_length: u32,
    pub cdb: [u8; 16],
    pub read: bool,
    pub write: bool,
    pub final_flag: bool,
}

/// Parsed SCSI Data-Out PDU
#[derive(Debug, Clone)]
pub struct DataOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub data: Vec<u8>,
    pub final_flag: bool,
}

impl IscsiPdu {
    /// Build a SCSI Command PDU (initiator side). `cdb` is copied into
    /// the 16-byte CDB field, zero padded.
    pub fn scsi_command(
        lun: u64,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        expected_data_length: u32,
        cdb: &[u8],
        read: bool,
        write: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::ScsiCommand.to_wire();
        pdu.flags = flags::FINAL
            | (if read { flags::READ } else { 0 })
            | (if write { flags::WRITE } else { 0 });
        pdu.lun = lun;
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[0..4], expected_data_length);
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        let n = cdb.len().min(16);
        pdu.specific[12..12 + n].copy_from_slice(&cdb[..n]);
        pdu.data = data;
        pdu
    }

    pub fn parse_scsi_command(&self) -> ScsiResult<ScsiCommandRequest> {
        self.expect_kind(Opcode::ScsiCommand)?;

        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&self.specific[12..28]);

        Ok(ScsiCommandRequest {
            lun: self.lun,
            itt: self.itt,
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            expected_data_length: BigEndian::read_u32(&self.specific[0..4]),
            cdb,
            read: (self.flags & flags::READ) != 0,
            write: (self.flags & flags::WRITE) != 0,
            final_flag: (self.flags & flags::FINAL) != 0,
        })
    }

    /// Build a SCSI Response PDU. Response and status go in BHS bytes
    /// 2-3; optional sense data travels in the data segment.
    pub fn scsi_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
        status: u8,
        sense_data: Option<&[u8]>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::ScsiResponse.to_wire();
        pdu.flags = flags::FINAL;
        pdu.opcode_bytes = [response, status];
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        if let Some(sense) = sense_data {
            // sense data is prefixed by a two-byte length per RFC 3720 10.4.7
            let mut data = Vec::with_capacity(2 + sense.len());
            data.extend_from_slice(&(sense.len() as u16).to_be_bytes());
            data.extend_from_slice(sense);
            pdu.data = data;
        }
        pdu
    }

    /// Build a SCSI Data-In PDU; `status` piggybacks GOOD status on the
    /// final PDU of the sequence (S bit).
    pub fn scsi_data_in(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
        status: Option<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::ScsiDataIn.to_wire();
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        if let Some(status) = status {
            pdu.flags |= flags::STATUS;
            pdu.opcode_bytes[1] = status;
        }
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[0..4], crate::serial::RESERVED_TAG);
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[16..20], data_sn);
        BigEndian::write_u32(&mut pdu.specific[20..24], buffer_offset);
        pdu.data = data;
        pdu
    }

    pub fn parse_data_out(&self) -> ScsiResult<DataOutPdu> {
        self.expect_kind(Opcode::ScsiDataOut)?;

        Ok(DataOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            data_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            data: self.data.clone(),
            final_flag: (self.flags & flags::FINAL) != 0,
        })
    }

    /// Build a SCSI Data-Out PDU (initiator side).
    pub fn data_out(
        lun: u64,
        itt: u32,
        ttt: u32,
        exp_stat_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::ScsiDataOut.to_wire();
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.lun = lun;
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[0..4], ttt);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        BigEndian::write_u32(&mut pdu.specific[16..20], data_sn);
        BigEndian::write_u32(&mut pdu.specific[20..24], buffer_offset);
        pdu.data = data;
        pdu
    }

    /// Build a Ready To Transfer PDU soliciting `desired_length` bytes
    /// of Data-Out starting at `buffer_offset`. R2T carries no status,
    /// so StatSN is reported without being consumed.
    pub fn ready_to_transfer(
        lun: u64,
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        r2t_sn: u32,
        buffer_offset: u32,
        desired_length: u32,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::ReadyToTransfer.to_wire();
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[0..4], ttt);
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[16..20], r2t_sn);
        BigEndian::write_u32(&mut pdu.specific[20..24], buffer_offset);
        BigEndian::write_u32(&mut pdu.specific[24..28], desired_length);
        pdu
    }
}

// ============================================================================
// NOP, Logout, Text, Task Management, Reject
// ============================================================================

/// Parsed NOP-Out
#[derive(Debug, Clone)]
pub struct NopOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

/// Parsed Logout Request
#[derive(Debug, Clone)]
pub struct LogoutRequest {
    pub itt: u32,
    pub reason: u8,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

/// Parsed Text Request
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub final_flag: bool,
    pub cont: bool,
    pub parameters: Vec<(String, String)>,
}

/// Parsed Task Management Request
#[derive(Debug, Clone)]
pub struct TaskManagementRequest {
    pub itt: u32,
    pub function: u8,
    pub referenced_task_tag: u32,
    pub cmd_sn: u32,
}

impl IscsiPdu {
    pub fn parse_nop_out(&self) -> ScsiResult<NopOutPdu> {
        self.expect_kind(Opcode::NopOut)?;

        Ok(NopOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            data: self.data.clone(),
        })
    }

    /// Build a NOP-Out PDU (initiator side ping).
    pub fn nop_out(
        lun: u64,
        itt: u32,
        ttt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        immediate: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::NopOut.to_wire();
        pdu.immediate = immediate;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[0..4], ttt);
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        pdu.data = data;
        pdu
    }

    /// Build a NOP-In PDU echoing a ping payload.
    pub fn nop_in(
        lun: u64,
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::NopIn.to_wire();
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[0..4], ttt);
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        pdu.data = data;
        pdu
    }

    pub fn parse_logout_request(&self) -> ScsiResult<LogoutRequest> {
        self.expect_kind(Opcode::LogoutRequest)?;

        Ok(LogoutRequest {
            itt: self.itt,
            reason: self.flags & 0x7F,
            cid: BigEndian::read_u16(&self.specific[0..2]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
        })
    }

    /// Build a Logout Response PDU.
    pub fn logout_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
        time2wait: u16,
        time2retain: u16,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::LogoutResponse.to_wire();
        pdu.flags = flags::FINAL;
        pdu.opcode_bytes[0] = response;
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        BigEndian::write_u16(&mut pdu.specific[20..22], time2wait);
        BigEndian::write_u16(&mut pdu.specific[22..24], time2retain);
        pdu
    }

    /// Build a Logout Request PDU (initiator side).
    pub fn logout_request(reason: u8, cid: u16, itt: u32, cmd_sn: u32, exp_stat_sn: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::LogoutRequest.to_wire();
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (reason & 0x7F);
        pdu.itt = itt;
        BigEndian::write_u16(&mut pdu.specific[0..2], cid);
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        pdu
    }

    /// Build a Text Request PDU (initiator side).
    pub fn text_request(
        itt: u32,
        ttt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::TextRequest.to_wire();
        pdu.flags = flags::FINAL;
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[0..4], ttt);
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        pdu.data = data;
        pdu
    }

    pub fn parse_text_request(&self) -> ScsiResult<TextRequest> {
        self.expect_kind(Opcode::TextRequest)?;

        Ok(TextRequest {
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            final_flag: (self.flags & flags::FINAL) != 0,
            cont: (self.flags & flags::CONTINUE) != 0,
            parameters: decode_text_keys(&self.data),
        })
    }

    /// Build a Text Response PDU.
    pub fn text_response(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::TextResponse.to_wire();
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[0..4], ttt);
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        pdu.data = data;
        pdu
    }

    pub fn parse_task_mgmt_request(&self) -> ScsiResult<TaskManagementRequest> {
        self.expect_kind(Opcode::TaskManagementRequest)?;

        Ok(TaskManagementRequest {
            itt: self.itt,
            function: self.flags & 0x7F,
            referenced_task_tag: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
        })
    }

    /// Build a Task Management Response PDU.
    pub fn task_mgmt_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::TaskManagementResponse.to_wire();
        pdu.flags = flags::FINAL;
        pdu.opcode_bytes[0] = response;
        pdu.itt = itt;
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        pdu
    }

    /// Build a Reject PDU carrying the offending PDU's header as data.
    pub fn reject(
        reason: u8,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        rejected_header: &[u8],
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::Reject.to_wire();
        pdu.flags = flags::FINAL;
        pdu.opcode_bytes[0] = reason;
        pdu.itt = crate::serial::RESERVED_TAG;
        BigEndian::write_u32(&mut pdu.specific[4..8], stat_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[12..16], max_cmd_sn);
        pdu.data = rejected_header.to_vec();
        pdu
    }

    fn expect_kind(&self, expected: Opcode) -> ScsiResult<()> {
        if self.kind() == Some(expected) {
            Ok(())
        } else {
            Err(IscsiError::ProtocolViolation(format!(
                "expected {} (0x{:02x}), got opcode 0x{:02x}",
                expected,
                expected.to_wire(),
                self.opcode
            )))
        }
    }
}

// ============================================================================
// Text key=value codec
// ============================================================================

/// Decode null-terminated `key=value` pairs from a text data segment.
/// Malformed chunks without `=` are skipped.
pub fn decode_text_keys(data: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let s = String::from_utf8_lossy(chunk);
        if let Some(eq) = s.find('=') {
            pairs.push((s[..eq].to_string(), s[eq + 1..].to_string()));
        }
    }
    pairs
}

/// Encode `key=value` pairs into the null-terminated text format.
pub fn encode_text_keys(pairs: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in pairs {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::status as scsi_status;

    #[test]
    fn test_roundtrip_bare_bhs() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::NopOut.to_wire();
        pdu.flags = flags::FINAL;
        pdu.itt = 0x12345678;
        pdu.lun = 0x0001020304050607;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind(), Some(Opcode::NopOut));
        assert_eq!(parsed.flags, flags::FINAL);
        assert_eq!(parsed.itt, 0x12345678);
        assert_eq!(parsed.lun, 0x0001020304050607);
    }

    #[test]
    fn test_roundtrip_with_data_and_padding() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::TextRequest.to_wire();
        pdu.data = vec![1, 2, 3]; // pads to 4
        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE + 4);
        assert_eq!(bytes.len() % 4, 0);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_read_from_stream() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::LoginRequest.to_wire();
        pdu.data = b"InitiatorName=iqn.test\0".to_vec();
        let bytes = pdu.to_bytes();

        let mut cursor = std::io::Cursor::new(bytes);
        let parsed = IscsiPdu::read_from(&mut cursor).unwrap();
        assert_eq!(parsed.kind(), Some(Opcode::LoginRequest));
        assert_eq!(parsed.data, pdu.data);
    }

    #[test]
    fn test_truncated_pdu_rejected() {
        assert!(IscsiPdu::from_bytes(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_immediate_bit() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = Opcode::LoginRequest.to_wire();
        pdu.immediate = true;
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0] & 0x40, 0x40);
        assert!(IscsiPdu::from_bytes(&bytes).unwrap().immediate);
    }

    #[test]
    fn test_cmd_sn_accessor() {
        let pdu = IscsiPdu::nop_out(0, 5, crate::serial::RESERVED_TAG, 42, 7, false, vec![]);
        assert_eq!(pdu.cmd_sn(), Some(42));

        // responses carry no CmdSN
        let resp = IscsiPdu::nop_in(0, 5, crate::serial::RESERVED_TAG, 1, 43, 74, vec![]);
        assert_eq!(resp.cmd_sn(), None);
    }

    #[test]
    fn test_login_request_roundtrip() {
        let isid = [0x00, 0x02, 0x3D, 0x01, 0x02, 0x03];
        let pdu = IscsiPdu::login_request(
            isid,
            0,
            1,
            9,
            3,
            login_stage::OPERATIONAL_NEGOTIATION,
            login_stage::FULL_FEATURE,
            true,
            0xAB,
            encode_text_keys(&[("SessionType".into(), "Normal".into())]),
        );
        let req = pdu.parse_login_request().unwrap();
        assert_eq!(req.isid, isid);
        assert_eq!(req.cid, 1);
        assert_eq!(req.cmd_sn, 9);
        assert_eq!(req.exp_stat_sn, 3);
        assert!(req.transit);
        assert_eq!(req.csg, login_stage::OPERATIONAL_NEGOTIATION);
        assert_eq!(req.nsg, login_stage::FULL_FEATURE);
        assert_eq!(req.parameters, vec![("SessionType".to_string(), "Normal".to_string())]);
    }

    #[test]
    fn test_scsi_response_status_bytes() {
        let pdu = IscsiPdu::scsi_response(7, 1, 2, 33, 0, scsi_status::CHECK_CONDITION, Some(&[0x70, 0, 5]));
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[2], 0); // response: command completed
        assert_eq!(bytes[3], scsi_status::CHECK_CONDITION);
        // sense length prefix
        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(&parsed.data[0..2], &[0, 3]);
        assert_eq!(&parsed.data[2..], &[0x70, 0, 5]);
    }

    #[test]
    fn test_data_out_roundtrip() {
        let pdu = IscsiPdu::data_out(0, 11, 0x55, 9, 0, 512, vec![0xAA; 16], true);
        let out = pdu.parse_data_out().unwrap();
        assert_eq!(out.itt, 11);
        assert_eq!(out.ttt, 0x55);
        assert_eq!(out.buffer_offset, 512);
        assert!(out.final_flag);
        assert_eq!(out.data.len(), 16);
    }

    #[test]
    fn test_r2t_fields() {
        let pdu = IscsiPdu::ready_to_transfer(0, 3, 0x77, 10, 4, 35, 0, 8192, 4096);
        assert_eq!(pdu.kind(), Some(Opcode::ReadyToTransfer));
        assert_eq!(BigEndian::read_u32(&pdu.specific[0..4]), 0x77);
        assert_eq!(BigEndian::read_u32(&pdu.specific[20..24]), 8192);
        assert_eq!(BigEndian::read_u32(&pdu.specific[24..28]), 4096);
    }

    #[test]
    fn test_reject_carries_header() {
        let header = [0x3Bu8; BHS_SIZE];
        let pdu = IscsiPdu::reject(reject_reason::COMMAND_NOT_SUPPORTED, 1, 2, 33, &header);
        assert_eq!(pdu.opcode_bytes[0], reject_reason::COMMAND_NOT_SUPPORTED);
        assert_eq!(pdu.itt, crate::serial::RESERVED_TAG);
        assert_eq!(pdu.data, header);
    }

    #[test]
    fn test_text_key_codec() {
        let pairs = vec![
            ("Key1".to_string(), "Value1".to_string()),
            ("Key2".to_string(), "Value2".to_string()),
        ];
        let data = encode_text_keys(&pairs);
        assert_eq!(data, b"Key1=Value1\0Key2=Value2\0");
        assert_eq!(decode_text_keys(&data), pairs);
    }

    #[test]
    fn test_text_key_decode_skips_garbage() {
        let pairs = decode_text_keys(b"NoEquals\0Good=Yes\0");
        assert_eq!(pairs, vec![("Good".to_string(), "Yes".to_string())]);
    }

    #[test]
    fn test_unknown_opcode_kind() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = 0x3B;
        assert_eq!(pdu.kind(), None);
        assert_eq!(pdu.cmd_sn(), None);
    }
}
