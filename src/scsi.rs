//! SCSI block command execution over a storage backend
//!
//! [`StorageDevice`] is the trait storage backends implement; the
//! session's full-feature stage calls [`execute`] with the CDB and any
//! solicited Data-Out payload. Command failures never surface as crate
//! errors: they become CHECK CONDITION replies with fixed-format sense
//! data, so only transport faults can tear down a connection.

use crate::error::ScsiResult;
use byteorder::{BigEndian, ByteOrder};

/// Block storage backend behind an iSCSI target.
///
/// Implementations are driven from one session thread at a time; the
/// session serializes access. `close` is called exactly once when the
/// session is torn down.
pub trait StorageDevice: Send {
    /// Read `blocks` logical blocks starting at `lba`.
    fn read_blocks(&mut self, lba: u64, blocks: u32) -> ScsiResult<Vec<u8>>;

    /// Write `data` (a whole number of blocks) starting at `lba`.
    fn write_blocks(&mut self, lba: u64, data: &[u8]) -> ScsiResult<()>;

    /// Total capacity in logical blocks.
    fn block_count(&self) -> u64;

    /// Logical block size in bytes, typically 512 or 4096.
    fn block_size(&self) -> u32;

    fn flush(&mut self) -> ScsiResult<()> {
        Ok(())
    }

    /// Release backend resources. Called once per session at teardown.
    fn close(&mut self) -> ScsiResult<()> {
        Ok(())
    }

    fn vendor_id(&self) -> &str {
        "ISCSI"
    }

    fn product_id(&self) -> &str {
        "Virtual Disk"
    }

    fn product_rev(&self) -> &str {
        "1.0"
    }
}

/// SCSI status codes carried in the SCSI Response PDU.
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;
}

/// Sense key codes.
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional sense codes.
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const WRITE_FAULT: u8 = 0x03;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
}

/// Fixed-format sense data (SPC-3 section 4.5.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: u32,
}

impl SenseData {
    pub fn new(key: u8, asc: u8, ascq: u8) -> Self {
        SenseData { key, asc, ascq, information: 0 }
    }

    pub fn with_information(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    pub fn invalid_opcode() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    pub fn invalid_field() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    }

    pub fn lba_out_of_range(lba: u64) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0)
            .with_information(lba as u32)
    }

    pub fn read_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0)
    }

    pub fn write_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::WRITE_FAULT, 0)
    }

    pub fn lun_not_supported() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0)
    }

    /// 18-byte fixed-format encoding, response code 0x70 (current error).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 18];
        out[0] = 0x70;
        out[2] = self.key & 0x0F;
        BigEndian::write_u32(&mut out[3..7], self.information);
        out[7] = 10;
        out[12] = self.asc;
        out[13] = self.ascq;
        out
    }
}

/// Outcome of executing one SCSI command.
#[derive(Debug, Clone)]
pub struct ScsiReply {
    pub status: u8,
    /// Data-In payload for read-class commands.
    pub data: Vec<u8>,
    pub sense: Option<SenseData>,
}

impl ScsiReply {
    pub fn good(data: Vec<u8>) -> Self {
        ScsiReply { status: status::GOOD, data, sense: None }
    }

    pub fn good_no_data() -> Self {
        Self::good(Vec::new())
    }

    pub fn check_condition(sense: SenseData) -> Self {
        ScsiReply { status: status::CHECK_CONDITION, data: Vec::new(), sense: Some(sense) }
    }
}

/// Execute one SCSI command against `device`.
///
/// `data_out` carries the solicited/unsolicited write payload for
/// write-class commands. All command-level failures are reported as
/// CHECK CONDITION.
pub fn execute(device: &mut dyn StorageDevice, cdb: &[u8], data_out: Option<&[u8]>) -> ScsiReply {
    let Some(&opcode) = cdb.first() else {
        return ScsiReply::check_condition(SenseData::invalid_field());
    };
    match opcode {
        0x00 => ScsiReply::good_no_data(), // TEST UNIT READY
        0x03 => request_sense(cdb),
        0x12 => inquiry(device, cdb),
        0x1A => mode_sense_6(cdb),
        0x1B => ScsiReply::good_no_data(), // START STOP UNIT
        0x25 => read_capacity_10(device),
        0x28 => read(device, parse_rw10(cdb)),
        0x2A => write(device, parse_rw10(cdb), data_out),
        0x2F | 0x8F => ScsiReply::good_no_data(), // VERIFY without BYTCHK
        0x35 | 0x91 => synchronize_cache(device),
        0x5A => mode_sense_10(cdb),
        0x88 => read(device, parse_rw16(cdb)),
        0x8A => write(device, parse_rw16(cdb), data_out),
        0x9E => service_action_in_16(device, cdb),
        0xA0 => report_luns(cdb),
        _ => {
            log::debug!("unsupported SCSI opcode {opcode:#04x}");
            ScsiReply::check_condition(SenseData::invalid_opcode())
        }
    }
}

fn parse_rw10(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 10 {
        return None;
    }
    Some((BigEndian::read_u32(&cdb[2..6]) as u64, BigEndian::read_u16(&cdb[7..9]) as u32))
}

fn parse_rw16(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 16 {
        return None;
    }
    Some((BigEndian::read_u64(&cdb[2..10]), BigEndian::read_u32(&cdb[10..14])))
}

fn read(device: &mut dyn StorageDevice, range: Option<(u64, u32)>) -> ScsiReply {
    let Some((lba, blocks)) = range else {
        return ScsiReply::check_condition(SenseData::invalid_field());
    };
    if blocks == 0 {
        return ScsiReply::good_no_data();
    }
    // checked: a READ(16) CDB can carry an LBA near u64::MAX
    match lba.checked_add(blocks as u64) {
        Some(end) if end <= device.block_count() => {}
        _ => return ScsiReply::check_condition(SenseData::lba_out_of_range(lba)),
    }
    match device.read_blocks(lba, blocks) {
        Ok(data) => ScsiReply::good(data),
        Err(e) => {
            log::warn!("read of {blocks} blocks at lba {lba} failed: {e}");
            ScsiReply::check_condition(SenseData::read_error())
        }
    }
}

fn write(device: &mut dyn StorageDevice, range: Option<(u64, u32)>, data_out: Option<&[u8]>) -> ScsiReply {
    let Some((lba, blocks)) = range else {
        return ScsiReply::check_condition(SenseData::invalid_field());
    };
    if blocks == 0 {
        return ScsiReply::good_no_data();
    }
    match lba.checked_add(blocks as u64) {
        Some(end) if end <= device.block_count() => {}
        _ => return ScsiReply::check_condition(SenseData::lba_out_of_range(lba)),
    }
    let expected = blocks as usize * device.block_size() as usize;
    let Some(data) = data_out else {
        return ScsiReply::check_condition(SenseData::invalid_field());
    };
    if data.len() < expected {
        log::warn!("short write payload: got {} of {expected} bytes", data.len());
        return ScsiReply::check_condition(SenseData::invalid_field());
    }
    match device.write_blocks(lba, &data[..expected]) {
        Ok(()) => ScsiReply::good_no_data(),
        Err(e) => {
            log::warn!("write of {blocks} blocks at lba {lba} failed: {e}");
            ScsiReply::check_condition(SenseData::write_error())
        }
    }
}

fn inquiry(device: &mut dyn StorageDevice, cdb: &[u8]) -> ScsiReply {
    if cdb.len() < 6 {
        return ScsiReply::check_condition(SenseData::invalid_field());
    }
    let evpd = cdb[1] & 0x01;
    let page_code = cdb[2];
    let alloc_len = BigEndian::read_u16(&cdb[3..5]) as usize;

    if evpd != 0 {
        return inquiry_vpd(page_code, alloc_len);
    }

    let mut data = vec![0u8; 36];
    data[0] = 0x00; // direct-access block device
    data[2] = 0x05; // SPC-3
    data[3] = 0x12; // response format 2, HiSup
    data[4] = 31; // additional length
    data[7] = 0x02; // CmdQue
    pad_ascii(&mut data[8..16], device.vendor_id());
    pad_ascii(&mut data[16..32], device.product_id());
    pad_ascii(&mut data[32..36], device.product_rev());
    data.truncate(alloc_len.min(data.len()));
    ScsiReply::good(data)
}

fn inquiry_vpd(page_code: u8, alloc_len: usize) -> ScsiReply {
    let mut data = match page_code {
        0x00 => vec![0x00, 0x00, 0x00, 2, 0x00, 0x80],
        0x80 => {
            let mut d = vec![0x00, 0x80, 0x00, 16];
            d.extend_from_slice(b"ISCSI00000000001");
            d
        }
        _ => return ScsiReply::check_condition(SenseData::invalid_field()),
    };
    data.truncate(alloc_len.min(data.len()));
    ScsiReply::good(data)
}

fn read_capacity_10(device: &mut dyn StorageDevice) -> ScsiReply {
    let last_lba = device.block_count().saturating_sub(1);
    let mut data = vec![0u8; 8];
    // 0xFFFFFFFF signals the initiator to use READ CAPACITY 16
    let last_lba_32 = u32::try_from(last_lba).unwrap_or(u32::MAX);
    BigEndian::write_u32(&mut data[0..4], last_lba_32);
    BigEndian::write_u32(&mut data[4..8], device.block_size());
    ScsiReply::good(data)
}

fn service_action_in_16(device: &mut dyn StorageDevice, cdb: &[u8]) -> ScsiReply {
    if cdb.len() < 16 || cdb[1] & 0x1F != 0x10 {
        return ScsiReply::check_condition(SenseData::invalid_field());
    }
    let alloc_len = BigEndian::read_u32(&cdb[10..14]) as usize;
    let mut data = vec![0u8; 32];
    BigEndian::write_u64(&mut data[0..8], device.block_count().saturating_sub(1));
    BigEndian::write_u32(&mut data[8..12], device.block_size());
    data.truncate(alloc_len.min(data.len()));
    ScsiReply::good(data)
}

fn mode_sense_6(cdb: &[u8]) -> ScsiReply {
    if cdb.len() < 6 {
        return ScsiReply::check_condition(SenseData::invalid_field());
    }
    let alloc_len = cdb[4] as usize;
    // minimal mode parameter header, no block descriptors or pages
    let mut data = vec![3, 0, 0, 0];
    data.truncate(alloc_len.min(data.len()));
    ScsiReply::good(data)
}

fn mode_sense_10(cdb: &[u8]) -> ScsiReply {
    if cdb.len() < 10 {
        return ScsiReply::check_condition(SenseData::invalid_field());
    }
    let alloc_len = BigEndian::read_u16(&cdb[7..9]) as usize;
    let mut data = vec![0u8; 8];
    BigEndian::write_u16(&mut data[0..2], 6);
    data.truncate(alloc_len.min(data.len()));
    ScsiReply::good(data)
}

fn request_sense(cdb: &[u8]) -> ScsiReply {
    if cdb.len() < 6 {
        return ScsiReply::check_condition(SenseData::invalid_field());
    }
    let alloc_len = cdb[4] as usize;
    let mut data = SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE, 0).to_bytes();
    data.truncate(alloc_len.min(data.len()));
    ScsiReply::good(data)
}

fn synchronize_cache(device: &mut dyn StorageDevice) -> ScsiReply {
    match device.flush() {
        Ok(()) => ScsiReply::good_no_data(),
        Err(e) => {
            log::warn!("cache flush failed: {e}");
            ScsiReply::check_condition(SenseData::write_error())
        }
    }
}

fn report_luns(cdb: &[u8]) -> ScsiReply {
    if cdb.len() < 12 {
        return ScsiReply::check_condition(SenseData::invalid_field());
    }
    let alloc_len = BigEndian::read_u32(&cdb[6..10]) as usize;
    // LUN 0 only
    let mut data = vec![0u8; 16];
    BigEndian::write_u32(&mut data[0..4], 8);
    data.truncate(alloc_len.min(data.len()));
    ScsiReply::good(data)
}

fn pad_ascii(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemDevice {
        blocks: u64,
        block_size: u32,
        data: Vec<u8>,
        flushes: u32,
    }

    impl MemDevice {
        fn new(blocks: u64, block_size: u32) -> Self {
            MemDevice {
                blocks,
                block_size,
                data: vec![0u8; (blocks * block_size as u64) as usize],
                flushes: 0,
            }
        }
    }

    impl StorageDevice for MemDevice {
        fn read_blocks(&mut self, lba: u64, blocks: u32) -> ScsiResult<Vec<u8>> {
            let start = (lba * self.block_size as u64) as usize;
            let len = (blocks * self.block_size) as usize;
            Ok(self.data[start..start + len].to_vec())
        }

        fn write_blocks(&mut self, lba: u64, data: &[u8]) -> ScsiResult<()> {
            let start = (lba * self.block_size as u64) as usize;
            self.data[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn block_count(&self) -> u64 {
            self.blocks
        }

        fn block_size(&self) -> u32 {
            self.block_size
        }

        fn flush(&mut self) -> ScsiResult<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_test_unit_ready() {
        let mut dev = MemDevice::new(100, 512);
        let reply = execute(&mut dev, &[0x00, 0, 0, 0, 0, 0], None);
        assert_eq!(reply.status, status::GOOD);
    }

    #[test]
    fn test_inquiry_standard() {
        let mut dev = MemDevice::new(100, 512);
        let reply = execute(&mut dev, &[0x12, 0, 0, 0, 36, 0], None);
        assert_eq!(reply.status, status::GOOD);
        assert_eq!(reply.data.len(), 36);
        assert_eq!(reply.data[0], 0x00);
        assert_eq!(&reply.data[8..13], b"ISCSI");
    }

    #[test]
    fn test_read_capacity_10() {
        let mut dev = MemDevice::new(1000, 512);
        let reply = execute(&mut dev, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], None);
        assert_eq!(BigEndian::read_u32(&reply.data[0..4]), 999);
        assert_eq!(BigEndian::read_u32(&reply.data[4..8]), 512);
    }

    #[test]
    fn test_read_capacity_16() {
        let mut dev = MemDevice::new(1000, 4096);
        let cdb = [0x9E, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 32, 0, 0];
        let reply = execute(&mut dev, &cdb, None);
        assert_eq!(BigEndian::read_u64(&reply.data[0..8]), 999);
        assert_eq!(BigEndian::read_u32(&reply.data[8..12]), 4096);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut dev = MemDevice::new(100, 512);
        let payload = vec![0xAB; 512];
        // WRITE(10) lba=5, 1 block
        let write_cdb = [0x2A, 0, 0, 0, 0, 5, 0, 0, 1, 0];
        let reply = execute(&mut dev, &write_cdb, Some(&payload));
        assert_eq!(reply.status, status::GOOD);

        let read_cdb = [0x28, 0, 0, 0, 0, 5, 0, 0, 1, 0];
        let reply = execute(&mut dev, &read_cdb, None);
        assert_eq!(reply.status, status::GOOD);
        assert_eq!(reply.data, payload);
    }

    #[test]
    fn test_read_out_of_range() {
        let mut dev = MemDevice::new(100, 512);
        let cdb = [0x28, 0, 0, 0, 0, 200, 0, 0, 1, 0];
        let reply = execute(&mut dev, &cdb, None);
        assert_eq!(reply.status, status::CHECK_CONDITION);
        let sense = reply.sense.unwrap();
        assert_eq!(sense.key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.asc, asc::LBA_OUT_OF_RANGE);
    }

    #[test]
    fn test_read16_lba_at_end_of_address_space() {
        // lba + blocks must not wrap around u64
        let mut dev = MemDevice::new(100, 512);
        let mut cdb = [0u8; 16];
        cdb[0] = 0x88;
        BigEndian::write_u64(&mut cdb[2..10], u64::MAX);
        BigEndian::write_u32(&mut cdb[10..14], 2);
        let reply = execute(&mut dev, &cdb, None);
        assert_eq!(reply.status, status::CHECK_CONDITION);
        let sense = reply.sense.unwrap();
        assert_eq!(sense.key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.asc, asc::LBA_OUT_OF_RANGE);

        cdb[0] = 0x8A;
        let payload = vec![0u8; 1024];
        let reply = execute(&mut dev, &cdb, Some(&payload));
        assert_eq!(reply.status, status::CHECK_CONDITION);
        assert_eq!(reply.sense.unwrap().asc, asc::LBA_OUT_OF_RANGE);
    }

    #[test]
    fn test_write_without_payload() {
        let mut dev = MemDevice::new(100, 512);
        let cdb = [0x2A, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        let reply = execute(&mut dev, &cdb, None);
        assert_eq!(reply.status, status::CHECK_CONDITION);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut dev = MemDevice::new(100, 512);
        let reply = execute(&mut dev, &[0xFF, 0, 0, 0, 0, 0], None);
        assert_eq!(reply.status, status::CHECK_CONDITION);
        assert_eq!(reply.sense.unwrap().asc, asc::INVALID_COMMAND_OPERATION_CODE);
    }

    #[test]
    fn test_synchronize_cache_flushes() {
        let mut dev = MemDevice::new(100, 512);
        let reply = execute(&mut dev, &[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0], None);
        assert_eq!(reply.status, status::GOOD);
        assert_eq!(dev.flushes, 1);
    }

    #[test]
    fn test_report_luns() {
        let mut dev = MemDevice::new(100, 512);
        let cdb = [0xA0, 0, 0, 0, 0, 0, 0, 0, 0, 16, 0, 0];
        let reply = execute(&mut dev, &cdb, None);
        assert_eq!(reply.data.len(), 16);
        assert_eq!(BigEndian::read_u32(&reply.data[0..4]), 8);
    }

    #[test]
    fn test_sense_encoding() {
        let sense = SenseData::lba_out_of_range(42);
        let bytes = sense.to_bytes();
        assert_eq!(bytes.len(), 18);
        assert_eq!(bytes[0], 0x70);
        assert_eq!(bytes[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(BigEndian::read_u32(&bytes[3..7]), 42);
        assert_eq!(bytes[12], asc::LBA_OUT_OF_RANGE);
    }
}
