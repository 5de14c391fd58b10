//! Simple iSCSI target example with in-memory storage
//!
//! This example demonstrates how to create an iSCSI target backed by
//! a simple in-memory storage device.

use iscsi_target_core::{IscsiError, IscsiTarget, ScsiResult, StorageDevice};

const BLOCK_SIZE: u32 = 512;

/// Simple in-memory storage backend
struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    fn new(size_mb: usize) -> Self {
        MemoryStorage {
            data: vec![0u8; size_mb * 1024 * 1024],
        }
    }
}

impl StorageDevice for MemoryStorage {
    fn read_blocks(&mut self, lba: u64, blocks: u32) -> ScsiResult<Vec<u8>> {
        let offset = (lba * BLOCK_SIZE as u64) as usize;
        let len = (blocks * BLOCK_SIZE) as usize;

        if offset + len > self.data.len() {
            return Err(IscsiError::ProtocolViolation(format!(
                "read beyond device capacity: LBA {}, blocks {}",
                lba, blocks
            )));
        }

        Ok(self.data[offset..offset + len].to_vec())
    }

    fn write_blocks(&mut self, lba: u64, data: &[u8]) -> ScsiResult<()> {
        let offset = (lba * BLOCK_SIZE as u64) as usize;

        if offset + data.len() > self.data.len() {
            return Err(IscsiError::ProtocolViolation(format!(
                "write beyond device capacity: LBA {}, bytes {}",
                lba,
                data.len()
            )));
        }

        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / BLOCK_SIZE as usize) as u64
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn flush(&mut self) -> ScsiResult<()> {
        // No-op for memory storage
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // 100 MB in-memory storage with 512-byte blocks
    let storage = MemoryStorage::new(100);

    println!(
        "Capacity: {} blocks of {} bytes",
        storage.block_count(),
        storage.block_size()
    );

    let target = IscsiTarget::builder()
        .bind_addr("0.0.0.0:3260".parse()?)
        .add_target("iqn.2026-08.local:storage.memory-disk", storage)
        .build()?;

    println!("iSCSI target configured:");
    println!("  Target name: iqn.2026-08.local:storage.memory-disk");
    println!("  Listen address: 0.0.0.0:3260");
    println!();
    println!("Connect with any RFC 3720 initiator, for example:");
    println!("  iscsiadm -m discovery -t sendtargets -p 127.0.0.1:3260");
    println!();

    target.bind()?.serve()?;
    println!("Target stopped");
    Ok(())
}
