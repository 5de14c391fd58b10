//! Example demonstrating graceful shutdown of an iSCSI target
//!
//! This shows how to:
//! 1. Start an iSCSI target on a background thread
//! 2. Obtain a handle before serving
//! 3. Ask established full-feature connections to stop
//! 4. Unblock the accept loop and stop the target cleanly

use iscsi_target_core::{IscsiTarget, ScsiResult, StorageDevice};
use std::thread;
use std::time::Duration;

/// Simple in-memory storage
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
        let offset = (lba * 512) as usize;
        let len = (blocks * 512) as usize;
        if offset + len > self.data.len() {
            return Err(iscsi_target_core::IscsiError::ProtocolViolation(
                "read out of bounds".into(),
            ));
        }
        Ok(self.data[offset..offset + len].to_vec())
    }

    fn write_blocks(&mut self, lba: u64, data: &[u8]) -> ScsiResult<()> {
        let offset = (lba * 512) as usize;
        if offset + data.len() > self.data.len() {
            return Err(iscsi_target_core::IscsiError::ProtocolViolation(
                "write out of bounds".into(),
            ));
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / 512) as u64
    }

    fn block_size(&self) -> u32 {
        512
    }

    fn flush(&mut self) -> ScsiResult<()> {
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:3261".to_string());

    let storage = MemoryStorage::new(100);
    let target = IscsiTarget::builder()
        .bind_addr(bind_addr.parse()?)
        .add_target("iqn.2026-08.local:storage.shutdown-demo", storage)
        .build()?;

    let bound = target.bind()?;
    let handle = bound.handle()?;

    println!("iSCSI target configured:");
    println!("  Target name: iqn.2026-08.local:storage.shutdown-demo");
    println!("  Listen address: {}", bind_addr);
    println!();
    println!("Serving for 30 seconds, then shutting down.");
    println!();

    let server_thread = thread::spawn(move || bound.serve());

    thread::sleep(Duration::from_secs(30));

    println!("Initiating shutdown...");
    let refused = handle.shutdown();
    for peer in &refused {
        println!("  connection from {} could not be stopped cooperatively", peer);
    }

    server_thread
        .join()
        .map_err(|_| "server thread panicked")??;

    println!("Target shut down cleanly, {} sessions remaining", handle.session_count());
    Ok(())
}
