//! A pure Rust iSCSI target implementation
//!
//! This library provides a reusable iSCSI target server that can be
//! integrated into storage applications. Users implement the
//! `StorageDevice` trait to provide the actual storage backend and
//! register one or more targets on a builder. Each accepted connection
//! runs login negotiation (optionally CHAP-authenticated) and then a
//! full-feature loop serving SCSI commands, text negotiation and NOP
//! pings on its own thread.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_target_core::{IscsiTarget, ScsiResult, StorageDevice};
//!
//! struct MyStorage {
//!     data: Vec<u8>,
//! }
//!
//! impl StorageDevice for MyStorage {
//!     fn read_blocks(&mut self, lba: u64, blocks: u32) -> ScsiResult<Vec<u8>> {
//!         let offset = (lba * 512) as usize;
//!         let len = (blocks * 512) as usize;
//!         Ok(self.data[offset..offset + len].to_vec())
//!     }
//!
//!     fn write_blocks(&mut self, lba: u64, data: &[u8]) -> ScsiResult<()> {
//!         let offset = (lba * 512) as usize;
//!         self.data[offset..offset + data.len()].copy_from_slice(data);
//!         Ok(())
//!     }
//!
//!     fn block_count(&self) -> u64 {
//!         (self.data.len() / 512) as u64
//!     }
//!
//!     fn block_size(&self) -> u32 {
//!         512
//!     }
//!
//!     fn flush(&mut self) -> ScsiResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MyStorage { data: vec![0u8; 1024 * 1024] };
//! let target = IscsiTarget::builder()
//!     .bind_addr("0.0.0.0:3260".parse()?)
//!     .add_target("iqn.2026-08.local:storage.disk1", storage)
//!     .build()?;
//! target.bind()?.serve()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
mod connection;
pub mod error;
pub mod pdu;
mod phase;
pub mod scsi;
pub mod serial;
pub mod session;
pub mod settings;
mod stage;
pub mod target;

pub use auth::{AuthConfig, ChapCredentials};
pub use client::IscsiClient;
pub use error::{IscsiError, ScsiResult};
pub use scsi::StorageDevice;
pub use target::{IscsiTarget, IscsiTargetBuilder, TargetHandle};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
