//! BlobGrid common types and utilities
//!
//! This crate defines the identifier and location types shared by the
//! volume, repair and storage-node layers, together with the CRC-32
//! helpers and the shard-fetch error surface.

pub mod checksum;
pub mod error;
pub mod types;

pub use checksum::{Crc32, crc32_ieee};
pub use error::{FetchError, FetchResult};
pub use types::{BlobId, DiskId, ShardInfoSimple, Vuid, VunitLocation};
