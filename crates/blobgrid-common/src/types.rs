//! Core type definitions for BlobGrid
//!
//! Identifiers here are stable wire values: blobs are numbered per volume,
//! and volume units pack their parent volume, replica position and epoch
//! into a single 64-bit value.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a logical blob within a volume
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct BlobId(u64);

impl BlobId {
    /// Create a blob id from its raw value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

/// Unique identifier for a disk on a storage node
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct DiskId(u32);

impl DiskId {
    /// Create a disk id from its raw value
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Debug for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiskId({})", self.0)
    }
}

const VUID_INDEX_BITS: u32 = 8;
const VUID_EPOCH_BITS: u32 = 24;
const VUID_EPOCH_MAX: u32 = (1 << VUID_EPOCH_BITS) - 1;

/// Volume-unit identifier
///
/// Packs `(vid:32 | index:8 | epoch:24)` into one u64. The `index` is the
/// unit's position in its volume's ordered replica list and is the value
/// the repair engine keys buffers and stripes on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct Vuid(u64);

impl Vuid {
    /// Pack a volume id, replica index and epoch into a vuid
    ///
    /// # Panics
    /// Panics if `epoch` does not fit in 24 bits.
    #[must_use]
    pub const fn new(vid: u32, index: u8, epoch: u32) -> Self {
        assert!(epoch <= VUID_EPOCH_MAX, "vuid epoch out of range");
        Self(
            ((vid as u64) << (VUID_INDEX_BITS + VUID_EPOCH_BITS))
                | ((index as u64) << VUID_EPOCH_BITS)
                | epoch as u64,
        )
    }

    /// Volume id of the parent volume
    #[must_use]
    pub const fn vid(&self) -> u32 {
        (self.0 >> (VUID_INDEX_BITS + VUID_EPOCH_BITS)) as u32
    }

    /// Position of this unit in the parent volume's replica list
    #[must_use]
    pub const fn index(&self) -> u8 {
        (self.0 >> VUID_EPOCH_BITS) as u8
    }

    /// Allocation epoch of this unit
    #[must_use]
    pub const fn epoch(&self) -> u32 {
        (self.0 as u32) & VUID_EPOCH_MAX
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Vuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vuid({}-{}-{})",
            self.vid(),
            self.index(),
            self.epoch()
        )
    }
}

impl fmt::Display for Vuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing address of one volume-unit replica
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VunitLocation {
    /// The unit stored at this location
    pub vuid: Vuid,
    /// Storage-node host, e.g. `http://10.0.0.1:8889`
    pub host: String,
    /// Disk holding the unit's chunk
    pub disk_id: DiskId,
}

impl fmt::Display for VunitLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.vuid, self.host, self.disk_id)
    }
}

/// Minimal per-blob shard descriptor
///
/// `size` is authoritative for buffer layout planning: every replica of
/// `bid` stores exactly this many bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfoSimple {
    /// Blob the shard belongs to
    pub bid: BlobId,
    /// Shard size in bytes
    pub size: u64,
}

impl ShardInfoSimple {
    /// Create a new shard descriptor
    #[must_use]
    pub const fn new(bid: BlobId, size: u64) -> Self {
        Self { bid, size }
    }
}
