//! Shard-fetch error surface
//!
//! These are the conditions a storage node (or the RPC layer in front of
//! it) reports when a shard is requested. The repair engine classifies
//! them to decide whether a failure is scoped to one blob or poisons the
//! whole replica.

use thiserror::Error;

/// Result alias for shard-getter operations
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Errors returned when fetching one shard from a storage node
#[derive(Debug, Error)]
pub enum FetchError {
    /// The shard was marked deleted on this replica
    #[error("shard mark deleted")]
    ShardMarkDeleted,

    /// The replica has no record of this bid
    #[error("bid not found")]
    BidNotFound,

    /// The shard exceeds the node's transfer limit
    #[error("shard size too large")]
    ShardSizeTooLarge,

    /// The disk backing the chunk is broken
    #[error("disk broken")]
    DiskBroken,

    /// The request timed out
    #[error("request timeout")]
    Timeout,

    /// The node refused service
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Transport-level I/O failure (includes body-read failures)
    #[error("shard i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Any other RPC failure
    #[error("rpc: {0}")]
    Rpc(String),
}

impl FetchError {
    /// True when the failure concerns only the requested bid
    ///
    /// Everything else is assumed to poison the replica: further requests
    /// against it would fail the same way.
    #[must_use]
    pub const fn is_per_bid(&self) -> bool {
        matches!(
            self,
            Self::ShardMarkDeleted | Self::BidNotFound | Self::ShardSizeTooLarge
        )
    }
}
