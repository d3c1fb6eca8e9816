//! Error types for the repair crate

use thiserror::Error;

/// Errors surfaced by [`crate::ShardsBuf`] operations
#[derive(Debug, Error)]
pub enum BufError {
    /// The shard exists in the layout but has not been downloaded or
    /// reconstructed yet
    #[error("shard data not prepared")]
    ShardDataNotPrepared,

    /// The bid was not part of the buffer's planned layout
    #[error("bid not found in buffer")]
    BidNotFoundInBuf,

    /// The slot already holds authoritative shard content
    #[error("buf already has data")]
    BufHasData,

    /// A committed cell did not alias the slot's reserved range
    #[error("illegal buffer")]
    IllegalBuf,

    /// Reading the shard body into the slot failed
    #[error("shard read: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`crate::ByteBufferPool`]
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every permitted buffer is already handed out
    #[error("buffer pool exhausted: {outstanding} buffers outstanding")]
    Exhausted {
        /// Buffers currently handed out
        outstanding: usize,
    },
}

/// Errors returned by [`crate::ShardRecover::recover_shards`]
#[derive(Debug, Error)]
pub enum RepairError {
    /// After every recovery phase some repair index still misses shard
    /// data for at least one bid
    #[error("bid can not recover")]
    BidCannotRecover,

    /// Buffer allocation failed
    #[error(transparent)]
    Pool(#[from] PoolError),
}
