//! BlobGrid shard recovery engine
//!
//! Reconstructs lost or unreadable shards of erasure-coded volumes from
//! surviving replicas. The volume's code mode layers two protection
//! tiers: a global Reed-Solomon stripe across AZs and a cheaper local
//! stripe per AZ; recovery tries local parity first and escalates to the
//! global stripe only for what remains.
//!
//! The engine is a library core. Storage-node access, buffer pooling and
//! the erasure codec are consumed through narrow seams
//! ([`ShardGetter`], [`ByteBufferPool`], the encoder pool from
//! `blobgrid-erasure`), so transports and codecs stay out of the
//! recovery logic.
//!
//! # Example
//!
//! ```ignore
//! let mut recover = ShardRecover::new(
//!     replicas, mode, bid_infos, pool, getter, encoders,
//!     RecoverConfig::default(),
//! );
//! recover.recover_shards(&[3], false).await?;
//! let shard = recover.get_shard(3, bid)?;
//! // ... write the repaired shard somewhere ...
//! recover.release_buf();
//! ```

pub mod buffer;
pub mod downloader;
pub mod error;
mod planner;
pub mod pool;
pub mod recover;
mod status;

pub use buffer::{ShardView, ShardsBuf};
pub use downloader::{ShardBody, ShardGetter, ShardPayload, all_shards_can_not_download};
pub use error::{BufError, PoolError, RepairError};
pub use pool::{ByteBufferPool, PoolConfig};
pub use recover::{
    DEFAULT_GET_CONCURRENCY, RecoverConfig, ShardRecover, bids_of, vunit_idxs,
};
