//! Concurrent shard download
//!
//! Fans out over `replicas x bids`: one worker per replica, and within a
//! replica up to `concurrency` bids in flight. Every downloaded shard is
//! CRC-verified against the transport-reported checksum before it counts.
//!
//! A failed bid does not stop its replica unless the error poisons the
//! whole replica (anything other than the per-bid conditions); then the
//! replica's cancellation token stops its remaining bids. Other replicas
//! are unaffected.

use crate::buffer::ShardsBuf;
use crate::error::BufError;
use crate::status::DownloadStatus;
use async_trait::async_trait;
use blobgrid_common::{BlobId, FetchError, FetchResult, VunitLocation};
use futures::StreamExt;
use futures::future::join_all;
use futures::stream;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shard body stream handed back by a storage node
pub type ShardBody = Box<dyn AsyncRead + Send + Unpin>;

/// One fetched shard: its body and the node-computed IEEE CRC-32
pub struct ShardPayload {
    /// Yields exactly the shard's planned size in bytes
    pub body: ShardBody,
    /// CRC of the full body, computed by the storage node
    pub crc32: u32,
}

/// Capability to fetch one shard from a storage node
#[async_trait]
pub trait ShardGetter: Send + Sync {
    /// Fetch `bid`'s shard from the given replica
    async fn get_shard(&self, location: &VunitLocation, bid: BlobId) -> FetchResult<ShardPayload>;
}

/// True when `err` poisons the whole replica
///
/// Only `ShardMarkDeleted`, `BidNotFound` and `ShardSizeTooLarge` are
/// scoped to a single bid; every other failure means further requests
/// against the replica are pointless.
#[must_use]
pub fn all_shards_can_not_download(err: &FetchError) -> bool {
    !err.is_per_bid()
}

/// Per-call download driver over the recovery's chunk buffers
pub(crate) struct Downloader<'a> {
    chunks: &'a [Option<ShardsBuf>],
    status: &'a DownloadStatus,
    getter: &'a dyn ShardGetter,
    concurrency: usize,
}

impl<'a> Downloader<'a> {
    pub(crate) fn new(
        chunks: &'a [Option<ShardsBuf>],
        status: &'a DownloadStatus,
        getter: &'a dyn ShardGetter,
        concurrency: usize,
    ) -> Self {
        Self {
            chunks,
            status,
            getter,
            concurrency,
        }
    }

    /// Download every bid from every replica, in parallel per replica
    pub(crate) async fn download(&self, bids: &[BlobId], replicas: &[VunitLocation]) {
        join_all(
            replicas
                .iter()
                .map(|replica| self.download_repl_shards(replica, bids)),
        )
        .await;
    }

    async fn download_repl_shards(&self, replica: &VunitLocation, bids: &[BlobId]) {
        let vuid = replica.vuid;
        if !self.status.need_download(vuid) {
            debug!(%replica, idx = vuid.index(), "skip download");
            return;
        }

        debug!(idx = vuid.index(), bids = bids.len(), "start replica download");
        let cancel = CancellationToken::new();
        stream::iter(bids.iter().copied())
            .for_each_concurrent(self.concurrency, |bid| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        debug!(%replica, %bid, "download cancelled");
                        return;
                    }
                    let Err(err) = self.download_shard(replica, bid).await else {
                        return;
                    };
                    warn!(%replica, %bid, %err, "download shard failed");
                    if all_shards_can_not_download(&err) {
                        info!(%replica, "replica can not serve shards, cancelling remaining bids");
                        cancel.cancel();
                    }
                }
            })
            .await;
        debug!(%vuid, idx = vuid.index(), "finish replica download");
    }

    async fn download_shard(&self, replica: &VunitLocation, bid: BlobId) -> FetchResult<()> {
        let fetched = self.getter.get_shard(replica, bid).await;
        // Attempted is attempted, success or not: a failed replica is
        // never retried against the same bid set.
        self.status.mark_downloaded(replica.vuid);
        let payload = fetched?;

        let idx = replica.vuid.index();
        let buf = self.chunks[idx as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("no buffer allocated for replica index {idx}"));

        let ShardPayload { mut body, crc32 } = payload;
        match buf.put_shard(bid, &mut body).await {
            Ok(()) => {
                let local = buf
                    .shard_crc32(bid)
                    .unwrap_or_else(|err| panic!("crc of fresh shard: bid {bid}: {err}"));
                if local != crc32 {
                    error!(%replica, %bid, local, remote = crc32, "shard crc32 mismatch");
                    panic!("shard crc32 mismatch: bid {bid}, local {local}, remote {crc32}");
                }
                Ok(())
            }
            Err(BufError::BufHasData) => {
                // Another path already filled this slot; the contents
                // must agree with what this replica reports.
                let existing = buf
                    .shard_crc32(bid)
                    .unwrap_or_else(|err| panic!("crc of conflicting shard: bid {bid}: {err}"));
                if existing != crc32 {
                    error!(%replica, %bid, existing, remote = crc32, "conflicting shard data");
                    panic!(
                        "data conflict, crc32 not match: bid {bid}, buf {existing}, remote {crc32}"
                    );
                }
                Ok(())
            }
            Err(BufError::Io(err)) => Err(FetchError::Io(err)),
            Err(err) => panic!("unexpected put shard failure: bid {bid}: {err}"),
        }
    }
}
