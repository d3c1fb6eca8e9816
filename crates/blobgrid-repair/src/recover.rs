//! Shard recovery coordinator
//!
//! Reconstructs the shards of the repair indices for every bid of a
//! task, exploiting cheap AZ-local parity before falling back to the
//! global stripe.
//!
//! For global-tier targets (data and global parity):
//! 1. repair with the target's local stripe; done if nothing still fails
//! 2. repair with the global stripe; remaining failures are fatal
//!
//! For local-parity targets:
//! 1. repair with the local stripe
//! 2. collect the local stripe's global members that are themselves
//!    missing and refill them with the global stripe
//! 3. repair with the local stripe again; remaining failures are fatal
//!
//! Data view: `chunks_shards_buf[i]` holds every downloaded or
//! reconstructed shard of replica `i`, in one pooled chunk whose layout
//! is identical across replicas. Stripes are matrices over those
//! buffers, one row per stripe replica.
//!
//! Usage: `recover_shards` once, `get_shard` per repaired shard,
//! `release_buf` when done.

use crate::buffer::{ShardView, ShardsBuf};
use crate::downloader::{Downloader, ShardGetter};
use crate::error::{BufError, RepairError};
use crate::planner::RepairStripe;
use crate::pool::ByteBufferPool;
use crate::status::DownloadStatus;
use blobgrid_codemode::{CodeMode, abstract_replicas};
use blobgrid_common::{BlobId, ShardInfoSimple, Vuid, VunitLocation};
use blobgrid_erasure::{EncoderPool, MatrixRow};
use bytes::BytesMut;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default bid-fetch concurrency within one replica
pub const DEFAULT_GET_CONCURRENCY: usize = 100;

/// Tuning knobs for one recovery
#[derive(Debug, Clone, Default)]
pub struct RecoverConfig {
    /// Concurrent bid fetches per replica; 0 means
    /// [`DEFAULT_GET_CONCURRENCY`]
    pub shard_get_concurrency: usize,
    /// Seed for download-plan shuffling; entropy-seeded when `None`
    pub plan_seed: Option<u64>,
}

/// Bids of a shard-info list
#[must_use]
pub fn bids_of(infos: &[ShardInfoSimple]) -> Vec<BlobId> {
    infos.iter().map(|info| info.bid).collect()
}

/// Replica-list positions of the given locations
#[must_use]
pub fn vunit_idxs(replicas: &[VunitLocation]) -> Vec<u8> {
    replicas.iter().map(|r| r.vuid.index()).collect()
}

/// One row of a repair matrix, checked out of its buffer
struct RowCell {
    vol_idx: u8,
    cell: BytesMut,
    present: bool,
}

/// Recovers the shards of repair targets from surviving replicas
///
/// Owns one optional [`ShardsBuf`] per volume replica, allocated lazily
/// as stripes touch them. The instance serves exactly one recovery.
pub struct ShardRecover {
    replicas: Vec<VunitLocation>,
    code_mode: CodeMode,
    /// Never mutated after construction
    repair_bids: Vec<ShardInfoSimple>,

    chunks_shards_buf: Vec<Option<ShardsBuf>>,
    buf_pool: Arc<ByteBufferPool>,
    shard_getter: Arc<dyn ShardGetter>,
    encoders: Arc<EncoderPool>,

    status: DownloadStatus,
    rng: StdRng,
    shard_get_concurrency: usize,
}

impl ShardRecover {
    /// Create a recovery over an ordered volume replica list
    ///
    /// # Panics
    /// Panics unless `replicas[i].vuid.index() == i` for every position
    /// and the list length matches the code mode's unit count.
    #[must_use]
    pub fn new(
        replicas: Vec<VunitLocation>,
        mode: CodeMode,
        bid_infos: Vec<ShardInfoSimple>,
        buf_pool: Arc<ByteBufferPool>,
        shard_getter: Arc<dyn ShardGetter>,
        encoders: Arc<EncoderPool>,
        config: RecoverConfig,
    ) -> Self {
        assert_eq!(
            replicas.len(),
            mode.tactic().total_units(),
            "replica list does not match code mode {mode}"
        );
        for (i, replica) in replicas.iter().enumerate() {
            assert_eq!(
                usize::from(replica.vuid.index()),
                i,
                "replica list order does not match vuid index"
            );
        }

        let shard_get_concurrency = if config.shard_get_concurrency == 0 {
            DEFAULT_GET_CONCURRENCY
        } else {
            config.shard_get_concurrency
        };
        let rng = config
            .plan_seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);

        Self {
            chunks_shards_buf: (0..replicas.len()).map(|_| None).collect(),
            replicas,
            code_mode: mode,
            repair_bids: bid_infos,
            buf_pool,
            shard_getter,
            encoders,
            status: DownloadStatus::new(),
            rng,
            shard_get_concurrency,
        }
    }

    /// Like [`Self::new`], with some volume units pre-forbidden
    ///
    /// Used when the caller already knows units that must never be read,
    /// beyond the repair targets themselves.
    #[must_use]
    pub fn with_forbidden_download(
        replicas: Vec<VunitLocation>,
        mode: CodeMode,
        bid_infos: Vec<ShardInfoSimple>,
        buf_pool: Arc<ByteBufferPool>,
        shard_getter: Arc<dyn ShardGetter>,
        encoders: Arc<EncoderPool>,
        config: RecoverConfig,
        forbidden: impl IntoIterator<Item = Vuid>,
    ) -> Self {
        let recover = Self::new(
            replicas,
            mode,
            bid_infos,
            buf_pool,
            shard_getter,
            encoders,
            config,
        );
        for vuid in forbidden {
            recover.status.forbid(vuid);
        }
        recover
    }

    /// Recover every bid's shard at every repair index
    ///
    /// With `direct`, first tries to fetch the targets' own replicas and
    /// only erasure-decodes what that leaves behind.
    pub async fn recover_shards(
        &mut self,
        repair_idxs: &[u8],
        direct: bool,
    ) -> Result<(), RepairError> {
        let mut repair_bids = bids_of(&self.repair_bids);

        if direct {
            debug!(bids = repair_bids.len(), "recover shards by direct download");
            repair_bids = self.direct_get_shard(&repair_bids, repair_idxs).await?;
            if repair_bids.is_empty() {
                return Ok(());
            }
            debug!(bids = repair_bids.len(), "direct download left bids for ec recovery");
        }

        for &idx in repair_idxs {
            self.status.forbid(self.replicas[usize::from(idx)].vuid);
        }

        // Global-tier and local-parity targets repair differently.
        let tactic = self.code_mode.tactic();
        let (local_idxs, global_idxs): (Vec<u8>, Vec<u8>) = repair_idxs
            .iter()
            .copied()
            .partition(|&idx| tactic.is_local_unit(usize::from(idx)));

        info!(
            ?local_idxs,
            ?global_idxs,
            bids = self.repair_bids.len(),
            "start recover shards"
        );

        if !global_idxs.is_empty() {
            self.recover_global_replica_shards(&global_idxs, &repair_bids)
                .await?;
        }
        if !local_idxs.is_empty() {
            self.recover_local_replica_shards(&local_idxs, &repair_bids)
                .await?;
        }
        info!("end recover shards");
        Ok(())
    }

    /// Shard bytes for one repaired `(index, bid)` pair
    ///
    /// # Panics
    /// Panics when no buffer was ever allocated for `idx`; only indices
    /// covered by a successful recovery are in contract.
    pub fn get_shard(&self, idx: u8, bid: BlobId) -> Result<ShardView<'_>, BufError> {
        self.chunk_buf(idx).fetch_shard(bid)
    }

    /// Return every chunk buffer to the pool. Idempotent.
    pub fn release_buf(&mut self) {
        for slot in &mut self.chunks_shards_buf {
            if let Some(buf) = slot.take() {
                match buf.into_chunk() {
                    Some(chunk) => self.buf_pool.put(chunk),
                    None => warn!("chunk cell still checked out, dropping allocation"),
                }
            }
        }
    }

    async fn recover_global_replica_shards(
        &mut self,
        repair_idxs: &[u8],
        repair_bids: &[BlobId],
    ) -> Result<(), RepairError> {
        info!(?repair_idxs, bids = repair_bids.len(), "start recover global shards");

        debug!("step1: recover by local stripe");
        self.recover_by_local_stripe(repair_bids, repair_idxs).await?;
        let fail_bids = self.collect_fail_bids(repair_bids, repair_idxs);
        if fail_bids.is_empty() {
            return Ok(());
        }

        debug!("step2: local stripe insufficient, recover by global stripe");
        self.recover_by_global_stripe(&fail_bids, repair_idxs).await?;
        let fail_bids = self.collect_fail_bids(&fail_bids, repair_idxs);
        if !fail_bids.is_empty() {
            error!(fail_bids = fail_bids.len(), "recover global shards failed");
            return Err(RepairError::BidCannotRecover);
        }
        Ok(())
    }

    async fn recover_local_replica_shards(
        &mut self,
        repair_idxs: &[u8],
        repair_bids: &[BlobId],
    ) -> Result<(), RepairError> {
        info!(?repair_idxs, bids = repair_bids.len(), "start recover local unit shards");

        debug!("step1: recover by local stripe");
        self.recover_by_local_stripe(repair_bids, repair_idxs).await?;
        let fail_bids = self.collect_fail_bids(repair_bids, repair_idxs);
        if fail_bids.is_empty() {
            return Ok(());
        }

        let global_bad_idxs = self.collect_global_bad_replicas(&fail_bids, repair_idxs);
        debug!(
            ?global_bad_idxs,
            "step2: refill missing global units by global stripe"
        );
        self.recover_by_global_stripe(&fail_bids, &global_bad_idxs)
            .await?;

        debug!("step3: recover by local stripe again");
        self.recover_by_local_stripe(&fail_bids, repair_idxs).await?;
        let fail_bids = self.collect_fail_bids(&fail_bids, repair_idxs);
        if !fail_bids.is_empty() {
            error!(fail_bids = fail_bids.len(), "recover local unit shards failed");
            return Err(RepairError::BidCannotRecover);
        }
        Ok(())
    }

    /// Global-tier members of the failing local stripes whose shard data
    /// is itself absent for some failing bid
    fn collect_global_bad_replicas(&self, fail_bids: &[BlobId], repair_idxs: &[u8]) -> Vec<u8> {
        let tactic = self.code_mode.tactic();

        let mut global_unit_idxs: Vec<usize> = Vec::new();
        for group in tactic.idx_split_by_local_stripe(repair_idxs) {
            let Some((idxs, n_l, _)) = tactic.local_stripe_of(usize::from(group[0])) else {
                continue;
            };
            global_unit_idxs.extend_from_slice(&idxs[..n_l]);
        }

        let mut bad: BTreeSet<u8> = BTreeSet::new();
        for &bid in fail_bids {
            for &unit_idx in &global_unit_idxs {
                match &self.chunks_shards_buf[unit_idx] {
                    None => {
                        bad.insert(u8::try_from(unit_idx).expect("unit index fits u8"));
                    }
                    Some(buf) if !buf.shard_is_ok(bid) => {
                        bad.insert(u8::try_from(unit_idx).expect("unit index fits u8"));
                    }
                    Some(_) => {}
                }
            }
        }

        let bad: Vec<u8> = bad.into_iter().collect();
        debug!(?bad, "collect global bad replicas");
        bad
    }

    async fn direct_get_shard(
        &mut self,
        repair_bids: &[BlobId],
        repair_idxs: &[u8],
    ) -> Result<Vec<BlobId>, RepairError> {
        debug!("start direct get shard");
        self.alloc_buf(repair_idxs)?;

        let replicas: Vec<VunitLocation> = repair_idxs
            .iter()
            .map(|&idx| self.replicas[usize::from(idx)].clone())
            .collect();
        self.download(repair_bids, &replicas).await;

        let fail_bids = self.collect_fail_bids(repair_bids, repair_idxs);
        debug!(fail_bids = fail_bids.len(), "end direct get shard");
        Ok(fail_bids)
    }

    async fn recover_by_local_stripe(
        &mut self,
        repair_bids: &[BlobId],
        repair_idxs: &[u8],
    ) -> Result<(), RepairError> {
        let stripes = self.gen_local_stripes(repair_idxs);
        if stripes.is_empty() {
            return Ok(());
        }
        debug!(?repair_idxs, stripes = stripes.len(), "start recover by local stripe");

        // TODO: stripes are independent and could be repaired concurrently.
        for stripe in stripes {
            let idxs = vunit_idxs(&stripe.replicas);
            self.alloc_buf(&idxs)?;
            self.repair_stripe(repair_bids, &stripe).await;
        }
        debug!("end recover by local stripe");
        Ok(())
    }

    async fn recover_by_global_stripe(
        &mut self,
        repair_bids: &[BlobId],
        repair_idxs: &[u8],
    ) -> Result<(), RepairError> {
        debug!(?repair_idxs, "start recover by global stripe");

        let stripe = self.gen_global_stripe(repair_idxs);
        let idxs = vunit_idxs(&stripe.replicas);
        self.alloc_buf(&idxs)?;
        self.repair_stripe(repair_bids, &stripe).await;
        debug!("end recover by global stripe");
        Ok(())
    }

    /// Try download plans in order until no bid still fails on the
    /// stripe's bad positions
    async fn repair_stripe(&mut self, repair_bids: &[BlobId], stripe: &RepairStripe) {
        let plans = stripe.gen_download_plans(&mut self.rng);
        debug!(plans = plans.len(), bids = repair_bids.len(), "start repair stripe");

        let mut fail_bids = repair_bids.to_vec();
        for plan in plans {
            self.download(&fail_bids, &plan.replicas).await;
            self.repair(&fail_bids, stripe);
            fail_bids = self.collect_fail_bids(&fail_bids, &stripe.bad_idxs);
            if fail_bids.is_empty() {
                return;
            }
        }
    }

    async fn download(&self, bids: &[BlobId], replicas: &[VunitLocation]) {
        Downloader::new(
            &self.chunks_shards_buf,
            &self.status,
            &*self.shard_getter,
            self.shard_get_concurrency,
        )
        .download(bids, replicas)
        .await;
    }

    /// Reconstruct every still-missing row of the stripe, bid by bid
    ///
    /// Builds the shard matrix over the stripe replicas' buffers, with
    /// absent rows as in-place reconstruction destinations. Skips bids
    /// that are complete, zero-sized, or short more rows than the stripe
    /// can repair. Reconstruction output is re-verified against the
    /// stripe's parity before it is committed; an inconsistent matrix is
    /// state corruption and aborts.
    fn repair(&self, repair_bids: &[BlobId], stripe: &RepairStripe) {
        let (n, m) = (stripe.n, stripe.m);
        assert!(!stripe.replicas.is_empty(), "repair of an empty stripe");
        debug!(n, m, bids = repair_bids.len(), "start repair");

        let encoder = self
            .encoders
            .get(n, m)
            .unwrap_or_else(|err| panic!("encoder for ({n}, {m}): {err}"));

        for &bid in repair_bids {
            let first_idx = stripe.replicas[0].vuid.index();
            let zero = self
                .chunk_buf(first_idx)
                .shard_size_is_zero(bid)
                .unwrap_or_else(|err| panic!("bid {bid} missing from layout: {err}"));
            if zero {
                debug!(%bid, "zero size blob, nothing to recover");
                continue;
            }

            let mut rows: Vec<RowCell> = Vec::with_capacity(stripe.replicas.len());
            for replica in &stripe.replicas {
                let vol_idx = replica.vuid.index();
                let (cell, present) = self
                    .chunk_buf(vol_idx)
                    .take_shard_buf(bid)
                    .unwrap_or_else(|err| panic!("take shard buf: bid {bid}, idx {vol_idx}: {err}"));
                rows.push(RowCell {
                    vol_idx,
                    cell,
                    present,
                });
            }

            let absent = rows.iter().filter(|row| !row.present).count();
            if absent > m {
                debug!(%bid, absent, "too many rows missing, skip");
                self.restore_rows(bid, rows);
                continue;
            }
            if absent == 0 {
                debug!(%bid, "no rows to recover");
                self.restore_rows(bid, rows);
                continue;
            }

            {
                let mut matrix: Vec<MatrixRow<'_>> = rows
                    .iter_mut()
                    .map(|row| (&mut row.cell[..], row.present))
                    .collect();
                if let Err(err) = encoder.reconstruct(&mut matrix) {
                    error!(%bid, %err, "reconstruct shard failed");
                }
            }

            let refs: Vec<&[u8]> = rows.iter().map(|row| &row.cell[..]).collect();
            match encoder.verify(&refs) {
                Ok(true) => {}
                verdict => {
                    error!(%bid, ?verdict, "ec verify failed");
                    panic!("ec verify failed after reconstruct: bid {bid}");
                }
            }

            for row in rows {
                let buf = self.chunk_buf(row.vol_idx);
                if row.present {
                    buf.restore_shard_buf(bid, row.cell, true);
                } else if let Err(err) = buf.set_shard_buf(bid, row.cell) {
                    panic!("set shard buf: idx {}, bid {bid}: {err}", row.vol_idx);
                }
            }
        }
    }

    fn restore_rows(&self, bid: BlobId, rows: Vec<RowCell>) {
        for row in rows {
            self.chunk_buf(row.vol_idx)
                .restore_shard_buf(bid, row.cell, row.present);
        }
    }

    fn gen_local_stripes(&self, repair_idxs: &[u8]) -> Vec<RepairStripe> {
        let tactic = self.code_mode.tactic();
        tactic
            .idx_split_by_local_stripe(repair_idxs)
            .into_iter()
            .filter_map(|group| {
                let (idxs, n, m) = tactic.local_stripe_of(usize::from(group[0]))?;
                Some(RepairStripe {
                    replicas: abstract_replicas(&self.replicas, &idxs),
                    n,
                    m,
                    bad_idxs: group,
                })
            })
            .collect()
    }

    fn gen_global_stripe(&self, repair_idxs: &[u8]) -> RepairStripe {
        let (idxs, n, m) = self.code_mode.tactic().global_stripe();
        RepairStripe {
            replicas: abstract_replicas(&self.replicas, &idxs),
            n,
            m,
            bad_idxs: repair_idxs.to_vec(),
        }
    }

    /// Bids still missing authoritative content at any of the given
    /// indices
    fn collect_fail_bids(&self, repair_bids: &[BlobId], repair_idxs: &[u8]) -> Vec<BlobId> {
        repair_bids
            .iter()
            .copied()
            .filter(|&bid| {
                repair_idxs
                    .iter()
                    .any(|&idx| match &self.chunks_shards_buf[usize::from(idx)] {
                        None => true,
                        Some(buf) => !buf.shard_is_ok(bid),
                    })
            })
            .collect()
    }

    fn alloc_buf(&mut self, vunit_idxs: &[u8]) -> Result<(), RepairError> {
        debug!(?vunit_idxs, "alloc buf");
        for &idx in vunit_idxs {
            if self.chunks_shards_buf[usize::from(idx)].is_none() {
                let chunk = self.buf_pool.get().inspect_err(|err| {
                    error!(%err, "alloc buf failed");
                })?;
                let buf = ShardsBuf::new(chunk);
                buf.planning_data_layout(&self.repair_bids);
                self.chunks_shards_buf[usize::from(idx)] = Some(buf);
            }
        }
        Ok(())
    }

    fn chunk_buf(&self, idx: u8) -> &ShardsBuf {
        self.chunks_shards_buf[usize::from(idx)]
            .as_ref()
            .unwrap_or_else(|| panic!("no buffer allocated for index {idx}"))
    }
}
