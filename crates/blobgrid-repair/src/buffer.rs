//! Per-chunk shard buffer
//!
//! A [`ShardsBuf`] holds every shard of one replica chunk that a recovery
//! touches, inside a single pooled allocation. The layout is planned once
//! from the bid list: each bid gets a fixed, disjoint byte range, carved
//! with `BytesMut::split_to` so every range is an independently owned
//! cell of the same allocation.
//!
//! Cells move through three states. A `Vacant` cell is reserved storage
//! waiting for content; a `Writing` cell is checked out by the single
//! writer for that `(buffer, bid)` pair (a downloader filling it, or the
//! reconstruction matrix); a `Ready` cell holds authoritative shard
//! bytes. Checkout keeps the slot lock release-free across I/O and lets
//! the erasure codec write reconstruction output straight into the
//! reserved range. Committing a reconstructed cell verifies identity:
//! the returned storage must start at the reserved range's recorded base
//! address and have exactly the planned size, otherwise the buffer is in
//! an illegal state.

use crate::error::BufError;
use blobgrid_common::{BlobId, ShardInfoSimple, crc32_ieee};
use bytes::BytesMut;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use tokio::io::{AsyncRead, AsyncReadExt};

enum SlotState {
    /// Reserved storage, content not yet authoritative
    Vacant(BytesMut),
    /// Checked out by the slot's single writer
    Writing,
    /// Authoritative shard content
    Ready(BytesMut),
}

struct ShardSlot {
    size: usize,
    /// Heap address of the reserved range, fixed at planning time
    base: usize,
    state: SlotState,
}

impl ShardSlot {
    const fn is_ready(&self) -> bool {
        matches!(self.state, SlotState::Ready(_))
    }
}

struct BufInner {
    slots: HashMap<BlobId, ShardSlot>,
    /// Bids in layout order, for reassembly on release
    order: Vec<BlobId>,
    /// Unconsumed tail of the pooled chunk
    spare: BytesMut,
    laid_out: bool,
}

/// Read view of one shard, borrowed from its buffer
pub struct ShardView<'a>(MappedMutexGuard<'a, [u8]>);

impl Deref for ShardView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for ShardView<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ShardView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardView({} bytes)", self.0.len())
    }
}

/// Shard storage for one replica chunk
pub struct ShardsBuf {
    inner: Mutex<BufInner>,
}

impl ShardsBuf {
    /// Wrap a pooled chunk. Call [`Self::planning_data_layout`] before
    /// any shard operation.
    #[must_use]
    pub fn new(buf: BytesMut) -> Self {
        Self {
            inner: Mutex::new(BufInner {
                slots: HashMap::new(),
                order: Vec::new(),
                spare: buf,
                laid_out: false,
            }),
        }
    }

    /// Carve one slot per bid, in bid order
    ///
    /// Offsets are fixed for the buffer's lifetime and deterministic in
    /// the bid order. Zero-size bids are born ready.
    ///
    /// # Panics
    /// Panics when the bid sizes exceed the buffer, or on a second call:
    /// both are programmer errors.
    pub fn planning_data_layout(&self, bids: &[ShardInfoSimple]) {
        let mut inner = self.inner.lock();
        assert!(!inner.laid_out, "buffer layout already planned");

        let total: u64 = bids.iter().map(|b| b.size).sum();
        assert!(
            total <= inner.spare.len() as u64,
            "buf space not enough: need {total}, have {}",
            inner.spare.len()
        );

        for info in bids {
            let size = usize::try_from(info.size).expect("shard size overflows usize");
            let cell = inner.spare.split_to(size);
            let slot = ShardSlot {
                size,
                base: cell.as_ptr() as usize,
                state: if size == 0 {
                    SlotState::Ready(cell)
                } else {
                    SlotState::Vacant(cell)
                },
            };
            let prev = inner.slots.insert(info.bid, slot);
            debug_assert!(prev.is_none(), "duplicate bid in layout");
            inner.order.push(info.bid);
        }
        inner.laid_out = true;
    }

    /// Read exactly the planned size from `body` into the bid's slot
    ///
    /// The slot lock is not held across the read: the cell is checked
    /// out, filled, then committed. A failed read leaves the slot vacant.
    pub async fn put_shard<R>(&self, bid: BlobId, body: &mut R) -> Result<(), BufError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut cell = {
            let mut inner = self.inner.lock();
            let slot = inner.slots.get_mut(&bid).ok_or(BufError::BidNotFoundInBuf)?;
            if slot.size == 0 {
                return Ok(());
            }
            match std::mem::replace(&mut slot.state, SlotState::Writing) {
                SlotState::Vacant(cell) => cell,
                prev => {
                    slot.state = prev;
                    return Err(BufError::BufHasData);
                }
            }
        };

        let read = body.read_exact(&mut cell[..]).await;

        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(&bid)
            .expect("slot disappeared during put");
        match read {
            Ok(_) => {
                slot.state = SlotState::Ready(cell);
                Ok(())
            }
            Err(err) => {
                slot.state = SlotState::Vacant(cell);
                Err(BufError::Io(err))
            }
        }
    }

    /// Check out the bid's cell for reconstruction
    ///
    /// Returns the cell and whether it already holds authoritative
    /// content. Absent content still yields the full reserved range: the
    /// codec writes the reconstruction result into it.
    ///
    /// # Panics
    /// Panics if the cell is already checked out; recovery phases are
    /// sequential, so a concurrent checkout means corrupted state.
    pub(crate) fn take_shard_buf(&self, bid: BlobId) -> Result<(BytesMut, bool), BufError> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(&bid).ok_or(BufError::BidNotFoundInBuf)?;
        match std::mem::replace(&mut slot.state, SlotState::Writing) {
            SlotState::Vacant(cell) => Ok((cell, false)),
            SlotState::Ready(cell) => Ok((cell, true)),
            SlotState::Writing => panic!("shard cell already checked out: bid {bid}"),
        }
    }

    /// Return a checked-out cell without changing its standing
    ///
    /// # Panics
    /// Panics when the slot is not in the checked-out state.
    pub(crate) fn restore_shard_buf(&self, bid: BlobId, cell: BytesMut, present: bool) {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(&bid)
            .unwrap_or_else(|| panic!("restore of unknown bid {bid}"));
        assert!(
            matches!(slot.state, SlotState::Writing),
            "restore of a cell that was not checked out: bid {bid}"
        );
        slot.state = if present {
            SlotState::Ready(cell)
        } else {
            SlotState::Vacant(cell)
        };
    }

    /// Commit a reconstructed cell as the bid's authoritative content
    ///
    /// The cell must be the slot's own reserved range: same base address,
    /// exact planned size. Anything else is `IllegalBuf`.
    pub fn set_shard_buf(&self, bid: BlobId, cell: BytesMut) -> Result<(), BufError> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(&bid).ok_or(BufError::BidNotFoundInBuf)?;
        if slot.is_ready() {
            return Err(BufError::BufHasData);
        }
        if slot.size == 0 {
            slot.state = SlotState::Ready(cell);
            return Ok(());
        }
        if cell.as_ptr() as usize == slot.base && cell.len() == slot.size {
            slot.state = SlotState::Ready(cell);
            return Ok(());
        }
        tracing::error!(
            %bid,
            expect_base = slot.base,
            expect_size = slot.size,
            actual_base = cell.as_ptr() as usize,
            actual_size = cell.len(),
            "set shard buf failed"
        );
        Err(BufError::IllegalBuf)
    }

    /// Authoritative shard bytes, or why they are not available
    pub fn fetch_shard(&self, bid: BlobId) -> Result<ShardView<'_>, BufError> {
        let inner = self.inner.lock();
        match inner.slots.get(&bid) {
            None => return Err(BufError::BidNotFoundInBuf),
            Some(slot) if !slot.is_ready() => return Err(BufError::ShardDataNotPrepared),
            Some(_) => {}
        }
        let mapped = MutexGuard::map(inner, |inner| {
            match &mut inner.slots.get_mut(&bid).expect("slot checked above").state {
                SlotState::Ready(cell) => &mut cell[..],
                _ => unreachable!("readiness checked above"),
            }
        });
        Ok(ShardView(mapped))
    }

    /// IEEE CRC-32 of the bid's authoritative content
    pub fn shard_crc32(&self, bid: BlobId) -> Result<u32, BufError> {
        let view = self.fetch_shard(bid)?;
        Ok(crc32_ieee(&view))
    }

    /// Whether the bid was planned with size zero
    pub fn shard_size_is_zero(&self, bid: BlobId) -> Result<bool, BufError> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(&bid)
            .map(|slot| slot.size == 0)
            .ok_or(BufError::BidNotFoundInBuf)
    }

    /// Whether the bid holds authoritative content. Unknown bids are not
    /// ok.
    #[must_use]
    pub fn shard_is_ok(&self, bid: BlobId) -> bool {
        let inner = self.inner.lock();
        inner.slots.get(&bid).is_some_and(ShardSlot::is_ready)
    }

    /// Reassemble the pooled chunk for return to the pool
    ///
    /// Cells are rejoined in layout order; `None` when a cell is still
    /// checked out (its storage cannot be reclaimed).
    pub(crate) fn into_chunk(self) -> Option<BytesMut> {
        let BufInner {
            mut slots,
            order,
            spare,
            ..
        } = self.inner.into_inner();

        let mut chunk: Option<BytesMut> = None;
        let mut append = |cell: BytesMut| match chunk.as_mut() {
            None => chunk = Some(cell),
            Some(head) => head.unsplit(cell),
        };

        for bid in order {
            let slot = slots.remove(&bid).expect("slot missing from layout order");
            match slot.state {
                SlotState::Vacant(cell) | SlotState::Ready(cell) => append(cell),
                SlotState::Writing => return None,
            }
        }
        append(spare);
        chunk
    }
}

impl fmt::Debug for ShardsBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ShardsBuf")
            .field("bids", &inner.order.len())
            .field("laid_out", &inner.laid_out)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sized_buf(capacity: usize, bids: &[(u64, u64)]) -> ShardsBuf {
        let buf = ShardsBuf::new(BytesMut::zeroed(capacity));
        let infos: Vec<ShardInfoSimple> = bids
            .iter()
            .map(|&(bid, size)| ShardInfoSimple::new(BlobId::new(bid), size))
            .collect();
        buf.planning_data_layout(&infos);
        buf
    }

    #[tokio::test]
    async fn test_put_then_fetch_round_trip() {
        let buf = sized_buf(4096, &[(1, 8), (2, 16)]);
        let payload = *b"\x01\x02\x03\x04\x05\x06\x07\x08";

        buf.put_shard(BlobId::new(1), &mut Cursor::new(payload.to_vec()))
            .await
            .unwrap();

        let view = buf.fetch_shard(BlobId::new(1)).unwrap();
        assert_eq!(&*view, &payload);
        drop(view);

        assert_eq!(
            buf.shard_crc32(BlobId::new(1)).unwrap(),
            crc32_ieee(&payload)
        );
    }

    #[tokio::test]
    async fn test_put_twice_reports_has_data() {
        let buf = sized_buf(4096, &[(1, 4)]);
        buf.put_shard(BlobId::new(1), &mut Cursor::new(vec![9; 4]))
            .await
            .unwrap();
        let err = buf
            .put_shard(BlobId::new(1), &mut Cursor::new(vec![9; 4]))
            .await
            .unwrap_err();
        assert!(matches!(err, BufError::BufHasData));
    }

    #[tokio::test]
    async fn test_put_unknown_bid() {
        let buf = sized_buf(4096, &[(1, 4)]);
        let err = buf
            .put_shard(BlobId::new(99), &mut Cursor::new(vec![0; 4]))
            .await
            .unwrap_err();
        assert!(matches!(err, BufError::BidNotFoundInBuf));
    }

    #[tokio::test]
    async fn test_short_read_leaves_slot_vacant() {
        let buf = sized_buf(4096, &[(1, 64)]);
        let err = buf
            .put_shard(BlobId::new(1), &mut Cursor::new(vec![1; 10]))
            .await
            .unwrap_err();
        assert!(matches!(err, BufError::Io(_)));
        assert!(!buf.shard_is_ok(BlobId::new(1)));

        // The slot is reusable after the failure.
        buf.put_shard(BlobId::new(1), &mut Cursor::new(vec![7; 64]))
            .await
            .unwrap();
        assert!(buf.shard_is_ok(BlobId::new(1)));
    }

    #[tokio::test]
    async fn test_zero_size_bid_is_born_ready() {
        let buf = sized_buf(4096, &[(1, 0), (2, 32)]);
        assert!(buf.shard_is_ok(BlobId::new(1)));
        assert!(buf.shard_size_is_zero(BlobId::new(1)).unwrap());

        // Put on a zero-size bid reads nothing and succeeds.
        buf.put_shard(BlobId::new(1), &mut Cursor::new(Vec::new()))
            .await
            .unwrap();

        let view = buf.fetch_shard(BlobId::new(1)).unwrap();
        assert!(view.is_empty());
    }

    #[test]
    fn test_fetch_before_put_not_prepared() {
        let buf = sized_buf(4096, &[(1, 4)]);
        assert!(matches!(
            buf.fetch_shard(BlobId::new(1)),
            Err(BufError::ShardDataNotPrepared)
        ));
        assert!(matches!(
            buf.fetch_shard(BlobId::new(404)),
            Err(BufError::BidNotFoundInBuf)
        ));
    }

    #[test]
    fn test_layout_is_deterministic_and_disjoint() {
        let bids = [(10, 100), (11, 0), (12, 57), (13, 4000 - 157)];
        let a = sized_buf(4000, &bids);
        let b = sized_buf(4000, &bids);

        let offsets = |buf: &ShardsBuf| -> Vec<(usize, usize)> {
            let inner = buf.inner.lock();
            let head = inner
                .order
                .first()
                .map(|bid| inner.slots[bid].base)
                .unwrap();
            inner
                .order
                .iter()
                .map(|bid| {
                    let slot = &inner.slots[bid];
                    (slot.base - head, slot.size)
                })
                .collect()
        };

        // Same bid order, same offsets.
        assert_eq!(offsets(&a), offsets(&b));

        // Contiguous and non-overlapping, in order.
        let mut expect = 0;
        for (offset, size) in offsets(&a) {
            assert_eq!(offset, expect);
            expect += size;
        }
        assert_eq!(expect, 4000);
    }

    #[test]
    #[should_panic(expected = "buf space not enough")]
    fn test_layout_overflow_panics() {
        let _ = sized_buf(64, &[(1, 65)]);
    }

    #[test]
    fn test_take_and_commit_reconstructed_cell() {
        let buf = sized_buf(4096, &[(1, 8)]);

        let (mut cell, present) = buf.take_shard_buf(BlobId::new(1)).unwrap();
        assert!(!present);
        assert_eq!(cell.len(), 8);

        cell.copy_from_slice(b"recovery");
        buf.set_shard_buf(BlobId::new(1), cell).unwrap();

        let view = buf.fetch_shard(BlobId::new(1)).unwrap();
        assert_eq!(&*view, b"recovery");
    }

    #[test]
    fn test_commit_foreign_buffer_is_illegal() {
        let buf = sized_buf(4096, &[(1, 8)]);

        let (_cell, _) = buf.take_shard_buf(BlobId::new(1)).unwrap();
        let foreign = BytesMut::zeroed(8);
        assert!(matches!(
            buf.set_shard_buf(BlobId::new(1), foreign),
            Err(BufError::IllegalBuf)
        ));
    }

    #[test]
    fn test_commit_wrong_length_is_illegal() {
        let buf = sized_buf(4096, &[(1, 8)]);

        let (mut cell, _) = buf.take_shard_buf(BlobId::new(1)).unwrap();
        let tail = cell.split_off(4);
        assert!(matches!(
            buf.set_shard_buf(BlobId::new(1), cell),
            Err(BufError::IllegalBuf)
        ));
        drop(tail);
    }

    #[tokio::test]
    async fn test_commit_over_ready_slot_has_data() {
        let buf = sized_buf(4096, &[(1, 4)]);
        buf.put_shard(BlobId::new(1), &mut Cursor::new(vec![3; 4]))
            .await
            .unwrap();

        assert!(matches!(
            buf.set_shard_buf(BlobId::new(1), BytesMut::zeroed(4)),
            Err(BufError::BufHasData)
        ));
    }

    #[test]
    fn test_restore_keeps_standing() {
        let buf = sized_buf(4096, &[(1, 8)]);

        let (cell, present) = buf.take_shard_buf(BlobId::new(1)).unwrap();
        buf.restore_shard_buf(BlobId::new(1), cell, present);
        assert!(!buf.shard_is_ok(BlobId::new(1)));

        // And round-trips ready content unchanged.
        let (mut cell, _) = buf.take_shard_buf(BlobId::new(1)).unwrap();
        cell.copy_from_slice(b"ready!!!");
        buf.set_shard_buf(BlobId::new(1), cell).unwrap();
        let (cell, present) = buf.take_shard_buf(BlobId::new(1)).unwrap();
        assert!(present);
        buf.restore_shard_buf(BlobId::new(1), cell, present);
        assert!(buf.shard_is_ok(BlobId::new(1)));
    }

    #[tokio::test]
    async fn test_into_chunk_reassembles_allocation() {
        let buf = sized_buf(4096, &[(1, 100), (2, 0), (3, 900)]);
        buf.put_shard(BlobId::new(1), &mut Cursor::new(vec![5; 100]))
            .await
            .unwrap();

        let chunk = buf.into_chunk().expect("nothing checked out");
        assert_eq!(chunk.len(), 4096);
    }

    #[test]
    fn test_into_chunk_with_checked_out_cell() {
        let buf = sized_buf(4096, &[(1, 100)]);
        let (_cell, _) = buf.take_shard_buf(BlobId::new(1)).unwrap();
        assert!(buf.into_chunk().is_none());
    }

    #[test]
    fn test_empty_layout_releases_whole_chunk() {
        let buf = ShardsBuf::new(BytesMut::zeroed(1024));
        let chunk = buf.into_chunk().unwrap();
        assert_eq!(chunk.len(), 1024);
    }
}
