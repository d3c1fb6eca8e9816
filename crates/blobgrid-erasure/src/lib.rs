//! Reed-Solomon encoder pool
//!
//! One [`Encoder`] handles one `(n, m)` stripe geometry. Both stripe
//! tiers of a volume go through the same surface: the global stripe with
//! the mode's `(n, m)` and each AZ's local stripe with its
//! `(n_l, m_l)`.
//!
//! Reconstruction is strictly **in place**: every row of the matrix,
//! present or absent, is storage the caller already owns. Absent rows
//! are handed in as `(buffer, false)` and the codec fills the buffer
//! without reallocating, which is what lets the repair engine commit
//! reconstructed shards by flipping a flag instead of copying.

use parking_lot::RwLock;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors from encoder construction and stripe operations
#[derive(Debug, Error)]
pub enum CodecError {
    /// Invalid `(n, m)` geometry
    #[error("invalid codec geometry n={n} m={m}: {source}")]
    InvalidGeometry {
        n: usize,
        m: usize,
        source: reed_solomon_erasure::Error,
    },

    /// Encode/reconstruct/verify failure reported by the codec
    #[error("codec: {0}")]
    Codec(#[from] reed_solomon_erasure::Error),
}

/// A matrix row for in-place reconstruction
///
/// `(storage, present)`: storage always has the stripe's shard length;
/// `present == false` marks the row as a reconstruction destination.
pub type MatrixRow<'a> = (&'a mut [u8], bool);

/// Reed-Solomon codec for one `(n, m)` geometry
pub struct Encoder {
    rs: ReedSolomon,
    n: usize,
    m: usize,
}

impl Encoder {
    /// Create an encoder for `n` data and `m` parity rows
    pub fn new(n: usize, m: usize) -> Result<Self, CodecError> {
        let rs = ReedSolomon::new(n, m).map_err(|source| CodecError::InvalidGeometry {
            n,
            m,
            source,
        })?;
        Ok(Self { rs, n, m })
    }

    /// Data row count
    #[must_use]
    pub const fn data_rows(&self) -> usize {
        self.n
    }

    /// Parity row count
    #[must_use]
    pub const fn parity_rows(&self) -> usize {
        self.m
    }

    /// Fill the `m` parity rows from the `n` data rows
    ///
    /// `rows` must hold `n + m` equal-length buffers; the first `n` are
    /// read, the rest overwritten.
    pub fn encode(&self, rows: &mut [Vec<u8>]) -> Result<(), CodecError> {
        self.rs.encode(rows)?;
        Ok(())
    }

    /// Reconstruct the absent rows of a stripe in place
    ///
    /// Rows flagged `false` are filled from the others; their storage is
    /// written through, never replaced. At most `m` rows may be absent
    /// and every row must already have the stripe's shard length.
    pub fn reconstruct(&self, rows: &mut [MatrixRow<'_>]) -> Result<(), CodecError> {
        self.rs.reconstruct(rows)?;
        Ok(())
    }

    /// Verify that parity rows are consistent with data rows
    ///
    /// All rows must be present. Returns `Ok(false)` on inconsistency.
    pub fn verify(&self, rows: &[&[u8]]) -> Result<bool, CodecError> {
        Ok(self.rs.verify(rows)?)
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("n", &self.n)
            .field("m", &self.m)
            .finish()
    }
}

/// Cache of encoders keyed by geometry
///
/// Matrix construction for a geometry is not free; recovery touches at
/// most a handful of geometries per volume, so they are built once and
/// shared.
#[derive(Debug, Default)]
pub struct EncoderPool {
    cache: RwLock<HashMap<(usize, usize), Arc<Encoder>>>,
}

impl EncoderPool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (building on first use) the encoder for `(n, m)`
    pub fn get(&self, n: usize, m: usize) -> Result<Arc<Encoder>, CodecError> {
        if let Some(enc) = self.cache.read().get(&(n, m)) {
            return Ok(Arc::clone(enc));
        }

        let enc = Arc::new(Encoder::new(n, m)?);
        let mut cache = self.cache.write();
        Ok(Arc::clone(cache.entry((n, m)).or_insert(enc)))
    }
}
