//! Code-mode layout oracle
//!
//! A volume's code mode fixes how its `n + m + l` units are laid out
//! across availability zones and which units protect which. This crate is
//! the single source of truth for that layout:
//!
//! - the **global stripe** spans every data and global-parity unit with
//!   parameters `(n, m)`;
//! - each AZ owns a **local stripe**: its slice of the global units plus
//!   its local parities, with parameters `((n + m) / az, l / az)`.
//!
//! Unit index space: data `[0, n)`, global parity `[n, n + m)`, local
//! parity `[n + m, n + m + l)`. Every region is divided into equal
//! contiguous AZ slices, so membership is pure arithmetic.

use blobgrid_common::VunitLocation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Erasure scheme of a volume
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeMode {
    /// 15 data + 12 global parity, 3 AZs, no local parity
    EC15P12,
    /// 6 data + 6 global parity, 3 AZs, no local parity
    EC6P6,
    /// 16 data + 20 global parity, 2 AZs, 1 local parity per AZ
    EC16P20L2,
    /// 6 data + 10 global parity, 2 AZs, 1 local parity per AZ
    EC6P10L2,
    /// 4 data + 4 global parity, 2 AZs, 1 local parity per AZ
    EC4P4L2,
}

impl CodeMode {
    /// Layout parameters of this mode
    #[must_use]
    pub const fn tactic(self) -> Tactic {
        match self {
            Self::EC15P12 => Tactic::new(15, 12, 0, 3),
            Self::EC6P6 => Tactic::new(6, 6, 0, 3),
            Self::EC16P20L2 => Tactic::new(16, 20, 2, 2),
            Self::EC6P10L2 => Tactic::new(6, 10, 2, 2),
            Self::EC4P4L2 => Tactic::new(4, 4, 2, 2),
        }
    }
}

impl fmt::Display for CodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EC15P12 => write!(f, "EC15P12"),
            Self::EC6P6 => write!(f, "EC6P6"),
            Self::EC16P20L2 => write!(f, "EC16P20L2"),
            Self::EC6P10L2 => write!(f, "EC6P10L2"),
            Self::EC4P4L2 => write!(f, "EC4P4L2"),
        }
    }
}

/// Layout parameters of one code mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tactic {
    /// Data units
    pub n: usize,
    /// Global parity units
    pub m: usize,
    /// Local parity units across all AZs
    pub l: usize,
    /// Availability zones the volume spans
    pub az_count: usize,
}

impl Tactic {
    /// Build a tactic, validating that every region divides evenly
    /// across AZs.
    ///
    /// # Panics
    /// Panics when `n`, `m` or `l` is not divisible by `az_count`.
    #[must_use]
    pub const fn new(n: usize, m: usize, l: usize, az_count: usize) -> Self {
        assert!(n > 0 && m > 0 && az_count > 0, "empty code mode");
        assert!(
            n % az_count == 0 && m % az_count == 0 && l % az_count == 0,
            "code mode regions must divide evenly across AZs"
        );
        Self { n, m, l, az_count }
    }

    /// Total unit count `n + m + l`
    #[must_use]
    pub const fn total_units(&self) -> usize {
        self.n + self.m + self.l
    }

    /// True when `idx` names a local-parity unit
    #[must_use]
    pub const fn is_local_unit(&self, idx: usize) -> bool {
        idx >= self.n + self.m
    }

    /// AZ owning unit `idx`
    ///
    /// # Panics
    /// Panics when `idx` is outside the unit index space.
    #[must_use]
    pub const fn az_of_unit(&self, idx: usize) -> usize {
        if idx < self.n {
            idx / (self.n / self.az_count)
        } else if idx < self.n + self.m {
            (idx - self.n) / (self.m / self.az_count)
        } else {
            assert!(idx < self.total_units(), "unit index out of range");
            assert!(self.l > 0, "mode has no local units");
            (idx - self.n - self.m) / (self.l / self.az_count)
        }
    }

    /// The global stripe: every data and global-parity unit
    #[must_use]
    pub fn global_stripe(&self) -> (Vec<usize>, usize, usize) {
        ((0..self.n + self.m).collect(), self.n, self.m)
    }

    /// The local stripe containing unit `idx`
    ///
    /// Returns the AZ's global units followed by its local parities, with
    /// the local stripe's `(n_l, m_l)`. `None` for modes without local
    /// parity.
    #[must_use]
    pub fn local_stripe_of(&self, idx: usize) -> Option<(Vec<usize>, usize, usize)> {
        if self.l == 0 {
            return None;
        }
        let az = self.az_of_unit(idx);
        Some(self.local_stripe_of_az(az))
    }

    /// The local stripe of one AZ; see [`Self::local_stripe_of`].
    ///
    /// # Panics
    /// Panics for modes without local parity or an out-of-range AZ.
    #[must_use]
    pub fn local_stripe_of_az(&self, az: usize) -> (Vec<usize>, usize, usize) {
        assert!(self.l > 0, "mode has no local stripes");
        assert!(az < self.az_count, "az out of range");

        let data_per_az = self.n / self.az_count;
        let parity_per_az = self.m / self.az_count;
        let local_per_az = self.l / self.az_count;

        let mut idxs = Vec::with_capacity(data_per_az + parity_per_az + local_per_az);
        idxs.extend(az * data_per_az..(az + 1) * data_per_az);
        idxs.extend(self.n + az * parity_per_az..self.n + (az + 1) * parity_per_az);
        idxs.extend(
            self.n + self.m + az * local_per_az..self.n + self.m + (az + 1) * local_per_az,
        );
        (idxs, data_per_az + parity_per_az, local_per_az)
    }

    /// Group repair indices by the local stripe that owns them
    ///
    /// Non-empty groups only, in AZ order. Empty for modes without local
    /// parity.
    #[must_use]
    pub fn idx_split_by_local_stripe(&self, idxs: &[u8]) -> Vec<Vec<u8>> {
        if self.l == 0 {
            return Vec::new();
        }
        let mut groups = vec![Vec::new(); self.az_count];
        for &idx in idxs {
            groups[self.az_of_unit(idx as usize)].push(idx);
        }
        groups.retain(|g| !g.is_empty());
        groups
    }
}

/// Project a volume replica list onto stripe membership
///
/// # Panics
/// Panics when an index is outside the replica list: stripe membership is
/// derived from the same code mode that sized the list, so a miss is a
/// programmer error.
#[must_use]
pub fn abstract_replicas(all: &[VunitLocation], idxs: &[usize]) -> Vec<VunitLocation> {
    idxs.iter().map(|&i| all[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobgrid_common::{DiskId, Vuid};

    const ALL_MODES: [CodeMode; 5] = [
        CodeMode::EC15P12,
        CodeMode::EC6P6,
        CodeMode::EC16P20L2,
        CodeMode::EC6P10L2,
        CodeMode::EC4P4L2,
    ];

    #[test]
    fn test_all_presets_are_well_formed() {
        for mode in ALL_MODES {
            let t = mode.tactic();
            assert_eq!(t.n % t.az_count, 0, "{mode}");
            assert_eq!(t.m % t.az_count, 0, "{mode}");
            assert_eq!(t.l % t.az_count, 0, "{mode}");
        }
    }

    #[test]
    fn test_global_stripe() {
        let t = CodeMode::EC4P4L2.tactic();
        let (idxs, n, m) = t.global_stripe();
        assert_eq!(idxs, (0..8).collect::<Vec<_>>());
        assert_eq!((n, m), (4, 4));
    }

    #[test]
    fn test_local_stripe_membership() {
        let t = CodeMode::EC4P4L2.tactic();

        // AZ 0 owns data 0-1, parity 4-5 and local 8.
        let (idxs, n_l, m_l) = t.local_stripe_of(0).unwrap();
        assert_eq!(idxs, vec![0, 1, 4, 5, 8]);
        assert_eq!((n_l, m_l), (4, 1));

        // Unit 8 is AZ 0's local parity, same stripe.
        assert_eq!(t.local_stripe_of(8).unwrap().0, vec![0, 1, 4, 5, 8]);

        // AZ 1 owns data 2-3, parity 6-7 and local 9.
        let (idxs, _, _) = t.local_stripe_of(3).unwrap();
        assert_eq!(idxs, vec![2, 3, 6, 7, 9]);
    }

    #[test]
    fn test_local_stripe_wide_mode() {
        let t = CodeMode::EC16P20L2.tactic();
        let (idxs, n_l, m_l) = t.local_stripe_of(0).unwrap();
        assert_eq!(idxs.len(), 8 + 10 + 1);
        assert_eq!((n_l, m_l), (18, 1));
        assert_eq!(idxs[0], 0);
        assert_eq!(*idxs.last().unwrap(), 36);
    }

    #[test]
    fn test_no_local_stripes_without_local_parity() {
        let t = CodeMode::EC6P6.tactic();
        assert!(t.local_stripe_of(0).is_none());
        assert!(t.idx_split_by_local_stripe(&[0, 5, 11]).is_empty());
        assert!(!t.is_local_unit(11));
    }

    #[test]
    fn test_is_local_unit() {
        let t = CodeMode::EC4P4L2.tactic();
        for idx in 0..8 {
            assert!(!t.is_local_unit(idx));
        }
        assert!(t.is_local_unit(8));
        assert!(t.is_local_unit(9));
    }

    #[test]
    fn test_idx_split_by_local_stripe() {
        let t = CodeMode::EC4P4L2.tactic();
        let groups = t.idx_split_by_local_stripe(&[0, 3, 8, 6]);
        assert_eq!(groups, vec![vec![0, 8], vec![3, 6]]);

        // A single-AZ split yields a single group.
        let groups = t.idx_split_by_local_stripe(&[9]);
        assert_eq!(groups, vec![vec![9]]);
    }

    #[test]
    fn test_abstract_replicas() {
        let all: Vec<VunitLocation> = (0..10)
            .map(|i| VunitLocation {
                vuid: Vuid::new(7, i, 1),
                host: format!("http://node-{i}:8889"),
                disk_id: DiskId::new(u32::from(i)),
            })
            .collect();

        let picked = abstract_replicas(&all, &[2, 6, 9]);
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0].vuid.index(), 2);
        assert_eq!(picked[1].vuid.index(), 6);
        assert_eq!(picked[2].vuid.index(), 9);
    }
}
