//! Download planning for stripe repair
//!
//! Reconstruction needs any `n` surviving replicas of a stripe. A plan
//! is one such choice. Plans share a fixed prefix of `n - 1` replicas and
//! rotate the last slot through the remaining survivors: bytes pulled for
//! an earlier plan are never re-downloaded (the download status
//! deduplicates per replica), so trying the next plan only costs the
//! rotated replica.

use blobgrid_common::VunitLocation;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashSet;

/// A set of exactly `n` surviving replicas to download
#[derive(Debug, Clone)]
pub(crate) struct DownloadPlan {
    pub(crate) replicas: Vec<VunitLocation>,
}

/// One stripe under repair: its replicas, geometry and bad positions
#[derive(Debug, Clone)]
pub(crate) struct RepairStripe {
    pub(crate) replicas: Vec<VunitLocation>,
    pub(crate) n: usize,
    pub(crate) m: usize,
    pub(crate) bad_idxs: Vec<u8>,
}

impl RepairStripe {
    /// Ordered download plans for this stripe
    ///
    /// Replicas are shuffled once, bad positions dropped, and
    /// `well - n + 1` plans emitted over the shuffled order. Empty when
    /// fewer than `n` replicas survive.
    pub(crate) fn gen_download_plans(&self, rng: &mut impl Rng) -> Vec<DownloadPlan> {
        let bad: HashSet<u8> = self.bad_idxs.iter().copied().collect();

        let mut shuffled = self.replicas.clone();
        shuffled.shuffle(rng);

        let well: Vec<VunitLocation> = shuffled
            .into_iter()
            .filter(|replica| !bad.contains(&replica.vuid.index()))
            .collect();
        if well.len() < self.n {
            return Vec::new();
        }

        let plan_cnt = well.len() - self.n + 1;
        (0..plan_cnt)
            .map(|i| {
                let mut replicas = well[..self.n - 1].to_vec();
                replicas.push(well[self.n - 1 + i].clone());
                DownloadPlan { replicas }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobgrid_common::{DiskId, Vuid};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn stripe(total: usize, n: usize, m: usize, bad: &[u8]) -> RepairStripe {
        let replicas = (0..total)
            .map(|i| VunitLocation {
                vuid: Vuid::new(9, u8::try_from(i).unwrap(), 1),
                host: format!("http://node-{i}:8889"),
                disk_id: DiskId::new(u32::try_from(i).unwrap()),
            })
            .collect();
        RepairStripe {
            replicas,
            n,
            m,
            bad_idxs: bad.to_vec(),
        }
    }

    #[test]
    fn test_plan_count_and_size() {
        let stripe = stripe(8, 4, 4, &[0]);
        let mut rng = StdRng::seed_from_u64(7);
        let plans = stripe.gen_download_plans(&mut rng);

        // 7 well replicas, n = 4 -> 4 plans of exactly n replicas.
        assert_eq!(plans.len(), 4);
        for plan in &plans {
            assert_eq!(plan.replicas.len(), 4);
        }
    }

    #[test]
    fn test_plans_exclude_bad_and_share_prefix() {
        let stripe = stripe(8, 4, 4, &[1, 5]);
        let mut rng = StdRng::seed_from_u64(11);
        let plans = stripe.gen_download_plans(&mut rng);
        assert_eq!(plans.len(), 3);

        let prefix: Vec<u8> = plans[0].replicas[..3]
            .iter()
            .map(|r| r.vuid.index())
            .collect();
        let mut rotated = HashSet::new();
        for plan in &plans {
            for replica in &plan.replicas {
                assert!(![1u8, 5u8].contains(&replica.vuid.index()));
            }
            let shared: Vec<u8> = plan.replicas[..3].iter().map(|r| r.vuid.index()).collect();
            assert_eq!(shared, prefix);
            assert!(rotated.insert(plan.replicas[3].vuid.index()));
        }
    }

    #[test]
    fn test_no_plans_when_too_few_survivors() {
        // 5 replicas, 2 bad -> 3 well < n = 4.
        let stripe1 = stripe(5, 4, 1, &[0, 1]);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(stripe1.gen_download_plans(&mut rng).is_empty());

        // Exactly n - 1 survivors is still not enough.
        let stripe2 = stripe(5, 5, 1, &[4]);
        assert!(stripe2.gen_download_plans(&mut rng).is_empty());
    }

    #[test]
    fn test_exactly_n_survivors_single_plan() {
        let stripe = stripe(5, 4, 1, &[2]);
        let mut rng = StdRng::seed_from_u64(5);
        let plans = stripe.gen_download_plans(&mut rng);
        assert_eq!(plans.len(), 1);

        let mut idxs: Vec<u8> = plans[0].replicas.iter().map(|r| r.vuid.index()).collect();
        idxs.sort_unstable();
        assert_eq!(idxs, vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let stripe = stripe(10, 4, 4, &[0]);
        let pick = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            stripe
                .gen_download_plans(&mut rng)
                .into_iter()
                .map(|p| p.replicas.into_iter().map(|r| r.vuid.index()).collect())
                .collect::<Vec<Vec<u8>>>()
        };
        assert_eq!(pick(42), pick(42));
    }
}
