//! Property-based tests for partial-result merging.
//!
//! Partials are produced by real local steps over generated shards, then
//! merged in different orders and groupings.

use proptest::collection::vec as prop_vec;
use proptest::prelude::*;

use tessera::algorithms::covariance::{self, Covariance, CrossProducts};
use tessera::algorithms::moments::{self, Moments, Stats};
use tessera::compute::{Distributed, PartialSet, Step};
use tessera::testing::dense_table;

const COLS: usize = 3;

// =============================================================================
// Strategies and helpers
// =============================================================================

/// Row-major shard of up to 12 rows.
fn arb_shard() -> impl Strategy<Value = Vec<f64>> {
    prop_vec(prop_vec(-1e3f64..1e3, COLS), 0..12)
        .prop_map(|rows| rows.into_iter().flatten().collect())
}

fn moments_partial(values: &[f64]) -> PartialSet<Moments> {
    let mut local = Distributed::<Moments>::new(Step::STEP1_LOCAL);
    local
        .set_input(moments::InputId::Data, dense_table(values, values.len() / COLS, COLS))
        .unwrap();
    local.compute().unwrap();
    local.take_partial_result().unwrap()
}

fn covariance_partial(values: &[f64]) -> PartialSet<Covariance> {
    let mut local = Distributed::<Covariance>::new(Step::STEP1_LOCAL);
    local
        .set_input(covariance::InputId::Data, dense_table(values, values.len() / COLS, COLS))
        .unwrap();
    local.compute().unwrap();
    local.take_partial_result().unwrap()
}

fn stats(values: &[f64]) -> Stats {
    Stats::read(&moments_partial(values)).unwrap()
}

fn cross(values: &[f64]) -> CrossProducts {
    CrossProducts::read(&covariance_partial(values)).unwrap()
}

fn merged(a: &Stats, b: &Stats) -> Stats {
    let mut out = a.clone();
    out.merge(b);
    out
}

fn close(a: &[f64], b: &[f64]) -> bool {
    a.iter()
        .zip(b)
        .all(|(x, y)| (x - y).abs() <= 1e-9 * (1.0 + x.abs().max(y.abs())))
}

fn stats_close(a: &Stats, b: &Stats) -> bool {
    a.n == b.n
        && a.min == b.min
        && a.max == b.max
        && close(&a.sum, &b.sum)
        && close(&a.sum_sq, &b.sum_sq)
        && close(&a.m2, &b.m2)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn moments_merge_is_commutative(a in arb_shard(), b in arb_shard()) {
        let (sa, sb) = (stats(&a), stats(&b));
        prop_assert_eq!(merged(&sa, &sb), merged(&sb, &sa));
    }

    #[test]
    fn moments_merge_is_associative(a in arb_shard(), b in arb_shard(), c in arb_shard()) {
        let (sa, sb, sc) = (stats(&a), stats(&b), stats(&c));
        let left = merged(&merged(&sa, &sb), &sc);
        let right = merged(&sa, &merged(&sb, &sc));
        prop_assert!(stats_close(&left, &right), "{left:?} vs {right:?}");
    }

    #[test]
    fn moments_merge_matches_concatenation(a in arb_shard(), b in arb_shard()) {
        let whole: Vec<f64> = a.iter().chain(&b).copied().collect();
        let split = merged(&stats(&a), &stats(&b));
        prop_assert!(stats_close(&split, &stats(&whole)));
    }

    #[test]
    fn empty_partial_is_identity(a in arb_shard()) {
        let sa = stats(&a);
        let empty = stats(&[]);
        prop_assert_eq!(empty.n, 0);
        prop_assert_eq!(merged(&sa, &empty), sa.clone());
        prop_assert_eq!(merged(&empty, &sa), sa);
    }

    #[test]
    fn master_fold_ignores_add_order(a in arb_shard(), b in arb_shard(), c in arb_shard()) {
        let fold = |order: [&Vec<f64>; 3]| {
            let mut master = Distributed::<Moments>::new(Step::STEP2_MASTER);
            for shard in order {
                master.add(moments_partial(shard)).unwrap();
            }
            Stats::read(master.compute().unwrap()).unwrap()
        };
        let forward = fold([&a, &b, &c]);
        let backward = fold([&c, &b, &a]);
        prop_assert!(stats_close(&forward, &backward));
    }

    #[test]
    fn covariance_merge_commutes_and_keeps_identity(a in arb_shard(), b in arb_shard()) {
        let (ca, cb) = (cross(&a), cross(&b));
        let mut ab = ca.clone();
        ab.merge(&cb);
        let mut ba = cb.clone();
        ba.merge(&ca);
        prop_assert_eq!(&ab, &ba);

        let mut with_empty = ca.clone();
        with_empty.merge(&cross(&[]));
        prop_assert_eq!(with_empty, ca);
    }

    #[test]
    fn covariance_merge_matches_concatenation(a in arb_shard(), b in arb_shard()) {
        let whole: Vec<f64> = a.iter().chain(&b).copied().collect();
        let mut split = cross(&a);
        split.merge(&cross(&b));
        let full = cross(&whole);
        prop_assert_eq!(split.n, full.n);
        prop_assert!(close(&split.cross, &full.cross));
    }
}
