//! Batch, online and distributed execution of the reference algorithms.

use std::sync::Arc;

use approx::assert_relative_eq;
use rstest::rstest;
use tessera::algorithms::covariance::{self, Covariance};
use tessera::algorithms::moments::{self, Moments};
use tessera::algorithms::quantile::{self, Quantile};
use tessera::compute::{
    Batch, CancellationToken, Collection, CollectionSnapshot, Distributed, Online, OnlineState,
    PartialSet, Step,
};
use tessera::table::{create_dense_table, DataType};
use tessera::testing::{
    dense_table, random_dense_f64, random_integers_f64, row_slice, shard_ranges,
    DEFAULT_TOLERANCE_F64,
};
use tessera::{ComputeConfig, ComputeError};

fn local_moments(values: &[f64], cols: usize, rows: std::ops::Range<usize>) -> PartialSet<Moments> {
    let mut local = Distributed::<Moments>::new(Step::STEP1_LOCAL);
    local
        .set_input(moments::InputId::Data, row_slice(values, cols, rows))
        .unwrap();
    local.compute().unwrap();
    local.take_partial_result().unwrap()
}

fn read(partial: &PartialSet<Moments>, key: moments::PartialId) -> Vec<f64> {
    partial.table(key).unwrap().to_vec::<f64>().unwrap()
}

// =============================================================================
// Distributed
// =============================================================================

#[test]
fn four_shards_reproduce_full_sum_and_count() {
    let values = random_integers_f64(100, 5, 11, -50, 50);
    let full = local_moments(&values, 5, 0..100);

    let mut master = Distributed::<Moments>::new(Step::STEP2_MASTER).with_expected_nodes(4);
    for rows in shard_ranges(100, 4) {
        assert_eq!(rows.len(), 25);
        master.add(local_moments(&values, 5, rows)).unwrap();
    }
    let merged = master.compute().unwrap();

    let count = |p: &PartialSet<Moments>| {
        p.table(moments::PartialId::Count)
            .unwrap()
            .to_vec::<i64>()
            .unwrap()
    };
    assert_eq!(count(merged), vec![100]);
    assert_eq!(count(merged), count(&full));
    assert_eq!(
        read(merged, moments::PartialId::Sum),
        read(&full, moments::PartialId::Sum)
    );
    assert_eq!(
        read(merged, moments::PartialId::SumSquares),
        read(&full, moments::PartialId::SumSquares)
    );
    assert_eq!(
        read(merged, moments::PartialId::Min),
        read(&full, moments::PartialId::Min)
    );
}

#[test]
fn distributed_result_matches_batch() {
    let values = random_dense_f64(90, 3, 5, -10.0, 10.0);

    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&values, 90, 3));
    batch.compute().unwrap();

    let mut master = Distributed::<Moments>::new(Step::STEP2_MASTER);
    // Reverse order: adds are order-independent.
    for rows in shard_ranges(90, 3).into_iter().rev() {
        master.add(local_moments(&values, 3, rows)).unwrap();
    }
    master.finalize_compute().unwrap();

    for key in [
        moments::ResultId::Mean,
        moments::ResultId::Variance,
        moments::ResultId::StandardDeviation,
        moments::ResultId::Maximum,
    ] {
        let a = batch.result(key).unwrap().to_vec::<f64>().unwrap();
        let b = master.result(key).unwrap().to_vec::<f64>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_relative_eq!(x, y, max_relative = DEFAULT_TOLERANCE_F64);
        }
    }
}

#[test]
fn partials_survive_a_json_round_trip() {
    let values = random_dense_f64(40, 4, 9, 0.0, 1.0);
    let partial = local_moments(&values, 4, 0..40);

    let json = serde_json::to_string(&partial.snapshot().unwrap()).unwrap();
    let snapshot: CollectionSnapshot = serde_json::from_str(&json).unwrap();
    let restored = Collection::<moments::PartialId>::from_snapshot(&snapshot).unwrap();

    assert_eq!(restored.keys(), partial.keys());
    for key in partial.keys() {
        assert_eq!(
            restored.table(key).unwrap().to_vec::<f64>().unwrap(),
            partial.table(key).unwrap().to_vec::<f64>().unwrap(),
            "{key:?}"
        );
    }

    let mut master = Distributed::<Moments>::new(Step::STEP2_MASTER);
    master.add(restored).unwrap();
    let result = master.finalize_compute().unwrap();
    assert!(result.contains(moments::ResultId::Mean));
}

#[test]
fn distributed_state_errors() {
    let data = dense_table(&[1.0, 2.0], 2, 1);

    let mut local = Distributed::<Moments>::new(Step::STEP1_LOCAL);
    let err = local.add(PartialSet::<Moments>::new()).unwrap_err();
    assert!(matches!(err.first(), ComputeError::InvalidState(_)));
    local.set_input(moments::InputId::Data, Arc::clone(&data)).unwrap();
    local.compute().unwrap();
    assert!(matches!(
        local.finalize_compute().unwrap_err().first(),
        ComputeError::InvalidState(_)
    ));

    let mut master = Distributed::<Moments>::new(Step::STEP2_MASTER).with_expected_nodes(1);
    assert!(matches!(
        master.set_input(moments::InputId::Data, Arc::clone(&data)).unwrap_err().first(),
        ComputeError::InvalidState(_)
    ));
    assert!(matches!(
        master.finalize_compute().unwrap_err().first(),
        ComputeError::InvalidState(_)
    ));
    assert!(matches!(
        master.compute().unwrap_err().first(),
        ComputeError::InvalidState(_)
    ));
    master.add(local.take_partial_result().unwrap()).unwrap();
    assert!(matches!(
        master.add(PartialSet::<Moments>::new()).unwrap_err().first(),
        ComputeError::InvalidState(_)
    ));
    assert_eq!(master.n_added(), 1);

    let mut unknown = Distributed::<Moments>::new(Step::local(3));
    unknown.set_input(moments::InputId::Data, data).unwrap();
    assert!(matches!(
        unknown.compute().unwrap_err().first(),
        ComputeError::Unsupported(_)
    ));
}

#[test]
fn finalize_without_explicit_compute_merges_first() {
    let values = random_integers_f64(30, 2, 3, 0, 9);
    let mut master = Distributed::<Moments>::new(Step::STEP2_MASTER);
    master.add(local_moments(&values, 2, 0..10)).unwrap();
    master.add(local_moments(&values, 2, 10..30)).unwrap();

    let sum = master
        .finalize_compute()
        .unwrap()
        .table(moments::ResultId::Sum)
        .unwrap()
        .to_vec::<f64>()
        .unwrap();
    let expected: Vec<f64> = (0..2)
        .map(|j| values.iter().skip(j).step_by(2).sum::<f64>())
        .collect();
    assert_eq!(sum, expected);
    assert!(master.partial_result().is_some());
}

// =============================================================================
// Online
// =============================================================================

#[rstest]
#[case::one_chunk(1)]
#[case::three_chunks(3)]
#[case::seven_chunks(7)]
fn online_over_chunks_matches_batch(#[case] chunks: usize) {
    let values = random_dense_f64(70, 4, 21, -3.0, 3.0);

    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&values, 70, 4));
    batch.compute().unwrap();

    let mut online = Online::<Moments>::new();
    for rows in shard_ranges(70, chunks) {
        online.set_input(moments::InputId::Data, row_slice(&values, 4, rows));
        online.compute().unwrap();
    }
    online.finalize_compute().unwrap();

    for &key in <moments::ResultId as tessera::compute::Key>::all() {
        let a = batch.result(key).unwrap().to_vec::<f64>().unwrap();
        let b = online.result(key).unwrap().to_vec::<f64>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_relative_eq!(x, y, epsilon = 1e-12, max_relative = DEFAULT_TOLERANCE_F64);
        }
    }
}

#[test]
fn online_finalize_is_cached_until_next_compute() {
    let mut online = Online::<Moments>::new();
    assert_eq!(online.state(), OnlineState::Ready);
    assert!(matches!(
        online.finalize_compute().unwrap_err().first(),
        ComputeError::InvalidState(_)
    ));

    online.set_input(moments::InputId::Data, dense_table(&[1.0, 3.0], 2, 1));
    online.compute().unwrap();
    assert_eq!(online.state(), OnlineState::Computed);

    let first = online.finalize_compute().unwrap().table(moments::ResultId::Mean).unwrap().clone();
    let second = online.finalize_compute().unwrap().table(moments::ResultId::Mean).unwrap().clone();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(online.state(), OnlineState::Finalized);

    online.set_input(moments::InputId::Data, dense_table(&[5.0], 1, 1));
    online.compute().unwrap();
    assert_eq!(online.state(), OnlineState::Computed);
    let mean = online.finalize_compute().unwrap().table(moments::ResultId::Mean).unwrap().clone();
    assert_eq!(mean.to_vec::<f64>().unwrap(), vec![3.0]);
    // Earlier result handles keep their values.
    assert_eq!(first.to_vec::<f64>().unwrap(), vec![2.0]);
}

#[test]
fn online_rejects_chunk_of_different_width() {
    let mut online = Online::<Moments>::new();
    online.set_input(moments::InputId::Data, dense_table(&[1.0, 2.0], 1, 2));
    online.compute().unwrap();

    online.set_input(moments::InputId::Data, dense_table(&[1.0, 2.0, 3.0], 1, 3));
    let err = online.compute().unwrap_err();
    assert!(matches!(err.first(), ComputeError::DimensionMismatch { .. }));

    // The accumulator still holds the first chunk.
    let sum = online.finalize_compute().unwrap().table(moments::ResultId::Sum).unwrap().clone();
    assert_eq!(sum.to_vec::<f64>().unwrap(), vec![1.0, 2.0]);
}

// =============================================================================
// Failure semantics
// =============================================================================

#[test]
fn missing_input_allocates_nothing() {
    let mut batch = Batch::<Moments>::new();
    let err = batch.compute().unwrap_err();
    assert_eq!(err.first(), &ComputeError::MissingInput { key: "data" });
    assert!(batch.result_set().is_none());

    let mut online = Online::<Moments>::new();
    assert!(online.compute().is_err());
    assert!(online.partial_result().is_none());

    let mut local = Distributed::<Moments>::new(Step::STEP1_LOCAL);
    assert!(matches!(
        local.compute().unwrap_err().first(),
        ComputeError::MissingInput { .. }
    ));
    assert!(local.partial_result().is_none());
}

#[test]
fn failed_precondition_keeps_previous_result() {
    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&[1.0, 2.0], 1, 2));
    batch.compute().unwrap();

    batch.input_mut().remove(moments::InputId::Data);
    let err = batch.compute().unwrap_err();
    assert_eq!(err.first(), &ComputeError::MissingInput { key: "data" });
    let sum = batch.result(moments::ResultId::Sum).unwrap();
    assert_eq!(sum.to_vec::<f64>().unwrap(), vec![1.0, 2.0]);

    let mut local = Distributed::<Quantile>::new(Step::STEP1_LOCAL);
    local
        .set_input(quantile::InputId::Data, dense_table(&[1.0, 2.0], 1, 2))
        .unwrap();
    local.compute().unwrap();
    local.set_parameter(quantile::Parameter { q: 1.5, rounds: 8 });
    assert!(matches!(
        local.compute().unwrap_err().first(),
        ComputeError::InvalidParameter { .. }
    ));
    assert!(local.partial_result().is_some());
}

#[test]
fn failed_publish_leaves_every_supplied_result_untouched() {
    // A single row has no sample variance, and NaN has no i32 form.
    let mean = create_dense_table(1, 2, DataType::F64).unwrap();
    let variance = create_dense_table(1, 2, DataType::I32).unwrap();
    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&[3.0, 7.0], 1, 2));
    batch.set_result(moments::ResultId::Mean, Arc::clone(&mean));
    batch.set_result(moments::ResultId::Variance, Arc::clone(&variance));

    let status = batch.compute().unwrap_err();
    assert!(matches!(
        status.first(),
        ComputeError::Conversion { to: DataType::I32, .. }
    ));
    assert_eq!(mean.to_vec::<f64>().unwrap(), vec![0.0, 0.0]);
    assert_eq!(variance.to_vec::<i32>().unwrap(), vec![0, 0]);
    assert!(batch.result_set().is_none());
}

#[test]
fn every_failing_output_is_reported() {
    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&[3.0, 7.0], 1, 2));
    batch.set_result(moments::ResultId::Variance, create_dense_table(1, 2, DataType::I32).unwrap());
    batch.set_result(
        moments::ResultId::StandardDeviation,
        create_dense_table(1, 2, DataType::I64).unwrap(),
    );
    let status = batch.compute().unwrap_err();
    assert_eq!(status.errors().len(), 2);
    assert!(status
        .errors()
        .iter()
        .all(|e| matches!(e, ComputeError::Conversion { .. })));

    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&[3.0, 7.0], 1, 2));
    batch.set_result(moments::ResultId::Mean, create_dense_table(1, 3, DataType::F64).unwrap());
    batch.set_result(moments::ResultId::Sum, create_dense_table(2, 2, DataType::F64).unwrap());
    let status = batch.compute().unwrap_err();
    assert_eq!(status.errors().len(), 2);
    assert!(status.errors().iter().all(ComputeError::is_precondition));
}

#[test]
fn malformed_partials_fail_with_a_status() {
    let values = [1.0, 2.0, 3.0, 4.0];
    let good = local_moments(&values, 2, 0..2);
    let mut narrow = good.clone();
    narrow.set(moments::PartialId::Min, dense_table(&[0.0], 1, 1));
    narrow.set(moments::PartialId::Max, dense_table(&[9.0], 1, 1));

    let mut master = Distributed::<Moments>::new(Step::STEP2_MASTER);
    master.add(good).unwrap();
    master.add(narrow).unwrap();
    assert!(matches!(
        master.compute().unwrap_err().first(),
        ComputeError::DimensionMismatch { .. }
    ));

    let mut local = Distributed::<Covariance>::new(Step::STEP1_LOCAL);
    local
        .set_input(covariance::InputId::Data, dense_table(&values, 2, 2))
        .unwrap();
    let good = local.compute().unwrap().clone();
    let mut short = good.clone();
    short.set(covariance::PartialId::CrossProduct, dense_table(&[1.0, 0.0], 1, 2));

    let mut master = Distributed::<Covariance>::new(Step::STEP2_MASTER);
    master.add(good).unwrap();
    master.add(short).unwrap();
    assert!(matches!(
        master.compute().unwrap_err().first(),
        ComputeError::DimensionMismatch { .. }
    ));
}

#[test]
fn cancelled_computation_publishes_nothing() {
    let token = CancellationToken::new();
    token.cancel();
    let config = ComputeConfig::builder()
        .cancellation(token)
        .build()
        .unwrap();

    let target = create_dense_table(1, 2, DataType::F64).unwrap();
    let mut batch = Batch::<Moments>::new().with_config(config);
    batch.set_input(moments::InputId::Data, dense_table(&[1.0, 2.0, 3.0, 4.0], 2, 2));
    batch.set_result(moments::ResultId::Mean, Arc::clone(&target));

    let err = batch.compute().unwrap_err();
    assert!(err.is_cancelled());
    assert!(batch.result_set().is_none());
    assert_eq!(target.to_vec::<f64>().unwrap(), vec![0.0, 0.0]);
}

#[test]
fn cancelled_chunk_leaves_accumulator_intact() {
    let token = CancellationToken::new();
    let config = ComputeConfig::builder()
        .n_threads(1)
        .block_rows(1)
        .cancellation(token.clone())
        .build()
        .unwrap();
    let mut online = Online::<Moments>::new().with_config(config);
    online.set_input(moments::InputId::Data, dense_table(&[1.0, 2.0, 3.0], 3, 1));
    online.compute().unwrap();

    token.cancel();
    assert!(online.compute().unwrap_err().is_cancelled());
    // The failed chunk was not folded in.
    let count = online
        .partial_result()
        .unwrap()
        .table(moments::PartialId::Count)
        .unwrap()
        .get::<i64>(0, 0)
        .unwrap();
    assert_eq!(count, 3);
}

#[test]
fn caller_supplied_result_is_written_on_success() {
    let target = create_dense_table(1, 2, DataType::F32).unwrap();
    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&[1.0, 4.0, 3.0, 8.0], 2, 2));
    batch.set_result(moments::ResultId::Mean, Arc::clone(&target));
    batch.compute().unwrap();

    assert_eq!(target.to_vec::<f32>().unwrap(), vec![2.0, 6.0]);
    assert!(Arc::ptr_eq(&batch.result(moments::ResultId::Mean).unwrap(), &target));
}

#[test]
fn caller_supplied_result_with_wrong_shape_is_rejected() {
    let target = create_dense_table(1, 3, DataType::F64).unwrap();
    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&[1.0, 2.0], 1, 2));
    batch.set_result(moments::ResultId::Mean, target);
    assert!(matches!(
        batch.compute().unwrap_err().first(),
        ComputeError::DimensionMismatch { .. }
    ));
}

#[test]
fn empty_input_reports_nan_mean() {
    let mut batch = Batch::<Moments>::new();
    batch.set_input(moments::InputId::Data, dense_table(&[], 0, 2));
    let result = batch.compute().unwrap();
    let mean = result.table(moments::ResultId::Mean).unwrap().to_vec::<f64>().unwrap();
    assert!(mean.iter().all(|m| m.is_nan()));
    let sum = result.table(moments::ResultId::Sum).unwrap().to_vec::<f64>().unwrap();
    assert_eq!(sum, vec![0.0, 0.0]);
}

// =============================================================================
// Covariance
// =============================================================================

#[test]
fn covariance_of_known_data() {
    // y = 2x, z = -x + const
    let values = [1.0, 2.0, 5.0, 2.0, 4.0, 4.0, 3.0, 6.0, 3.0];
    let mut batch = Batch::<Covariance>::new();
    batch.set_input(covariance::InputId::Data, dense_table(&values, 3, 3));
    let result = batch.compute().unwrap();

    let cov = result.table(covariance::ResultId::Covariance).unwrap().to_vec::<f64>().unwrap();
    let expected = [1.0, 2.0, -1.0, 2.0, 4.0, -2.0, -1.0, -2.0, 1.0];
    for (c, e) in cov.iter().zip(&expected) {
        assert_relative_eq!(c, e, epsilon = 1e-12);
    }
    let corr = result.table(covariance::ResultId::Correlation).unwrap().to_vec::<f64>().unwrap();
    assert_relative_eq!(corr[1], 1.0, epsilon = 1e-12);
    assert_relative_eq!(corr[2], -1.0, epsilon = 1e-12);
    assert_eq!(corr[0], 1.0);
}

#[test]
fn biased_covariance_divides_by_n() {
    let values = [1.0, 2.0, 3.0, 4.0];
    let mut batch = Batch::<Covariance>::new();
    batch.set_parameter(covariance::Parameter { biased: true });
    batch.set_input(covariance::InputId::Data, dense_table(&values, 4, 1));
    let cov = batch.compute().unwrap().table(covariance::ResultId::Covariance).unwrap().get::<f64>(0, 0).unwrap();
    assert_relative_eq!(cov, 1.25);
}

#[test]
fn covariance_distributed_matches_batch() {
    let values = random_dense_f64(60, 4, 33, -1.0, 1.0);
    let mut batch = Batch::<Covariance>::new();
    batch.set_input(covariance::InputId::Data, dense_table(&values, 60, 4));
    batch.compute().unwrap();

    let mut master = Distributed::<Covariance>::new(Step::STEP2_MASTER);
    for rows in shard_ranges(60, 5) {
        let mut local = Distributed::<Covariance>::new(Step::STEP1_LOCAL);
        local
            .set_input(covariance::InputId::Data, row_slice(&values, 4, rows))
            .unwrap();
        local.compute().unwrap();
        master.add(local.take_partial_result().unwrap()).unwrap();
    }
    master.finalize_compute().unwrap();

    let a = batch.result(covariance::ResultId::Covariance).unwrap().to_vec::<f64>().unwrap();
    let b = master.result(covariance::ResultId::Covariance).unwrap().to_vec::<f64>().unwrap();
    for (x, y) in a.iter().zip(&b) {
        assert_relative_eq!(x, y, epsilon = 1e-12);
    }
}

#[test]
fn zero_variance_column_has_undefined_correlation() {
    let values = [1.0, 7.0, 2.0, 7.0, 3.0, 7.0];
    let mut batch = Batch::<Covariance>::new();
    batch.set_input(covariance::InputId::Data, dense_table(&values, 3, 2));
    let corr = batch.compute().unwrap().table(covariance::ResultId::Correlation).unwrap().to_vec::<f64>().unwrap();
    assert_eq!(corr[0], 1.0);
    assert!(corr[1].is_nan());
    assert!(corr[3].is_nan());
}
