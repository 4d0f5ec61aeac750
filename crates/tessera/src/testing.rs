//! Testing utilities for tessera.
//!
//! Seeded data generators and helpers to build the same data in every
//! table layout, shared by unit tests, integration tests and benches.
//!
//! ```
//! use tessera::testing::{dense_table, random_dense_f64};
//!
//! let values = random_dense_f64(10, 3, 42, -1.0, 1.0);
//! let table = dense_table(&values, 10, 3);
//! assert_eq!(table.shape(), (10, 3));
//! ```

use std::ops::Range;
use std::sync::Arc;

use rand::prelude::*;

use crate::table::{
    DataType, FeatureMeta, Layout, Table, TableHandle, TableSchema, TypedBuffer, Value,
};

// =============================================================================
// Constants
// =============================================================================

/// Default tolerance for comparing results of differently ordered
/// floating-point reductions.
pub const DEFAULT_TOLERANCE_F64: f64 = 1e-9;

// =============================================================================
// Generators
// =============================================================================

/// Random dense values in row-major order, uniform in `[min, max]`.
pub fn random_dense_f64(rows: usize, cols: usize, seed: u64, min: f64, max: f64) -> Vec<f64> {
    assert!(max >= min);
    let mut rng = StdRng::seed_from_u64(seed);
    let width = max - min;
    (0..rows * cols)
        .map(|_| min + rng.r#gen::<f64>() * width)
        .collect()
}

/// Random integer-valued data in `[min, max]`, stored as `f64`.
///
/// Sums of such values are exact, which makes merged results comparable
/// bit for bit regardless of the order of additions.
pub fn random_integers_f64(rows: usize, cols: usize, seed: u64, min: i64, max: i64) -> Vec<f64> {
    assert!(max >= min);
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows * cols)
        .map(|_| rng.gen_range(min..=max) as f64)
        .collect()
}

/// Random data where roughly `density` of the values are non-zero.
pub fn random_sparse_f64(rows: usize, cols: usize, seed: u64, density: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows * cols)
        .map(|_| {
            if rng.r#gen::<f64>() < density {
                rng.gen_range(-100..=100) as f64 * 0.5
            } else {
                0.0
            }
        })
        .collect()
}

// =============================================================================
// Tables
// =============================================================================

/// Dense `f64` table over row-major `values`.
///
/// # Panics
///
/// If `values.len() != rows * cols`.
pub fn dense_table(values: &[f64], rows: usize, cols: usize) -> TableHandle {
    Arc::new(Table::dense(values.to_vec(), rows, cols).expect("shape matches values"))
}

/// Rows `range` of a row-major matrix as a dense table.
pub fn row_slice(values: &[f64], cols: usize, range: Range<usize>) -> TableHandle {
    let rows = range.len();
    dense_table(&values[range.start * cols..range.end * cols], rows, cols)
}

/// `n` contiguous, near-equal row ranges covering `0..rows`.
pub fn shard_ranges(rows: usize, n: usize) -> Vec<Range<usize>> {
    let n = n.max(1);
    (0..n)
        .map(|i| (i * rows / n)..((i + 1) * rows / n))
        .collect()
}

/// The same `f64` data in the requested layout. Zeros are not stored in
/// the sparse layout.
pub fn table_in_layout(values: &[f64], rows: usize, cols: usize, layout: Layout) -> TableHandle {
    assert_eq!(values.len(), rows * cols);
    let table = match layout {
        Layout::Dense => Table::dense(values.to_vec(), rows, cols),
        Layout::Csr => {
            let mut row_offsets = vec![0];
            let mut col_indices = Vec::new();
            let mut data = Vec::new();
            for row in values.chunks_exact(cols.max(1)).take(rows) {
                for (j, &v) in row.iter().enumerate() {
                    if v != 0.0 {
                        col_indices.push(j);
                        data.push(v);
                    }
                }
                row_offsets.push(data.len());
            }
            row_offsets.resize(rows + 1, data.len());
            Table::csr(rows, cols, row_offsets, col_indices, TypedBuffer::F64(data))
        }
        Layout::Aos => {
            let records = (0..rows)
                .map(|i| {
                    (0..cols)
                        .map(|j| Value::F64(values[i * cols + j]))
                        .collect::<Box<[Value]>>()
                })
                .collect();
            let schema = TableSchema::from_columns(
                (0..cols)
                    .map(|_| FeatureMeta::continuous(DataType::F64))
                    .collect(),
            );
            Table::from_records(records, schema)
        }
        Layout::Soa => {
            let columns = (0..cols)
                .map(|j| TypedBuffer::F64((0..rows).map(|i| values[i * cols + j]).collect()))
                .collect();
            Table::from_columns(rows, columns)
        }
    };
    Arc::new(table.expect("generated table is valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generators_are_deterministic() {
        assert_eq!(
            random_dense_f64(4, 3, 7, -1.0, 1.0),
            random_dense_f64(4, 3, 7, -1.0, 1.0)
        );
        let ints = random_integers_f64(20, 2, 1, -5, 5);
        assert!(ints.iter().all(|v| v.fract() == 0.0 && (-5.0..=5.0).contains(v)));
    }

    #[test]
    fn shards_cover_all_rows() {
        let shards = shard_ranges(100, 4);
        assert_eq!(shards, vec![0..25, 25..50, 50..75, 75..100]);
        let uneven = shard_ranges(10, 3);
        assert_eq!(uneven.iter().map(|r| r.len()).sum::<usize>(), 10);
        assert_eq!(uneven.last().map(|r| r.end), Some(10));
    }

    #[test]
    fn every_layout_builds() {
        let values = random_sparse_f64(6, 3, 3, 0.5);
        for layout in [Layout::Dense, Layout::Csr, Layout::Aos, Layout::Soa] {
            let table = table_in_layout(&values, 6, 3, layout);
            assert_eq!(table.layout(), layout);
            assert_eq!(table.to_vec::<f64>().unwrap(), values);
        }
    }
}
