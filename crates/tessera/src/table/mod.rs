//! Tables: typed rectangular data in one of several physical layouts.
//!
//! # Overview
//!
//! A [`Table`] has a fixed shape, a [`Layout`], and a [`TableSchema`] with
//! per-column metadata. Algorithms never touch storage directly; they open
//! [`BlockDescriptor`]s that present any window of any layout as a row-major
//! buffer of the element type they ask for.
//!
//! ```
//! use tessera::table::{create_dense_table, AccessMode, DataType};
//!
//! let table = create_dense_table(4, 2, DataType::F32).unwrap();
//! {
//!     let mut block = table.acquire_block::<f64>(0, 2, AccessMode::ReadWrite).unwrap();
//!     block.values_mut().unwrap().fill(1.5);
//!     block.release().unwrap();
//! }
//! assert_eq!(table.get::<f32>(1, 1).unwrap(), 1.5);
//! ```
//!
//! Tables are shared by reference count ([`TableHandle`]); storage is freed
//! when the last handle is dropped.

mod block;
mod container;
mod dtype;
mod schema;
mod storage;

use std::sync::Arc;

pub use block::{AccessMode, BlockDescriptor};
pub use container::{Allocation, Table};
pub use dtype::{convert, ConversionFailure, DataType, Element, Scalar, Value};
pub use schema::{FeatureMeta, FeatureType, TableSchema};
pub use storage::{Layout, TypedBuffer};

pub(crate) use storage::{try_filled, DenseStorage, Storage};

/// Shared ownership of a table.
pub type TableHandle = Arc<Table>;

/// Zero-filled dense table with one numeric type for all columns.
pub fn create_dense_table(
    n_rows: usize,
    n_cols: usize,
    dtype: DataType,
) -> Result<TableHandle, crate::error::ComputeError> {
    Table::create(
        n_rows,
        n_cols,
        Layout::Dense,
        TableSchema::uniform(n_cols, dtype),
        Allocation::Allocate,
    )
    .map(Arc::new)
}

/// Sparse table from compressed-row arrays.
///
/// `row_offsets` has `n_rows + 1` non-decreasing entries starting at 0 and
/// ending at `values.len()`; every column index is below `n_cols`.
pub fn create_sparse_table(
    n_rows: usize,
    n_cols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: TypedBuffer,
) -> Result<TableHandle, crate::error::ComputeError> {
    Table::csr(n_rows, n_cols, row_offsets, col_indices, values).map(Arc::new)
}
