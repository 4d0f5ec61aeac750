//! Reference algorithms built on the execution framework.
//!
//! - [`moments`]: per-column count, extrema, sums, mean, variance.
//! - [`covariance`]: covariance and correlation matrices.
//! - [`quantile`]: per-column quantile by multi-round distributed bisection.
//!
//! Their math is deliberately elementary; they exist to exercise every
//! execution mode and the kernel dispatch.

pub mod covariance;
pub mod moments;
pub mod quantile;

use std::ops::Range;

use crate::compute::{Collection, KernelContext, Key};
use crate::error::ComputeError;
use crate::table::{AccessMode, Element, Table, TableHandle};

/// Slot of a library-produced collection, or `InvalidArgument`.
pub(crate) fn slot<K: Key>(c: &Collection<K>, key: K) -> Result<&TableHandle, ComputeError> {
    c.get(key).ok_or_else(|| {
        ComputeError::invalid_argument(format!("collection has no `{}` table", key.name()))
    })
}

/// All values of a slot, which must be `rows × cols`.
///
/// Partial results may come from another process, so their shapes are
/// checked before any kernel indexes into them.
pub(crate) fn read_shaped<K: Key, T: Element>(
    c: &Collection<K>,
    key: K,
    rows: usize,
    cols: usize,
) -> Result<Vec<T>, ComputeError> {
    let table = slot(c, key)?;
    let (n_rows, n_cols) = table.shape();
    if n_rows != rows {
        return Err(ComputeError::dimension_mismatch(
            format!("{} rows", key.name()),
            rows,
            n_rows,
        ));
    }
    if n_cols != cols {
        return Err(ComputeError::dimension_mismatch(
            format!("{} columns", key.name()),
            cols,
            n_cols,
        ));
    }
    table.to_vec::<T>()
}

/// Overwrite all values of a slot.
pub(crate) fn write_slot<K: Key, T: Element>(
    c: &Collection<K>,
    key: K,
    values: &[T],
) -> Result<(), ComputeError> {
    let table = slot(c, key)?;
    let (rows, cols) = table.shape();
    if rows * cols != values.len() {
        return Err(ComputeError::dimension_mismatch(
            key.name(),
            rows * cols,
            values.len(),
        ));
    }
    let mut block = table.block::<T>(0..rows, 0..cols, AccessMode::WriteOnly)?;
    block.values_mut()?.copy_from_slice(values);
    block.release()
}

/// Dense `rows × cols` table filled with `fill`.
pub(crate) fn filled<T: Element>(rows: usize, cols: usize, fill: T) -> Result<Table, ComputeError> {
    let len = rows
        .checked_mul(cols)
        .ok_or(ComputeError::Allocation { requested: usize::MAX })?;
    Table::dense(crate::table::try_filled(len, fill)?, rows, cols)
}

/// Map every row block of `table` (all columns, as `f64`) through `f`,
/// in parallel when the context allows. Output order follows row order.
///
/// Cancellation is polled before each block.
pub(crate) fn map_row_blocks<R, F>(
    ctx: &KernelContext,
    table: &Table,
    f: F,
) -> Result<Vec<R>, ComputeError>
where
    R: Send,
    F: Fn(&[f64], Range<usize>) -> R + Sync + Send,
{
    let n_cols = table.n_cols();
    ctx.parallelism()
        .maybe_par_map(ctx.row_blocks(table.n_rows()), |rows| {
            ctx.check_cancelled()?;
            let block = table.block::<f64>(rows.clone(), 0..n_cols, AccessMode::Read)?;
            let out = f(block.values(), rows);
            block.release()?;
            Ok::<_, ComputeError>(out)
        })
        .into_iter()
        .collect()
}
