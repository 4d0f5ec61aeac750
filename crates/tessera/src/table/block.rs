//! Scoped typed windows over a table.
//!
//! A [`BlockDescriptor`] materializes a `rows × cols` window of a table as a
//! contiguous row-major buffer of the requested element type. Kernels only
//! see these buffers, never the physical layout.
//!
//! # Region discipline
//!
//! Each table tracks the regions held by open descriptors. Any number of
//! [`AccessMode::Read`] descriptors may overlap; a writing descriptor
//! ([`AccessMode::ReadWrite`] or [`AccessMode::WriteOnly`]) excludes every
//! other descriptor on an overlapping region. Conflicts fail immediately with
//! [`ComputeError::BlockConflict`] instead of blocking.
//!
//! # Release
//!
//! Call [`BlockDescriptor::release`] to write back mutations and observe
//! write-back errors. Dropping a descriptor releases it as well; a failed
//! write-back during drop is logged and otherwise lost.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::container::Table;
use super::dtype::Element;
use crate::error::ComputeError;

/// How a block may be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read only; nothing is written back.
    Read,
    /// Materialize current values, write mutations back on release.
    ReadWrite,
    /// Start from zeros, write the whole window back on release.
    WriteOnly,
}

impl AccessMode {
    /// Whether the descriptor writes back on release.
    #[inline]
    pub fn writes(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

// =============================================================================
// Region locks
// =============================================================================

#[derive(Debug)]
struct Region {
    id: u64,
    rows: Range<usize>,
    cols: Range<usize>,
    access: AccessMode,
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Per-table registry of open block regions.
#[derive(Debug, Default)]
pub(crate) struct RegionLocks {
    active: Mutex<Vec<Region>>,
    next_id: AtomicU64,
}

impl RegionLocks {
    /// Claim a region or report the conflict.
    pub(crate) fn acquire(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        access: AccessMode,
    ) -> Result<u64, ComputeError> {
        let mut active = self.active.lock();
        let conflict = active.iter().any(|r| {
            (access.writes() || r.access.writes())
                && overlaps(&r.rows, &rows)
                && overlaps(&r.cols, &cols)
        });
        if conflict {
            return Err(ComputeError::BlockConflict { rows, cols });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        active.push(Region {
            id,
            rows,
            cols,
            access,
        });
        Ok(id)
    }

    /// Free a region claimed by [`acquire`](Self::acquire).
    pub(crate) fn release(&self, id: u64) {
        let mut active = self.active.lock();
        if let Some(pos) = active.iter().position(|r| r.id == id) {
            active.swap_remove(pos);
        }
    }

    /// Number of open regions.
    pub(crate) fn open_count(&self) -> usize {
        self.active.lock().len()
    }
}

// =============================================================================
// BlockDescriptor
// =============================================================================

/// A materialized `rows × cols` window of a table.
///
/// Values are stored row-major: element `(i, j)` of the block (relative to
/// its first row and column) is at `i * n_cols() + j`.
#[derive(Debug)]
pub struct BlockDescriptor<'t, T: Element> {
    table: &'t Table,
    rows: Range<usize>,
    cols: Range<usize>,
    access: AccessMode,
    values: Vec<T>,
    token: Option<u64>,
    dirty: bool,
}

impl<'t, T: Element> BlockDescriptor<'t, T> {
    pub(crate) fn open(
        table: &'t Table,
        rows: Range<usize>,
        cols: Range<usize>,
        access: AccessMode,
        token: u64,
        values: Vec<T>,
    ) -> Self {
        Self {
            table,
            rows,
            cols,
            access,
            values,
            token: Some(token),
            dirty: access == AccessMode::WriteOnly,
        }
    }

    /// Row range covered, in table coordinates.
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    /// Column range covered, in table coordinates.
    pub fn cols(&self) -> Range<usize> {
        self.cols.clone()
    }

    /// Number of rows in the block.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns in the block.
    #[inline]
    pub fn n_cols(&self) -> usize {
        self.cols.len()
    }

    /// Access mode the block was opened with.
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Row-major values.
    #[inline]
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Mutable row-major values.
    ///
    /// Fails with [`ComputeError::InvalidState`] on a read-only block.
    pub fn values_mut(&mut self) -> Result<&mut [T], ComputeError> {
        if !self.access.writes() {
            return Err(ComputeError::invalid_state(
                "block was opened read-only",
            ));
        }
        self.dirty = true;
        Ok(&mut self.values)
    }

    /// Row `i` of the block (relative index).
    #[inline]
    pub fn row(&self, i: usize) -> &[T] {
        let w = self.n_cols();
        &self.values[i * w..(i + 1) * w]
    }

    /// Iterate over the rows of the block.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[T]> {
        // `max(1)` keeps `chunks_exact` valid for zero-width blocks.
        self.values.chunks_exact(self.n_cols().max(1))
    }

    /// Value at block-relative `(i, j)`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> Option<T> {
        if i >= self.n_rows() || j >= self.n_cols() {
            return None;
        }
        Some(self.values[i * self.n_cols() + j])
    }

    /// Write back (if writable and modified) and release the region.
    ///
    /// The region is released even when the write-back fails.
    pub fn release(mut self) -> Result<(), ComputeError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), ComputeError> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };
        let result = if self.access.writes() && self.dirty {
            self.table
                .write_back(self.rows.clone(), self.cols.clone(), &self.values)
        } else {
            Ok(())
        };
        self.table.regions().release(token);
        log::trace!(
            "released {:?} block rows {:?} cols {:?}",
            self.access,
            self.rows,
            self.cols
        );
        result
    }
}

impl<T: Element> Drop for BlockDescriptor<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::warn!("block write-back failed during drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_regions() {
        let locks = RegionLocks::default();
        let a = locks.acquire(0..10, 0..3, AccessMode::Read).unwrap();
        let b = locks.acquire(5..15, 0..3, AccessMode::Read).unwrap();
        assert_ne!(a, b);
        assert_eq!(locks.open_count(), 2);
    }

    #[test]
    fn writer_excludes_overlap() {
        let locks = RegionLocks::default();
        let w = locks.acquire(0..10, 0..3, AccessMode::ReadWrite).unwrap();
        assert!(matches!(
            locks.acquire(9..12, 2..3, AccessMode::Read),
            Err(ComputeError::BlockConflict { .. })
        ));
        // Disjoint rows or disjoint columns are fine.
        locks.acquire(10..12, 0..3, AccessMode::WriteOnly).unwrap();
        locks.acquire(0..10, 3..5, AccessMode::ReadWrite).unwrap();

        locks.release(w);
        locks.acquire(9..12, 2..3, AccessMode::Read).unwrap();
    }

    #[test]
    fn reader_excludes_writer() {
        let locks = RegionLocks::default();
        locks.acquire(0..4, 0..1, AccessMode::Read).unwrap();
        assert!(locks.acquire(3..4, 0..1, AccessMode::WriteOnly).is_err());
    }

    #[test]
    fn release_unknown_id_is_noop() {
        let locks = RegionLocks::default();
        locks.release(42);
        assert_eq!(locks.open_count(), 0);
    }
}
