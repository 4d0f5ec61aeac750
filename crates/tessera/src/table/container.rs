//! The [`Table`] container.

use std::ops::Range;

use ndarray::{Array2, ArrayView2};
use parking_lot::RwLock;

use super::block::{AccessMode, BlockDescriptor, RegionLocks};
use super::dtype::{DataType, Element, Value};
use super::schema::{FeatureMeta, FeatureType, TableSchema};
use super::storage::{
    checked_len, try_filled, AosStorage, CsrStorage, DenseStorage, Layout, SoaStorage, Storage,
    TypedBuffer,
};
use crate::error::ComputeError;

/// Whether [`Table::create`] reserves storage immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Allocation {
    /// Reserve zero-filled storage now.
    #[default]
    Allocate,
    /// Defer until [`Table::allocate`]; block access fails until then.
    Deferred,
}

/// A `rows × cols` table of typed values in one of four layouts.
///
/// The shape and layout are fixed at creation. Values are read and written
/// through [`BlockDescriptor`]s only, so every algorithm sees the same
/// row-major typed view regardless of how the table is stored.
///
/// Tables are shared through [`TableHandle`](super::TableHandle)
/// (`Arc<Table>`); all methods take `&self`.
#[derive(Debug)]
pub struct Table {
    n_rows: usize,
    n_cols: usize,
    layout: Layout,
    schema: RwLock<TableSchema>,
    storage: RwLock<Option<Storage>>,
    regions: RegionLocks,
}

impl Table {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a table with a given layout and schema.
    ///
    /// Dense and sparse layouts need a schema whose columns share one numeric
    /// type. With [`Allocation::Allocate`] storage is zero-filled (sparse
    /// tables start with no stored entries).
    pub fn create(
        n_rows: usize,
        n_cols: usize,
        layout: Layout,
        schema: TableSchema,
        allocation: Allocation,
    ) -> Result<Self, ComputeError> {
        if schema.n_cols() != n_cols {
            return Err(ComputeError::dimension_mismatch(
                "schema columns",
                n_cols,
                schema.n_cols(),
            ));
        }
        if matches!(layout, Layout::Dense | Layout::Csr) {
            homogeneous_dtype(&schema, layout)?;
        }
        checked_len(n_rows, n_cols)?;

        let table = Self::unallocated(n_rows, n_cols, layout, schema);
        if allocation == Allocation::Allocate {
            table.allocate()?;
        }
        Ok(table)
    }

    /// Dense row-major table from a flat vector.
    pub fn dense<T: Element>(
        values: Vec<T>,
        n_rows: usize,
        n_cols: usize,
    ) -> Result<Self, ComputeError> {
        let storage = DenseStorage::from_buffer(TypedBuffer::from_vec(values), n_rows, n_cols)?;
        let schema = TableSchema::uniform(n_cols, T::DTYPE);
        Ok(Self::from_storage(n_rows, n_cols, schema, Storage::Dense(storage)))
    }

    /// Dense table copied from a 2-D array view.
    pub fn from_array<T: Element>(array: ArrayView2<'_, T>) -> Result<Self, ComputeError> {
        let (n_rows, n_cols) = array.dim();
        // Logical iteration order is row-major for any memory layout.
        let values: Vec<T> = array.iter().copied().collect();
        Self::dense(values, n_rows, n_cols)
    }

    /// Sparse table from compressed-row arrays.
    pub fn csr(
        n_rows: usize,
        n_cols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
        values: TypedBuffer,
    ) -> Result<Self, ComputeError> {
        checked_len(n_rows, n_cols)?;
        let dtype = values.dtype();
        let storage = CsrStorage::new(n_rows, n_cols, row_offsets, col_indices, values)?;
        let schema = TableSchema::uniform(n_cols, dtype);
        Ok(Self::from_storage(n_rows, n_cols, schema, Storage::Csr(storage)))
    }

    /// Record table; record cells must match the schema's column types.
    pub fn from_records(
        records: Vec<Box<[Value]>>,
        schema: TableSchema,
    ) -> Result<Self, ComputeError> {
        let n_rows = records.len();
        let n_cols = schema.n_cols();
        let dtypes = schema.iter().map(|m| m.dtype).collect();
        let storage = AosStorage::from_records(records, dtypes)?;
        Ok(Self::from_storage(n_rows, n_cols, schema, Storage::Aos(storage)))
    }

    /// Column table from one typed buffer per column.
    pub fn from_columns(n_rows: usize, columns: Vec<TypedBuffer>) -> Result<Self, ComputeError> {
        let n_cols = columns.len();
        let schema = TableSchema::from_columns(
            columns
                .iter()
                .map(|c| FeatureMeta::continuous(c.dtype()))
                .collect(),
        );
        let storage = SoaStorage::from_columns(n_rows, columns)?;
        Ok(Self::from_storage(n_rows, n_cols, schema, Storage::Soa(storage)))
    }

    /// Replace the schema. Column count and data types must match.
    pub fn with_schema(self, schema: TableSchema) -> Result<Self, ComputeError> {
        if schema.n_cols() != self.n_cols {
            return Err(ComputeError::dimension_mismatch(
                "schema columns",
                self.n_cols,
                schema.n_cols(),
            ));
        }
        {
            let current = self.schema.read();
            if let Some(col) = (0..self.n_cols).find(|&c| current.dtype(c) != schema.dtype(c)) {
                return Err(ComputeError::invalid_argument(format!(
                    "schema changes the data type of column {col}"
                )));
            }
        }
        *self.schema.write() = schema;
        Ok(self)
    }

    fn unallocated(n_rows: usize, n_cols: usize, layout: Layout, schema: TableSchema) -> Self {
        Self {
            n_rows,
            n_cols,
            layout,
            schema: RwLock::new(schema),
            storage: RwLock::new(None),
            regions: RegionLocks::default(),
        }
    }

    pub(crate) fn from_storage(
        n_rows: usize,
        n_cols: usize,
        schema: TableSchema,
        storage: Storage,
    ) -> Self {
        let table = Self::unallocated(n_rows, n_cols, storage.layout(), schema);
        *table.storage.write() = Some(storage);
        table
    }

    /// Reserve zero-filled storage for a deferred table. No-op if allocated.
    pub fn allocate(&self) -> Result<(), ComputeError> {
        let mut slot = self.storage.write();
        if slot.is_some() {
            return Ok(());
        }
        let schema = self.schema.read();
        let storage = match self.layout {
            Layout::Dense => Storage::Dense(DenseStorage::zeroed(
                self.n_rows,
                self.n_cols,
                homogeneous_dtype(&schema, self.layout)?,
            )?),
            Layout::Csr => Storage::Csr(CsrStorage::empty(
                self.n_rows,
                homogeneous_dtype(&schema, self.layout)?,
            )?),
            Layout::Aos => Storage::Aos(AosStorage::zeroed(
                self.n_rows,
                schema.iter().map(|m| m.dtype).collect(),
            )?),
            Layout::Soa => {
                let dtypes: Vec<DataType> = schema.iter().map(|m| m.dtype).collect();
                Storage::Soa(SoaStorage::zeroed(self.n_rows, &dtypes)?)
            }
        };
        *slot = Some(storage);
        Ok(())
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Number of rows.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// `(rows, cols)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// Storage layout.
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Whether storage has been reserved.
    pub fn is_allocated(&self) -> bool {
        self.storage.read().is_some()
    }

    /// Snapshot of the schema.
    pub fn schema(&self) -> TableSchema {
        self.schema.read().clone()
    }

    /// Metadata of one column.
    pub fn feature(&self, col: usize) -> Option<FeatureMeta> {
        self.schema.read().get(col).cloned()
    }

    /// Physical type of one column.
    pub fn dtype(&self, col: usize) -> Option<DataType> {
        self.schema.read().dtype(col)
    }

    /// Number of stored entries of a sparse table.
    pub fn nnz(&self) -> Option<usize> {
        match self.storage.read().as_ref() {
            Some(Storage::Csr(s)) => Some(s.nnz()),
            _ => None,
        }
    }

    /// Change the logical type of a column.
    ///
    /// Categorical columns must have a numeric physical type.
    pub fn relabel(
        &self,
        col: usize,
        feature_type: FeatureType,
        n_categories: Option<u32>,
    ) -> Result<(), ComputeError> {
        let mut schema = self.schema.write();
        let dtype = schema.dtype(col).ok_or_else(|| self.column_out_of_range(col))?;
        if feature_type.is_categorical() && !dtype.is_numeric() {
            return Err(ComputeError::invalid_argument(format!(
                "column {col} holds {dtype} values and cannot be categorical"
            )));
        }
        schema.relabel(col, feature_type, n_categories);
        Ok(())
    }

    /// Rename a column.
    pub fn rename_feature(&self, col: usize, name: impl Into<String>) -> Result<(), ComputeError> {
        if self.schema.write().rename(col, name) {
            Ok(())
        } else {
            Err(self.column_out_of_range(col))
        }
    }

    fn column_out_of_range(&self, col: usize) -> ComputeError {
        ComputeError::invalid_argument(format!(
            "column {col} out of range ({} columns)",
            self.n_cols
        ))
    }

    // =========================================================================
    // Block access
    // =========================================================================

    /// Open a block over `rows × cols`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if a range is out of bounds.
    /// - `InvalidState` if storage is not allocated.
    /// - `Unsupported` for a writing block on a sparse table.
    /// - `BlockConflict` if a conflicting block is open.
    /// - `Conversion` if a value cannot be represented as `T`.
    pub fn block<T: Element>(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        access: AccessMode,
    ) -> Result<BlockDescriptor<'_, T>, ComputeError> {
        if rows.start > rows.end || rows.end > self.n_rows {
            return Err(ComputeError::invalid_argument(format!(
                "rows {rows:?} out of range ({} rows)",
                self.n_rows
            )));
        }
        if cols.start > cols.end || cols.end > self.n_cols {
            return Err(ComputeError::invalid_argument(format!(
                "columns {cols:?} out of range ({} columns)",
                self.n_cols
            )));
        }

        let guard = self.storage.read();
        let storage = guard
            .as_ref()
            .ok_or_else(|| ComputeError::invalid_state("table storage is not allocated"))?;
        if access.writes() && !storage.is_writable() {
            return Err(ComputeError::unsupported(format!(
                "{:?} blocks over a {:?} table",
                access, self.layout
            )));
        }

        let token = self.regions.acquire(rows.clone(), cols.clone(), access)?;
        let values = match access {
            AccessMode::WriteOnly => {
                checked_len(rows.len(), cols.len()).and_then(|len| try_filled(len, T::default()))
            }
            AccessMode::Read | AccessMode::ReadWrite => {
                let mut values = Vec::new();
                storage
                    .read_block(rows.clone(), cols.clone(), &mut values)
                    .map(|()| values)
            }
        };
        drop(guard);

        match values {
            Ok(values) => {
                log::trace!("acquired {access:?} block rows {rows:?} cols {cols:?}");
                Ok(BlockDescriptor::open(self, rows, cols, access, token, values))
            }
            Err(e) => {
                self.regions.release(token);
                Err(e)
            }
        }
    }

    /// Open a block over `row_count` rows from `row_start`, all columns.
    pub fn acquire_block<T: Element>(
        &self,
        row_start: usize,
        row_count: usize,
        access: AccessMode,
    ) -> Result<BlockDescriptor<'_, T>, ComputeError> {
        let end = row_start
            .checked_add(row_count)
            .ok_or_else(|| ComputeError::invalid_argument("row range overflows"))?;
        self.block(row_start..end, 0..self.n_cols, access)
    }

    /// Open a single-column block.
    pub fn column_block<T: Element>(
        &self,
        col: usize,
        rows: Range<usize>,
        access: AccessMode,
    ) -> Result<BlockDescriptor<'_, T>, ComputeError> {
        let end = col
            .checked_add(1)
            .ok_or_else(|| self.column_out_of_range(col))?;
        self.block(rows, col..end, access)
    }

    /// All values as a row-major vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ComputeError> {
        let block = self.block::<T>(0..self.n_rows, 0..self.n_cols, AccessMode::Read)?;
        let values = block.values().to_vec();
        block.release()?;
        Ok(values)
    }

    /// All values as a 2-D array.
    pub fn to_array<T: Element>(&self) -> Result<Array2<T>, ComputeError> {
        let values = self.to_vec::<T>()?;
        Array2::from_shape_vec((self.n_rows, self.n_cols), values).map_err(|e| {
            ComputeError::invalid_state(format!("table shape does not match its values: {e}"))
        })
    }

    /// Single value at `(row, col)` converted to `T`.
    pub fn get<T: Element>(&self, row: usize, col: usize) -> Result<T, ComputeError> {
        let row_end = row
            .checked_add(1)
            .ok_or_else(|| ComputeError::invalid_argument("row index overflows"))?;
        let col_end = col
            .checked_add(1)
            .ok_or_else(|| self.column_out_of_range(col))?;
        let block = self.block::<T>(row..row_end, col..col_end, AccessMode::Read)?;
        let value = block.values()[0];
        block.release()?;
        Ok(value)
    }

    // =========================================================================
    // Copies
    // =========================================================================

    /// Independent copy with the same layout, schema, and values.
    pub fn deep_copy(&self) -> Result<Self, ComputeError> {
        let storage = self
            .storage
            .read()
            .clone()
            .ok_or_else(|| ComputeError::invalid_state("table storage is not allocated"))?;
        Ok(Self::from_storage(
            self.n_rows,
            self.n_cols,
            self.schema(),
            storage,
        ))
    }

    /// Overwrite all values with those of `src`, converting as needed.
    ///
    /// Shapes must match. The destination keeps its own layout and types.
    /// Integer columns copied into integer columns keep every bit; anything
    /// else travels through `f64`.
    pub fn copy_from(&self, src: &Table) -> Result<(), ComputeError> {
        if src.n_rows != self.n_rows {
            return Err(ComputeError::dimension_mismatch("rows", self.n_rows, src.n_rows));
        }
        if src.n_cols != self.n_cols {
            return Err(ComputeError::dimension_mismatch("columns", self.n_cols, src.n_cols));
        }
        let is_integer = |d: DataType| d.is_numeric() && !d.is_float();
        let integers = self.schema.read().iter().all(|m| is_integer(m.dtype))
            && src.schema.read().iter().all(|m| is_integer(m.dtype));
        if integers {
            self.copy_values::<i64>(src)
        } else {
            self.copy_values::<f64>(src)
        }
    }

    fn copy_values<T: Element>(&self, src: &Table) -> Result<(), ComputeError> {
        let source = src.block::<T>(0..src.n_rows, 0..src.n_cols, AccessMode::Read)?;
        let mut dest = self.block::<T>(0..self.n_rows, 0..self.n_cols, AccessMode::WriteOnly)?;
        dest.values_mut()?.copy_from_slice(source.values());
        source.release()?;
        dest.release()
    }

    /// Copy of this table holding the values of `src`.
    ///
    /// The copy has this table's layout and types; this table is untouched.
    pub(crate) fn converted(&self, src: &Table) -> Result<Table, ComputeError> {
        let staged = self.deep_copy()?;
        staged.copy_from(src)?;
        Ok(staged)
    }

    /// Claim the whole table against other blocks until the token is released.
    pub(crate) fn claim(&self) -> Result<u64, ComputeError> {
        self.regions
            .acquire(0..self.n_rows, 0..self.n_cols, AccessMode::WriteOnly)
    }

    /// Take over the storage of `staged`, a table from [`converted`](Self::converted).
    pub(crate) fn replace_storage(&self, staged: Table) {
        *self.storage.write() = staged.storage.into_inner();
    }

    // =========================================================================
    // Internals used by block descriptors
    // =========================================================================

    pub(crate) fn write_back<T: Element>(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        values: &[T],
    ) -> Result<(), ComputeError> {
        let mut guard = self.storage.write();
        let storage = guard
            .as_mut()
            .ok_or_else(|| ComputeError::invalid_state("table storage is not allocated"))?;
        storage.write_block(rows, cols, values)
    }

    pub(crate) fn regions(&self) -> &RegionLocks {
        &self.regions
    }
}

/// The single numeric type required by dense and sparse layouts.
fn homogeneous_dtype(schema: &TableSchema, layout: Layout) -> Result<DataType, ComputeError> {
    if schema.n_cols() == 0 {
        return Ok(DataType::default());
    }
    match schema.uniform_dtype() {
        Some(dtype) if dtype.is_numeric() => Ok(dtype),
        _ => Err(ComputeError::unsupported(format!(
            "{layout:?} tables need one numeric type for all columns"
        ))),
    }
}
