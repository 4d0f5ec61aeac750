//! Physical storage layouts.
//!
//! A table stores its values in exactly one of four layouts. All of them
//! implement the same two operations, used by block descriptors:
//!
//! - `read_block`: materialize a `rows × cols` window as a row-major buffer of
//!   the requested element type.
//! - `write_block`: store a row-major buffer back into the window.
//!
//! | Layout | Physical form | Reads | Writes |
//! |---|---|---|---|
//! | [`Layout::Dense`] | one homogeneous row-major buffer | direct / converted | yes |
//! | [`Layout::Csr`] | compressed sparse rows | densify on read | no |
//! | [`Layout::Aos`] | one record of [`Value`]s per row | converted | yes |
//! | [`Layout::Soa`] | one typed buffer per column | converted | yes |

use std::any::Any;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::dtype::{ConversionFailure, DataType, Element, Value};
use crate::error::ComputeError;

/// Storage layout tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Dense, row-major, one data type for all columns.
    Dense,
    /// Sparse compressed rows. Read-only for kernels.
    Csr,
    /// Array of row records (column-array-of-structures).
    Aos,
    /// Array of column arrays, each with its own data type.
    Soa,
}

// =============================================================================
// Helpers
// =============================================================================

/// Allocate a vector of `len` copies of `fill`, reporting out-of-memory.
pub(crate) fn try_filled<T: Clone>(len: usize, fill: T) -> Result<Vec<T>, ComputeError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| ComputeError::Allocation { requested: len })?;
    v.resize(len, fill);
    Ok(v)
}

/// `rows * cols` with overflow reported as an allocation failure.
pub(crate) fn checked_len(rows: usize, cols: usize) -> Result<usize, ComputeError> {
    rows.checked_mul(cols)
        .ok_or(ComputeError::Allocation { requested: usize::MAX })
}

/// Convert a row-major `rows × cols` window to `dtype` without touching any
/// table. The first failing cell is reported in table coordinates.
fn stage<T: Element>(
    values: &[T],
    dtype: DataType,
    rows: &Range<usize>,
    cols: &Range<usize>,
) -> Result<TypedBuffer, ComputeError> {
    let width = cols.len();
    let mut staged = TypedBuffer::zeroed(dtype, values.len())?;
    for (k, &v) in values.iter().enumerate() {
        staged.set(k, v).map_err(|f| {
            conversion_error(T::DTYPE, dtype, rows.start + k / width, cols.start + k % width, f)
        })?;
    }
    Ok(staged)
}

fn conversion_error(
    from: DataType,
    to: DataType,
    row: usize,
    col: usize,
    failure: ConversionFailure,
) -> ComputeError {
    ComputeError::Conversion {
        from,
        to,
        row,
        col,
        reason: failure.reason(),
    }
}

// =============================================================================
// TypedBuffer
// =============================================================================

/// A homogeneous buffer of one physical type.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedBuffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Utf8(Vec<String>),
}

impl TypedBuffer {
    /// Zero-filled (or empty-string-filled) buffer.
    pub fn zeroed(dtype: DataType, len: usize) -> Result<Self, ComputeError> {
        Ok(match dtype {
            DataType::F32 => TypedBuffer::F32(try_filled(len, 0.0)?),
            DataType::F64 => TypedBuffer::F64(try_filled(len, 0.0)?),
            DataType::I32 => TypedBuffer::I32(try_filled(len, 0)?),
            DataType::I64 => TypedBuffer::I64(try_filled(len, 0)?),
            DataType::Utf8 => TypedBuffer::Utf8(try_filled(len, String::new())?),
        })
    }

    /// Wrap a typed vector.
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        let any: Box<dyn Any> = Box::new(values);
        let any = match any.downcast::<Vec<f32>>() {
            Ok(v) => return TypedBuffer::F32(*v),
            Err(any) => any,
        };
        let any = match any.downcast::<Vec<f64>>() {
            Ok(v) => return TypedBuffer::F64(*v),
            Err(any) => any,
        };
        let any = match any.downcast::<Vec<i32>>() {
            Ok(v) => return TypedBuffer::I32(*v),
            Err(any) => any,
        };
        match any.downcast::<Vec<i64>>() {
            Ok(v) => TypedBuffer::I64(*v),
            // `Element` is sealed to the four types above.
            Err(_) => unreachable!("unsupported element type"),
        }
    }

    /// Physical type.
    pub fn dtype(&self) -> DataType {
        match self {
            TypedBuffer::F32(_) => DataType::F32,
            TypedBuffer::F64(_) => DataType::F64,
            TypedBuffer::I32(_) => DataType::I32,
            TypedBuffer::I64(_) => DataType::I64,
            TypedBuffer::Utf8(_) => DataType::Utf8,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            TypedBuffer::F32(v) => v.len(),
            TypedBuffer::F64(v) => v.len(),
            TypedBuffer::I32(v) => v.len(),
            TypedBuffer::I64(v) => v.len(),
            TypedBuffer::Utf8(v) => v.len(),
        }
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow as `&[T]` when the physical type is `T`.
    #[inline]
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        let any: &dyn Any = match self {
            TypedBuffer::F32(v) => v as &dyn Any,
            TypedBuffer::F64(v) => v as &dyn Any,
            TypedBuffer::I32(v) => v as &dyn Any,
            TypedBuffer::I64(v) => v as &dyn Any,
            TypedBuffer::Utf8(_) => return None,
        };
        any.downcast_ref::<Vec<T>>().map(Vec::as_slice)
    }

    /// Borrow as `&mut [T]` when the physical type is `T`.
    #[inline]
    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        let any: &mut dyn Any = match self {
            TypedBuffer::F32(v) => v as &mut dyn Any,
            TypedBuffer::F64(v) => v as &mut dyn Any,
            TypedBuffer::I32(v) => v as &mut dyn Any,
            TypedBuffer::I64(v) => v as &mut dyn Any,
            TypedBuffer::Utf8(_) => return None,
        };
        any.downcast_mut::<Vec<T>>().map(Vec::as_mut_slice)
    }

    /// Read element `idx` converted to `T`.
    #[inline]
    pub fn get<T: Element>(&self, idx: usize) -> Result<T, ConversionFailure> {
        match self {
            TypedBuffer::F32(v) => T::from_scalar(v[idx].to_scalar()),
            TypedBuffer::F64(v) => T::from_scalar(v[idx].to_scalar()),
            TypedBuffer::I32(v) => T::from_scalar(v[idx].to_scalar()),
            TypedBuffer::I64(v) => T::from_scalar(v[idx].to_scalar()),
            TypedBuffer::Utf8(_) => Err(ConversionFailure::NotNumeric),
        }
    }

    /// Store `value` at `idx`, converting to the physical type.
    #[inline]
    pub fn set<T: Element>(&mut self, idx: usize, value: T) -> Result<(), ConversionFailure> {
        let scalar = value.to_scalar();
        match self {
            TypedBuffer::F32(v) => v[idx] = f32::from_scalar(scalar)?,
            TypedBuffer::F64(v) => v[idx] = f64::from_scalar(scalar)?,
            TypedBuffer::I32(v) => v[idx] = i32::from_scalar(scalar)?,
            TypedBuffer::I64(v) => v[idx] = i64::from_scalar(scalar)?,
            TypedBuffer::Utf8(_) => return Err(ConversionFailure::NotNumeric),
        }
        Ok(())
    }

    /// Copy `src[range]` into `self` starting at `at`.
    ///
    /// Both buffers hold the same physical type; callers stage values in the
    /// destination's type first.
    fn copy_range(&mut self, at: usize, src: &TypedBuffer, range: Range<usize>) {
        let end = at + range.len();
        match (self, src) {
            (TypedBuffer::F32(d), TypedBuffer::F32(s)) => d[at..end].copy_from_slice(&s[range]),
            (TypedBuffer::F64(d), TypedBuffer::F64(s)) => d[at..end].copy_from_slice(&s[range]),
            (TypedBuffer::I32(d), TypedBuffer::I32(s)) => d[at..end].copy_from_slice(&s[range]),
            (TypedBuffer::I64(d), TypedBuffer::I64(s)) => d[at..end].copy_from_slice(&s[range]),
            (TypedBuffer::Utf8(d), TypedBuffer::Utf8(s)) => d[at..end].clone_from_slice(&s[range]),
            (d, s) => unreachable!("copy from {} into {} buffer", s.dtype(), d.dtype()),
        }
    }

    /// Text at `idx`, if this is a text buffer.
    pub fn get_str(&self, idx: usize) -> Option<&str> {
        match self {
            TypedBuffer::Utf8(v) => v.get(idx).map(String::as_str),
            _ => None,
        }
    }
}

// =============================================================================
// Dense
// =============================================================================

/// Dense row-major storage: `index = row * n_cols + col`.
#[derive(Clone, Debug)]
pub struct DenseStorage {
    data: TypedBuffer,
    n_cols: usize,
}

impl DenseStorage {
    /// Zero-filled dense storage.
    pub fn zeroed(n_rows: usize, n_cols: usize, dtype: DataType) -> Result<Self, ComputeError> {
        if !dtype.is_numeric() {
            return Err(ComputeError::unsupported(
                "dense tables hold numeric types only",
            ));
        }
        Ok(Self {
            data: TypedBuffer::zeroed(dtype, checked_len(n_rows, n_cols)?)?,
            n_cols,
        })
    }

    /// Wrap a row-major buffer.
    pub fn from_buffer(data: TypedBuffer, n_rows: usize, n_cols: usize) -> Result<Self, ComputeError> {
        let expected = checked_len(n_rows, n_cols)?;
        if data.len() != expected {
            return Err(ComputeError::dimension_mismatch(
                "dense buffer length",
                expected,
                data.len(),
            ));
        }
        if !data.dtype().is_numeric() {
            return Err(ComputeError::unsupported(
                "dense tables hold numeric types only",
            ));
        }
        Ok(Self { data, n_cols })
    }

    /// Physical type of every cell.
    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    fn read_block<T: Element>(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        out: &mut Vec<T>,
    ) -> Result<(), ComputeError> {
        // Full-width, same-type blocks are one contiguous copy.
        if cols.start == 0 && cols.end == self.n_cols {
            if let Some(src) = self.data.as_slice::<T>() {
                out.extend_from_slice(&src[rows.start * self.n_cols..rows.end * self.n_cols]);
                return Ok(());
            }
        }
        if let Some(src) = self.data.as_slice::<T>() {
            for r in rows {
                let base = r * self.n_cols;
                out.extend_from_slice(&src[base + cols.start..base + cols.end]);
            }
            return Ok(());
        }
        for r in rows {
            let base = r * self.n_cols;
            for c in cols.clone() {
                let v = self
                    .data
                    .get::<T>(base + c)
                    .map_err(|f| conversion_error(self.dtype(), T::DTYPE, r, c, f))?;
                out.push(v);
            }
        }
        Ok(())
    }

    fn write_block<T: Element>(
        &mut self,
        rows: Range<usize>,
        cols: Range<usize>,
        values: &[T],
    ) -> Result<(), ComputeError> {
        let width = cols.len();
        let n_cols = self.n_cols;
        if let Some(dst) = self.data.as_mut_slice::<T>() {
            for (i, r) in rows.enumerate() {
                let base = r * n_cols;
                dst[base + cols.start..base + cols.end]
                    .copy_from_slice(&values[i * width..(i + 1) * width]);
            }
            return Ok(());
        }
        // A failing cell must leave the table as it was.
        let staged = stage(values, self.dtype(), &rows, &cols)?;
        for (i, r) in rows.enumerate() {
            self.data
                .copy_range(r * n_cols + cols.start, &staged, i * width..(i + 1) * width);
        }
        Ok(())
    }
}

// =============================================================================
// CSR
// =============================================================================

/// Compressed sparse row storage.
///
/// For row `i`, the stored entries are `values[row_offsets[i]..row_offsets[i+1]]`
/// at columns `col_indices[row_offsets[i]..row_offsets[i+1]]`. Unstored cells
/// read as zero. Column order within a row is unconstrained but a row may
/// not repeat a column.
#[derive(Clone, Debug)]
pub struct CsrStorage {
    values: TypedBuffer,
    col_indices: Vec<usize>,
    row_offsets: Vec<usize>,
}

impl CsrStorage {
    /// Validate and wrap compressed-row arrays.
    pub fn new(
        n_rows: usize,
        n_cols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
        values: TypedBuffer,
    ) -> Result<Self, ComputeError> {
        if !values.dtype().is_numeric() {
            return Err(ComputeError::unsupported(
                "sparse tables hold numeric types only",
            ));
        }
        let n_offsets = n_rows
            .checked_add(1)
            .ok_or(ComputeError::Allocation { requested: usize::MAX })?;
        if row_offsets.len() != n_offsets {
            return Err(ComputeError::dimension_mismatch(
                "row_offsets length",
                n_offsets,
                row_offsets.len(),
            ));
        }
        if col_indices.len() != values.len() {
            return Err(ComputeError::dimension_mismatch(
                "col_indices length",
                values.len(),
                col_indices.len(),
            ));
        }
        if row_offsets[0] != 0 {
            return Err(ComputeError::invalid_argument("row_offsets[0] must be 0"));
        }
        if row_offsets[n_rows] != values.len() {
            return Err(ComputeError::invalid_argument(format!(
                "row_offsets[{n_rows}] = {} but {} values are stored",
                row_offsets[n_rows],
                values.len()
            )));
        }
        if let Some(i) = row_offsets.windows(2).position(|w| w[0] > w[1]) {
            return Err(ComputeError::invalid_argument(format!(
                "row_offsets decrease at row {i}"
            )));
        }

        let mut seen = try_filled(n_cols, usize::MAX)?;
        for row in 0..n_rows {
            for &c in &col_indices[row_offsets[row]..row_offsets[row + 1]] {
                if c >= n_cols {
                    return Err(ComputeError::invalid_argument(format!(
                        "column index {c} out of range in row {row} ({n_cols} columns)"
                    )));
                }
                if seen[c] == row {
                    return Err(ComputeError::invalid_argument(format!(
                        "column {c} stored twice in row {row}"
                    )));
                }
                seen[c] = row;
            }
        }

        Ok(Self {
            values,
            col_indices,
            row_offsets,
        })
    }

    /// A sparse table with no stored entries.
    pub fn empty(n_rows: usize, dtype: DataType) -> Result<Self, ComputeError> {
        if !dtype.is_numeric() {
            return Err(ComputeError::unsupported(
                "sparse tables hold numeric types only",
            ));
        }
        Ok(Self {
            values: TypedBuffer::zeroed(dtype, 0)?,
            col_indices: Vec::new(),
            row_offsets: try_filled(
                n_rows
                    .checked_add(1)
                    .ok_or(ComputeError::Allocation { requested: usize::MAX })?,
                0,
            )?,
        })
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Physical type of stored values.
    pub fn dtype(&self) -> DataType {
        self.values.dtype()
    }

    fn read_block<T: Element>(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        out: &mut Vec<T>,
    ) -> Result<(), ComputeError> {
        let width = cols.len();
        let base = out.len();
        out.resize(base + rows.len() * width, T::default());
        for (i, r) in rows.enumerate() {
            for k in self.row_offsets[r]..self.row_offsets[r + 1] {
                let c = self.col_indices[k];
                if cols.contains(&c) {
                    let v = self
                        .values
                        .get::<T>(k)
                        .map_err(|f| conversion_error(self.dtype(), T::DTYPE, r, c, f))?;
                    out[base + i * width + (c - cols.start)] = v;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// AOS
// =============================================================================

/// Row records with per-column physical types.
#[derive(Clone, Debug)]
pub struct AosStorage {
    records: Vec<Box<[Value]>>,
    dtypes: Vec<DataType>,
}

impl AosStorage {
    /// Records filled with zero values (empty strings for text columns).
    pub fn zeroed(n_rows: usize, dtypes: Vec<DataType>) -> Result<Self, ComputeError> {
        let template: Box<[Value]> = dtypes.iter().map(|&d| default_value(d)).collect();
        Ok(Self {
            records: try_filled(n_rows, template)?,
            dtypes,
        })
    }

    /// Validate and wrap records.
    pub fn from_records(
        records: Vec<Box<[Value]>>,
        dtypes: Vec<DataType>,
    ) -> Result<Self, ComputeError> {
        for (row, record) in records.iter().enumerate() {
            if record.len() != dtypes.len() {
                return Err(ComputeError::dimension_mismatch(
                    format!("record {row} length"),
                    dtypes.len(),
                    record.len(),
                ));
            }
            if let Some(col) = record
                .iter()
                .zip(&dtypes)
                .position(|(v, &d)| v.dtype() != d)
            {
                return Err(ComputeError::invalid_argument(format!(
                    "record {row}, column {col}: expected {}, got {}",
                    dtypes[col],
                    record[col].dtype()
                )));
            }
        }
        Ok(Self { records, dtypes })
    }

    fn read_block<T: Element>(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        out: &mut Vec<T>,
    ) -> Result<(), ComputeError> {
        for r in rows {
            let record = &self.records[r];
            for c in cols.clone() {
                let value = &record[c];
                let v = value
                    .to_scalar()
                    .and_then(T::from_scalar)
                    .map_err(|f| conversion_error(value.dtype(), T::DTYPE, r, c, f))?;
                out.push(v);
            }
        }
        Ok(())
    }

    fn write_block<T: Element>(
        &mut self,
        rows: Range<usize>,
        cols: Range<usize>,
        values: &[T],
    ) -> Result<(), ComputeError> {
        let width = cols.len();
        let mut staged = Vec::new();
        staged
            .try_reserve_exact(values.len())
            .map_err(|_| ComputeError::Allocation { requested: values.len() })?;
        for (k, &v) in values.iter().enumerate() {
            let (r, c) = (rows.start + k / width, cols.start + k % width);
            let dtype = self.dtypes[c];
            staged.push(
                Value::from_element(v, dtype)
                    .map_err(|f| conversion_error(T::DTYPE, dtype, r, c, f))?,
            );
        }

        let mut staged = staged.into_iter();
        for r in rows {
            for (cell, value) in self.records[r][cols.clone()].iter_mut().zip(&mut staged) {
                *cell = value;
            }
        }
        Ok(())
    }
}

fn default_value(dtype: DataType) -> Value {
    match dtype {
        DataType::F32 => Value::F32(0.0),
        DataType::F64 => Value::F64(0.0),
        DataType::I32 => Value::I32(0),
        DataType::I64 => Value::I64(0),
        DataType::Utf8 => Value::Utf8(String::new()),
    }
}

// =============================================================================
// SOA
// =============================================================================

/// One typed buffer per column.
#[derive(Clone, Debug)]
pub struct SoaStorage {
    columns: Vec<TypedBuffer>,
}

impl SoaStorage {
    /// Zero-filled columns.
    pub fn zeroed(n_rows: usize, dtypes: &[DataType]) -> Result<Self, ComputeError> {
        let columns = dtypes
            .iter()
            .map(|&d| TypedBuffer::zeroed(d, n_rows))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { columns })
    }

    /// Validate and wrap column buffers.
    pub fn from_columns(n_rows: usize, columns: Vec<TypedBuffer>) -> Result<Self, ComputeError> {
        if let Some(c) = columns.iter().position(|col| col.len() != n_rows) {
            return Err(ComputeError::dimension_mismatch(
                format!("column {c} length"),
                n_rows,
                columns[c].len(),
            ));
        }
        Ok(Self { columns })
    }

    fn read_block<T: Element>(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        out: &mut Vec<T>,
    ) -> Result<(), ComputeError> {
        // Single-column, same-type reads are a contiguous copy.
        if cols.len() == 1 {
            if let Some(src) = self.columns[cols.start].as_slice::<T>() {
                out.extend_from_slice(&src[rows]);
                return Ok(());
            }
        }
        for r in rows {
            for c in cols.clone() {
                let column = &self.columns[c];
                let v = column
                    .get::<T>(r)
                    .map_err(|f| conversion_error(column.dtype(), T::DTYPE, r, c, f))?;
                out.push(v);
            }
        }
        Ok(())
    }

    fn write_block<T: Element>(
        &mut self,
        rows: Range<usize>,
        cols: Range<usize>,
        values: &[T],
    ) -> Result<(), ComputeError> {
        let width = cols.len();
        // Stage every column before committing any of them.
        let mut staged = Vec::with_capacity(width);
        for (j, c) in cols.clone().enumerate() {
            let column: Vec<T> = values.iter().skip(j).step_by(width).copied().collect();
            staged.push(stage(&column, self.columns[c].dtype(), &rows, &(c..c + 1))?);
        }
        for (c, buffer) in cols.zip(&staged) {
            self.columns[c].copy_range(rows.start, buffer, 0..rows.len());
        }
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Layout-tagged storage.
#[derive(Clone, Debug)]
pub enum Storage {
    Dense(DenseStorage),
    Csr(CsrStorage),
    Aos(AosStorage),
    Soa(SoaStorage),
}

impl Storage {
    /// Layout tag.
    pub fn layout(&self) -> Layout {
        match self {
            Storage::Dense(_) => Layout::Dense,
            Storage::Csr(_) => Layout::Csr,
            Storage::Aos(_) => Layout::Aos,
            Storage::Soa(_) => Layout::Soa,
        }
    }

    /// Whether blocks may be written back.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Storage::Csr(_))
    }

    /// Append the `rows × cols` window to `out` in row-major order.
    pub fn read_block<T: Element>(
        &self,
        rows: Range<usize>,
        cols: Range<usize>,
        out: &mut Vec<T>,
    ) -> Result<(), ComputeError> {
        let len = checked_len(rows.len(), cols.len())?;
        out.try_reserve_exact(len)
            .map_err(|_| ComputeError::Allocation { requested: len })?;
        match self {
            Storage::Dense(s) => s.read_block(rows, cols, out),
            Storage::Csr(s) => s.read_block(rows, cols, out),
            Storage::Aos(s) => s.read_block(rows, cols, out),
            Storage::Soa(s) => s.read_block(rows, cols, out),
        }
    }

    /// Store a row-major `rows × cols` window.
    pub fn write_block<T: Element>(
        &mut self,
        rows: Range<usize>,
        cols: Range<usize>,
        values: &[T],
    ) -> Result<(), ComputeError> {
        debug_assert_eq!(values.len(), rows.len() * cols.len());
        match self {
            Storage::Dense(s) => s.write_block(rows, cols, values),
            Storage::Csr(_) => Err(ComputeError::unsupported(
                "sparse tables cannot be written in place",
            )),
            Storage::Aos(s) => s.write_block(rows, cols, values),
            Storage::Soa(s) => s.write_block(rows, cols, values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_3x3() -> Storage {
        let data = TypedBuffer::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        Storage::Dense(DenseStorage::from_buffer(data, 3, 3).unwrap())
    }

    #[test]
    fn typed_buffer_from_vec_keeps_type() {
        assert_eq!(TypedBuffer::from_vec(vec![1i32, 2]).dtype(), DataType::I32);
        assert_eq!(TypedBuffer::from_vec(vec![1.0f32]).dtype(), DataType::F32);
        let buf = TypedBuffer::from_vec(vec![5i64]);
        assert_eq!(buf.as_slice::<i64>(), Some(&[5i64][..]));
        assert_eq!(buf.as_slice::<f64>(), None);
    }

    #[test]
    fn dense_window_read() {
        let storage = dense_3x3();
        let mut out = Vec::new();
        storage.read_block::<f64>(1..3, 1..3, &mut out).unwrap();
        assert_eq!(out, vec![5.0, 6.0, 8.0, 9.0]);

        let mut out = Vec::new();
        storage.read_block::<i32>(0..1, 0..3, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn dense_write_converts() {
        let mut storage = dense_3x3();
        storage.write_block::<i32>(0..1, 0..2, &[10, 20]).unwrap();
        let mut out = Vec::new();
        storage.read_block::<f64>(0..1, 0..3, &mut out).unwrap();
        assert_eq!(out, vec![10.0, 20.0, 3.0]);
    }

    #[test]
    fn dense_rejects_wrong_length() {
        let data = TypedBuffer::from_vec(vec![1.0f64; 5]);
        let err = DenseStorage::from_buffer(data, 2, 3).unwrap_err();
        assert!(matches!(err, ComputeError::DimensionMismatch { .. }));
    }

    #[test]
    fn csr_densifies_unordered_columns() {
        // [[0, 2, 1], [0, 0, 0], [3, 0, 0]] with row 0 stored out of order
        let csr = CsrStorage::new(
            3,
            3,
            vec![0, 2, 2, 3],
            vec![2, 1, 0],
            TypedBuffer::from_vec(vec![1.0f32, 2.0, 3.0]),
        )
        .unwrap();
        let storage = Storage::Csr(csr);
        let mut out = Vec::new();
        storage.read_block::<f64>(0..3, 0..3, &mut out).unwrap();
        assert_eq!(out, vec![0.0, 2.0, 1.0, 0.0, 0.0, 0.0, 3.0, 0.0, 0.0]);

        let mut out = Vec::new();
        storage.read_block::<f64>(0..1, 1..2, &mut out).unwrap();
        assert_eq!(out, vec![2.0]);
    }

    #[test]
    fn csr_invariants() {
        let vals = || TypedBuffer::from_vec(vec![1.0f64, 2.0]);
        // decreasing offsets
        assert!(CsrStorage::new(2, 2, vec![0, 2, 1], vec![0, 1], vals()).is_err());
        // column out of range
        assert!(CsrStorage::new(1, 2, vec![0, 2], vec![0, 2], vals()).is_err());
        // repeated column
        assert!(CsrStorage::new(1, 2, vec![0, 2], vec![1, 1], vals()).is_err());
        // last offset != nnz
        assert!(CsrStorage::new(1, 2, vec![0, 1], vec![0, 1], vals()).is_err());
        assert!(CsrStorage::new(1, 2, vec![0, 2], vec![1, 0], vals()).is_ok());
    }

    #[test]
    fn csr_is_read_only() {
        let mut storage = Storage::Csr(CsrStorage::empty(2, DataType::F64).unwrap());
        assert!(!storage.is_writable());
        let err = storage.write_block::<f64>(0..1, 0..1, &[1.0]).unwrap_err();
        assert!(matches!(err, ComputeError::Unsupported(_)));
    }

    #[test]
    fn aos_mixed_record_types() {
        let records: Vec<Box<[Value]>> = vec![
            vec![Value::F64(1.5), Value::I32(2)].into_boxed_slice(),
            vec![Value::F64(3.5), Value::I32(4)].into_boxed_slice(),
        ];
        let mut storage = Storage::Aos(
            AosStorage::from_records(records, vec![DataType::F64, DataType::I32]).unwrap(),
        );
        let mut out = Vec::new();
        storage.read_block::<f32>(0..2, 0..2, &mut out).unwrap();
        assert_eq!(out, vec![1.5, 2.0, 3.5, 4.0]);

        storage.write_block::<f64>(1..2, 1..2, &[9.9]).unwrap();
        let mut out = Vec::new();
        storage.read_block::<i64>(1..2, 1..2, &mut out).unwrap();
        assert_eq!(out, vec![9]);
    }

    #[test]
    fn aos_rejects_mismatched_record() {
        let records: Vec<Box<[Value]>> = vec![vec![Value::I32(1)].into_boxed_slice()];
        assert!(AosStorage::from_records(records, vec![DataType::F64]).is_err());
    }

    #[test]
    fn soa_text_column_fails_conversion() {
        let storage = Storage::Soa(
            SoaStorage::from_columns(
                2,
                vec![
                    TypedBuffer::from_vec(vec![1.0f64, 2.0]),
                    TypedBuffer::Utf8(vec!["a".into(), "b".into()]),
                ],
            )
            .unwrap(),
        );
        let mut out = Vec::new();
        storage.read_block::<f64>(0..2, 0..1, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0]);

        let mut out = Vec::new();
        let err = storage.read_block::<f64>(0..2, 0..2, &mut out).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Conversion {
                from: DataType::Utf8,
                to: DataType::F64,
                row: 0,
                col: 1,
                ..
            }
        ));
    }

    #[test]
    fn nan_into_integer_column_fails() {
        let mut storage = Storage::Soa(SoaStorage::zeroed(1, &[DataType::I32]).unwrap());
        let err = storage
            .write_block::<f64>(0..1, 0..1, &[f64::NAN])
            .unwrap_err();
        assert!(matches!(err, ComputeError::Conversion { to: DataType::I32, .. }));
    }

    #[test]
    fn failed_conversion_leaves_soa_column_unchanged() {
        let mut storage = Storage::Soa(SoaStorage::zeroed(2, &[DataType::I32]).unwrap());
        let err = storage
            .write_block::<f64>(0..2, 0..1, &[5.0, f64::NAN])
            .unwrap_err();
        assert!(matches!(err, ComputeError::Conversion { row: 1, col: 0, .. }));

        let mut out = Vec::new();
        storage.read_block::<i32>(0..2, 0..1, &mut out).unwrap();
        assert_eq!(out, vec![0, 0]);
    }

    #[test]
    fn failed_conversion_leaves_dense_and_aos_unchanged() {
        let mut dense = Storage::Dense(DenseStorage::zeroed(2, 2, DataType::I64).unwrap());
        let err = dense
            .write_block::<f64>(0..2, 0..2, &[1.0, 2.0, 3.0, f64::NAN])
            .unwrap_err();
        assert!(matches!(err, ComputeError::Conversion { row: 1, col: 1, .. }));
        let mut out = Vec::new();
        dense.read_block::<i64>(0..2, 0..2, &mut out).unwrap();
        assert_eq!(out, vec![0; 4]);

        let mut aos = Storage::Aos(
            AosStorage::zeroed(1, vec![DataType::F64, DataType::Utf8, DataType::I32]).unwrap(),
        );
        let err = aos
            .write_block::<f64>(0..1, 0..3, &[4.0, 5.0, 6.0])
            .unwrap_err();
        assert!(matches!(err, ComputeError::Conversion { to: DataType::Utf8, col: 1, .. }));
        let mut out = Vec::new();
        aos.read_block::<f64>(0..1, 0..1, &mut out).unwrap();
        assert_eq!(out, vec![0.0]);
    }

    #[test]
    fn multi_column_soa_write_converts_each_column() {
        let mut storage =
            Storage::Soa(SoaStorage::zeroed(2, &[DataType::I32, DataType::F32]).unwrap());
        storage
            .write_block::<f64>(0..2, 0..2, &[1.0, 1.5, 2.0, 2.5])
            .unwrap();
        let mut out = Vec::new();
        storage.read_block::<f64>(0..2, 0..2, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn huge_sparse_shapes_are_allocation_errors() {
        let empty = || TypedBuffer::from_vec(Vec::<f64>::new());
        let err = CsrStorage::new(1, usize::MAX, vec![0, 0], Vec::new(), empty()).unwrap_err();
        assert!(matches!(err, ComputeError::Allocation { .. }));

        let err = CsrStorage::new(usize::MAX, 1, vec![0], Vec::new(), empty()).unwrap_err();
        assert!(matches!(err, ComputeError::Allocation { .. }));

        let err = CsrStorage::empty(usize::MAX, DataType::F64).unwrap_err();
        assert!(matches!(err, ComputeError::Allocation { .. }));
    }

    #[test]
    fn overflowing_shape_is_allocation_error() {
        let err = DenseStorage::zeroed(usize::MAX, 2, DataType::F64).unwrap_err();
        assert!(matches!(err, ComputeError::Allocation { .. }));
    }
}
