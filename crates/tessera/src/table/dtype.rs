//! Physical data types and element conversion.
//!
//! Every table column has a [`DataType`]. Kernels request blocks in a
//! concrete element type `T: Element`; when the stored type differs the
//! value is converted while the block is materialized.
//!
//! # Conversion rules
//!
//! | from \ to | `f32` | `f64` | `i32` | `i64` |
//! |---|---|---|---|---|
//! | `f32` | exact | exact | truncate toward zero, saturate | same |
//! | `f64` | round to nearest, overflow → ±∞ | exact | truncate toward zero, saturate | same |
//! | `i32` | round to nearest above 2²⁴ | exact | exact | exact |
//! | `i64` | round to nearest | round to nearest above 2⁵³ | saturate | exact |
//! | `utf8` | error | error | error | error |
//!
//! NaN has no integer representation and fails the conversion, as does any
//! string value. Conversions never produce unspecified values.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// DataType
// =============================================================================

/// Physical type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    F32,
    #[default]
    F64,
    I32,
    I64,
    /// UTF-8 text. Only column-oriented and record layouts can hold it.
    Utf8,
}

impl DataType {
    /// Whether values of this type have a numeric class.
    #[inline]
    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Utf8)
    }

    /// Whether this is a floating point type.
    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::Utf8 => "utf8",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Scalar
// =============================================================================

/// Numeric value in its widest lossless class.
///
/// Used as the pivot for conversions between element types.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Float(f64),
    Int(i64),
}

/// Why a conversion failed. Position information is added by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionFailure {
    /// NaN requested as an integer.
    NanToInteger,
    /// The source value class is text.
    NotNumeric,
}

impl ConversionFailure {
    pub(crate) fn reason(self) -> &'static str {
        match self {
            ConversionFailure::NanToInteger => "NaN has no integer representation",
            ConversionFailure::NotNumeric => "value class is not numeric",
        }
    }
}

// =============================================================================
// Element
// =============================================================================

mod sealed {
    pub trait Sealed {}
}

/// A numeric type that blocks can be materialized in.
///
/// Sealed: implemented for `f32`, `f64`, `i32` and `i64`.
pub trait Element:
    sealed::Sealed + Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// The matching [`DataType`].
    const DTYPE: DataType;

    /// Widen into the pivot representation.
    fn to_scalar(self) -> Scalar;

    /// Narrow from the pivot representation following the module rules.
    fn from_scalar(value: Scalar) -> Result<Self, ConversionFailure>;

    /// Lossy view as `f64`, for kernels that accumulate in double precision.
    fn to_f64(self) -> f64;

    /// Convert from `f64` following the module rules.
    #[inline]
    fn from_f64(value: f64) -> Result<Self, ConversionFailure> {
        Self::from_scalar(Scalar::Float(value))
    }
}

impl sealed::Sealed for f32 {}
impl sealed::Sealed for f64 {}
impl sealed::Sealed for i32 {}
impl sealed::Sealed for i64 {}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;

    #[inline]
    fn to_scalar(self) -> Scalar {
        Scalar::Float(self as f64)
    }

    #[inline]
    fn from_scalar(value: Scalar) -> Result<Self, ConversionFailure> {
        Ok(match value {
            Scalar::Float(v) => v as f32,
            Scalar::Int(v) => v as f32,
        })
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Element for f64 {
    const DTYPE: DataType = DataType::F64;

    #[inline]
    fn to_scalar(self) -> Scalar {
        Scalar::Float(self)
    }

    #[inline]
    fn from_scalar(value: Scalar) -> Result<Self, ConversionFailure> {
        Ok(match value {
            Scalar::Float(v) => v,
            Scalar::Int(v) => v as f64,
        })
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;

    #[inline]
    fn to_scalar(self) -> Scalar {
        Scalar::Int(self as i64)
    }

    #[inline]
    fn from_scalar(value: Scalar) -> Result<Self, ConversionFailure> {
        match value {
            Scalar::Float(v) if v.is_nan() => Err(ConversionFailure::NanToInteger),
            // `as` truncates toward zero and saturates at the bounds.
            Scalar::Float(v) => Ok(v as i32),
            Scalar::Int(v) => Ok(v.clamp(i32::MIN as i64, i32::MAX as i64) as i32),
        }
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Element for i64 {
    const DTYPE: DataType = DataType::I64;

    #[inline]
    fn to_scalar(self) -> Scalar {
        Scalar::Int(self)
    }

    #[inline]
    fn from_scalar(value: Scalar) -> Result<Self, ConversionFailure> {
        match value {
            Scalar::Float(v) if v.is_nan() => Err(ConversionFailure::NanToInteger),
            Scalar::Float(v) => Ok(v as i64),
            Scalar::Int(v) => Ok(v),
        }
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

/// Convert one element to another element type.
#[inline]
pub fn convert<S: Element, T: Element>(value: S) -> Result<T, ConversionFailure> {
    T::from_scalar(value.to_scalar())
}

// =============================================================================
// Value
// =============================================================================

/// A single dynamically typed cell, used by record (AOS) layouts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    Utf8(String),
}

impl Value {
    /// The physical type of this value.
    pub fn dtype(&self) -> DataType {
        match self {
            Value::F32(_) => DataType::F32,
            Value::F64(_) => DataType::F64,
            Value::I32(_) => DataType::I32,
            Value::I64(_) => DataType::I64,
            Value::Utf8(_) => DataType::Utf8,
        }
    }

    /// Numeric class of this value, if any.
    pub fn to_scalar(&self) -> Result<Scalar, ConversionFailure> {
        match self {
            Value::F32(v) => Ok(v.to_scalar()),
            Value::F64(v) => Ok(v.to_scalar()),
            Value::I32(v) => Ok(v.to_scalar()),
            Value::I64(v) => Ok(v.to_scalar()),
            Value::Utf8(_) => Err(ConversionFailure::NotNumeric),
        }
    }

    /// Build a value of type `dtype` from an element.
    pub fn from_element<T: Element>(value: T, dtype: DataType) -> Result<Self, ConversionFailure> {
        let scalar = value.to_scalar();
        Ok(match dtype {
            DataType::F32 => Value::F32(f32::from_scalar(scalar)?),
            DataType::F64 => Value::F64(f64::from_scalar(scalar)?),
            DataType::I32 => Value::I32(i32::from_scalar(scalar)?),
            DataType::I64 => Value::I64(i64::from_scalar(scalar)?),
            DataType::Utf8 => return Err(ConversionFailure::NotNumeric),
        })
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_owned())
    }
}
