//! Per-column feature metadata.
//!
//! A [`TableSchema`] is attached to every table at creation. It records the
//! physical [`DataType`] of each column and how the values are to be
//! interpreted ([`FeatureType`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::dtype::DataType;

/// Logical classification of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FeatureType {
    /// Continuous numeric measurement.
    #[default]
    Continuous,

    /// Ordered discrete levels (e.g. ratings).
    Ordinal,

    /// Unordered category IDs.
    ///
    /// Stored as integers or integral floats: `0, 1, ..., n_categories - 1`.
    Categorical,
}

impl FeatureType {
    /// Returns true if this is a categorical feature.
    #[inline]
    pub fn is_categorical(&self) -> bool {
        matches!(self, FeatureType::Categorical)
    }

    /// Returns true if values have a meaningful order.
    #[inline]
    pub fn is_ordered(&self) -> bool {
        !self.is_categorical()
    }
}

/// Metadata for a single column.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureMeta {
    /// Column name (optional).
    pub name: Option<String>,

    /// Physical type.
    pub dtype: DataType,

    /// Logical type.
    pub feature_type: FeatureType,

    /// Number of categories, when known.
    pub n_categories: Option<u32>,
}

impl FeatureMeta {
    /// Continuous column of the given type.
    pub fn continuous(dtype: DataType) -> Self {
        Self {
            dtype,
            ..Default::default()
        }
    }

    /// Categorical column of the given type.
    pub fn categorical(dtype: DataType, n_categories: Option<u32>) -> Self {
        Self {
            name: None,
            dtype,
            feature_type: FeatureType::Categorical,
            n_categories,
        }
    }

    /// Ordinal column of the given type.
    pub fn ordinal(dtype: DataType) -> Self {
        Self {
            dtype,
            feature_type: FeatureType::Ordinal,
            ..Default::default()
        }
    }

    /// Set the column name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Schema describing the columns of a table.
///
/// Contains per-column metadata and a name-to-index mapping that is rebuilt
/// whenever a column is renamed.
#[derive(Clone, Debug, Default)]
pub struct TableSchema {
    columns: Vec<FeatureMeta>,
    name_index: HashMap<String, usize>,
}

impl TableSchema {
    /// Create a schema from column metadata.
    pub fn from_columns(columns: Vec<FeatureMeta>) -> Self {
        let mut schema = Self {
            columns,
            name_index: HashMap::new(),
        };
        schema.rebuild_name_index();
        schema
    }

    /// Schema with `n_cols` continuous columns of one type.
    pub fn uniform(n_cols: usize, dtype: DataType) -> Self {
        Self::from_columns(vec![FeatureMeta::continuous(dtype); n_cols])
    }

    /// Number of columns.
    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// Metadata for a column.
    pub fn get(&self, col: usize) -> Option<&FeatureMeta> {
        self.columns.get(col)
    }

    /// Physical type of a column.
    pub fn dtype(&self, col: usize) -> Option<DataType> {
        self.columns.get(col).map(|m| m.dtype)
    }

    /// Logical type of a column (continuous if out of range).
    pub fn feature_type(&self, col: usize) -> FeatureType {
        self.columns
            .get(col)
            .map(|m| m.feature_type)
            .unwrap_or_default()
    }

    /// Whether any column is categorical.
    pub fn has_categorical(&self) -> bool {
        self.columns.iter().any(|m| m.feature_type.is_categorical())
    }

    /// Whether every column has the same physical type.
    pub fn uniform_dtype(&self) -> Option<DataType> {
        let first = self.columns.first()?.dtype;
        self.columns
            .iter()
            .all(|m| m.dtype == first)
            .then_some(first)
    }

    /// Column index by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    /// Iterate over column metadata.
    pub fn iter(&self) -> impl Iterator<Item = &FeatureMeta> {
        self.columns.iter()
    }

    /// Change the logical type of a column. Returns `false` if out of range.
    pub(crate) fn relabel(
        &mut self,
        col: usize,
        feature_type: FeatureType,
        n_categories: Option<u32>,
    ) -> bool {
        match self.columns.get_mut(col) {
            Some(meta) => {
                meta.feature_type = feature_type;
                meta.n_categories = n_categories;
                true
            }
            None => false,
        }
    }

    /// Rename a column. Returns `false` if out of range.
    pub(crate) fn rename(&mut self, col: usize, name: impl Into<String>) -> bool {
        match self.columns.get_mut(col) {
            Some(meta) => {
                meta.name = Some(name.into());
                self.rebuild_name_index();
                true
            }
            None => false,
        }
    }

    fn rebuild_name_index(&mut self) {
        self.name_index = self
            .columns
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.name.clone().map(|n| (n, i)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_type_default_is_continuous() {
        assert_eq!(FeatureType::default(), FeatureType::Continuous);
        assert!(FeatureType::Ordinal.is_ordered());
        assert!(!FeatureType::Categorical.is_ordered());
    }

    #[test]
    fn schema_uniform() {
        let schema = TableSchema::uniform(3, DataType::F32);
        assert_eq!(schema.n_cols(), 3);
        assert_eq!(schema.uniform_dtype(), Some(DataType::F32));
        assert!(!schema.has_categorical());
    }

    #[test]
    fn schema_mixed_dtypes() {
        let schema = TableSchema::from_columns(vec![
            FeatureMeta::continuous(DataType::F64),
            FeatureMeta::categorical(DataType::I32, Some(4)),
        ]);
        assert_eq!(schema.uniform_dtype(), None);
        assert!(schema.has_categorical());
        assert_eq!(schema.feature_type(1), FeatureType::Categorical);
        assert_eq!(schema.feature_type(7), FeatureType::Continuous);
    }

    #[test]
    fn schema_relabel_and_rename() {
        let mut schema = TableSchema::uniform(2, DataType::F64);
        assert!(schema.relabel(1, FeatureType::Ordinal, None));
        assert!(!schema.relabel(5, FeatureType::Ordinal, None));
        assert_eq!(schema.feature_type(1), FeatureType::Ordinal);

        assert!(schema.rename(0, "age"));
        assert_eq!(schema.column_index("age"), Some(0));
        assert!(schema.rename(0, "years"));
        assert_eq!(schema.column_index("age"), None);
        assert_eq!(schema.column_index("years"), Some(0));
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn types_are_send_sync() {
        assert_send_sync::<FeatureType>();
        assert_send_sync::<FeatureMeta>();
        assert_send_sync::<TableSchema>();
    }
}
