//! Keyed collections of tables: inputs, partial results, and results.
//!
//! Each algorithm names the slots of its collections with small `Copy`
//! enums implementing [`Key`]. A slot holds one table or a list of tables
//! and remembers whether the table was supplied by the caller or allocated
//! by the library.
//!
//! Partial results cross process boundaries in distributed mode; a
//! [`CollectionSnapshot`] is the serde-serializable form used for that
//! exchange. The wire format is up to the caller.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ComputeError;
use crate::table::{DataType, DenseStorage, Storage, Table, TableHandle, TableSchema, TypedBuffer};

/// Slot name of a collection.
pub trait Key: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Stable name, used in error messages and snapshots.
    fn name(self) -> &'static str;

    /// Every slot, in declaration order.
    fn all() -> &'static [Self];

    /// Slot with the given name.
    fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.name() == name)
    }
}

/// Contents of one slot.
#[derive(Clone, Debug)]
pub enum Entry {
    Table(TableHandle),
    List(Vec<TableHandle>),
}

/// Who provided a slot's tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Allocated by the library; owned by the collection.
    Allocated,
    /// Supplied by the caller; the library only writes into it.
    CallerSupplied,
}

/// A keyed set of tables.
#[derive(Clone, Debug)]
pub struct Collection<K: Key> {
    entries: HashMap<K, (Entry, Origin)>,
}

impl<K: Key> Default for Collection<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Key> Collection<K> {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply a table for `key`.
    pub fn set(&mut self, key: K, table: TableHandle) {
        self.entries
            .insert(key, (Entry::Table(table), Origin::CallerSupplied));
    }

    /// Supply a list of tables for `key`.
    pub fn set_list(&mut self, key: K, tables: Vec<TableHandle>) {
        self.entries
            .insert(key, (Entry::List(tables), Origin::CallerSupplied));
    }

    pub(crate) fn insert_allocated(&mut self, key: K, table: Table) {
        self.entries
            .insert(key, (Entry::Table(Arc::new(table)), Origin::Allocated));
    }

    /// Remove a slot, returning its contents.
    pub fn remove(&mut self, key: K) -> Option<Entry> {
        self.entries.remove(&key).map(|(entry, _)| entry)
    }

    /// Table at `key`, if the slot holds a single table.
    pub fn get(&self, key: K) -> Option<&TableHandle> {
        match self.entries.get(&key) {
            Some((Entry::Table(t), _)) => Some(t),
            _ => None,
        }
    }

    /// Table at `key`, or [`ComputeError::MissingInput`].
    pub fn table(&self, key: K) -> Result<&TableHandle, ComputeError> {
        self.get(key)
            .ok_or(ComputeError::MissingInput { key: key.name() })
    }

    /// Tables at `key`, if the slot holds a list.
    pub fn list(&self, key: K) -> Option<&[TableHandle]> {
        match self.entries.get(&key) {
            Some((Entry::List(l), _)) => Some(l),
            _ => None,
        }
    }

    /// Contents of a slot.
    pub fn entry(&self, key: K) -> Option<&Entry> {
        self.entries.get(&key).map(|(e, _)| e)
    }

    /// Origin of a slot.
    pub fn origin(&self, key: K) -> Option<Origin> {
        self.entries.get(&key).map(|(_, o)| *o)
    }

    /// Whether a slot is filled.
    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    /// Filled slots, in declaration order.
    pub fn keys(&self) -> Vec<K> {
        K::all()
            .iter()
            .copied()
            .filter(|k| self.entries.contains_key(k))
            .collect()
    }

    /// Number of filled slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no slot is filled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First key of `required` that is not filled.
    pub fn first_missing(&self, required: &[K]) -> Option<K> {
        required.iter().copied().find(|k| !self.contains(*k))
    }

    /// Copy every table into new library-owned storage.
    pub fn deep_copy(&self) -> Result<Self, ComputeError> {
        let mut entries = HashMap::with_capacity(self.entries.len());
        for (key, (entry, _)) in &self.entries {
            let copied = match entry {
                Entry::Table(t) => Entry::Table(Arc::new(t.deep_copy()?)),
                Entry::List(l) => Entry::List(
                    l.iter()
                        .map(|t| t.deep_copy().map(Arc::new))
                        .collect::<Result<_, _>>()?,
                ),
            };
            entries.insert(*key, (copied, Origin::Allocated));
        }
        Ok(Self { entries })
    }

    /// Serializable form of the collection.
    ///
    /// Every table must hold numeric columns of one type. Tables are
    /// restored as dense tables by [`from_snapshot`](Self::from_snapshot).
    pub fn snapshot(&self) -> Result<CollectionSnapshot, ComputeError> {
        let entries = self
            .keys()
            .into_iter()
            .filter_map(|key| self.entries.get(&key).map(|(e, _)| (key, e)))
            .map(|(key, entry)| {
                let (tables, list) = match entry {
                    Entry::Table(t) => (vec![TableSnapshot::capture(t)?], false),
                    Entry::List(l) => (
                        l.iter()
                            .map(|t| TableSnapshot::capture(t))
                            .collect::<Result<_, _>>()?,
                        true,
                    ),
                };
                Ok(EntrySnapshot {
                    key: key.name().to_owned(),
                    list,
                    tables,
                })
            })
            .collect::<Result<_, ComputeError>>()?;
        Ok(CollectionSnapshot { entries })
    }

    /// Rebuild a collection from a snapshot.
    ///
    /// Fails with [`ComputeError::InvalidArgument`] on an unknown key or a
    /// malformed table.
    pub fn from_snapshot(snapshot: &CollectionSnapshot) -> Result<Self, ComputeError> {
        let mut collection = Self::new();
        for entry in &snapshot.entries {
            let key = K::from_name(&entry.key).ok_or_else(|| {
                ComputeError::invalid_argument(format!("unknown key `{}`", entry.key))
            })?;
            let tables = entry
                .tables
                .iter()
                .map(|t| t.restore().map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?;
            let restored = match (entry.list, tables.len()) {
                (true, _) => Entry::List(tables),
                (false, 1) => Entry::Table(tables.into_iter().next().ok_or_else(|| {
                    ComputeError::invalid_argument("empty snapshot entry")
                })?),
                (false, n) => {
                    return Err(ComputeError::invalid_argument(format!(
                        "entry `{}` holds {n} tables but is not a list",
                        entry.key
                    )))
                }
            };
            collection
                .entries
                .insert(key, (restored, Origin::Allocated));
        }
        Ok(collection)
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Serializable contents of a [`Collection`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub entries: Vec<EntrySnapshot>,
}

/// One slot of a [`CollectionSnapshot`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: String,
    pub list: bool,
    pub tables: Vec<TableSnapshot>,
}

/// Row-major values of one table.
///
/// Formats without non-finite floats (such as JSON) cannot carry infinite
/// or NaN values; partial results of empty shards may contain them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub n_rows: usize,
    pub n_cols: usize,
    pub values: SnapshotValues,
}

/// Typed value buffer of a [`TableSnapshot`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "data", rename_all = "lowercase")]
pub enum SnapshotValues {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TableSnapshot {
    /// Capture a table's values in its column type.
    pub fn capture(table: &Table) -> Result<Self, ComputeError> {
        let dtype = match table.schema().uniform_dtype() {
            Some(dtype) => dtype,
            None if table.n_cols() == 0 => DataType::default(),
            None => {
                return Err(ComputeError::unsupported(
                    "snapshots hold tables with one column type only",
                ))
            }
        };
        let values = match dtype {
            DataType::F32 => SnapshotValues::F32(table.to_vec()?),
            DataType::F64 => SnapshotValues::F64(table.to_vec()?),
            DataType::I32 => SnapshotValues::I32(table.to_vec()?),
            DataType::I64 => SnapshotValues::I64(table.to_vec()?),
            DataType::Utf8 => {
                return Err(ComputeError::unsupported(
                    "snapshots hold numeric tables only",
                ))
            }
        };
        Ok(Self {
            n_rows: table.n_rows(),
            n_cols: table.n_cols(),
            values,
        })
    }

    /// Rebuild as a dense table.
    pub fn restore(&self) -> Result<Table, ComputeError> {
        let buffer = match &self.values {
            SnapshotValues::F32(v) => TypedBuffer::F32(v.clone()),
            SnapshotValues::F64(v) => TypedBuffer::F64(v.clone()),
            SnapshotValues::I32(v) => TypedBuffer::I32(v.clone()),
            SnapshotValues::I64(v) => TypedBuffer::I64(v.clone()),
        };
        let schema = TableSchema::uniform(self.n_cols, buffer.dtype());
        let storage = DenseStorage::from_buffer(buffer, self.n_rows, self.n_cols)?;
        Ok(Table::from_storage(
            self.n_rows,
            self.n_cols,
            schema,
            Storage::Dense(storage),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum Slot {
        Data,
        Weights,
    }

    impl Key for Slot {
        fn name(self) -> &'static str {
            match self {
                Slot::Data => "data",
                Slot::Weights => "weights",
            }
        }

        fn all() -> &'static [Self] {
            &[Slot::Data, Slot::Weights]
        }
    }

    fn table(values: Vec<f64>, rows: usize, cols: usize) -> TableHandle {
        Arc::new(Table::dense(values, rows, cols).unwrap())
    }

    #[test]
    fn missing_key_reports_name() {
        let c = Collection::<Slot>::new();
        assert_eq!(
            c.table(Slot::Weights).unwrap_err(),
            ComputeError::MissingInput { key: "weights" }
        );
        assert_eq!(c.first_missing(Slot::all()), Some(Slot::Data));
    }

    #[test]
    fn origin_is_tracked() {
        let mut c = Collection::<Slot>::new();
        c.set(Slot::Data, table(vec![1.0], 1, 1));
        c.insert_allocated(Slot::Weights, Table::dense(vec![2.0f64], 1, 1).unwrap());
        assert_eq!(c.origin(Slot::Data), Some(Origin::CallerSupplied));
        assert_eq!(c.origin(Slot::Weights), Some(Origin::Allocated));
        assert_eq!(c.keys(), vec![Slot::Data, Slot::Weights]);
    }

    #[test]
    fn deep_copy_detaches_tables() {
        let mut c = Collection::<Slot>::new();
        let t = table(vec![1.0, 2.0], 1, 2);
        c.set(Slot::Data, t.clone());
        let copy = c.deep_copy().unwrap();
        assert!(!Arc::ptr_eq(copy.get(Slot::Data).unwrap(), &t));
        assert_eq!(copy.origin(Slot::Data), Some(Origin::Allocated));
        assert_eq!(copy.get(Slot::Data).unwrap().to_vec::<f64>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn snapshot_round_trip_keeps_lists() {
        let mut c = Collection::<Slot>::new();
        c.set(Slot::Data, Arc::new(Table::dense(vec![3i64, 4], 2, 1).unwrap()));
        c.set_list(Slot::Weights, vec![table(vec![0.5], 1, 1), table(vec![1.5], 1, 1)]);

        let snapshot = c.snapshot().unwrap();
        let restored = Collection::<Slot>::from_snapshot(&snapshot).unwrap();
        assert_eq!(
            restored.get(Slot::Data).unwrap().to_vec::<i64>().unwrap(),
            vec![3, 4]
        );
        assert_eq!(restored.list(Slot::Weights).unwrap().len(), 2);
        assert_eq!(restored.snapshot().unwrap(), snapshot);
    }

    #[test]
    fn snapshot_rejects_unknown_key() {
        let snapshot = CollectionSnapshot {
            entries: vec![EntrySnapshot {
                key: "bogus".into(),
                list: false,
                tables: Vec::new(),
            }],
        };
        assert!(matches!(
            Collection::<Slot>::from_snapshot(&snapshot),
            Err(ComputeError::InvalidArgument(_))
        ));
    }
}
