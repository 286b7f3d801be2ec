//! Typed recursive key/value store for block and column metadata.

use std::collections::HashMap;

use crate::intern::{InternedId, StringInterner};

/// Interned key into a [`DataContainer`].
pub type DataKey = InternedId;

/// Intern a key string.
#[inline]
pub fn intern_key(key: &str) -> DataKey {
    StringInterner::global().intern(key)
}

/// Value variants a container can hold.
#[derive(Clone, Debug, PartialEq)]
pub enum DataValue {
    Null,
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Container(Box<DataContainer>),
    I64Array(Vec<i64>),
    F64Array(Vec<f64>),
    StrArray(Vec<String>),
}

/// Container for arbitrary metadata, keyed by interned strings.
///
/// Keys serialize as their original strings and are re-interned on load, so
/// on-disk data survives runtime id reassignment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataContainer {
    entries: HashMap<DataKey, DataValue>,
}

impl DataContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: DataKey, value: DataValue) {
        self.entries.insert(key, value);
    }

    pub fn set_by_name(&mut self, key: &str, value: DataValue) {
        self.set(intern_key(key), value);
    }

    pub fn get(&self, key: DataKey) -> Option<&DataValue> {
        self.entries.get(&key)
    }

    pub fn get_by_name(&self, key: &str) -> Option<&DataValue> {
        StringInterner::global()
            .find(key)
            .and_then(|id| self.entries.get(&id))
    }

    pub fn has(&self, key: DataKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn remove(&mut self, key: DataKey) -> Option<DataValue> {
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (DataKey, &DataValue)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    // Typed getters with default fallback on missing key or type mismatch.

    pub fn get_i64(&self, key: DataKey, default: i64) -> i64 {
        match self.entries.get(&key) {
            Some(DataValue::I64(v)) => *v,
            _ => default,
        }
    }

    pub fn get_f64(&self, key: DataKey, default: f64) -> f64 {
        match self.entries.get(&key) {
            Some(DataValue::F64(v)) => *v,
            _ => default,
        }
    }

    pub fn get_str(&self, key: DataKey) -> Option<&str> {
        match self.entries.get(&key) {
            Some(DataValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: DataKey) -> Option<&[u8]> {
        match self.entries.get(&key) {
            Some(DataValue::Bytes(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_container(&self, key: DataKey) -> Option<&DataContainer> {
        match self.entries.get(&key) {
            Some(DataValue::Container(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_container_mut(&mut self, key: DataKey) -> &mut DataContainer {
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| DataValue::Container(Box::default()));
        if !matches!(entry, DataValue::Container(_)) {
            *entry = DataValue::Container(Box::default());
        }
        match entry {
            DataValue::Container(v) => v,
            _ => unreachable!(),
        }
    }

    pub fn get_i64_array(&self, key: DataKey) -> Option<&[i64]> {
        match self.entries.get(&key) {
            Some(DataValue::I64Array(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_f64_array(&self, key: DataKey) -> Option<&[f64]> {
        match self.entries.get(&key) {
            Some(DataValue::F64Array(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_str_array(&self, key: DataKey) -> Option<&[String]> {
        match self.entries.get(&key) {
            Some(DataValue::StrArray(v)) => Some(v.as_slice()),
            _ => None,
        }
    }
}
