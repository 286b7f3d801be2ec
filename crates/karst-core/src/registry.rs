//! Per-world stable name/id mapping for persistence.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::data::{DataContainer, DataValue, intern_key};

/// Stable on-disk id. Unlike runtime interned ids these never drift across
/// sessions: they are assigned per world and serialized with it.
pub type PersistentId = u32;

/// Reserved empty/none id.
pub const EMPTY_PERSISTENT_ID: PersistentId = 0;

struct Inner {
    names: Vec<String>,
    lookup: HashMap<String, PersistentId>,
}

/// Per-world name registry.
///
/// Save path: `get_or_assign(name) -> PersistentId` written to disk.
/// Load path: `name(id)` then re-intern through the global interner.
pub struct NameRegistry {
    inner: RwLock<Inner>,
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NameRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                names: vec![String::new()],
                lookup: HashMap::new(),
            }),
        }
    }

    /// Get the id for `name`, assigning the next sequential id if new.
    pub fn get_or_assign(&self, name: &str) -> PersistentId {
        if name.is_empty() {
            return EMPTY_PERSISTENT_ID;
        }
        {
            let inner = self.inner.read().expect("name registry lock poisoned");
            if let Some(&id) = inner.lookup.get(name) {
                return id;
            }
        }
        let mut inner = self.inner.write().expect("name registry lock poisoned");
        if let Some(&id) = inner.lookup.get(name) {
            return id;
        }
        let id = inner.names.len() as PersistentId;
        inner.names.push(name.to_string());
        inner.lookup.insert(name.to_string(), id);
        id
    }

    /// Name for an id; `None` for unknown ids, empty string for id 0.
    pub fn name(&self, id: PersistentId) -> Option<String> {
        let inner = self.inner.read().expect("name registry lock poisoned");
        inner.names.get(id as usize).cloned()
    }

    pub fn find(&self, name: &str) -> Option<PersistentId> {
        if name.is_empty() {
            return Some(EMPTY_PERSISTENT_ID);
        }
        let inner = self.inner.read().expect("name registry lock poisoned");
        inner.lookup.get(name).copied()
    }

    /// Assigned ids, the reserved id 0 included.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("name registry lock poisoned");
        inner.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Save the mapping under `key` as a string array indexed by id.
    /// Id 0 is implied and skipped.
    pub fn save_to(&self, dc: &mut DataContainer, key: &str) {
        let inner = self.inner.read().expect("name registry lock poisoned");
        let names: Vec<String> = inner.names.iter().skip(1).cloned().collect();
        dc.set(intern_key(key), DataValue::StrArray(names));
    }

    /// Rebuild a registry saved with [`save_to`](Self::save_to). Missing key
    /// yields an empty registry.
    pub fn load_from(dc: &DataContainer, key: &str) -> NameRegistry {
        let registry = NameRegistry::new();
        if let Some(DataValue::StrArray(names)) = dc.get(intern_key(key)) {
            let mut inner = registry.inner.write().expect("name registry lock poisoned");
            for name in names {
                let id = inner.names.len() as PersistentId;
                inner.names.push(name.clone());
                inner.lookup.insert(name.clone(), id);
            }
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_assignment() {
        let reg = NameRegistry::new();
        let a = reg.get_or_assign("karst:stone");
        let b = reg.get_or_assign("karst:dirt");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(reg.get_or_assign("karst:stone"), a);
        assert_eq!(reg.name(a).as_deref(), Some("karst:stone"));
        assert_eq!(reg.find("karst:dirt"), Some(b));
        assert_eq!(reg.find(""), Some(EMPTY_PERSISTENT_ID));
    }

    #[test]
    fn save_load_preserves_ids() {
        let reg = NameRegistry::new();
        reg.get_or_assign("karst:stone");
        reg.get_or_assign("karst:dirt");

        let mut dc = DataContainer::new();
        reg.save_to(&mut dc, "names");
        let loaded = NameRegistry::load_from(&dc, "names");

        assert_eq!(loaded.len(), reg.len());
        assert_eq!(loaded.find("karst:stone"), Some(1));
        assert_eq!(loaded.find("karst:dirt"), Some(2));
    }
}
