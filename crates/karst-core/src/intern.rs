//! Process-wide string interner and typed identity newtypes.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// Compact identifier assigned to each unique interned string.
pub type InternedId = u32;

/// Air. Also the id the empty string interns to.
pub const AIR_INTERNED_ID: InternedId = 0;
pub const INVALID_INTERNED_ID: InternedId = 1;
pub const UNKNOWN_INTERNED_ID: InternedId = 2;

struct Inner {
    // Index = id. Arc so lookups hand out cheap clones without holding the lock.
    strings: Vec<Arc<str>>,
    lookup: HashMap<Arc<str>, InternedId>,
}

/// Thread-safe interner. Strings are interned once and never removed.
///
/// Ids 0-2 are reserved (air / invalid / unknown) and seeded at startup, so
/// module registration can rely on air always being id 0.
pub struct StringInterner {
    inner: RwLock<Inner>,
}

static GLOBAL: OnceLock<StringInterner> = OnceLock::new();

impl StringInterner {
    pub fn global() -> &'static StringInterner {
        GLOBAL.get_or_init(StringInterner::new)
    }

    fn new() -> Self {
        let mut inner = Inner {
            strings: Vec::new(),
            lookup: HashMap::new(),
        };
        for name in ["karst:air", "karst:invalid", "karst:unknown"] {
            let id = inner.strings.len() as InternedId;
            let s: Arc<str> = Arc::from(name);
            inner.strings.push(s.clone());
            inner.lookup.insert(s, id);
        }
        // The empty string is an alias for air.
        inner.lookup.insert(Arc::from(""), AIR_INTERNED_ID);
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Intern a string, returning the same id for duplicates.
    pub fn intern(&self, s: &str) -> InternedId {
        {
            let inner = self.inner.read().expect("interner lock poisoned");
            if let Some(&id) = inner.lookup.get(s) {
                return id;
            }
        }
        let mut inner = self.inner.write().expect("interner lock poisoned");
        // Re-check: another thread may have interned it between the locks.
        if let Some(&id) = inner.lookup.get(s) {
            return id;
        }
        let id = inner.strings.len() as InternedId;
        let owned: Arc<str> = Arc::from(s);
        inner.strings.push(owned.clone());
        inner.lookup.insert(owned, id);
        id
    }

    /// Look up the string for an id. Unknown ids resolve to `None`.
    pub fn lookup(&self, id: InternedId) -> Option<Arc<str>> {
        let inner = self.inner.read().expect("interner lock poisoned");
        inner.strings.get(id as usize).cloned()
    }

    /// Find an id without interning.
    pub fn find(&self, s: &str) -> Option<InternedId> {
        let inner = self.inner.read().expect("interner lock poisoned");
        inner.lookup.get(s).copied()
    }

    /// Number of interned strings, reserved ids included.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("interner lock poisoned");
        inner.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

macro_rules! interned_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub InternedId);

        impl $name {
            /// Intern `name` (if new) and wrap the id.
            pub fn from_name(name: &str) -> Self {
                if name.is_empty() {
                    return Self(AIR_INTERNED_ID);
                }
                Self(StringInterner::global().intern(name))
            }

            pub fn name(self) -> Arc<str> {
                StringInterner::global()
                    .lookup(self.0)
                    .unwrap_or_else(|| Arc::from(""))
            }

            #[inline]
            pub fn raw(self) -> InternedId {
                self.0
            }
        }
    };
}

interned_newtype!(
    /// Identity of a block type. Id 0 is always air.
    BlockTypeId
);
interned_newtype!(ItemTypeId);
interned_newtype!(TagId);
interned_newtype!(BiomeId);
interned_newtype!(SoundSetId);

impl BlockTypeId {
    pub const AIR: BlockTypeId = BlockTypeId(AIR_INTERNED_ID);

    #[inline]
    pub fn is_air(self) -> bool {
        self.0 == AIR_INTERNED_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_seeded() {
        let it = StringInterner::global();
        assert_eq!(it.find("karst:air"), Some(AIR_INTERNED_ID));
        assert_eq!(it.find("karst:invalid"), Some(INVALID_INTERNED_ID));
        assert_eq!(it.find("karst:unknown"), Some(UNKNOWN_INTERNED_ID));
        assert_eq!(it.find(""), Some(AIR_INTERNED_ID));
    }

    #[test]
    fn intern_is_idempotent() {
        let it = StringInterner::global();
        let a = it.intern("karst:test_stone");
        let b = it.intern("karst:test_stone");
        assert_eq!(a, b);
        assert_eq!(it.lookup(a).as_deref(), Some("karst:test_stone"));
    }

    #[test]
    fn block_type_air() {
        assert!(BlockTypeId::AIR.is_air());
        assert!(BlockTypeId::from_name("").is_air());
        assert!(!BlockTypeId::from_name("karst:test_dirt").is_air());
    }
}
