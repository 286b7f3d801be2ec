//! Global item type registry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use karst_core::{BlockTypeId, InternedId, ItemTypeId};

/// Properties of one item type.
#[derive(Clone, Debug)]
pub struct ItemInfo {
    pub id: ItemTypeId,
    pub name: String,
    pub max_stack: u32,
    /// The block this item places, if it is a block item.
    pub block: Option<BlockTypeId>,
}

/// Process-wide item registry, populated during module initialization like
/// its block counterpart. On-disk item ids go through the per-world name
/// registry, so runtime ids here may drift freely between sessions.
pub struct ItemTypeRegistry {
    inner: RwLock<HashMap<InternedId, Arc<ItemInfo>>>,
}

static GLOBAL: OnceLock<ItemTypeRegistry> = OnceLock::new();

impl ItemTypeRegistry {
    pub fn global() -> &'static ItemTypeRegistry {
        GLOBAL.get_or_init(|| ItemTypeRegistry {
            inner: RwLock::new(HashMap::new()),
        })
    }

    pub fn register(&self, name: &str, max_stack: u32, block: Option<BlockTypeId>) -> ItemTypeId {
        let id = ItemTypeId::from_name(name);
        let info = ItemInfo {
            id,
            name: name.to_string(),
            max_stack: max_stack.max(1),
            block,
        };
        let mut inner = self.inner.write().expect("item registry lock poisoned");
        inner.insert(id.raw(), Arc::new(info));
        id
    }

    /// Register the placing item for a block, named after it.
    pub fn register_block_item(&self, block: BlockTypeId) -> ItemTypeId {
        self.register(&block.name(), 64, Some(block))
    }

    pub fn get(&self, id: ItemTypeId) -> Option<Arc<ItemInfo>> {
        let inner = self.inner.read().expect("item registry lock poisoned");
        inner.get(&id.raw()).cloned()
    }

    pub fn is_registered(&self, id: ItemTypeId) -> bool {
        let inner = self.inner.read().expect("item registry lock poisoned");
        inner.contains_key(&id.raw())
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("item registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
