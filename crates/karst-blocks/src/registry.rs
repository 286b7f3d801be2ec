//! Process-wide block type registry.

use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use karst_core::{BlockTypeId, InternedId, TagId};

use crate::config::{BlockDef, BlocksConfig};
use crate::handler::BlockHandler;

/// Compiled properties of one block type.
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub id: BlockTypeId,
    pub name: String,
    pub solid: bool,
    pub opaque: bool,
    pub blocks_sky_light: bool,
    pub light_attenuation: u8,
    pub light_emission: u8,
    pub random_ticks: bool,
    pub tags: Vec<TagId>,
}

impl BlockInfo {
    /// Properties of air: invisible, non-solid, attenuation 1.
    pub fn air() -> Self {
        Self {
            id: BlockTypeId::AIR,
            name: BlockTypeId::AIR.name().to_string(),
            solid: false,
            opaque: false,
            blocks_sky_light: false,
            light_attenuation: 1,
            light_emission: 0,
            random_ticks: false,
            tags: Vec::new(),
        }
    }
}

enum HandlerSlot {
    Ready(Arc<dyn BlockHandler>),
    Factory(Box<dyn Fn() -> Arc<dyn BlockHandler> + Send + Sync>),
}

struct Inner {
    infos: HashMap<InternedId, Arc<BlockInfo>>,
    handlers: HashMap<InternedId, HandlerSlot>,
}

/// Global registry of block types and their handlers.
///
/// Populated during module initialization before the game thread starts;
/// later registrations are allowed but must happen before any mutation that
/// references the new names.
pub struct BlockTypeRegistry {
    inner: RwLock<Inner>,
}

static GLOBAL: OnceLock<BlockTypeRegistry> = OnceLock::new();

impl BlockTypeRegistry {
    pub fn global() -> &'static BlockTypeRegistry {
        GLOBAL.get_or_init(|| {
            let registry = BlockTypeRegistry {
                inner: RwLock::new(Inner {
                    infos: HashMap::new(),
                    handlers: HashMap::new(),
                }),
            };
            registry.insert(BlockInfo::air());
            registry
        })
    }

    fn insert(&self, info: BlockInfo) -> BlockTypeId {
        let id = info.id;
        let mut inner = self.inner.write().expect("block registry lock poisoned");
        inner.infos.insert(id.raw(), Arc::new(info));
        id
    }

    /// Register a block type programmatically; replaces any previous
    /// registration for the same name.
    pub fn register(&self, def: &BlockDef) -> BlockTypeId {
        let id = BlockTypeId::from_name(&def.name);
        let solid = def.solid.unwrap_or(true);
        let opaque = def.opaque.unwrap_or(solid);
        let info = BlockInfo {
            id,
            name: def.name.clone(),
            solid,
            opaque,
            blocks_sky_light: def.blocks_skylight.unwrap_or(solid),
            light_attenuation: def
                .light_attenuation
                .unwrap_or(if opaque { 15 } else { 1 })
                .clamp(1, 15),
            light_emission: def.light_emission.unwrap_or(0).min(15),
            random_ticks: def.random_ticks.unwrap_or(false),
            tags: def.tags.iter().map(|t| TagId::from_name(t)).collect(),
        };
        self.insert(info)
    }

    /// Register every block in a parsed config.
    pub fn register_all(&self, cfg: &BlocksConfig) -> Vec<BlockTypeId> {
        cfg.blocks.iter().map(|def| self.register(def)).collect()
    }

    /// Load and register a `blocks.toml`.
    pub fn load_from_path(&self, path: impl AsRef<Path>) -> Result<Vec<BlockTypeId>, Box<dyn Error>> {
        let text = fs::read_to_string(path)?;
        let cfg: BlocksConfig = toml::from_str(&text)?;
        Ok(self.register_all(&cfg))
    }

    /// Properties for a type. Unregistered ids resolve to `None`; callers
    /// treat those as air.
    pub fn get(&self, id: BlockTypeId) -> Option<Arc<BlockInfo>> {
        let inner = self.inner.read().expect("block registry lock poisoned");
        inner.infos.get(&id.raw()).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<BlockInfo>> {
        karst_core::StringInterner::global()
            .find(name)
            .and_then(|raw| {
                let inner = self.inner.read().expect("block registry lock poisoned");
                inner.infos.get(&raw).cloned()
            })
    }

    pub fn is_registered(&self, id: BlockTypeId) -> bool {
        let inner = self.inner.read().expect("block registry lock poisoned");
        inner.infos.contains_key(&id.raw())
    }

    // Convenience property reads that default to air semantics for
    // unregistered types.

    pub fn is_opaque(&self, id: BlockTypeId) -> bool {
        self.get(id).map(|i| i.opaque).unwrap_or(false)
    }

    pub fn blocks_sky_light(&self, id: BlockTypeId) -> bool {
        self.get(id).map(|i| i.blocks_sky_light).unwrap_or(false)
    }

    pub fn light_attenuation(&self, id: BlockTypeId) -> u8 {
        self.get(id).map(|i| i.light_attenuation).unwrap_or(1)
    }

    pub fn light_emission(&self, id: BlockTypeId) -> u8 {
        self.get(id).map(|i| i.light_emission).unwrap_or(0)
    }

    /// Attach an eagerly constructed handler.
    pub fn set_handler(&self, id: BlockTypeId, handler: Arc<dyn BlockHandler>) {
        let mut inner = self.inner.write().expect("block registry lock poisoned");
        inner.handlers.insert(id.raw(), HandlerSlot::Ready(handler));
    }

    /// Attach a factory; the handler is instantiated on first access.
    pub fn set_handler_factory(
        &self,
        id: BlockTypeId,
        factory: impl Fn() -> Arc<dyn BlockHandler> + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.write().expect("block registry lock poisoned");
        inner
            .handlers
            .insert(id.raw(), HandlerSlot::Factory(Box::new(factory)));
    }

    /// Handler for a type, instantiating a registered factory on first use.
    pub fn handler(&self, id: BlockTypeId) -> Option<Arc<dyn BlockHandler>> {
        {
            let inner = self.inner.read().expect("block registry lock poisoned");
            match inner.handlers.get(&id.raw()) {
                Some(HandlerSlot::Ready(h)) => return Some(h.clone()),
                Some(HandlerSlot::Factory(_)) => {}
                None => return None,
            }
        }
        let mut inner = self.inner.write().expect("block registry lock poisoned");
        let slot = inner.handlers.get(&id.raw())?;
        let handler = match slot {
            HandlerSlot::Ready(h) => return Some(h.clone()),
            HandlerSlot::Factory(factory) => factory(),
        };
        inner
            .handlers
            .insert(id.raw(), HandlerSlot::Ready(handler.clone()));
        Some(handler)
    }
}
