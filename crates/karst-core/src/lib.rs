//! Identity, position, rotation and data primitives shared by every crate.
#![forbid(unsafe_code)]

mod data;
mod intern;
mod pos;
mod registry;
mod rotation;
mod time;

pub use data::{DataContainer, DataKey, DataValue, intern_key};
pub use intern::{
    AIR_INTERNED_ID, BiomeId, BlockTypeId, INVALID_INTERNED_ID, InternedId, ItemTypeId, SoundSetId,
    StringInterner, TagId, UNKNOWN_INTERNED_ID,
};
pub use pos::{BlockPos, ChunkPos, ColumnPos, Face, LocalPos, SUBCHUNK_SIZE, SUBCHUNK_VOLUME};
pub use registry::{NameRegistry, PersistentId};
pub use rotation::{AxisRotation, Rotation};
pub use time::WorldTime;
