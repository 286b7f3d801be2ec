//! World table, block APIs, event outbox and column lifecycle.
#![forbid(unsafe_code)]

mod distances;
mod events;
mod manager;
mod mesh_queue;
mod world;

pub use distances::{DistanceZones, Zone};
pub use events::{
    BlockChange, BlockEvent, EventKind, EventOutbox, UpdateScheduler, event_priority,
};
pub use manager::{ColumnManager, ColumnState, ColumnStore, ManagedColumn};
pub use mesh_queue::{MeshRebuildQueue, MeshRebuildRequest, new_mesh_rebuild_queue};
pub use world::{LightingUpdate, World};
