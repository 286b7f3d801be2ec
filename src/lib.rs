//! Karst: a headless chunked voxel world core.
//!
//! Re-exports the member crates plus the [`Engine`] wiring that owns the
//! full thread set (game, light, mesh workers, IO) with ordered teardown.
#![forbid(unsafe_code)]

mod engine;

pub use engine::{Engine, EngineConfig};

pub use karst_blocks as blocks;
pub use karst_chunk as chunk;
pub use karst_core as core;
pub use karst_io as io;
pub use karst_lighting as lighting;
pub use karst_mesh as mesh;
pub use karst_queue as queue;
pub use karst_runtime as runtime;
pub use karst_world as world;
