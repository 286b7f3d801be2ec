//! Mesh worker pool and the single-consumer game thread.
#![forbid(unsafe_code)]

mod pool;
mod session;

pub use pool::{GetMeshResult, MeshCacheEntry, MeshWorkerPool, PoolStats};
pub use session::{
    EntitySnapshot, GameCommand, GameSession, GameSessionConfig, GraphicsEvent,
};
