//! Keyed-coalescing rebuild queue feeding the mesh worker pool.

use karst_core::ChunkPos;
use karst_queue::KeyedQueue;

/// One rebuild request. Lower `priority` is more urgent.
#[derive(Copy, Clone, Debug)]
pub struct MeshRebuildRequest {
    pub priority: u32,
    /// Requested LOD level (0 = full detail).
    pub lod: u8,
    pub block_version: u64,
    pub light_version: u64,
}

impl MeshRebuildRequest {
    pub fn urgent(block_version: u64, light_version: u64) -> Self {
        Self {
            priority: 0,
            lod: 0,
            block_version,
            light_version,
        }
    }
}

pub type MeshRebuildQueue = KeyedQueue<ChunkPos, MeshRebuildRequest>;

/// Queue whose duplicate pushes keep the higher priority, latest versions
/// and latest LOD request.
pub fn new_mesh_rebuild_queue() -> MeshRebuildQueue {
    KeyedQueue::with_merge(|existing: &MeshRebuildRequest, incoming: MeshRebuildRequest| {
        MeshRebuildRequest {
            priority: existing.priority.min(incoming.priority),
            lod: incoming.lod,
            block_version: existing.block_version.max(incoming.block_version),
            light_version: existing.light_version.max(incoming.light_version),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_urgency_and_latest_versions() {
        let q = new_mesh_rebuild_queue();
        let pos = ChunkPos::new(1, 2, 3);
        q.push(
            pos,
            MeshRebuildRequest {
                priority: 10,
                lod: 1,
                block_version: 5,
                light_version: 9,
            },
        );
        q.push(
            pos,
            MeshRebuildRequest {
                priority: 3,
                lod: 0,
                block_version: 7,
                light_version: 2,
            },
        );
        let (_, merged) = q.try_pop().unwrap();
        assert_eq!(merged.priority, 3);
        assert_eq!(merged.lod, 0);
        assert_eq!(merged.block_version, 7);
        assert_eq!(merged.light_version, 9);
    }
}
