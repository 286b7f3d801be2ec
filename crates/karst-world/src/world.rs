//! The world: column table, block access, force loaders, queue wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use hashbrown::HashMap;
use karst_blocks::BlockTypeRegistry;
use karst_chunk::ChunkColumn;
use karst_core::{BlockPos, BlockTypeId, ChunkPos, ColumnPos, Face, Rotation};
use karst_queue::Queue;

use crate::events::{BlockChange, BlockEvent, UpdateScheduler};
use crate::mesh_queue::{MeshRebuildQueue, MeshRebuildRequest};

/// One block change handed to the light worker.
#[derive(Copy, Clone, Debug)]
pub struct LightingUpdate {
    pub pos: BlockPos,
    pub old_type: BlockTypeId,
    pub new_type: BlockTypeId,
    /// When set, the light worker pushes the affected subchunks onto the
    /// mesh rebuild queue after propagation, so a mesh is never built from
    /// pre-propagation light.
    pub trigger_mesh_rebuild: bool,
}

type Generator = Arc<dyn Fn(&ChunkColumn) + Send + Sync>;

/// Sparse, thread-shared map of columns plus the block-level APIs.
///
/// Reads take the shared map lock only long enough to clone the column Arc.
/// The internal API mutates directly and fires no events; the external API
/// only queues events for the game thread, which is the sole mutation
/// authority.
pub struct World {
    columns: RwLock<HashMap<u64, Arc<ChunkColumn>>>,
    generator: RwLock<Option<Generator>>,
    force_loaders: RwLock<HashMap<u64, i32>>,
    scheduler: RwLock<Option<Arc<UpdateScheduler>>>,
    lighting_queue: RwLock<Option<Arc<Queue<LightingUpdate>>>>,
    mesh_queue: RwLock<Option<Arc<MeshRebuildQueue>>>,
    always_defer_mesh_rebuild: AtomicBool,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            columns: RwLock::new(HashMap::new()),
            generator: RwLock::new(None),
            force_loaders: RwLock::new(HashMap::new()),
            scheduler: RwLock::new(None),
            lighting_queue: RwLock::new(None),
            mesh_queue: RwLock::new(None),
            always_defer_mesh_rebuild: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Column table
    // ------------------------------------------------------------------

    pub fn column(&self, pos: ColumnPos) -> Option<Arc<ChunkColumn>> {
        let map = self.columns.read().expect("column map lock poisoned");
        map.get(&pos.pack()).cloned()
    }

    pub fn has_column(&self, pos: ColumnPos) -> bool {
        let map = self.columns.read().expect("column map lock poisoned");
        map.contains_key(&pos.pack())
    }

    /// Get or create a column, running the generator on creation.
    pub fn get_or_create_column(&self, pos: ColumnPos) -> Arc<ChunkColumn> {
        if let Some(col) = self.column(pos) {
            return col;
        }
        let generator = self
            .generator
            .read()
            .expect("generator lock poisoned")
            .clone();
        let mut map = self.columns.write().expect("column map lock poisoned");
        map.entry(pos.pack())
            .or_insert_with(|| {
                let col = Arc::new(ChunkColumn::new(pos));
                if let Some(generate) = generator {
                    generate(&col);
                }
                col
            })
            .clone()
    }

    /// Insert an already-built column (load path). Replaces any existing.
    pub fn insert_column(&self, column: Arc<ChunkColumn>) {
        let mut map = self.columns.write().expect("column map lock poisoned");
        map.insert(column.position().pack(), column);
    }

    pub fn remove_column(&self, pos: ColumnPos) -> Option<Arc<ChunkColumn>> {
        let mut map = self.columns.write().expect("column map lock poisoned");
        map.remove(&pos.pack())
    }

    pub fn column_count(&self) -> usize {
        self.columns.read().expect("column map lock poisoned").len()
    }

    pub fn columns(&self) -> Vec<Arc<ChunkColumn>> {
        let map = self.columns.read().expect("column map lock poisoned");
        map.values().cloned().collect()
    }

    pub fn total_non_air_blocks(&self) -> i64 {
        self.columns().iter().map(|c| c.non_air_count()).sum()
    }

    pub fn clear(&self) {
        let mut map = self.columns.write().expect("column map lock poisoned");
        map.clear();
    }

    pub fn set_generator(&self, generator: Option<Generator>) {
        *self.generator.write().expect("generator lock poisoned") = generator;
    }

    pub fn subchunk(&self, pos: ChunkPos) -> Option<Arc<karst_chunk::SubChunk>> {
        self.column(pos.column())?.subchunk(pos.y)
    }

    pub fn all_subchunk_positions(&self) -> Vec<ChunkPos> {
        let mut out = Vec::new();
        for col in self.columns() {
            for (y, _) in col.subchunks() {
                out.push(col.chunk_pos(y));
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Internal block API (no events)
    // ------------------------------------------------------------------

    /// Read a block. Unloaded positions read as air.
    pub fn get_block(&self, pos: BlockPos) -> BlockTypeId {
        match self.column(pos.column()) {
            Some(col) => col.get_block(pos),
            None => BlockTypeId::AIR,
        }
    }

    /// Set a block directly: no events, no lighting, no notifications.
    /// Creates the column (and runs the generator) if missing. The heightmap
    /// is maintained so a later light pass starts from correct occlusion.
    pub fn set_block(&self, pos: BlockPos, ty: BlockTypeId) {
        if !(-2048..=2047).contains(&pos.y) {
            return;
        }
        let col = self.get_or_create_column(pos.column());
        let old = col.get_block(pos);
        if old == ty {
            return;
        }
        col.set_block(pos, ty);
        let reg = BlockTypeRegistry::global();
        let blocks_sky = !ty.is_air() && reg.blocks_sky_light(ty);
        col.update_height(pos.x & 15, pos.z & 15, pos.y, blocks_sky, reg);
    }

    // ------------------------------------------------------------------
    // External block API (event-driven)
    // ------------------------------------------------------------------

    fn scheduler(&self) -> Option<Arc<UpdateScheduler>> {
        self.scheduler.read().expect("scheduler lock poisoned").clone()
    }

    /// Bind the scheduler the external API queues into. Without one the
    /// external API is a no-op returning `false`.
    pub fn set_update_scheduler(&self, scheduler: Option<Arc<UpdateScheduler>>) {
        *self.scheduler.write().expect("scheduler lock poisoned") = scheduler;
    }

    /// Queue a placement event. Returns `false` without a bound scheduler.
    pub fn place_block(&self, pos: BlockPos, ty: BlockTypeId) -> bool {
        self.place_block_rotated(pos, ty, Rotation::IDENTITY)
    }

    pub fn place_block_rotated(&self, pos: BlockPos, ty: BlockTypeId, rotation: Rotation) -> bool {
        let Some(scheduler) = self.scheduler() else {
            return false;
        };
        let old = self.get_block(pos);
        scheduler.enqueue(BlockEvent::placed(pos, ty, old, rotation));
        true
    }

    pub fn break_block(&self, pos: BlockPos) -> bool {
        let Some(scheduler) = self.scheduler() else {
            return false;
        };
        let old = self.get_block(pos);
        scheduler.enqueue(BlockEvent::broken(pos, old));
        true
    }

    /// Bulk placement; returns the number of events queued.
    pub fn place_blocks(&self, changes: &[BlockChange]) -> usize {
        let Some(scheduler) = self.scheduler() else {
            return 0;
        };
        for change in changes {
            let old = self.get_block(change.pos);
            scheduler.enqueue(BlockEvent::placed(
                change.pos,
                change.block_type,
                old,
                change.rotation,
            ));
        }
        changes.len()
    }

    pub fn break_blocks(&self, positions: &[BlockPos]) -> usize {
        let Some(scheduler) = self.scheduler() else {
            return 0;
        };
        for &pos in positions {
            let old = self.get_block(pos);
            scheduler.enqueue(BlockEvent::broken(pos, old));
        }
        positions.len()
    }

    pub fn use_block(&self, pos: BlockPos, face: Face) -> bool {
        let Some(scheduler) = self.scheduler() else {
            return false;
        };
        scheduler.enqueue(BlockEvent::player_use(pos, face));
        true
    }

    pub fn hit_block(&self, pos: BlockPos, face: Face) -> bool {
        let Some(scheduler) = self.scheduler() else {
            return false;
        };
        scheduler.enqueue(BlockEvent::player_hit(pos, face));
        true
    }

    // ------------------------------------------------------------------
    // Mesh helpers
    // ------------------------------------------------------------------

    /// Subchunks whose meshes a change at `pos` can affect: the containing
    /// subchunk plus face neighbors on axes where the block sits on a
    /// boundary.
    pub fn affected_subchunks(pos: BlockPos) -> Vec<ChunkPos> {
        let chunk = pos.chunk();
        let local = pos.local();
        let mut out = vec![chunk];
        if local.x == 0 {
            out.push(chunk.offset(Face::NegX));
        } else if local.x == 15 {
            out.push(chunk.offset(Face::PosX));
        }
        if local.y == 0 {
            out.push(chunk.offset(Face::NegY));
        } else if local.y == 15 {
            out.push(chunk.offset(Face::PosY));
        }
        if local.z == 0 {
            out.push(chunk.offset(Face::NegZ));
        } else if local.z == 15 {
            out.push(chunk.offset(Face::PosZ));
        }
        out
    }

    // ------------------------------------------------------------------
    // Force loaders
    // ------------------------------------------------------------------

    /// Pin chunks within `radius` (Chebyshev, in chunks) of `pos` against
    /// unload.
    pub fn register_force_loader(&self, pos: BlockPos, radius: i32) {
        let mut map = self
            .force_loaders
            .write()
            .expect("force loader lock poisoned");
        map.insert(pos.pack(), radius.max(0));
    }

    pub fn unregister_force_loader(&self, pos: BlockPos) {
        let mut map = self
            .force_loaders
            .write()
            .expect("force loader lock poisoned");
        map.remove(&pos.pack());
    }

    pub fn is_force_loader(&self, pos: BlockPos) -> bool {
        let map = self
            .force_loaders
            .read()
            .expect("force loader lock poisoned");
        map.contains_key(&pos.pack())
    }

    pub fn can_unload_chunk(&self, chunk: ChunkPos) -> bool {
        let map = self
            .force_loaders
            .read()
            .expect("force loader lock poisoned");
        for (&packed, &radius) in map.iter() {
            let loader_chunk = BlockPos::unpack(packed).chunk();
            if loader_chunk.chebyshev(chunk) <= radius {
                return false;
            }
        }
        true
    }

    /// Column variant: vertical distance is ignored.
    pub fn can_unload_column(&self, pos: ColumnPos) -> bool {
        let map = self
            .force_loaders
            .read()
            .expect("force loader lock poisoned");
        for (&packed, &radius) in map.iter() {
            let loader = BlockPos::unpack(packed).column();
            if loader.chebyshev(pos) <= radius {
                return false;
            }
        }
        true
    }

    pub fn force_loaders(&self) -> Vec<(BlockPos, i32)> {
        let map = self
            .force_loaders
            .read()
            .expect("force loader lock poisoned");
        map.iter()
            .map(|(&packed, &radius)| (BlockPos::unpack(packed), radius))
            .collect()
    }

    pub fn set_force_loaders(&self, loaders: impl IntoIterator<Item = (BlockPos, i32)>) {
        let mut map = self
            .force_loaders
            .write()
            .expect("force loader lock poisoned");
        map.clear();
        for (pos, radius) in loaders {
            map.insert(pos.pack(), radius.max(0));
        }
    }

    // ------------------------------------------------------------------
    // Lighting and mesh queue wiring
    // ------------------------------------------------------------------

    pub fn set_lighting_queue(&self, queue: Option<Arc<Queue<LightingUpdate>>>) {
        *self
            .lighting_queue
            .write()
            .expect("lighting queue lock poisoned") = queue;
    }

    pub fn lighting_queue(&self) -> Option<Arc<Queue<LightingUpdate>>> {
        self.lighting_queue
            .read()
            .expect("lighting queue lock poisoned")
            .clone()
    }

    pub fn set_mesh_queue(&self, queue: Option<Arc<MeshRebuildQueue>>) {
        *self.mesh_queue.write().expect("mesh queue lock poisoned") = queue;
    }

    pub fn mesh_queue(&self) -> Option<Arc<MeshRebuildQueue>> {
        self.mesh_queue
            .read()
            .expect("mesh queue lock poisoned")
            .clone()
    }

    /// Force the deferral path regardless of queue depth (used by tests to
    /// avoid a mesh built from pre-propagation light).
    pub fn set_always_defer_mesh_rebuild(&self, defer: bool) {
        self.always_defer_mesh_rebuild
            .store(defer, Ordering::Relaxed);
    }

    /// Queue a lighting update with no mesh coordination.
    pub fn enqueue_lighting_update(&self, pos: BlockPos, old: BlockTypeId, new: BlockTypeId) {
        if let Some(queue) = self.lighting_queue() {
            queue.push(LightingUpdate {
                pos,
                old_type: old,
                new_type: new,
                trigger_mesh_rebuild: false,
            });
        }
    }

    /// Queue a lighting update, deferring the mesh rebuild to the light
    /// worker when it can run promptly.
    ///
    /// If the lighting queue is idle the worker will finish propagation
    /// before any mesh is built, so the rebuild is deferred to it. If the
    /// worker is backlogged, the rebuild is pushed immediately and the
    /// worker is free to batch.
    pub fn enqueue_lighting_update_with_remesh(
        &self,
        pos: BlockPos,
        old: BlockTypeId,
        new: BlockTypeId,
    ) {
        let Some(queue) = self.lighting_queue() else {
            // No light engine: mesh invalidation still has to happen.
            self.push_mesh_rebuilds(pos);
            return;
        };
        let defer =
            queue.is_empty() || self.always_defer_mesh_rebuild.load(Ordering::Relaxed);
        queue.push(LightingUpdate {
            pos,
            old_type: old,
            new_type: new,
            trigger_mesh_rebuild: defer,
        });
        if !defer {
            self.push_mesh_rebuilds(pos);
        }
    }

    /// Push rebuild requests for every subchunk a change at `pos` affects.
    pub fn push_mesh_rebuilds(&self, pos: BlockPos) {
        let Some(queue) = self.mesh_queue() else {
            return;
        };
        for chunk in Self::affected_subchunks(pos) {
            let (block_version, light_version) = match self.subchunk(chunk) {
                Some(sc) => (sc.block_version(), sc.light_version()),
                None => (0, 0),
            };
            queue.push(chunk, MeshRebuildRequest::urgent(block_version, light_version));
        }
    }
}
