//! Parallel mesh builds with a version-keyed cache and stale scanning.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use hashbrown::HashMap;
use karst_chunk::{BlockVolume, SubChunk};
use karst_core::{BlockPos, BlockTypeId, ChunkPos, Face};
use karst_lighting::{block_light_at, sky_light_at};
use karst_mesh::{
    LodMergeMode, LodRequest, MeshBuildInput, MeshData, UvRect, build_greedy, build_naive,
    downsample_volume,
};
use karst_world::{MeshRebuildQueue, MeshRebuildRequest, World};
use log::trace;

type TextureFn = Arc<dyn Fn(BlockTypeId, Face) -> UvRect + Send + Sync>;

/// Cache slot for one subchunk's mesh.
///
/// Workers fill the `pending` side; the graphics thread promotes it to
/// `uploaded` after the GPU copy via [`MeshWorkerPool::mark_uploaded`].
pub struct MeshCacheEntry {
    pub pending_mesh: Option<Arc<MeshData>>,
    pub pending_block_version: u64,
    pub pending_light_version: u64,
    pub pending_lod: u8,
    pub uploaded_block_version: u64,
    pub uploaded_light_version: u64,
    pub uploaded_lod: u8,
    pub subchunk: Weak<SubChunk>,
}

impl MeshCacheEntry {
    fn new(subchunk: &Arc<SubChunk>) -> Self {
        Self {
            pending_mesh: None,
            pending_block_version: 0,
            pending_light_version: 0,
            pending_lod: 0,
            uploaded_block_version: 0,
            uploaded_light_version: 0,
            uploaded_lod: 0,
            subchunk: Arc::downgrade(subchunk),
        }
    }

    pub fn has_pending_mesh(&self) -> bool {
        self.pending_mesh.is_some()
    }

    /// Stale when the live subchunk's versions moved past what was
    /// uploaded. A dropped subchunk is not stale; it gets removed instead.
    pub fn is_stale(&self) -> bool {
        match self.subchunk.upgrade() {
            Some(sc) => {
                sc.block_version() != self.uploaded_block_version
                    || sc.light_version() != self.uploaded_light_version
            }
            None => false,
        }
    }

    pub fn satisfies_lod(&self, request: LodRequest) -> bool {
        request.accepts(self.uploaded_lod)
    }
}

/// What the graphics thread gets back from [`MeshWorkerPool::get_mesh`].
#[derive(Clone, Default)]
pub struct GetMeshResult {
    /// A rebuild request was queued (coalesced) this call.
    pub rebuild_triggered: bool,
    /// Present when the cache has an entry at all, even a stale one, so the
    /// renderer can keep drawing while the rebuild runs.
    pub has_entry: bool,
    /// Mesh awaiting GPU upload, if the workers produced one.
    pub pending_mesh: Option<Arc<MeshData>>,
    pub pending_lod: u8,
    pub uploaded_lod: u8,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub meshes_built: AtomicU64,
    pub total_vertices: AtomicU64,
    pub total_indices: AtomicU64,
}

struct Tracked {
    ring: Vec<ChunkPos>,
    index: HashMap<u64, usize>,
}

impl Tracked {
    fn position_of(&self, pos: ChunkPos) -> Option<usize> {
        self.index.get(&pos.pack()).copied()
    }

    fn remove_at(&mut self, at: usize) {
        let pos = self.ring.remove(at);
        self.index.remove(&pos.pack());
        for (i, p) in self.ring.iter().enumerate().skip(at) {
            self.index.insert(p.pack(), i);
        }
    }

    fn move_to_back(&mut self, at: usize) {
        let pos = self.ring.remove(at);
        self.ring.push(pos);
        for (i, p) in self.ring.iter().enumerate().skip(at) {
            self.index.insert(p.pack(), i);
        }
    }

    fn move_to_front(&mut self, at: usize) {
        let pos = self.ring.remove(at);
        self.ring.insert(0, pos);
        for (i, p) in self.ring.iter().enumerate() {
            self.index.insert(p.pack(), i);
        }
    }
}

/// N worker threads pulling from the shared mesh rebuild queue.
///
/// When the queue is empty the workers scan the tracked-chunk ring for
/// entries whose versions drifted from the uploaded mesh and rebuild those
/// in the background; the graphics thread can set an alarm to schedule that
/// scan just before the next frame.
pub struct MeshWorkerPool {
    world: Arc<World>,
    queue: Arc<MeshRebuildQueue>,
    cache: Mutex<HashMap<u64, MeshCacheEntry>>,
    tracked: Mutex<Tracked>,
    textures: RwLock<Option<TextureFn>>,
    greedy: AtomicBool,
    background_scanning: AtomicBool,
    lod_merge_mode: Mutex<LodMergeMode>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    stats: PoolStats,
}

impl MeshWorkerPool {
    /// `threads = 0` means hardware concurrency minus one.
    pub fn new(world: Arc<World>, queue: Arc<MeshRebuildQueue>, threads: usize) -> Arc<Self> {
        let worker_count = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1).max(1))
                .unwrap_or(1)
        } else {
            threads
        };
        Arc::new(Self {
            world,
            queue,
            cache: Mutex::new(HashMap::new()),
            tracked: Mutex::new(Tracked {
                ring: Vec::new(),
                index: HashMap::new(),
            }),
            textures: RwLock::new(None),
            greedy: AtomicBool::new(true),
            background_scanning: AtomicBool::new(true),
            lod_merge_mode: Mutex::new(LodMergeMode::FullHeight),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            worker_count,
            stats: PoolStats::default(),
        })
    }

    pub fn set_texture_provider(
        &self,
        provider: impl Fn(BlockTypeId, Face) -> UvRect + Send + Sync + 'static,
    ) {
        *self.textures.write().expect("texture provider lock poisoned") = Some(Arc::new(provider));
    }

    pub fn set_greedy_meshing(&self, enabled: bool) {
        self.greedy.store(enabled, Ordering::Relaxed);
    }

    pub fn set_background_scanning(&self, enabled: bool) {
        self.background_scanning.store(enabled, Ordering::Relaxed);
    }

    pub fn set_lod_merge_mode(&self, mode: LodMergeMode) {
        *self.lod_merge_mode.lock().expect("lod mode lock poisoned") = mode;
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn thread_count(&self) -> usize {
        self.worker_count
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().expect("pool workers lock poisoned");
        for i in 0..self.worker_count {
            let pool = Arc::clone(self);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("karst-mesh-{i}"))
                    .spawn(move || pool.worker_loop())
                    .expect("failed to spawn mesh worker"),
            );
        }
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.shutdown();
        let mut workers = self.workers.lock().expect("pool workers lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn worker_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if let Some((pos, request)) = self.queue.try_pop() {
                self.build_to_cache(pos, request);
                continue;
            }
            if self.background_scanning.load(Ordering::Relaxed) {
                if let Some((pos, request)) = self.find_stale_chunk() {
                    self.build_to_cache(pos, request);
                    continue;
                }
            }
            if !self.queue.wait_for_work() {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Graphics thread API
    // ------------------------------------------------------------------

    /// Per-frame cache query. Triggers a coalesced rebuild when the entry
    /// is missing, stale, or the wrong LOD, and returns whatever mesh
    /// exists meanwhile.
    pub fn get_mesh(
        &self,
        pos: ChunkPos,
        subchunk: &Arc<SubChunk>,
        lod_request: LodRequest,
    ) -> GetMeshResult {
        let mut result = GetMeshResult::default();
        let needs_rebuild = {
            let cache = self.cache.lock().expect("mesh cache lock poisoned");
            match cache.get(&pos.pack()) {
                Some(entry) => {
                    result.has_entry = true;
                    result.pending_mesh = entry.pending_mesh.clone();
                    result.pending_lod = entry.pending_lod;
                    result.uploaded_lod = entry.uploaded_lod;
                    entry.is_stale() || !entry.satisfies_lod(lod_request)
                }
                None => true,
            }
        };
        if needs_rebuild {
            let request = MeshRebuildRequest {
                priority: 1,
                lod: lod_request.level,
                block_version: subchunk.block_version(),
                light_version: subchunk.light_version(),
            };
            self.queue.push(pos, request);
            self.touch_chunk(pos);
            result.rebuild_triggered = true;
        }
        result
    }

    /// Promote the pending mesh to uploaded after the GPU copy.
    pub fn mark_uploaded(&self, pos: ChunkPos) {
        let mut cache = self.cache.lock().expect("mesh cache lock poisoned");
        if let Some(entry) = cache.get_mut(&pos.pack()) {
            if entry.pending_mesh.take().is_some() {
                entry.uploaded_block_version = entry.pending_block_version;
                entry.uploaded_light_version = entry.pending_light_version;
                entry.uploaded_lod = entry.pending_lod;
            }
        }
    }

    /// Drop a chunk's cache entry (out of view or unloaded).
    pub fn remove_mesh(&self, pos: ChunkPos) {
        let mut cache = self.cache.lock().expect("mesh cache lock poisoned");
        cache.remove(&pos.pack());
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("mesh cache lock poisoned").len()
    }

    pub fn pending_mesh_count(&self) -> usize {
        let cache = self.cache.lock().expect("mesh cache lock poisoned");
        cache.values().filter(|e| e.has_pending_mesh()).count()
    }

    /// Wake the workers at `when` for a background scan even if no explicit
    /// work arrives (typically half a frame before the next render).
    pub fn set_alarm(&self, when: Instant) {
        self.queue.set_alarm(when);
    }

    pub fn clear_alarm(&self) {
        self.queue.clear_alarm();
    }

    // ------------------------------------------------------------------
    // Tracked chunks
    // ------------------------------------------------------------------

    pub fn track_chunk(&self, pos: ChunkPos) {
        let mut tracked = self.tracked.lock().expect("tracked lock poisoned");
        if tracked.index.contains_key(&pos.pack()) {
            return;
        }
        let idx = tracked.ring.len();
        tracked.index.insert(pos.pack(), idx);
        tracked.ring.push(pos);
    }

    pub fn untrack_chunk(&self, pos: ChunkPos) {
        let mut tracked = self.tracked.lock().expect("tracked lock poisoned");
        if let Some(at) = tracked.position_of(pos) {
            tracked.remove_at(at);
        }
    }

    pub fn clear_tracked_chunks(&self) {
        let mut tracked = self.tracked.lock().expect("tracked lock poisoned");
        tracked.ring.clear();
        tracked.index.clear();
    }

    /// Move a chunk to the front of the scan order (recently requested).
    pub fn touch_chunk(&self, pos: ChunkPos) {
        let mut tracked = self.tracked.lock().expect("tracked lock poisoned");
        if let Some(at) = tracked.position_of(pos) {
            tracked.move_to_front(at);
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().expect("tracked lock poisoned").ring.len()
    }

    /// First tracked chunk whose live versions differ from the uploaded
    /// mesh. The hit rotates to the back so scanning stays balanced;
    /// entries whose subchunks dropped fall out of the ring.
    fn find_stale_chunk(&self) -> Option<(ChunkPos, MeshRebuildRequest)> {
        let mut tracked = self.tracked.lock().expect("tracked lock poisoned");
        let cache = self.cache.lock().expect("mesh cache lock poisoned");
        let mut at = 0;
        while at < tracked.ring.len() {
            let pos = tracked.ring[at];
            let Some(sc) = self.world.subchunk(pos) else {
                tracked.remove_at(at);
                continue;
            };
            let (uploaded_block, uploaded_light, lod) = match cache.get(&pos.pack()) {
                Some(entry) => {
                    if entry.has_pending_mesh() {
                        // Already rebuilt, waiting on upload.
                        at += 1;
                        continue;
                    }
                    (
                        entry.uploaded_block_version,
                        entry.uploaded_light_version,
                        entry.uploaded_lod,
                    )
                }
                None => (0, 0, 0),
            };
            let block_version = sc.block_version();
            let light_version = sc.light_version();
            if block_version != uploaded_block || light_version != uploaded_light {
                tracked.move_to_back(at);
                return Some((
                    pos,
                    MeshRebuildRequest {
                        priority: u32::MAX,
                        lod,
                        block_version,
                        light_version,
                    },
                ));
            }
            at += 1;
        }
        None
    }

    // ------------------------------------------------------------------
    // Build path (workers)
    // ------------------------------------------------------------------

    fn build_to_cache(&self, pos: ChunkPos, request: MeshRebuildRequest) {
        let Some(sc) = self.world.subchunk(pos) else {
            self.remove_mesh(pos);
            return;
        };
        // Capture versions before reading the volume: a mutation racing the
        // build leaves the entry stale, which re-triggers.
        let light_version = sc.light_version();
        let volume = sc.snapshot();
        let block_version = volume.block_version;

        let neighbor_arcs: Vec<Option<Arc<SubChunk>>> = Face::ALL
            .iter()
            .map(|&face| self.world.subchunk(pos.offset(face)))
            .collect();
        let neighbor_volumes: Vec<Option<BlockVolume>> = neighbor_arcs
            .iter()
            .map(|sc| sc.as_ref().map(|sc| sc.snapshot()))
            .collect();

        let merge_mode = *self.lod_merge_mode.lock().expect("lod mode lock poisoned");
        let lod_volume = downsample_volume(&volume, request.lod, merge_mode);

        let mut neighbors: [Option<&BlockVolume>; 6] = [None; 6];
        for (slot, volume) in neighbors.iter_mut().zip(neighbor_volumes.iter()) {
            *slot = volume.as_ref();
        }
        let input = MeshBuildInput {
            chunk: pos,
            center: &lod_volume,
            neighbors,
        };
        let world = &self.world;
        let light = |p: BlockPos| -> u8 {
            (sky_light_at(world, p) << 4) | block_light_at(world, p)
        };
        let textures = self.textures.read().expect("texture provider lock poisoned").clone();
        let texture_fn = |ty: BlockTypeId, face: Face| -> UvRect {
            match &textures {
                Some(provider) => provider(ty, face),
                None => UvRect::FULL,
            }
        };
        let mesh = if self.greedy.load(Ordering::Relaxed) {
            build_greedy(&input, &light, &texture_fn)
        } else {
            build_naive(&input, &light, &texture_fn)
        };
        trace!(
            "built mesh for {pos:?}: {} vertices, lod {}",
            mesh.vertex_count(),
            request.lod
        );
        self.stats.meshes_built.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_vertices
            .fetch_add(mesh.vertex_count() as u64, Ordering::Relaxed);
        self.stats
            .total_indices
            .fetch_add(mesh.indices.len() as u64, Ordering::Relaxed);

        let mut cache = self.cache.lock().expect("mesh cache lock poisoned");
        let entry = cache
            .entry(pos.pack())
            .or_insert_with(|| MeshCacheEntry::new(&sc));
        entry.subchunk = Arc::downgrade(&sc);
        entry.pending_mesh = Some(Arc::new(mesh));
        entry.pending_block_version = block_version;
        entry.pending_light_version = light_version;
        entry.pending_lod = request.lod;
    }

    /// Synchronous single-request processing, used by tests and the demo
    /// binary to drive builds without worker threads.
    pub fn pump_one(&self) -> bool {
        if let Some((pos, request)) = self.queue.try_pop() {
            self.build_to_cache(pos, request);
            return true;
        }
        if let Some((pos, request)) = self.find_stale_chunk() {
            self.build_to_cache(pos, request);
            return true;
        }
        false
    }
}

impl Drop for MeshWorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_blocks::{BlockDef, BlockTypeRegistry};
    use karst_world::new_mesh_rebuild_queue;

    fn stone() -> BlockTypeId {
        BlockTypeRegistry::global().register(&BlockDef {
            name: "karst:pool_stone".to_string(),
            solid: Some(true),
            opaque: None,
            blocks_skylight: None,
            light_attenuation: None,
            light_emission: None,
            random_ticks: None,
            tags: Vec::new(),
        })
    }

    fn setup() -> (Arc<World>, Arc<MeshWorkerPool>, ChunkPos, Arc<SubChunk>) {
        let world = Arc::new(World::new());
        world.set_block(BlockPos::new(8, 8, 8), stone());
        let queue = Arc::new(new_mesh_rebuild_queue());
        world.set_mesh_queue(Some(queue.clone()));
        let pool = MeshWorkerPool::new(world.clone(), queue, 1);
        let pos = ChunkPos::new(0, 0, 0);
        let sc = world.subchunk(pos).unwrap();
        (world, pool, pos, sc)
    }

    // A block edit makes the cache stale; upload settles it again.
    #[test]
    fn staleness_cycle() {
        let (world, pool, pos, sc) = setup();
        let request = LodRequest::exact(0);

        // First query: no entry, rebuild triggered.
        let first = pool.get_mesh(pos, &sc, request);
        assert!(first.rebuild_triggered);
        assert!(!first.has_entry);

        // Worker builds; pending appears.
        assert!(pool.pump_one());
        let built = pool.get_mesh(pos, &sc, request);
        assert!(built.pending_mesh.is_some());
        let old_vertex_count = built.pending_mesh.as_ref().unwrap().vertex_count();
        assert!(old_vertex_count > 0);

        pool.mark_uploaded(pos);
        let clean = pool.get_mesh(pos, &sc, request);
        assert!(!clean.rebuild_triggered);

        // Mutate a block (a detached one, so the rebuilt mesh grows):
        // stale again, but the old entry remains usable.
        world.set_block(BlockPos::new(12, 12, 12), stone());
        let stale = pool.get_mesh(pos, &sc, request);
        assert!(stale.rebuild_triggered);
        assert!(stale.has_entry);

        assert!(pool.pump_one());
        let rebuilt = pool.get_mesh(pos, &sc, request);
        let new_mesh = rebuilt.pending_mesh.unwrap();
        assert!(new_mesh.vertex_count() > old_vertex_count);
        pool.mark_uploaded(pos);
        let settled = pool.get_mesh(pos, &sc, request);
        assert!(!settled.rebuild_triggered);
    }

    #[test]
    fn lod_mismatch_triggers_rebuild() {
        let (_world, pool, pos, sc) = setup();
        pool.get_mesh(pos, &sc, LodRequest::exact(0));
        pool.pump_one();
        pool.mark_uploaded(pos);
        assert!(!pool.get_mesh(pos, &sc, LodRequest::exact(0)).rebuild_triggered);
        // Request a coarser level: mismatch.
        let coarse = pool.get_mesh(pos, &sc, LodRequest::exact(2));
        assert!(coarse.rebuild_triggered);
        pool.pump_one();
        pool.mark_uploaded(pos);
        assert!(!pool.get_mesh(pos, &sc, LodRequest::exact(2)).rebuild_triggered);
        // Flexible request accepts the uploaded level 2.
        let flexible = LodRequest {
            level: 1,
            flexibility: 1,
        };
        assert!(!pool.get_mesh(pos, &sc, flexible).rebuild_triggered);
    }

    #[test]
    fn stale_scan_finds_tracked_chunk() {
        let (world, pool, pos, _sc) = setup();
        pool.track_chunk(pos);
        assert_eq!(pool.tracked_count(), 1);
        // No explicit request queued; the scan discovers version drift.
        assert!(pool.pump_one());
        pool.mark_uploaded(pos);
        assert!(!pool.pump_one());
        // A mutation re-arms the scan.
        world.set_block(BlockPos::new(1, 1, 1), stone());
        assert!(pool.pump_one());
    }

    #[test]
    fn untracked_and_unloaded_chunks_drop_out() {
        let (world, pool, pos, _sc) = setup();
        pool.track_chunk(pos);
        pool.untrack_chunk(pos);
        assert_eq!(pool.tracked_count(), 0);

        // A tracked chunk whose column unloads falls out of the ring.
        pool.track_chunk(pos);
        world.remove_column(karst_core::ColumnPos::new(0, 0));
        assert!(!pool.pump_one());
        assert_eq!(pool.tracked_count(), 0);
    }

    #[test]
    fn worker_threads_drain_queue() {
        let (world, pool, pos, sc) = setup();
        pool.start();
        let result = pool.get_mesh(pos, &sc, LodRequest::exact(0));
        assert!(result.rebuild_triggered);
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let state = pool.get_mesh(pos, &sc, LodRequest::exact(0));
            if state.pending_mesh.is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "worker never produced a mesh");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        pool.stop();
        drop(world);
    }
}
