//! Vertical stack of subchunks at one (x, z) column position.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use karst_blocks::BlockTypeRegistry;
use karst_core::{BlockPos, BlockTypeId, ChunkPos, ColumnPos, DataContainer, LocalPos};

use crate::subchunk::{BlockChangeCallback, SubChunk};

/// Heightmap value for a column with no sky-blocking blocks.
pub const NO_HEIGHT: i32 = i32::MIN;

/// Subchunk Y range matching the packed position format (+/-2048 blocks).
const MIN_CHUNK_Y: i32 = -128;
const MAX_CHUNK_Y: i32 = 127;

struct Heightmap {
    // Index = z*16 + x. Value = Y of the first sky-open cell above the
    // highest sky-blocking block, NO_HEIGHT when the column has none.
    data: Box<[i32; 256]>,
    dirty: bool,
}

/// Sparse column of subchunks with heightmap and activity tracking.
///
/// Subchunks exist only while they contain non-air blocks: setting air on a
/// missing subchunk is a no-op, and a subchunk whose last block is cleared
/// is pruned.
pub struct ChunkColumn {
    pos: ColumnPos,
    subchunks: RwLock<HashMap<i32, Arc<SubChunk>>>,
    heightmap: Mutex<Heightmap>,
    light_initialized: AtomicBool,
    data: Mutex<Option<DataContainer>>,
    last_activity: Mutex<Option<Instant>>,
    change_callback: Mutex<Option<BlockChangeCallback>>,
}

#[inline]
fn heightmap_index(local_x: i32, local_z: i32) -> usize {
    (local_z * 16 + local_x) as usize
}

impl ChunkColumn {
    pub fn new(pos: ColumnPos) -> Self {
        Self {
            pos,
            subchunks: RwLock::new(HashMap::new()),
            heightmap: Mutex::new(Heightmap {
                data: Box::new([NO_HEIGHT; 256]),
                dirty: true,
            }),
            light_initialized: AtomicBool::new(false),
            data: Mutex::new(None),
            last_activity: Mutex::new(None),
            change_callback: Mutex::new(None),
        }
    }

    #[inline]
    pub fn position(&self) -> ColumnPos {
        self.pos
    }

    #[inline]
    pub fn chunk_pos(&self, chunk_y: i32) -> ChunkPos {
        ChunkPos::new(self.pos.x, chunk_y, self.pos.z)
    }

    /// Install the change callback on current and future subchunks.
    pub fn set_block_change_callback(&self, callback: Option<BlockChangeCallback>) {
        *self
            .change_callback
            .lock()
            .expect("column callback lock poisoned") = callback.clone();
        let map = self.subchunks.read().expect("column lock poisoned");
        for sc in map.values() {
            sc.set_change_callback(callback.clone());
        }
    }

    // ------------------------------------------------------------------
    // Block access
    // ------------------------------------------------------------------

    pub fn get_block(&self, pos: BlockPos) -> BlockTypeId {
        let chunk_y = pos.y >> 4;
        if !(MIN_CHUNK_Y..=MAX_CHUNK_Y).contains(&chunk_y) {
            return BlockTypeId::AIR;
        }
        let map = self.subchunks.read().expect("column lock poisoned");
        match map.get(&chunk_y) {
            Some(sc) => sc.get(pos.local()),
            None => BlockTypeId::AIR,
        }
    }

    /// Set a block, creating or pruning the subchunk as needed.
    pub fn set_block(&self, pos: BlockPos, ty: BlockTypeId) {
        let chunk_y = pos.y >> 4;
        if !(MIN_CHUNK_Y..=MAX_CHUNK_Y).contains(&chunk_y) {
            return;
        }
        if ty.is_air() {
            let sc = {
                let map = self.subchunks.read().expect("column lock poisoned");
                map.get(&chunk_y).cloned()
            };
            let Some(sc) = sc else {
                return;
            };
            sc.set(pos.local(), ty);
            if sc.is_empty() {
                let mut map = self.subchunks.write().expect("column lock poisoned");
                if map.get(&chunk_y).is_some_and(|s| s.is_empty()) {
                    map.remove(&chunk_y);
                }
            }
        } else {
            self.get_or_create_subchunk(chunk_y).set(pos.local(), ty);
        }
    }

    pub fn has_subchunk(&self, chunk_y: i32) -> bool {
        let map = self.subchunks.read().expect("column lock poisoned");
        map.contains_key(&chunk_y)
    }

    pub fn subchunk(&self, chunk_y: i32) -> Option<Arc<SubChunk>> {
        let map = self.subchunks.read().expect("column lock poisoned");
        map.get(&chunk_y).cloned()
    }

    pub fn get_or_create_subchunk(&self, chunk_y: i32) -> Arc<SubChunk> {
        {
            let map = self.subchunks.read().expect("column lock poisoned");
            if let Some(sc) = map.get(&chunk_y) {
                return sc.clone();
            }
        }
        let mut map = self.subchunks.write().expect("column lock poisoned");
        map.entry(chunk_y)
            .or_insert_with(|| {
                let sc = Arc::new(SubChunk::new(self.chunk_pos(chunk_y)));
                let callback = self
                    .change_callback
                    .lock()
                    .expect("column callback lock poisoned")
                    .clone();
                sc.set_change_callback(callback);
                sc
            })
            .clone()
    }

    /// Sorted snapshot of allocated subchunks, bottom to top.
    pub fn subchunks(&self) -> Vec<(i32, Arc<SubChunk>)> {
        let map = self.subchunks.read().expect("column lock poisoned");
        let mut out: Vec<_> = map.iter().map(|(&y, sc)| (y, sc.clone())).collect();
        out.sort_by_key(|(y, _)| *y);
        out
    }

    pub fn prune_empty_subchunks(&self) {
        let mut map = self.subchunks.write().expect("column lock poisoned");
        map.retain(|_, sc| !sc.is_empty());
    }

    pub fn subchunk_count(&self) -> usize {
        self.subchunks.read().expect("column lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        let map = self.subchunks.read().expect("column lock poisoned");
        map.values().all(|sc| sc.is_empty())
    }

    pub fn non_air_count(&self) -> i64 {
        let map = self.subchunks.read().expect("column lock poisoned");
        map.values().map(|sc| sc.non_air_count() as i64).sum()
    }

    /// Min and max chunk Y of non-empty subchunks.
    pub fn y_bounds(&self) -> Option<(i32, i32)> {
        let map = self.subchunks.read().expect("column lock poisoned");
        let mut bounds: Option<(i32, i32)> = None;
        for (&y, sc) in map.iter() {
            if sc.is_empty() {
                continue;
            }
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(y), hi.max(y)),
                None => (y, y),
            });
        }
        bounds
    }

    pub fn compact_all(&self) {
        for (_, sc) in self.subchunks() {
            if sc.needs_compaction() {
                sc.compact_palette();
            }
        }
    }

    // ------------------------------------------------------------------
    // Heightmap
    // ------------------------------------------------------------------

    /// First sky-open Y above the highest sky-blocking block, or
    /// [`NO_HEIGHT`].
    pub fn height(&self, local_x: i32, local_z: i32) -> i32 {
        let hm = self.heightmap.lock().expect("heightmap lock poisoned");
        hm.data[heightmap_index(local_x, local_z)]
    }

    /// Incremental heightmap update after one block change.
    pub fn update_height(
        &self,
        local_x: i32,
        local_z: i32,
        block_y: i32,
        blocks_sky_light: bool,
        reg: &BlockTypeRegistry,
    ) {
        let index = heightmap_index(local_x, local_z);
        let mut hm = self.heightmap.lock().expect("heightmap lock poisoned");
        let current = hm.data[index];
        if blocks_sky_light {
            if current == NO_HEIGHT || block_y + 1 > current {
                hm.data[index] = block_y + 1;
            }
        } else if current != NO_HEIGHT && block_y + 1 == current {
            // The top blocker went away; find the next one below.
            hm.data[index] = self.scan_down(local_x, local_z, block_y, reg);
        }
    }

    /// Rebuild the whole heightmap from block data.
    pub fn recalculate_heightmap(&self, reg: &BlockTypeRegistry) {
        let mut data = Box::new([NO_HEIGHT; 256]);
        let top = self
            .y_bounds()
            .map(|(_, hi)| (hi << 4) + 15)
            .unwrap_or(NO_HEIGHT);
        if top != NO_HEIGHT {
            for lz in 0..16 {
                for lx in 0..16 {
                    data[heightmap_index(lx, lz)] = self.scan_down(lx, lz, top, reg);
                }
            }
        }
        let mut hm = self.heightmap.lock().expect("heightmap lock poisoned");
        hm.data = data;
        hm.dirty = false;
    }

    // Highest sky-blocking block at or below start_y, expressed as its
    // sky-open Y + 1. Walks allocated subchunks top-down.
    fn scan_down(&self, local_x: i32, local_z: i32, start_y: i32, reg: &BlockTypeRegistry) -> i32 {
        let mut chunks = self.subchunks();
        chunks.retain(|(y, sc)| ((*y) << 4) <= start_y && !sc.is_empty());
        chunks.reverse();
        for (chunk_y, sc) in chunks {
            let base = chunk_y << 4;
            let top = (base + 15).min(start_y);
            for y in (base..=top).rev() {
                let ty = sc.get(LocalPos::new(local_x as u8, (y & 15) as u8, local_z as u8));
                if !ty.is_air() && reg.blocks_sky_light(ty) {
                    return y + 1;
                }
            }
        }
        NO_HEIGHT
    }

    pub fn heightmap_dirty(&self) -> bool {
        self.heightmap.lock().expect("heightmap lock poisoned").dirty
    }

    pub fn mark_heightmap_dirty(&self) {
        self.heightmap.lock().expect("heightmap lock poisoned").dirty = true;
    }

    pub fn heightmap_data(&self) -> [i32; 256] {
        *self.heightmap.lock().expect("heightmap lock poisoned").data
    }

    pub fn set_heightmap_data(&self, data: [i32; 256]) {
        let mut hm = self.heightmap.lock().expect("heightmap lock poisoned");
        hm.data = Box::new(data);
        hm.dirty = false;
    }

    // ------------------------------------------------------------------
    // Light initialization
    // ------------------------------------------------------------------

    pub fn is_light_initialized(&self) -> bool {
        self.light_initialized.load(Ordering::Acquire)
    }

    pub fn mark_light_initialized(&self) {
        self.light_initialized.store(true, Ordering::Release);
    }

    pub fn reset_light_initialized(&self) {
        self.light_initialized.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Column data sidecar
    // ------------------------------------------------------------------

    pub fn has_data(&self) -> bool {
        self.data.lock().expect("column data lock poisoned").is_some()
    }

    pub fn data(&self) -> Option<DataContainer> {
        self.data.lock().expect("column data lock poisoned").clone()
    }

    pub fn set_data(&self, data: Option<DataContainer>) {
        *self.data.lock().expect("column data lock poisoned") = data;
    }

    /// Mutate the column data, creating it on demand.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut DataContainer) -> R) -> R {
        let mut guard = self.data.lock().expect("column data lock poisoned");
        let data = guard.get_or_insert_with(DataContainer::new);
        f(data)
    }

    // ------------------------------------------------------------------
    // Activity timer
    // ------------------------------------------------------------------

    /// Touch on every cross-chunk event delivery; vetoes unload until the
    /// timeout passes so propagation chains are not cut mid-step.
    pub fn touch_activity(&self) {
        *self
            .last_activity
            .lock()
            .expect("activity lock poisoned") = Some(Instant::now());
    }

    pub fn activity_age(&self) -> Option<Duration> {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .map(|at| at.elapsed())
    }

    /// True when no activity happened within `timeout`. Columns that were
    /// never touched count as expired.
    pub fn activity_expired(&self, timeout: Duration) -> bool {
        match self.activity_age() {
            Some(age) => age >= timeout,
            None => true,
        }
    }
}
