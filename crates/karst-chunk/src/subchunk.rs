//! 16^3 palette-indexed block volume.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use karst_core::{BlockTypeId, ChunkPos, DataContainer, LocalPos, SUBCHUNK_VOLUME};

use crate::light_data::LightData;
use crate::palette::{INVALID_LOCAL_INDEX, LocalIndex, Palette};

/// Fired after a real block change: `(chunk, local, old, new)`.
pub type BlockChangeCallback = Arc<dyn Fn(ChunkPos, LocalPos, BlockTypeId, BlockTypeId) + Send + Sync>;

struct Inner {
    palette: Palette,
    blocks: Vec<LocalIndex>,
    usage: Vec<u32>,
    non_air: u32,
    // Sparse per-block metadata, keyed by local index.
    block_data: HashMap<u16, DataContainer>,
}

/// Dense snapshot of a subchunk's block types, for mesh and light passes.
#[derive(Clone)]
pub struct BlockVolume {
    pub types: Vec<BlockTypeId>,
    pub non_air: u32,
    pub block_version: u64,
}

impl BlockVolume {
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> BlockTypeId {
        self.types[y * 256 + z * 16 + x]
    }

    pub fn is_empty(&self) -> bool {
        self.non_air == 0
    }
}

/// Serialization view: compacted palette plus raw indices.
pub struct SubchunkSerial {
    pub palette: Vec<BlockTypeId>,
    pub bits: u32,
    pub indices: Vec<LocalIndex>,
    pub block_data: Vec<(u16, DataContainer)>,
}

/// A 16x16x16 block volume with palette compression and usage counting.
///
/// The game thread is the only writer; mesh and IO threads take snapshots
/// through the internal lock. `block_version` increments on every real
/// change with release ordering, so version observers get at-least-as-new
/// data.
pub struct SubChunk {
    pos: ChunkPos,
    inner: RwLock<Inner>,
    block_version: AtomicU64,
    light: LightData,
    callback: Mutex<Option<BlockChangeCallback>>,
}

impl SubChunk {
    pub fn new(pos: ChunkPos) -> Self {
        Self {
            pos,
            inner: RwLock::new(Inner {
                palette: Palette::new(),
                blocks: vec![0; SUBCHUNK_VOLUME],
                usage: vec![SUBCHUNK_VOLUME as u32],
                non_air: 0,
                block_data: HashMap::new(),
            }),
            block_version: AtomicU64::new(1),
            light: LightData::new(),
            callback: Mutex::new(None),
        }
    }

    #[inline]
    pub fn position(&self) -> ChunkPos {
        self.pos
    }

    pub fn set_change_callback(&self, callback: Option<BlockChangeCallback>) {
        *self.callback.lock().expect("subchunk callback lock poisoned") = callback;
    }

    pub fn get(&self, local: LocalPos) -> BlockTypeId {
        self.get_index(local.index())
    }

    pub fn get_index(&self, index: usize) -> BlockTypeId {
        let inner = self.inner.read().expect("subchunk lock poisoned");
        let local = inner.blocks[index];
        inner.palette.global_id(local)
    }

    /// Set a block. Same-value writes are no-ops; real changes update the
    /// palette usage counts, bump the version and fire the change callback.
    pub fn set(&self, local: LocalPos, ty: BlockTypeId) {
        let index = local.index();
        let old = {
            let mut inner = self.inner.write().expect("subchunk lock poisoned");
            let old_local = inner.blocks[index];
            let old = inner.palette.global_id(old_local);
            if old == ty {
                return;
            }
            Self::apply_change(&mut inner, index, old_local, ty, old);
            old
        };
        self.block_version.fetch_add(1, Ordering::Release);
        let callback = self
            .callback
            .lock()
            .expect("subchunk callback lock poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(self.pos, local, old, ty);
        }
    }

    fn apply_change(
        inner: &mut Inner,
        index: usize,
        old_local: LocalIndex,
        ty: BlockTypeId,
        old: BlockTypeId,
    ) {
        let new_local = inner.palette.add(ty);
        if new_local as usize >= inner.usage.len() {
            inner.usage.resize(new_local as usize + 1, 0);
        }
        // Decrement old; a non-air entry whose usage hits zero leaves the
        // palette so its slot can be reused.
        if (old_local as usize) < inner.usage.len() && inner.usage[old_local as usize] > 0 {
            inner.usage[old_local as usize] -= 1;
            if inner.usage[old_local as usize] == 0 && old_local != 0 {
                let freed = inner.palette.global_id(old_local);
                if !freed.is_air() {
                    inner.palette.remove(freed);
                }
            }
        }
        inner.usage[new_local as usize] += 1;
        inner.blocks[index] = new_local;
        match (old.is_air(), ty.is_air()) {
            (true, false) => inner.non_air += 1,
            (false, true) => inner.non_air -= 1,
            _ => {}
        }
        // A type change invalidates the old block's sidecar data.
        inner.block_data.remove(&(index as u16));
    }

    /// Replace the whole volume with one type.
    pub fn fill(&self, ty: BlockTypeId) {
        {
            let mut inner = self.inner.write().expect("subchunk lock poisoned");
            inner.palette.clear();
            inner.block_data.clear();
            if ty.is_air() {
                inner.blocks.fill(0);
                inner.usage = vec![SUBCHUNK_VOLUME as u32];
                inner.non_air = 0;
            } else {
                let local = inner.palette.add(ty);
                inner.blocks.fill(local);
                inner.usage = vec![0; local as usize + 1];
                inner.usage[local as usize] = SUBCHUNK_VOLUME as u32;
                inner.non_air = SUBCHUNK_VOLUME as u32;
            }
        }
        self.block_version.fetch_add(1, Ordering::Release);
    }

    pub fn clear(&self) {
        self.fill(BlockTypeId::AIR);
    }

    pub fn is_empty(&self) -> bool {
        self.non_air_count() == 0
    }

    pub fn non_air_count(&self) -> u32 {
        self.inner.read().expect("subchunk lock poisoned").non_air
    }

    #[inline]
    pub fn block_version(&self) -> u64 {
        self.block_version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn light(&self) -> &LightData {
        &self.light
    }

    #[inline]
    pub fn light_version(&self) -> u64 {
        self.light.version()
    }

    /// Dense copy of all 4096 block types.
    pub fn snapshot(&self) -> BlockVolume {
        let version = self.block_version();
        let inner = self.inner.read().expect("subchunk lock poisoned");
        let types = inner
            .blocks
            .iter()
            .map(|&local| inner.palette.global_id(local))
            .collect();
        BlockVolume {
            types,
            non_air: inner.non_air,
            block_version: version,
        }
    }

    pub fn usage_counts(&self) -> Vec<u32> {
        self.inner
            .read()
            .expect("subchunk lock poisoned")
            .usage
            .clone()
    }

    pub fn needs_compaction(&self) -> bool {
        self.inner
            .read()
            .expect("subchunk lock poisoned")
            .palette
            .needs_compaction()
    }

    /// Compact the palette and rewrite all indices. Contents are unchanged,
    /// so the block version does not move.
    pub fn compact_palette(&self) -> Vec<LocalIndex> {
        let mut inner = self.inner.write().expect("subchunk lock poisoned");
        let usage = inner.usage.clone();
        let mapping = inner.palette.compact(&usage);
        for block in inner.blocks.iter_mut() {
            let new = mapping[*block as usize];
            // An invalid mapping here means usage counts disagreed with the
            // block array; fall back to air rather than corrupting.
            *block = if new == INVALID_LOCAL_INDEX {
                debug_assert!(false, "palette compaction dropped a live index");
                0
            } else {
                new
            };
        }
        let entry_count = inner.palette.entries().len();
        inner.usage = vec![0; entry_count];
        let blocks = std::mem::take(&mut inner.blocks);
        for &block in &blocks {
            inner.usage[block as usize] += 1;
        }
        inner.blocks = blocks;
        mapping
    }

    /// Compact and capture everything serialization needs in one lock hold.
    pub fn serial_snapshot(&self) -> SubchunkSerial {
        self.compact_palette();
        let inner = self.inner.read().expect("subchunk lock poisoned");
        SubchunkSerial {
            palette: inner.palette.entries().to_vec(),
            bits: inner.palette.bits_for_serialization(),
            indices: inner.blocks.clone(),
            block_data: inner
                .block_data
                .iter()
                .map(|(&k, v)| (k, v.clone()))
                .collect(),
        }
    }

    /// Rebuild the volume from a palette and raw indices (load path).
    /// Out-of-range indices fall back to air.
    pub fn load_indices(&self, palette: &[BlockTypeId], indices: &[LocalIndex]) {
        {
            let mut inner = self.inner.write().expect("subchunk lock poisoned");
            inner.palette.clear();
            inner.block_data.clear();
            let mut remap = vec![0 as LocalIndex; palette.len()];
            for (i, &ty) in palette.iter().enumerate() {
                remap[i] = if ty.is_air() { 0 } else { inner.palette.add(ty) };
            }
            let entry_count = inner.palette.entries().len();
            inner.usage = vec![0; entry_count];
            inner.non_air = 0;
            for (slot, &raw) in inner.blocks.iter_mut().zip(indices) {
                *slot = remap.get(raw as usize).copied().unwrap_or(0);
            }
            let blocks = std::mem::take(&mut inner.blocks);
            for &block in &blocks {
                inner.usage[block as usize] += 1;
                if block != 0 {
                    inner.non_air += 1;
                }
            }
            inner.blocks = blocks;
        }
        self.block_version.fetch_add(1, Ordering::Release);
    }

    /// Mutate the per-block data sidecar for one cell, creating it on
    /// demand. Empty containers are dropped on the way out.
    pub fn with_block_data<R>(
        &self,
        local: LocalPos,
        f: impl FnOnce(&mut DataContainer) -> R,
    ) -> R {
        let index = local.index() as u16;
        let mut inner = self.inner.write().expect("subchunk lock poisoned");
        let data = inner.block_data.entry(index).or_default();
        let out = f(data);
        if data.is_empty() {
            inner.block_data.remove(&index);
        }
        out
    }

    pub fn block_data(&self, local: LocalPos) -> Option<DataContainer> {
        let inner = self.inner.read().expect("subchunk lock poisoned");
        inner.block_data.get(&(local.index() as u16)).cloned()
    }

    pub fn set_block_data(&self, local: LocalPos, data: DataContainer) {
        let mut inner = self.inner.write().expect("subchunk lock poisoned");
        if data.is_empty() {
            inner.block_data.remove(&(local.index() as u16));
        } else {
            inner.block_data.insert(local.index() as u16, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_core::DataValue;

    fn ty(name: &str) -> BlockTypeId {
        BlockTypeId::from_name(name)
    }

    fn sc() -> SubChunk {
        SubChunk::new(ChunkPos::new(0, 0, 0))
    }

    #[test]
    fn same_value_set_is_noop() {
        let s = sc();
        let v0 = s.block_version();
        s.set(LocalPos::new(1, 2, 3), BlockTypeId::AIR);
        assert_eq!(s.block_version(), v0);
        s.set(LocalPos::new(1, 2, 3), ty("karst:sc_stone"));
        let v1 = s.block_version();
        assert!(v1 > v0);
        s.set(LocalPos::new(1, 2, 3), ty("karst:sc_stone"));
        assert_eq!(s.block_version(), v1);
    }

    #[test]
    fn usage_counts_sum_to_volume() {
        let s = sc();
        let stone = ty("karst:sc_stone");
        let dirt = ty("karst:sc_dirt");
        for i in 0..64 {
            s.set(LocalPos::from_index(i), stone);
        }
        for i in 0..32 {
            s.set(LocalPos::from_index(i), dirt);
        }
        let total: u32 = s.usage_counts().iter().sum();
        assert_eq!(total, SUBCHUNK_VOLUME as u32);
        assert_eq!(s.non_air_count(), 64);
    }

    // Palette churn: slot reuse on removal, dense renumbering on
    // compaction.
    #[test]
    fn palette_churn_and_compaction() {
        let s = sc();
        let stone = ty("karst:sc1_stone");
        let dirt = ty("karst:sc1_dirt");

        for i in 0..SUBCHUNK_VOLUME {
            s.set(LocalPos::from_index(i), stone);
        }
        assert_eq!(s.non_air_count(), 4096);
        assert_eq!(s.usage_counts(), vec![0, 4096]);

        for i in 0..SUBCHUNK_VOLUME / 2 {
            s.set(LocalPos::from_index(i), dirt);
        }
        assert_eq!(s.usage_counts(), vec![0, 2048, 2048]);

        for i in 0..SUBCHUNK_VOLUME / 2 {
            s.set(LocalPos::from_index(i), stone);
        }
        // Dirt's slot is freed and reclaimable.
        assert!(s.needs_compaction());

        s.compact_palette();
        let view = s.serial_snapshot();
        assert_eq!(view.palette, vec![BlockTypeId::AIR, stone]);
        assert_eq!(view.bits, 1);
    }

    #[test]
    fn change_callback_reports_old_and_new() {
        let s = Arc::new(sc());
        let seen: Arc<Mutex<Vec<(BlockTypeId, BlockTypeId)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        s.set_change_callback(Some(Arc::new(move |_chunk, _local, old, new| {
            sink.lock().unwrap().push((old, new));
        })));
        let stone = ty("karst:sc_cb_stone");
        s.set(LocalPos::new(0, 0, 0), stone);
        s.set(LocalPos::new(0, 0, 0), BlockTypeId::AIR);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (BlockTypeId::AIR, stone));
        assert_eq!(seen[1], (stone, BlockTypeId::AIR));
    }

    #[test]
    fn snapshot_reflects_types() {
        let s = sc();
        let stone = ty("karst:sc_snap_stone");
        s.set(LocalPos::new(3, 4, 5), stone);
        let snap = s.snapshot();
        assert_eq!(snap.get(3, 4, 5), stone);
        assert_eq!(snap.get(0, 0, 0), BlockTypeId::AIR);
        assert_eq!(snap.non_air, 1);
    }

    #[test]
    fn load_indices_roundtrip() {
        let s = sc();
        let stone = ty("karst:sc_load_stone");
        let dirt = ty("karst:sc_load_dirt");
        s.set(LocalPos::new(0, 0, 0), stone);
        s.set(LocalPos::new(1, 0, 0), dirt);
        let view = s.serial_snapshot();

        let restored = sc();
        restored.load_indices(&view.palette, &view.indices);
        assert_eq!(restored.get(LocalPos::new(0, 0, 0)), stone);
        assert_eq!(restored.get(LocalPos::new(1, 0, 0)), dirt);
        assert_eq!(restored.non_air_count(), 2);
    }

    #[test]
    fn block_data_dropped_on_type_change() {
        let s = sc();
        let stone = ty("karst:sc_data_stone");
        let p = LocalPos::new(2, 2, 2);
        s.set(p, stone);
        s.with_block_data(p, |dc| {
            dc.set_by_name("power", DataValue::I64(9));
        });
        assert!(s.block_data(p).is_some());
        s.set(p, BlockTypeId::AIR);
        assert!(s.block_data(p).is_none());
    }
}
