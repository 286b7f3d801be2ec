//! Level-of-detail selection and volume downsampling.

use std::collections::HashMap;

use karst_chunk::BlockVolume;
use karst_core::BlockTypeId;

/// How LOD cell groups collapse.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LodMergeMode {
    /// N x N x N groups.
    #[default]
    FullHeight,
    /// N x 1 x N groups: horizontal merge only, vertical detail kept, which
    /// avoids stair-step seams against finer neighbors.
    HeightLimited,
    /// No merging; LOD levels above 0 reuse full-detail geometry.
    NoMerge,
}

/// A renderer's LOD ask: the preferred level plus how far off is still
/// acceptable before a rebuild is forced (hysteresis).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LodRequest {
    pub level: u8,
    pub flexibility: u8,
}

impl LodRequest {
    pub fn exact(level: u8) -> Self {
        Self {
            level,
            flexibility: 0,
        }
    }

    pub fn accepts(&self, uploaded: u8) -> bool {
        (uploaded as i32 - self.level as i32).unsigned_abs() <= self.flexibility as u32
    }
}

/// Distance bands mapping chunk distance to LOD level.
#[derive(Clone, Debug, Default)]
pub struct LodConfig {
    // (max distance in chunks, level), sorted by distance ascending.
    bands: Vec<(i32, u8)>,
}

impl LodConfig {
    pub fn new(mut bands: Vec<(i32, u8)>) -> Self {
        bands.sort_by_key(|&(distance, _)| distance);
        Self { bands }
    }

    /// Level for a chunk `distance` away; past the last band the coarsest
    /// level applies.
    pub fn select(&self, distance: i32) -> u8 {
        for &(max_distance, level) in &self.bands {
            if distance <= max_distance {
                return level;
            }
        }
        self.bands.last().map(|&(_, level)| level).unwrap_or(0)
    }
}

/// Collapse a volume for an LOD level.
///
/// Each group becomes the most common non-air type in it (air only when the
/// whole group is air), written across the whole group so the greedy mesher
/// fuses it into large quads. Level 0 and `NoMerge` return the volume
/// unchanged.
pub fn downsample_volume(volume: &BlockVolume, level: u8, mode: LodMergeMode) -> BlockVolume {
    if level == 0 || mode == LodMergeMode::NoMerge {
        return volume.clone();
    }
    let n = (1usize << level.min(4)).min(16);
    let mut out = volume.clone();
    let group_y = match mode {
        LodMergeMode::FullHeight => n,
        LodMergeMode::HeightLimited => 1,
        LodMergeMode::NoMerge => unreachable!(),
    };
    let mut counts: HashMap<BlockTypeId, usize> = HashMap::new();
    let mut non_air: u32 = 0;
    for gy in (0..16).step_by(group_y) {
        for gz in (0..16).step_by(n) {
            for gx in (0..16).step_by(n) {
                counts.clear();
                for y in gy..gy + group_y {
                    for z in gz..gz + n {
                        for x in gx..gx + n {
                            let ty = volume.get(x, y, z);
                            if !ty.is_air() {
                                *counts.entry(ty).or_insert(0) += 1;
                            }
                        }
                    }
                }
                let winner = counts
                    .iter()
                    .max_by_key(|&(ty, &count)| (count, ty.raw()))
                    .map(|(&ty, _)| ty)
                    .unwrap_or(BlockTypeId::AIR);
                for y in gy..gy + group_y {
                    for z in gz..gz + n {
                        for x in gx..gx + n {
                            out.types[y * 256 + z * 16 + x] = winner;
                            if !winner.is_air() {
                                non_air += 1;
                            }
                        }
                    }
                }
            }
        }
    }
    out.non_air = non_air;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_chunk::SubChunk;
    use karst_core::{ChunkPos, LocalPos};

    fn ty(name: &str) -> BlockTypeId {
        BlockTypeId::from_name(name)
    }

    #[test]
    fn request_flexibility() {
        let exact = LodRequest::exact(2);
        assert!(exact.accepts(2));
        assert!(!exact.accepts(1));
        let flexible = LodRequest {
            level: 2,
            flexibility: 1,
        };
        assert!(flexible.accepts(1));
        assert!(flexible.accepts(3));
        assert!(!flexible.accepts(0));
    }

    #[test]
    fn config_bands_select() {
        let config = LodConfig::new(vec![(16, 1), (4, 0), (32, 2)]);
        assert_eq!(config.select(2), 0);
        assert_eq!(config.select(10), 1);
        assert_eq!(config.select(20), 2);
        // Beyond all bands the coarsest applies.
        assert_eq!(config.select(100), 2);
    }

    #[test]
    fn downsample_majority_wins() {
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        let stone = ty("karst:lod_stone");
        let dirt = ty("karst:lod_dirt");
        // 2x2x2 group at origin: 3 stone, 1 dirt, 4 air.
        sc.set(LocalPos::new(0, 0, 0), stone);
        sc.set(LocalPos::new(1, 0, 0), stone);
        sc.set(LocalPos::new(0, 1, 0), stone);
        sc.set(LocalPos::new(1, 1, 0), dirt);
        let volume = sc.snapshot();
        let lod = downsample_volume(&volume, 1, LodMergeMode::FullHeight);
        for (x, y, z) in [(0, 0, 0), (1, 1, 1), (0, 1, 0)] {
            assert_eq!(lod.get(x, y, z), stone);
        }
        // Empty groups stay air.
        assert_eq!(lod.get(8, 8, 8), BlockTypeId::AIR);
        assert_eq!(lod.non_air, 8);
    }

    #[test]
    fn height_limited_keeps_vertical_detail() {
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        let stone = ty("karst:lod_hl_stone");
        sc.set(LocalPos::new(0, 5, 0), stone);
        let volume = sc.snapshot();
        let lod = downsample_volume(&volume, 1, LodMergeMode::HeightLimited);
        // The group spreads horizontally at y=5 but not vertically.
        assert_eq!(lod.get(1, 5, 1), stone);
        assert_eq!(lod.get(0, 4, 0), BlockTypeId::AIR);
        assert_eq!(lod.get(0, 6, 0), BlockTypeId::AIR);
    }

    #[test]
    fn level_zero_is_identity() {
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        sc.set(LocalPos::new(3, 3, 3), ty("karst:lod_id_stone"));
        let volume = sc.snapshot();
        let same = downsample_volume(&volume, 0, LodMergeMode::FullHeight);
        assert_eq!(same.types, volume.types);
    }
}
