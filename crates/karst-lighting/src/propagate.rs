//! BFS light math over world columns.

use std::collections::{HashSet, VecDeque};

use karst_blocks::BlockTypeRegistry;
use karst_chunk::{ChunkColumn, MAX_LIGHT, NO_HEIGHT, SubChunk};
use karst_core::{BlockPos, ChunkPos, Face};
use karst_world::{LightingUpdate, World};
use rayon::prelude::*;
use std::sync::Arc;

fn light_cell(world: &World, pos: BlockPos) -> Option<(Arc<SubChunk>, usize)> {
    let col = world.column(pos.column())?;
    let sc = col.subchunk(pos.y >> 4)?;
    Some((sc, pos.local().index()))
}

/// Stored block light, 0 where no subchunk is allocated.
pub fn block_light_at(world: &World, pos: BlockPos) -> u8 {
    match light_cell(world, pos) {
        Some((sc, idx)) => sc.light().block(idx),
        None => 0,
    }
}

/// Stored sky light. Cells without storage default by the heightmap: open
/// sky reads 15, everything else 0.
pub fn sky_light_at(world: &World, pos: BlockPos) -> u8 {
    if let Some((sc, idx)) = light_cell(world, pos) {
        return sc.light().sky(idx);
    }
    match world.column(pos.column()) {
        Some(col) => {
            let h = col.height(pos.x & 15, pos.z & 15);
            if h == NO_HEIGHT || pos.y >= h { MAX_LIGHT } else { 0 }
        }
        None => MAX_LIGHT,
    }
}

/// Max of sky and block light, the mesh builder's light provider.
pub fn combined_light_at(world: &World, pos: BlockPos) -> u8 {
    sky_light_at(world, pos).max(block_light_at(world, pos))
}

fn set_block_light(world: &World, pos: BlockPos, level: u8, touched: &mut HashSet<ChunkPos>) -> bool {
    if let Some((sc, idx)) = light_cell(world, pos) {
        if sc.light().block(idx) != level {
            sc.light().set_block(idx, level);
            touched.insert(pos.chunk());
        }
        true
    } else {
        false
    }
}

/// Sky light for one world-space cell given the column heightmap: 15 at and
/// above the heightmap, then descending loses `max(1, attenuation)` per
/// block crossed. Sky light never travels back up.
fn sky_value(col: &ChunkColumn, reg: &BlockTypeRegistry, lx: i32, lz: i32, y: i32, h: i32) -> u8 {
    if h == NO_HEIGHT || y >= h {
        return MAX_LIGHT;
    }
    let mut light = MAX_LIGHT as i32;
    // Cross every cell strictly between the open sky and the target.
    for wy in (y + 1..h).rev() {
        let ty = col.get_block(BlockPos::new(
            (col.position().x << 4) + lx,
            wy,
            (col.position().z << 4) + lz,
        ));
        let attenuation = if ty.is_air() {
            1
        } else {
            reg.light_attenuation(ty).max(1)
        };
        light -= attenuation as i32;
        if light <= 0 {
            return 0;
        }
    }
    light as u8
}

/// Rewrite the sky nibbles of one vertical (x, z) line through every
/// allocated subchunk of the column.
fn recompute_sky_column(
    col: &ChunkColumn,
    reg: &BlockTypeRegistry,
    lx: i32,
    lz: i32,
    touched: &mut HashSet<ChunkPos>,
) {
    let h = col.height(lx, lz);
    for (chunk_y, sc) in col.subchunks() {
        let base = chunk_y << 4;
        let light = sc.light();
        let before = light.version();
        for ly in 0..16 {
            let idx = (ly as usize) * 256 + (lz as usize) * 16 + lx as usize;
            light.set_sky(idx, sky_value(col, reg, lx, lz, base + ly, h));
        }
        if light.version() != before {
            touched.insert(col.chunk_pos(chunk_y));
        }
    }
}

/// BFS spread of block light from seed cells. Entering a cell costs
/// `max(1, attenuation)` of the entered block; spread stops where the
/// arriving level no longer beats the stored one. Cap is 15.
fn propagate_block_light(
    world: &World,
    reg: &BlockTypeRegistry,
    seeds: Vec<(BlockPos, u8)>,
    touched: &mut HashSet<ChunkPos>,
) {
    let mut queue: VecDeque<(BlockPos, u8)> = VecDeque::new();
    for (pos, level) in seeds {
        let level = level.min(MAX_LIGHT);
        if level == 0 {
            continue;
        }
        if block_light_at(world, pos) <= level {
            set_block_light(world, pos, level, touched);
            queue.push_back((pos, level));
        }
    }
    while let Some((pos, level)) = queue.pop_front() {
        if level <= 1 {
            continue;
        }
        for face in Face::ALL {
            let next = pos.offset(face);
            let ty = world.get_block(next);
            let cost = if ty.is_air() {
                1
            } else {
                reg.light_attenuation(ty).max(1)
            };
            let arriving = level.saturating_sub(cost);
            if arriving == 0 {
                continue;
            }
            if block_light_at(world, next) < arriving && set_block_light(world, next, arriving, touched)
            {
                queue.push_back((next, arriving));
            }
        }
    }
}

/// Dark-wave removal: zero every cell this source lit, collecting surviving
/// boundary cells as re-propagation seeds.
fn remove_block_light(
    world: &World,
    pos: BlockPos,
    touched: &mut HashSet<ChunkPos>,
) -> Vec<(BlockPos, u8)> {
    let start = block_light_at(world, pos);
    if start == 0 {
        return Vec::new();
    }
    let mut seeds = Vec::new();
    let mut queue: VecDeque<(BlockPos, u8)> = VecDeque::new();
    set_block_light(world, pos, 0, touched);
    queue.push_back((pos, start));
    while let Some((dark, old_level)) = queue.pop_front() {
        for face in Face::ALL {
            let next = dark.offset(face);
            let level = block_light_at(world, next);
            if level == 0 {
                continue;
            }
            if level < old_level {
                // Lit by the removed source; darken and keep walking.
                set_block_light(world, next, 0, touched);
                queue.push_back((next, level));
            } else {
                // Independent source territory; re-propagate from here.
                seeds.push((next, level));
            }
        }
    }
    seeds
}

/// Apply one queued lighting update. Returns the set of subchunks whose
/// light changed, for mesh invalidation.
pub fn apply_update(world: &World, update: &LightingUpdate) -> HashSet<ChunkPos> {
    let reg = BlockTypeRegistry::global();
    let mut touched = HashSet::new();
    let pos = update.pos;

    // Sky: the heightmap was maintained at mutation time, so one vertical
    // recompute restores the invariant for this column.
    if let Some(col) = world.column(pos.column()) {
        recompute_sky_column(&col, reg, pos.x & 15, pos.z & 15, &mut touched);
    }

    // Block light: darken what the old state carried, then re-seed from the
    // new emission and from surviving neighbors.
    let mut seeds = remove_block_light(world, pos, &mut touched);
    let new_emission = reg.light_emission(update.new_type);
    if new_emission > 0 {
        seeds.push((pos, new_emission));
    }
    for face in Face::ALL {
        let next = pos.offset(face);
        let level = block_light_at(world, next);
        if level > 1 {
            seeds.push((next, level));
        }
    }
    propagate_block_light(world, reg, seeds, &mut touched);
    touched
}

/// Full lighting pass for one column: sky from the heightmap plus block
/// light from every emitter in it. Marks the column light-initialized.
pub fn initialize_column_light(world: &World, col: &ChunkColumn) -> HashSet<ChunkPos> {
    let reg = BlockTypeRegistry::global();
    let mut touched = HashSet::new();
    if col.heightmap_dirty() {
        col.recalculate_heightmap(reg);
    }
    for lz in 0..16 {
        for lx in 0..16 {
            recompute_sky_column(col, reg, lx, lz, &mut touched);
        }
    }
    let mut seeds = Vec::new();
    let base_x = col.position().x << 4;
    let base_z = col.position().z << 4;
    for (chunk_y, sc) in col.subchunks() {
        let snapshot = sc.snapshot();
        if snapshot.is_empty() {
            continue;
        }
        let base_y = chunk_y << 4;
        for (idx, &ty) in snapshot.types.iter().enumerate() {
            if ty.is_air() {
                continue;
            }
            let emission = reg.light_emission(ty);
            if emission > 0 {
                let local = karst_core::LocalPos::from_index(idx);
                seeds.push((
                    BlockPos::new(
                        base_x + local.x as i32,
                        base_y + local.y as i32,
                        base_z + local.z as i32,
                    ),
                    emission,
                ));
            }
        }
    }
    propagate_block_light(world, reg, seeds, &mut touched);
    col.mark_light_initialized();
    touched
}

/// Initial pass over every loaded column. Column sky light is independent
/// per column here, so the heavy first sweep runs in parallel; emitter
/// seeds then propagate in one sequential pass because block light crosses
/// column borders.
pub fn initialize_world_light(world: &World) {
    let reg = BlockTypeRegistry::global();
    let columns = world.columns();
    columns.par_iter().for_each(|col| {
        if col.heightmap_dirty() {
            col.recalculate_heightmap(reg);
        }
        let mut touched = HashSet::new();
        for lz in 0..16 {
            for lx in 0..16 {
                recompute_sky_column(col, reg, lx, lz, &mut touched);
            }
        }
    });
    for col in &columns {
        initialize_column_light(world, col);
    }
}
