//! Naive and greedy mesh builders.

use karst_blocks::BlockTypeRegistry;
use karst_chunk::BlockVolume;
use karst_core::{BlockPos, BlockTypeId, ChunkPos, Face};

use crate::{LightProvider, MeshData, MeshVertex, TextureProvider, UvRect};

/// Snapshot bundle a build runs against.
pub struct MeshBuildInput<'a> {
    pub chunk: ChunkPos,
    pub center: &'a BlockVolume,
    /// Face-adjacent subchunk snapshots, indexed by [`Face::index`].
    /// `None` means outside the loaded area.
    pub neighbors: [Option<&'a BlockVolume>; 6],
}

/// Reads block types across the center volume and its face neighbors.
///
/// Cells outside all provided volumes (unloaded, or diagonal across a chunk
/// edge) read as air, which renders boundary faces rather than leaving
/// holes.
pub struct Sampler<'a> {
    input: &'a MeshBuildInput<'a>,
}

impl<'a> Sampler<'a> {
    pub fn new(input: &'a MeshBuildInput<'a>) -> Self {
        Self { input }
    }

    pub fn type_at(&self, x: i32, y: i32, z: i32) -> BlockTypeId {
        let out_x = !(0..16).contains(&x);
        let out_y = !(0..16).contains(&y);
        let out_z = !(0..16).contains(&z);
        match (out_x, out_y, out_z) {
            (false, false, false) => self.input.center.get(x as usize, y as usize, z as usize),
            (true, false, false) => {
                let face = if x < 0 { Face::NegX } else { Face::PosX };
                self.neighbor_cell(face, x.rem_euclid(16), y, z)
            }
            (false, true, false) => {
                let face = if y < 0 { Face::NegY } else { Face::PosY };
                self.neighbor_cell(face, x, y.rem_euclid(16), z)
            }
            (false, false, true) => {
                let face = if z < 0 { Face::NegZ } else { Face::PosZ };
                self.neighbor_cell(face, x, y, z.rem_euclid(16))
            }
            _ => BlockTypeId::AIR,
        }
    }

    fn neighbor_cell(&self, face: Face, x: i32, y: i32, z: i32) -> BlockTypeId {
        match self.input.neighbors[face.index()] {
            Some(volume) => volume.get(x as usize, y as usize, z as usize),
            None => BlockTypeId::AIR,
        }
    }

    pub fn opaque_at(&self, x: i32, y: i32, z: i32) -> bool {
        let ty = self.type_at(x, y, z);
        !ty.is_air() && BlockTypeRegistry::global().is_opaque(ty)
    }

    /// A face is visible when the cell it looks into is not opaque, which
    /// includes cells outside the loaded area.
    pub fn face_visible(&self, x: i32, y: i32, z: i32, face: Face) -> bool {
        let (dx, dy, dz) = face.normal();
        !self.opaque_at(x + dx, y + dy, z + dz)
    }
}

// Tangent axes per face, ordered so cross(u, v) points along the normal.
fn face_axes(face: Face) -> ([i32; 3], [i32; 3]) {
    match face {
        Face::PosX => ([0, 1, 0], [0, 0, 1]),
        Face::NegX => ([0, 0, 1], [0, 1, 0]),
        Face::PosY => ([0, 0, 1], [1, 0, 0]),
        Face::NegY => ([1, 0, 0], [0, 0, 1]),
        Face::PosZ => ([1, 0, 0], [0, 1, 0]),
        Face::NegZ => ([0, 1, 0], [1, 0, 0]),
    }
}

fn add3(a: [i32; 3], b: [i32; 3]) -> [i32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn neg3(a: [i32; 3]) -> [i32; 3] {
    [-a[0], -a[1], -a[2]]
}

/// Standard voxel corner AO: `3 - (side + side + corner)`, with the fully
/// pinched corner forced to 0.
fn corner_ao(sampler: &Sampler, outside: [i32; 3], du: [i32; 3], dv: [i32; 3]) -> u8 {
    let s1 = sampler.opaque_at(
        outside[0] + du[0],
        outside[1] + du[1],
        outside[2] + du[2],
    );
    let s2 = sampler.opaque_at(
        outside[0] + dv[0],
        outside[1] + dv[1],
        outside[2] + dv[2],
    );
    let c = sampler.opaque_at(
        outside[0] + du[0] + dv[0],
        outside[1] + du[1] + dv[1],
        outside[2] + du[2] + dv[2],
    );
    if s1 && s2 {
        0
    } else {
        3 - (s1 as u8 + s2 as u8 + c as u8)
    }
}

fn light_world(input: &MeshBuildInput, light: LightProvider, cell: [i32; 3]) -> u8 {
    let base = input.chunk.base();
    light(BlockPos::new(
        base.x + cell[0],
        base.y + cell[1],
        base.z + cell[2],
    ))
}

/// Average four packed light samples nibble-wise (smooth lighting).
fn average_light(samples: [u8; 4]) -> u8 {
    let sky: u32 = samples.iter().map(|&s| (s >> 4) as u32).sum();
    let block: u32 = samples.iter().map(|&s| (s & 0x0F) as u32).sum();
    ((((sky + 2) / 4) as u8) << 4) | ((block + 2) / 4) as u8
}

struct QuadSpec {
    face: Face,
    // Cell coordinates of the quad's (0, 0) cell.
    cell: [i32; 3],
    width: i32,
    height: i32,
    // Per-corner AO in (a, b) order (0,0), (1,0), (1,1), (0,1).
    ao: [u8; 4],
    // Per-corner packed light, same order.
    light: [u8; 4],
}

fn emit_quad(mesh: &mut MeshData, spec: &QuadSpec, uv: UvRect) {
    let (u, v) = face_axes(spec.face);
    let (nx, ny, nz) = spec.face.normal();
    let positive = nx + ny + nz > 0;
    let mut base = [
        spec.cell[0] as f32,
        spec.cell[1] as f32,
        spec.cell[2] as f32,
    ];
    // Positive faces sit on the far plane of their cell.
    if positive {
        base[0] += nx as f32;
        base[1] += ny as f32;
        base[2] += nz as f32;
    }
    let normal = [nx as i8, ny as i8, nz as i8];
    let corner = |a: i32, b: i32| -> [f32; 3] {
        [
            base[0] + (u[0] * a * spec.width + v[0] * b * spec.height) as f32,
            base[1] + (u[1] * a * spec.width + v[1] * b * spec.height) as f32,
            base[2] + (u[2] * a * spec.width + v[2] * b * spec.height) as f32,
        ]
    };
    let span_u = (uv.u1 - uv.u0) * spec.width as f32;
    let span_v = (uv.v1 - uv.v0) * spec.height as f32;
    let uv_at = |a: i32, b: i32| -> [f32; 2] {
        [uv.u0 + span_u * a as f32, uv.v0 + span_v * b as f32]
    };
    let order = [(0, 0), (1, 0), (1, 1), (0, 1)];
    let mut corners = [MeshVertex {
        position: [0.0; 3],
        normal,
        uv: [0.0; 2],
        light: 0,
        ao: 0,
    }; 4];
    for (slot, &(a, b)) in order.iter().enumerate() {
        corners[slot] = MeshVertex {
            position: corner(a, b),
            normal,
            uv: uv_at(a, b),
            light: spec.light[slot],
            ao: spec.ao[slot],
        };
    }
    mesh.push_quad(corners);
}

fn corner_deltas(u: [i32; 3], v: [i32; 3]) -> [([i32; 3], [i32; 3]); 4] {
    [
        (neg3(u), neg3(v)),
        (u, neg3(v)),
        (u, v),
        (neg3(u), v),
    ]
}

/// One quad per visible face with smooth per-vertex lighting.
pub fn build_naive(
    input: &MeshBuildInput,
    light: LightProvider,
    textures: TextureProvider,
) -> MeshData {
    let sampler = Sampler::new(input);
    let mut mesh = MeshData::new_empty();
    if input.center.is_empty() {
        return mesh.finish();
    }
    for y in 0..16 {
        for z in 0..16 {
            for x in 0..16 {
                let ty = input.center.get(x as usize, y as usize, z as usize);
                if ty.is_air() {
                    continue;
                }
                for face in Face::ALL {
                    if !sampler.face_visible(x, y, z, face) {
                        continue;
                    }
                    let (nx, ny, nz) = face.normal();
                    let outside = [x + nx, y + ny, z + nz];
                    let (u, v) = face_axes(face);
                    let deltas = corner_deltas(u, v);
                    let mut ao = [0u8; 4];
                    let mut lights = [0u8; 4];
                    for (slot, &(du, dv)) in deltas.iter().enumerate() {
                        ao[slot] = corner_ao(&sampler, outside, du, dv);
                        lights[slot] = average_light([
                            light_world(input, light, outside),
                            light_world(input, light, add3(outside, du)),
                            light_world(input, light, add3(outside, dv)),
                            light_world(input, light, add3(outside, add3(du, dv))),
                        ]);
                    }
                    emit_quad(
                        &mut mesh,
                        &QuadSpec {
                            face,
                            cell: [x, y, z],
                            width: 1,
                            height: 1,
                            ao,
                            light: lights,
                        },
                        textures(ty, face),
                    );
                }
            }
        }
    }
    mesh.finish()
}

#[derive(Copy, Clone, PartialEq)]
struct MaskCell {
    ty: BlockTypeId,
    light: u8,
    ao: [u8; 4],
}

/// Greedy mesher: per-axis sweep that merges coplanar quads sharing block
/// type, light value and ambient-occlusion class into larger rectangles.
pub fn build_greedy(
    input: &MeshBuildInput,
    light: LightProvider,
    textures: TextureProvider,
) -> MeshData {
    let sampler = Sampler::new(input);
    let mut mesh = MeshData::new_empty();
    if input.center.is_empty() {
        return mesh.finish();
    }
    for face in Face::ALL {
        let (u, v) = face_axes(face);
        let (nx, ny, nz) = face.normal();
        let normal = [nx, ny, nz];
        // The axis the layers stack along.
        let n_axis = normal
            .iter()
            .position(|&c| c != 0)
            .expect("face normal has an axis");
        for layer in 0..16 {
            // Build the visibility mask for this layer.
            let mut mask: [[Option<MaskCell>; 16]; 16] = [[None; 16]; 16];
            for j in 0..16i32 {
                for i in 0..16i32 {
                    let mut cell = [0i32; 3];
                    cell[n_axis] = layer;
                    for axis in 0..3 {
                        cell[axis] += u[axis] * i + v[axis] * j;
                    }
                    let ty = input
                        .center
                        .get(cell[0] as usize, cell[1] as usize, cell[2] as usize);
                    if ty.is_air() || !sampler.face_visible(cell[0], cell[1], cell[2], face) {
                        continue;
                    }
                    let outside = add3(cell, normal);
                    let deltas = corner_deltas(u, v);
                    let mut ao = [0u8; 4];
                    for (slot, &(du, dv)) in deltas.iter().enumerate() {
                        ao[slot] = corner_ao(&sampler, outside, du, dv);
                    }
                    mask[i as usize][j as usize] = Some(MaskCell {
                        ty,
                        light: light_world(input, light, outside),
                        ao,
                    });
                }
            }
            // Sweep the mask into maximal rectangles.
            let mut used = [[false; 16]; 16];
            for j in 0..16usize {
                for i in 0..16usize {
                    let Some(cell) = mask[i][j] else {
                        continue;
                    };
                    if used[i][j] {
                        continue;
                    }
                    let mut width = 1;
                    while i + width < 16
                        && !used[i + width][j]
                        && mask[i + width][j] == Some(cell)
                    {
                        width += 1;
                    }
                    let mut height = 1;
                    'grow: while j + height < 16 {
                        for di in 0..width {
                            if used[i + di][j + height] || mask[i + di][j + height] != Some(cell) {
                                break 'grow;
                            }
                        }
                        height += 1;
                    }
                    for dj in 0..height {
                        for di in 0..width {
                            used[i + di][j + dj] = true;
                        }
                    }
                    let mut origin = [0i32; 3];
                    origin[n_axis] = layer;
                    for axis in 0..3 {
                        origin[axis] += u[axis] * i as i32 + v[axis] * j as i32;
                    }
                    emit_quad(
                        &mut mesh,
                        &QuadSpec {
                            face,
                            cell: origin,
                            width: width as i32,
                            height: height as i32,
                            ao: cell.ao,
                            light: [cell.light; 4],
                        },
                        textures(cell.ty, face),
                    );
                }
            }
        }
    }
    mesh.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_blocks::BlockDef;
    use karst_chunk::{ChunkColumn, SubChunk};
    use karst_core::{ColumnPos, LocalPos};

    fn stone() -> BlockTypeId {
        BlockTypeRegistry::global().register(&BlockDef {
            name: "karst:mesh_stone".to_string(),
            solid: Some(true),
            opaque: None,
            blocks_skylight: None,
            light_attenuation: None,
            light_emission: None,
            random_ticks: None,
            tags: Vec::new(),
        })
    }

    fn full_light(_: BlockPos) -> u8 {
        0xF0
    }

    fn uvs(_: BlockTypeId, _: Face) -> UvRect {
        UvRect::FULL
    }

    fn volume_with(cells: &[(u8, u8, u8)]) -> BlockVolume {
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        let ty = stone();
        for &(x, y, z) in cells {
            sc.set(LocalPos::new(x, y, z), ty);
        }
        sc.snapshot()
    }

    fn input<'a>(center: &'a BlockVolume) -> MeshBuildInput<'a> {
        MeshBuildInput {
            chunk: ChunkPos::new(0, 0, 0),
            center,
            neighbors: [None; 6],
        }
    }

    #[test]
    fn single_block_has_six_quads() {
        let volume = volume_with(&[(8, 8, 8)]);
        let built = build_naive(&input(&volume), &full_light, &uvs);
        assert_eq!(built.vertex_count(), 24);
        assert_eq!(built.triangle_count(), 12);
        // Open-sky AO everywhere.
        assert!(built.vertices.iter().all(|v| v.ao == 3));
        assert!(built.vertices.iter().all(|v| v.light == 0xF0));
        assert_eq!(built.bounds_min, [8.0, 8.0, 8.0]);
        assert_eq!(built.bounds_max, [9.0, 9.0, 9.0]);
    }

    #[test]
    fn buried_faces_are_culled() {
        // 2x1x1 pair: the touching faces are hidden.
        let volume = volume_with(&[(4, 4, 4), (5, 4, 4)]);
        let built = build_naive(&input(&volume), &full_light, &uvs);
        assert_eq!(built.triangle_count(), 20);
    }

    #[test]
    fn greedy_merges_flat_slab() {
        // A full 16x16 one-block-thick floor.
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        let ty = stone();
        for z in 0..16 {
            for x in 0..16 {
                sc.set(LocalPos::new(x, 0, z), ty);
            }
        }
        let volume = sc.snapshot();
        let built = build_greedy(&input(&volume), &full_light, &uvs);
        let naive = build_naive(&input(&volume), &full_light, &uvs);
        // Top and bottom each collapse to one quad; each side to one quad.
        assert_eq!(built.triangle_count(), 12);
        assert!(naive.triangle_count() > built.triangle_count());
    }

    #[test]
    fn greedy_splits_on_ao_change() {
        // A floor with one block standing on it pinches neighbor AO, so the
        // top face cannot merge into a single quad.
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        let ty = stone();
        for z in 0..16 {
            for x in 0..16 {
                sc.set(LocalPos::new(x, 0, z), ty);
            }
        }
        sc.set(LocalPos::new(8, 1, 8), ty);
        let volume = sc.snapshot();
        let built = build_greedy(&input(&volume), &full_light, &uvs);
        assert!(built.triangle_count() > 12);
    }

    #[test]
    fn neighbor_volume_occludes_boundary_face() {
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        let ty = stone();
        sc.set(LocalPos::new(15, 8, 8), ty);
        let volume = sc.snapshot();

        // Neighbor chunk with a block right across the border.
        let neighbor_sc = SubChunk::new(ChunkPos::new(1, 0, 0));
        neighbor_sc.set(LocalPos::new(0, 8, 8), ty);
        let neighbor = neighbor_sc.snapshot();

        let mut with_neighbor = input(&volume);
        with_neighbor.neighbors[Face::PosX.index()] = Some(&neighbor);
        let occluded = build_naive(&with_neighbor, &full_light, &uvs);
        let open = build_naive(&input(&volume), &full_light, &uvs);
        assert_eq!(open.triangle_count(), 12);
        assert_eq!(occluded.triangle_count(), 10);
    }

    #[test]
    fn corner_ao_darkens() {
        // A block with another diagonally above one top corner.
        let volume = volume_with(&[(8, 8, 8), (9, 9, 9)]);
        let built = build_naive(&input(&volume), &full_light, &uvs);
        let min_ao = built
            .vertices
            .iter()
            .filter(|v| v.normal == [0, 1, 0])
            .map(|v| v.ao)
            .min()
            .unwrap();
        assert_eq!(min_ao, 2);
    }

    #[test]
    fn column_snapshot_smoke() {
        // End-to-end: column -> snapshot -> mesh.
        let col = ChunkColumn::new(ColumnPos::new(0, 0));
        let ty = stone();
        col.set_block(BlockPos::new(1, 1, 1), ty);
        let sc = col.subchunk(0).unwrap();
        let volume = sc.snapshot();
        let built = build_greedy(&input(&volume), &full_light, &uvs);
        assert_eq!(built.triangle_count(), 12);
    }
}
