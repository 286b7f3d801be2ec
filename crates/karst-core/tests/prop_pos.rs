use karst_core::{BlockPos, ChunkPos, ColumnPos, Face, LocalPos};
use proptest::prelude::*;

fn block_x() -> impl Strategy<Value = i32> {
    -33_000_000i32..=33_000_000
}

fn block_y() -> impl Strategy<Value = i32> {
    -2048i32..=2047
}

proptest! {
    // Pack then unpack is the identity within the representable range
    #[test]
    fn block_pos_pack_roundtrip(x in block_x(), y in block_y(), z in block_x()) {
        let p = BlockPos::new(x, y, z);
        prop_assert_eq!(BlockPos::unpack(p.pack()), p);
    }

    #[test]
    fn chunk_pos_pack_roundtrip(x in -2_000_000i32..=2_000_000, y in -128i32..=127, z in -2_000_000i32..=2_000_000) {
        let p = ChunkPos::new(x, y, z);
        prop_assert_eq!(ChunkPos::unpack(p.pack()), p);
    }

    #[test]
    fn column_pos_pack_roundtrip(x in any::<i32>(), z in any::<i32>()) {
        let p = ColumnPos::new(x, z);
        prop_assert_eq!(ColumnPos::unpack(p.pack()), p);
    }

    // Block -> chunk -> base + local reconstructs the block
    #[test]
    fn chunk_and_local_decompose(x in block_x(), y in block_y(), z in block_x()) {
        let p = BlockPos::new(x, y, z);
        let chunk = p.chunk();
        let base = chunk.base();
        let local = p.local();
        prop_assert_eq!(base.x + local.x as i32, p.x);
        prop_assert_eq!(base.y + local.y as i32, p.y);
        prop_assert_eq!(base.z + local.z as i32, p.z);
        prop_assert_eq!(chunk.column(), p.column());
    }

    // Local index encoding is a bijection on 0..4096
    #[test]
    fn local_index_bijective(i in 0usize..4096) {
        let local = LocalPos::from_index(i);
        prop_assert_eq!(local.index(), i);
        prop_assert!(local.x < 16 && local.y < 16 && local.z < 16);
    }

    // Offsetting across a face then back is the identity
    #[test]
    fn face_offset_inverts(x in block_x(), y in -2047i32..=2046, z in block_x(), f in 0usize..6) {
        let face = Face::from_index(f);
        let p = BlockPos::new(x, y, z);
        prop_assert_eq!(p.offset(face).offset(face.opposite()), p);
    }
}
