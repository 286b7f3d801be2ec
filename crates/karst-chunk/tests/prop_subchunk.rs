use karst_chunk::{Palette, SubChunk, ceil_log2};
use karst_core::{BlockTypeId, ChunkPos, LocalPos, SUBCHUNK_VOLUME};
use proptest::prelude::*;

fn type_pool() -> Vec<BlockTypeId> {
    (0..6)
        .map(|i| BlockTypeId::from_name(&format!("karst:prop_type_{i}")))
        .collect()
}

proptest! {
    // Usage counts always sum to the volume, whatever the edit sequence
    #[test]
    fn usage_counts_conserved(ops in prop::collection::vec((0usize..4096, 0usize..7), 1..200)) {
        let pool = type_pool();
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        for (index, ty) in ops {
            let ty = if ty == 0 { BlockTypeId::AIR } else { pool[ty - 1] };
            sc.set(LocalPos::from_index(index), ty);
            let total: u64 = sc.usage_counts().iter().map(|&c| c as u64).sum();
            prop_assert_eq!(total, SUBCHUNK_VOLUME as u64);
        }
    }

    // Palette local/global lookups stay mutually inverse across churn
    #[test]
    fn palette_lookup_roundtrip(ops in prop::collection::vec((0usize..6, any::<bool>()), 1..100)) {
        let pool = type_pool();
        let mut palette = Palette::new();
        for (which, add) in ops {
            let ty = pool[which];
            if add {
                palette.add(ty);
            } else {
                palette.remove(ty);
            }
            for &t in &pool {
                if let Some(local) = palette.local_index(t) {
                    prop_assert_eq!(palette.global_id(local), t);
                }
            }
            prop_assert_eq!(palette.global_id(0), BlockTypeId::AIR);
        }
    }

    // Block versions strictly increase across real changes
    #[test]
    fn block_version_monotonic(indices in prop::collection::vec(0usize..4096, 1..100)) {
        let pool = type_pool();
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        let mut last = sc.block_version();
        for (step, index) in indices.into_iter().enumerate() {
            let ty = pool[step % pool.len()];
            let before = sc.get_index(index);
            sc.set(LocalPos::from_index(index), ty);
            let version = sc.block_version();
            if before != ty {
                prop_assert!(version > last);
            } else {
                prop_assert_eq!(version, last);
            }
            last = version;
        }
    }

    // Serialization bit width covers every stored index
    #[test]
    fn serial_bits_cover_indices(fills in prop::collection::vec((0usize..4096, 0usize..6), 1..150)) {
        let pool = type_pool();
        let sc = SubChunk::new(ChunkPos::new(0, 0, 0));
        for (index, ty) in fills {
            sc.set(LocalPos::from_index(index), pool[ty]);
        }
        let view = sc.serial_snapshot();
        let max = view.indices.iter().copied().max().unwrap_or(0) as u32;
        prop_assert!(ceil_log2(max + 1) <= view.bits);
        prop_assert_eq!(view.bits, ceil_log2(view.palette.len() as u32));
    }
}
