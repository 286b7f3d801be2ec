use karst_core::{BlockPos, Face, Rotation};
use proptest::prelude::*;

fn coord() -> impl Strategy<Value = i32> {
    -1000i32..=1000
}

proptest! {
    // Rotations preserve squared length (they are orthogonal)
    #[test]
    fn rotation_preserves_length(idx in 0u8..24, x in coord(), y in coord(), z in coord()) {
        let r = Rotation::by_index(idx);
        let (rx, ry, rz) = r.apply(x, y, z);
        let before = (x as i64).pow(2) + (y as i64).pow(2) + (z as i64).pow(2);
        let after = (rx as i64).pow(2) + (ry as i64).pow(2) + (rz as i64).pow(2);
        prop_assert_eq!(before, after);
    }

    // Inverse undoes the rotation on positions
    #[test]
    fn inverse_undoes_apply(idx in 0u8..24, x in coord(), y in coord(), z in coord()) {
        let r = Rotation::by_index(idx);
        let p = BlockPos::new(x, y, z);
        prop_assert_eq!(r.inverse().apply_pos(r.apply_pos(p)), p);
    }

    // Composition agrees with sequential application
    #[test]
    fn compose_matches_sequential(a in 0u8..24, b in 0u8..24, x in coord(), y in coord(), z in coord()) {
        let ra = Rotation::by_index(a);
        let rb = Rotation::by_index(b);
        let p = BlockPos::new(x, y, z);
        prop_assert_eq!(ra.compose(rb).apply_pos(p), ra.apply_pos(rb.apply_pos(p)));
    }

    // by_index . index is the identity over the whole group
    #[test]
    fn index_roundtrip(idx in 0u8..24) {
        let r = Rotation::by_index(idx);
        prop_assert_eq!(Rotation::by_index(r.index()), r);
    }

    // Face application commutes with normal rotation
    #[test]
    fn face_rotation_matches_normal(idx in 0u8..24, f in 0usize..6) {
        let r = Rotation::by_index(idx);
        let face = Face::from_index(f);
        let (nx, ny, nz) = face.normal();
        let (rx, ry, rz) = r.apply(nx, ny, nz);
        prop_assert_eq!(r.apply_face(face).normal(), (rx, ry, rz));
    }
}
