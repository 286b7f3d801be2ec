//! The 24 cube rotations, as integer 3x3 matrices.

use std::sync::OnceLock;

use crate::pos::{BlockPos, Face};

/// One of the 24 orientations of a cube.
///
/// Entries are -1, 0 or 1; rows are output axes, columns input axes.
/// Index 0 is always the identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Rotation {
    m: [[i8; 3]; 3],
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::IDENTITY
    }
}

impl Rotation {
    pub const IDENTITY: Rotation = Rotation {
        m: [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
    };
    pub const ROTATE_X_90: Rotation = Rotation {
        m: [[1, 0, 0], [0, 0, -1], [0, 1, 0]],
    };
    pub const ROTATE_Y_90: Rotation = Rotation {
        m: [[0, 0, 1], [0, 1, 0], [-1, 0, 0]],
    };
    pub const ROTATE_Z_90: Rotation = Rotation {
        m: [[0, -1, 0], [1, 0, 0], [0, 0, 1]],
    };

    pub const COUNT: usize = 24;

    /// All 24 rotations; the identity is element 0.
    pub fn all() -> &'static [Rotation; 24] {
        static ALL: OnceLock<[Rotation; 24]> = OnceLock::new();
        ALL.get_or_init(|| {
            // Close {identity} under the three quarter-turn generators.
            let mut out: Vec<Rotation> = vec![Rotation::IDENTITY];
            let mut i = 0;
            while i < out.len() {
                let r = out[i];
                for turn in [
                    Rotation::ROTATE_X_90,
                    Rotation::ROTATE_Y_90,
                    Rotation::ROTATE_Z_90,
                ] {
                    let next = turn.compose(r);
                    if !out.contains(&next) {
                        out.push(next);
                    }
                }
                i += 1;
            }
            debug_assert_eq!(out.len(), 24);
            let mut arr = [Rotation::IDENTITY; 24];
            arr[..out.len().min(24)].copy_from_slice(&out[..out.len().min(24)]);
            arr
        })
    }

    pub fn by_index(index: u8) -> Rotation {
        Self::all()[(index as usize) % Self::COUNT]
    }

    /// Canonical index of this rotation (0-23). Identity is 0.
    pub fn index(self) -> u8 {
        Self::all()
            .iter()
            .position(|r| *r == self)
            .unwrap_or(0) as u8
    }

    #[inline]
    pub fn matrix(self) -> [[i8; 3]; 3] {
        self.m
    }

    #[inline]
    pub fn is_identity(self) -> bool {
        self == Rotation::IDENTITY
    }

    /// Rotate coordinates relative to the origin.
    #[inline]
    pub fn apply(self, x: i32, y: i32, z: i32) -> (i32, i32, i32) {
        let m = &self.m;
        (
            m[0][0] as i32 * x + m[0][1] as i32 * y + m[0][2] as i32 * z,
            m[1][0] as i32 * x + m[1][1] as i32 * y + m[1][2] as i32 * z,
            m[2][0] as i32 * x + m[2][1] as i32 * y + m[2][2] as i32 * z,
        )
    }

    #[inline]
    pub fn apply_pos(self, pos: BlockPos) -> BlockPos {
        let (x, y, z) = self.apply(pos.x, pos.y, pos.z);
        BlockPos::new(x, y, z)
    }

    /// Rotate a face by rotating its normal.
    pub fn apply_face(self, face: Face) -> Face {
        let (nx, ny, nz) = face.normal();
        let (rx, ry, rz) = self.apply(nx, ny, nz);
        Face::from_normal(rx, ry, rz).unwrap_or(face)
    }

    /// Matrix product `self * other` (apply `other` first).
    pub fn compose(self, other: Rotation) -> Rotation {
        let a = &self.m;
        let b = &other.m;
        let mut m = [[0i8; 3]; 3];
        for (row, m_row) in m.iter_mut().enumerate() {
            for (col, cell) in m_row.iter_mut().enumerate() {
                *cell = a[row][0] * b[0][col] + a[row][1] * b[1][col] + a[row][2] * b[2][col];
            }
        }
        Rotation { m }
    }

    /// Inverse rotation. Rotation matrices are orthogonal, so this is the
    /// transpose.
    pub fn inverse(self) -> Rotation {
        let a = &self.m;
        let mut m = [[0i8; 3]; 3];
        for (row, m_row) in m.iter_mut().enumerate() {
            for (col, cell) in m_row.iter_mut().enumerate() {
                *cell = a[col][row];
            }
        }
        Rotation { m }
    }
}

/// Quarter-turn rotation around a single axis, for horizontal orientation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum AxisRotation {
    #[default]
    None = 0,
    Cw90 = 1,
    Cw180 = 2,
    Ccw90 = 3,
}

impl AxisRotation {
    pub fn from_quarter_turns(turns: i32) -> AxisRotation {
        match turns.rem_euclid(4) {
            1 => AxisRotation::Cw90,
            2 => AxisRotation::Cw180,
            3 => AxisRotation::Ccw90,
            _ => AxisRotation::None,
        }
    }

    pub fn compose(self, other: AxisRotation) -> AxisRotation {
        AxisRotation::from_quarter_turns(self as i32 + other as i32)
    }

    pub fn inverse(self) -> AxisRotation {
        AxisRotation::from_quarter_turns(4 - self as i32)
    }

    /// Rotate horizontal coordinates around the Y axis.
    #[inline]
    pub fn apply_xz(self, x: i32, z: i32) -> (i32, i32) {
        match self {
            AxisRotation::None => (x, z),
            AxisRotation::Cw90 => (-z, x),
            AxisRotation::Cw180 => (-x, -z),
            AxisRotation::Ccw90 => (z, -x),
        }
    }

    /// Rotate a face around the Y axis. Vertical faces are unchanged.
    pub fn apply_face(self, face: Face) -> Face {
        if matches!(face, Face::PosY | Face::NegY) {
            return face;
        }
        let (nx, _, nz) = face.normal();
        let (rx, rz) = self.apply_xz(nx, nz);
        Face::from_normal(rx, 0, rz).unwrap_or(face)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_index_zero() {
        assert_eq!(Rotation::IDENTITY.index(), 0);
        assert_eq!(Rotation::by_index(0), Rotation::IDENTITY);
    }

    #[test]
    fn all_rotations_distinct() {
        let all = Rotation::all();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn inverse_composes_to_identity() {
        for r in Rotation::all() {
            assert_eq!(r.compose(r.inverse()), Rotation::IDENTITY);
            assert_eq!(r.inverse().compose(*r), Rotation::IDENTITY);
        }
    }

    #[test]
    fn face_application_is_permutation() {
        for r in Rotation::all() {
            let mut seen = [false; 6];
            for f in Face::ALL {
                let out = r.apply_face(f);
                assert!(!seen[out.index()]);
                seen[out.index()] = true;
            }
        }
    }

    #[test]
    fn axis_rotation_cycles() {
        let f = Face::NegX;
        let r = AxisRotation::Cw90;
        let once = r.apply_face(f);
        let back = r.compose(r).compose(r).compose(r).apply_face(f);
        assert_ne!(once, f);
        assert_eq!(back, f);
        assert_eq!(r.apply_face(Face::PosY), Face::PosY);
    }
}
