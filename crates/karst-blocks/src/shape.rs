//! Collision shapes and the provider seam physics/raycast consume.

use karst_core::BlockPos;

/// Axis-aligned box in block-local space, components 0.0-1.0.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ShapeBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl ShapeBox {
    pub const FULL: ShapeBox = ShapeBox {
        min: [0.0, 0.0, 0.0],
        max: [1.0, 1.0, 1.0],
    };

    pub fn contains(&self, point: [f32; 3]) -> bool {
        (0..3).all(|axis| point[axis] >= self.min[axis] && point[axis] <= self.max[axis])
    }
}

/// Collision volume of a block: zero or more boxes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollisionShape {
    pub boxes: Vec<ShapeBox>,
}

impl CollisionShape {
    pub fn full_cube() -> Self {
        Self {
            boxes: vec![ShapeBox::FULL],
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// What a shape query is for: movement clipping or interaction targeting.
/// Some blocks (fluids, tall grass) collide for one but not the other.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RaycastMode {
    Collision,
    Interaction,
}

/// Caller-supplied shape lookup; `None` means no shape (air, unloaded).
pub type BlockShapeProvider<'a> =
    &'a (dyn Fn(BlockPos, RaycastMode) -> Option<CollisionShape> + Sync);
