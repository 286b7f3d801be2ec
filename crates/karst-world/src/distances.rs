//! Concentric distance zones around a viewpoint.

use karst_core::{ChunkPos, ColumnPos};

/// Which zone a chunk falls in relative to a viewpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Zone {
    /// Ticks, entity updates, force-load neighbors.
    Simulation,
    /// Meshes allocated.
    Render,
    /// Columns kept resident or prefetched.
    Load,
    Out,
}

/// Radii in chunks for the three concentric zones.
///
/// Invariant: `simulation <= render <= load`, with `load` at least
/// `render + margin` so prefetch stays ahead of the camera.
#[derive(Copy, Clone, Debug)]
pub struct DistanceZones {
    pub simulation: i32,
    pub render: i32,
    pub load: i32,
}

impl DistanceZones {
    pub fn new(simulation: i32, render: i32, load_margin: i32) -> Self {
        let simulation = simulation.max(0);
        let render = render.max(simulation);
        Self {
            simulation,
            render,
            load: render + load_margin.max(0),
        }
    }

    pub fn zone(&self, center: ColumnPos, target: ColumnPos) -> Zone {
        let d = center.chebyshev(target);
        if d <= self.simulation {
            Zone::Simulation
        } else if d <= self.render {
            Zone::Render
        } else if d <= self.load {
            Zone::Load
        } else {
            Zone::Out
        }
    }

    pub fn should_simulate(&self, center: ColumnPos, target: ColumnPos) -> bool {
        center.chebyshev(target) <= self.simulation
    }

    pub fn should_render(&self, center: ChunkPos, target: ChunkPos) -> bool {
        center.chebyshev_xz(target) <= self.render
    }

    pub fn should_load(&self, center: ColumnPos, target: ColumnPos) -> bool {
        center.chebyshev(target) <= self.load
    }

    /// Columns inside the load radius, row-major.
    pub fn columns_to_load(&self, center: ColumnPos) -> Vec<ColumnPos> {
        let mut out = Vec::new();
        for dz in -self.load..=self.load {
            for dx in -self.load..=self.load {
                out.push(ColumnPos::new(center.x + dx, center.z + dz));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_are_nested() {
        let zones = DistanceZones::new(2, 6, 2);
        assert_eq!(zones.load, 8);
        let c = ColumnPos::new(0, 0);
        assert_eq!(zones.zone(c, ColumnPos::new(1, -2)), Zone::Simulation);
        assert_eq!(zones.zone(c, ColumnPos::new(5, 0)), Zone::Render);
        assert_eq!(zones.zone(c, ColumnPos::new(0, 8)), Zone::Load);
        assert_eq!(zones.zone(c, ColumnPos::new(9, 0)), Zone::Out);
    }

    #[test]
    fn degenerate_config_is_clamped() {
        let zones = DistanceZones::new(5, 1, 0);
        assert_eq!(zones.render, 5);
        assert_eq!(zones.load, 5);
    }

    #[test]
    fn load_set_covers_square() {
        let zones = DistanceZones::new(0, 0, 1);
        let cols = zones.columns_to_load(ColumnPos::new(10, 10));
        assert_eq!(cols.len(), 9);
        assert!(cols.contains(&ColumnPos::new(9, 11)));
    }
}
