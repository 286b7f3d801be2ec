//! Sky and block light propagation, plus the async light worker.
#![forbid(unsafe_code)]

mod engine;
mod propagate;

pub use engine::LightEngine;
pub use propagate::{
    apply_update, block_light_at, combined_light_at, initialize_column_light,
    initialize_world_light, sky_light_at,
};
