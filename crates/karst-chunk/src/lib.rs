//! Palette-compressed subchunk storage, light volumes and columns.
#![forbid(unsafe_code)]

mod column;
mod light_data;
mod palette;
mod subchunk;

pub use column::{ChunkColumn, NO_HEIGHT};
pub use light_data::{LightData, MAX_LIGHT};
pub use palette::{INVALID_LOCAL_INDEX, LocalIndex, Palette, ceil_log2};
pub use subchunk::{BlockChangeCallback, BlockVolume, SubChunk, SubchunkSerial};
