//! Persistence: CBOR column codec, region files, async IO workers.
#![forbid(unsafe_code)]

mod codec;
mod config_file;
mod manager;
mod region;
mod schematic;

pub use codec::{
    PersistError, column_from_cbor, column_to_cbor, column_to_cbor_with_registry, data_to_value,
    name_registry_from_cbor, value_to_data,
};
pub use config_file::ConfigFile;
pub use manager::IoManager;
pub use region::{
    COLUMNS_PER_REGION, FLAG_COMPRESSED_LZ4, REGION_SIZE, RegionFile, RegionPos, TocEntry,
};
pub use schematic::{BlockSnapshot, Schematic};
