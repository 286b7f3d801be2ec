//! CBOR encoding of data containers and chunk columns.
//!
//! Column schema (CBOR map):
//! `version:int`, `x:int`, `z:int`, `heightmap:[i64; 256]`,
//! `subchunks:[{y, palette:[text], bits, data:bytes, block_data?}]`,
//! `column_data?:map`, `name_registry?:[text]`.
//!
//! Subchunk `data` is the block array bit-packed LSB-first at
//! `bits = ceil(log2(|palette|))` bits per block. Palette entries are
//! stored as type-name strings and re-interned on load, so runtime id
//! drift between sessions is harmless.

use std::sync::Arc;

use ciborium::value::{Integer, Value};
use karst_chunk::{ChunkColumn, LocalIndex, SubchunkSerial};
use karst_core::{
    BlockTypeId, ColumnPos, DataContainer, DataKey, DataValue, NameRegistry, SUBCHUNK_VOLUME,
    StringInterner,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic in {0}")]
    BadMagic(&'static str),
    #[error("unsupported format version {0}")]
    UnknownVersion(u64),
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

const COLUMN_FORMAT_VERSION: u64 = 1;

fn corrupt(what: impl Into<String>) -> PersistError {
    PersistError::Corrupt(what.into())
}

// ---------------------------------------------------------------------
// DataContainer <-> CBOR value
// ---------------------------------------------------------------------

fn key_name(key: DataKey) -> String {
    StringInterner::global()
        .lookup(key)
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// Encode a container as a CBOR map with string keys.
pub fn data_to_value(dc: &DataContainer) -> Value {
    let mut entries: Vec<(Value, Value)> = dc
        .iter()
        .map(|(key, value)| (Value::Text(key_name(key)), datum_to_value(value)))
        .collect();
    // Deterministic output independent of map iteration order.
    entries.sort_by(|(a, _), (b, _)| a.as_text().cmp(&b.as_text()));
    Value::Map(entries)
}

fn datum_to_value(value: &DataValue) -> Value {
    match value {
        DataValue::Null => Value::Null,
        DataValue::I64(v) => Value::Integer(Integer::from(*v)),
        DataValue::F64(v) => Value::Float(*v),
        DataValue::Str(v) => Value::Text(v.clone()),
        DataValue::Bytes(v) => Value::Bytes(v.clone()),
        DataValue::Container(v) => data_to_value(v),
        DataValue::I64Array(v) => {
            Value::Array(v.iter().map(|&i| Value::Integer(Integer::from(i))).collect())
        }
        DataValue::F64Array(v) => Value::Array(v.iter().map(|&f| Value::Float(f)).collect()),
        DataValue::StrArray(v) => Value::Array(v.iter().map(|s| Value::Text(s.clone())).collect()),
    }
}

/// Decode a CBOR map back into a container, interning the keys.
pub fn value_to_data(value: &Value) -> Result<DataContainer, PersistError> {
    let Value::Map(entries) = value else {
        return Err(corrupt("data container is not a map"));
    };
    let mut dc = DataContainer::new();
    for (key, value) in entries {
        let Value::Text(name) = key else {
            return Err(corrupt("data container key is not text"));
        };
        dc.set_by_name(name, value_to_datum(value)?);
    }
    Ok(dc)
}

fn value_to_datum(value: &Value) -> Result<DataValue, PersistError> {
    Ok(match value {
        Value::Null => DataValue::Null,
        Value::Integer(i) => {
            DataValue::I64(i128::from(*i) as i64)
        }
        Value::Float(f) => DataValue::F64(*f),
        Value::Text(s) => DataValue::Str(s.clone()),
        Value::Bytes(b) => DataValue::Bytes(b.clone()),
        Value::Map(_) => DataValue::Container(Box::new(value_to_data(value)?)),
        Value::Array(items) => array_to_datum(items)?,
        other => return Err(corrupt(format!("unsupported CBOR value {other:?}"))),
    })
}

// Arrays are homogeneous; the element type picks the variant. An empty
// array decodes as an empty i64 array.
fn array_to_datum(items: &[Value]) -> Result<DataValue, PersistError> {
    match items.first() {
        None => Ok(DataValue::I64Array(Vec::new())),
        Some(Value::Integer(_)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Integer(i) => out.push(i128::from(*i) as i64),
                    _ => return Err(corrupt("mixed integer array")),
                }
            }
            Ok(DataValue::I64Array(out))
        }
        Some(Value::Float(_)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Float(f) => out.push(*f),
                    _ => return Err(corrupt("mixed float array")),
                }
            }
            Ok(DataValue::F64Array(out))
        }
        Some(Value::Text(_)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Text(s) => out.push(s.clone()),
                    _ => return Err(corrupt("mixed string array")),
                }
            }
            Ok(DataValue::StrArray(out))
        }
        Some(other) => Err(corrupt(format!("unsupported array element {other:?}"))),
    }
}

// ---------------------------------------------------------------------
// Bit packing
// ---------------------------------------------------------------------

/// Pack local indices LSB-first at `bits` per entry.
fn pack_indices(indices: &[LocalIndex], bits: u32) -> Vec<u8> {
    if bits == 0 {
        return Vec::new();
    }
    let mut out = vec![0u8; (indices.len() * bits as usize).div_ceil(8)];
    let mut bit_pos = 0usize;
    for &index in indices {
        for bit in 0..bits {
            if index & (1 << bit) != 0 {
                out[bit_pos >> 3] |= 1 << (bit_pos & 7);
            }
            bit_pos += 1;
        }
    }
    out
}

fn unpack_indices(data: &[u8], bits: u32, count: usize) -> Result<Vec<LocalIndex>, PersistError> {
    if bits == 0 {
        return Ok(vec![0; count]);
    }
    if data.len() * 8 < count * bits as usize {
        return Err(corrupt("bit-packed block data too short"));
    }
    let mut out = Vec::with_capacity(count);
    let mut bit_pos = 0usize;
    for _ in 0..count {
        let mut index: LocalIndex = 0;
        for bit in 0..bits {
            if data[bit_pos >> 3] & (1 << (bit_pos & 7)) != 0 {
                index |= 1 << bit;
            }
            bit_pos += 1;
        }
        out.push(index);
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Column <-> CBOR
// ---------------------------------------------------------------------

fn map_entry(map: &mut Vec<(Value, Value)>, key: &str, value: Value) {
    map.push((Value::Text(key.to_string()), value));
}

fn serial_to_value(chunk_y: i32, serial: &SubchunkSerial) -> Value {
    let mut map = Vec::new();
    map_entry(&mut map, "y", Value::Integer(Integer::from(chunk_y)));
    map_entry(
        &mut map,
        "palette",
        Value::Array(
            serial
                .palette
                .iter()
                .map(|ty| Value::Text(ty.name().to_string()))
                .collect(),
        ),
    );
    map_entry(&mut map, "bits", Value::Integer(Integer::from(serial.bits)));
    map_entry(
        &mut map,
        "data",
        Value::Bytes(pack_indices(&serial.indices, serial.bits)),
    );
    if !serial.block_data.is_empty() {
        let entries: Vec<Value> = serial
            .block_data
            .iter()
            .map(|(index, dc)| {
                let mut entry = Vec::new();
                map_entry(&mut entry, "i", Value::Integer(Integer::from(*index)));
                map_entry(&mut entry, "d", data_to_value(dc));
                Value::Map(entry)
            })
            .collect();
        map_entry(&mut map, "block_data", Value::Array(entries));
    }
    Value::Map(map)
}

/// Serialize a column to CBOR bytes. Palettes are compacted first so disk
/// storage uses the minimum bit width.
pub fn column_to_cbor(column: &ChunkColumn) -> Vec<u8> {
    column_to_cbor_with_registry(column, None)
}

pub fn column_to_cbor_with_registry(
    column: &ChunkColumn,
    names: Option<&NameRegistry>,
) -> Vec<u8> {
    let pos = column.position();
    let mut map = Vec::new();
    map_entry(
        &mut map,
        "version",
        Value::Integer(Integer::from(COLUMN_FORMAT_VERSION)),
    );
    map_entry(&mut map, "x", Value::Integer(Integer::from(pos.x)));
    map_entry(&mut map, "z", Value::Integer(Integer::from(pos.z)));
    map_entry(
        &mut map,
        "heightmap",
        Value::Array(
            column
                .heightmap_data()
                .iter()
                .map(|&h| Value::Integer(Integer::from(h as i64)))
                .collect(),
        ),
    );
    let mut subchunks = Vec::new();
    for (chunk_y, sc) in column.subchunks() {
        if sc.is_empty() {
            continue;
        }
        let serial = sc.serial_snapshot();
        subchunks.push(serial_to_value(chunk_y, &serial));
    }
    map_entry(&mut map, "subchunks", Value::Array(subchunks));
    if let Some(data) = column.data() {
        if !data.is_empty() {
            map_entry(&mut map, "column_data", data_to_value(&data));
        }
    }
    if let Some(names) = names {
        let mut dc = DataContainer::new();
        names.save_to(&mut dc, "names");
        if let Some(list) = dc.get_str_array(karst_core::intern_key("names")) {
            map_entry(
                &mut map,
                "name_registry",
                Value::Array(list.iter().map(|s| Value::Text(s.clone())).collect()),
            );
        }
    }
    let mut out = Vec::new();
    ciborium::ser::into_writer(&Value::Map(map), &mut out)
        .expect("CBOR encoding to a Vec cannot fail");
    out
}

fn field<'a>(map: &'a [(Value, Value)], name: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(key, _)| key.as_text() == Some(name))
        .map(|(_, value)| value)
}

fn as_i64(value: &Value, what: &str) -> Result<i64, PersistError> {
    match value {
        Value::Integer(i) => Ok(i128::from(*i) as i64),
        _ => Err(corrupt(format!("{what} is not an integer"))),
    }
}

/// Deserialize a column. The palette's stored names are re-interned, and
/// out-of-range palette indices fall back to air.
pub fn column_from_cbor(bytes: &[u8]) -> Result<Arc<ChunkColumn>, PersistError> {
    let value: Value = ciborium::de::from_reader(bytes)
        .map_err(|e| corrupt(format!("CBOR decode failed: {e}")))?;
    let Value::Map(map) = value else {
        return Err(corrupt("column is not a map"));
    };
    let version = as_i64(
        field(&map, "version").ok_or_else(|| corrupt("missing version"))?,
        "version",
    )? as u64;
    if version != COLUMN_FORMAT_VERSION {
        return Err(PersistError::UnknownVersion(version));
    }
    let x = as_i64(field(&map, "x").ok_or_else(|| corrupt("missing x"))?, "x")? as i32;
    let z = as_i64(field(&map, "z").ok_or_else(|| corrupt("missing z"))?, "z")? as i32;
    let column = Arc::new(ChunkColumn::new(ColumnPos::new(x, z)));

    if let Some(Value::Array(heights)) = field(&map, "heightmap") {
        if heights.len() == 256 {
            let mut data = [0i32; 256];
            for (slot, value) in data.iter_mut().zip(heights) {
                *slot = as_i64(value, "heightmap entry")? as i32;
            }
            column.set_heightmap_data(data);
        }
    }

    if let Some(Value::Array(subchunks)) = field(&map, "subchunks") {
        for entry in subchunks {
            let Value::Map(sc_map) = entry else {
                return Err(corrupt("subchunk entry is not a map"));
            };
            let chunk_y = as_i64(
                field(&sc_map, "y").ok_or_else(|| corrupt("subchunk missing y"))?,
                "subchunk y",
            )? as i32;
            let bits = as_i64(
                field(&sc_map, "bits").ok_or_else(|| corrupt("subchunk missing bits"))?,
                "subchunk bits",
            )? as u32;
            let Some(Value::Array(palette_names)) = field(&sc_map, "palette") else {
                return Err(corrupt("subchunk missing palette"));
            };
            let mut palette = Vec::with_capacity(palette_names.len());
            for name in palette_names {
                let Value::Text(name) = name else {
                    return Err(corrupt("palette entry is not text"));
                };
                palette.push(BlockTypeId::from_name(name));
            }
            let Some(Value::Bytes(data)) = field(&sc_map, "data") else {
                return Err(corrupt("subchunk missing data"));
            };
            let indices = unpack_indices(data, bits, SUBCHUNK_VOLUME)?;
            let sc = column.get_or_create_subchunk(chunk_y);
            sc.load_indices(&palette, &indices);
            if let Some(Value::Array(block_data)) = field(&sc_map, "block_data") {
                for entry in block_data {
                    let Value::Map(bd_map) = entry else {
                        continue;
                    };
                    let index = as_i64(
                        field(&bd_map, "i").ok_or_else(|| corrupt("block data missing index"))?,
                        "block data index",
                    )? as usize;
                    if index >= SUBCHUNK_VOLUME {
                        continue;
                    }
                    if let Some(data_value) = field(&bd_map, "d") {
                        sc.set_block_data(
                            karst_core::LocalPos::from_index(index),
                            value_to_data(data_value)?,
                        );
                    }
                }
            }
        }
    }

    if let Some(data_value) = field(&map, "column_data") {
        column.set_data(Some(value_to_data(data_value)?));
    }
    Ok(column)
}

/// Pull a name registry out of serialized column bytes, if present.
pub fn name_registry_from_cbor(bytes: &[u8]) -> Result<Option<NameRegistry>, PersistError> {
    let value: Value = ciborium::de::from_reader(bytes)
        .map_err(|e| corrupt(format!("CBOR decode failed: {e}")))?;
    let Value::Map(map) = value else {
        return Err(corrupt("column is not a map"));
    };
    let Some(Value::Array(names)) = field(&map, "name_registry") else {
        return Ok(None);
    };
    let mut dc = DataContainer::new();
    let list: Result<Vec<String>, PersistError> = names
        .iter()
        .map(|v| match v {
            Value::Text(s) => Ok(s.clone()),
            _ => Err(corrupt("name registry entry is not text")),
        })
        .collect();
    dc.set_by_name("names", DataValue::StrArray(list?));
    Ok(Some(NameRegistry::load_from(&dc, "names")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_core::{BlockPos, intern_key};

    fn ty(name: &str) -> BlockTypeId {
        BlockTypeId::from_name(name)
    }

    #[test]
    fn data_container_every_variant_roundtrip() {
        let mut dc = DataContainer::new();
        dc.set_by_name("null", DataValue::Null);
        dc.set_by_name("int", DataValue::I64(-12345));
        dc.set_by_name("float", DataValue::F64(0.75));
        dc.set_by_name("text", DataValue::Str("sign text".into()));
        dc.set_by_name("blob", DataValue::Bytes(vec![0, 1, 255]));
        dc.set_by_name("ints", DataValue::I64Array(vec![i64::MIN, 0, i64::MAX]));
        dc.set_by_name("floats", DataValue::F64Array(vec![-1.5, 2.25]));
        dc.set_by_name("names", DataValue::StrArray(vec!["a".into(), "b".into()]));
        let mut nested = DataContainer::new();
        nested.set_by_name("inner", DataValue::I64(7));
        dc.set_by_name("child", DataValue::Container(Box::new(nested)));

        let decoded = value_to_data(&data_to_value(&dc)).unwrap();
        assert_eq!(decoded, dc);
    }

    #[test]
    fn bit_packing_roundtrip() {
        for bits in 1..=12u32 {
            let mask = (1u32 << bits) - 1;
            let indices: Vec<LocalIndex> = (0..SUBCHUNK_VOLUME)
                .map(|i| ((i as u32 * 37) & mask) as LocalIndex)
                .collect();
            let packed = pack_indices(&indices, bits);
            assert_eq!(packed.len(), (SUBCHUNK_VOLUME * bits as usize).div_ceil(8));
            let unpacked = unpack_indices(&packed, bits, SUBCHUNK_VOLUME).unwrap();
            assert_eq!(unpacked, indices);
        }
    }

    #[test]
    fn column_roundtrip_preserves_blocks_and_heightmap() {
        let column = ChunkColumn::new(ColumnPos::new(5, -3));
        let stone = ty("karst:codec_stone");
        let dirt = ty("karst:codec_dirt");
        column.set_block(BlockPos::new(80, 10, -48), stone);
        column.set_block(BlockPos::new(81, 200, -41), dirt);
        column.set_block(BlockPos::new(86, -100, -33), stone);
        let mut heights = [0i32; 256];
        heights[5] = 201;
        column.set_heightmap_data(heights);
        column.with_data(|dc| dc.set_by_name("biome", DataValue::Str("karst:plain".into())));
        if let Some(sc) = column.subchunk(0) {
            sc.with_block_data(BlockPos::new(80, 10, -48).local(), |dc| {
                dc.set_by_name("power", DataValue::I64(5));
            });
        }

        let bytes = column_to_cbor(&column);
        let loaded = column_from_cbor(&bytes).unwrap();

        assert_eq!(loaded.position(), ColumnPos::new(5, -3));
        assert_eq!(loaded.get_block(BlockPos::new(80, 10, -48)), stone);
        assert_eq!(loaded.get_block(BlockPos::new(81, 200, -41)), dirt);
        assert_eq!(loaded.get_block(BlockPos::new(86, -100, -33)), stone);
        assert_eq!(loaded.non_air_count(), column.non_air_count());
        assert_eq!(loaded.heightmap_data(), column.heightmap_data());
        let data = loaded.data().unwrap();
        assert_eq!(data.get_str(intern_key("biome")), Some("karst:plain"));
        let sc = loaded.subchunk(0).unwrap();
        let bd = sc.block_data(BlockPos::new(80, 10, -48).local()).unwrap();
        assert_eq!(bd.get_i64(intern_key("power"), 0), 5);
    }

    #[test]
    fn empty_column_roundtrip() {
        let column = ChunkColumn::new(ColumnPos::new(0, 0));
        let bytes = column_to_cbor(&column);
        let loaded = column_from_cbor(&bytes).unwrap();
        assert_eq!(loaded.non_air_count(), 0);
        assert_eq!(loaded.subchunk_count(), 0);
    }

    #[test]
    fn name_registry_rides_along() {
        let column = ChunkColumn::new(ColumnPos::new(1, 1));
        let names = NameRegistry::new();
        names.get_or_assign("karst:codec_item");
        let bytes = column_to_cbor_with_registry(&column, Some(&names));
        let loaded = name_registry_from_cbor(&bytes).unwrap().unwrap();
        assert_eq!(loaded.find("karst:codec_item"), Some(1));
    }

    #[test]
    fn garbage_bytes_are_corrupt() {
        assert!(matches!(
            column_from_cbor(&[0xFF, 0x00, 0x12]),
            Err(PersistError::Corrupt(_))
        ));
    }
}
