//! Schematics: portable block snapshots (`.vxsc`).
//!
//! File layout: `[magic "VXSC"][u32 LE decompressed size][LZ4(CBOR)]`.

use std::path::Path;

use ciborium::value::{Integer, Value};
use karst_core::{BlockPos, BlockTypeId, Rotation};
use karst_world::World;

use crate::codec::PersistError;

const SCHEMATIC_MAGIC: &[u8; 4] = b"VXSC";

/// One captured block, relative to the schematic origin.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockSnapshot {
    pub offset: BlockPos,
    pub block_type: BlockTypeId,
    pub rotation: Rotation,
}

/// A set of block snapshots that can be saved, rotated and pasted.
#[derive(Clone, Debug, Default)]
pub struct Schematic {
    pub blocks: Vec<BlockSnapshot>,
}

impl Schematic {
    pub fn new(blocks: Vec<BlockSnapshot>) -> Self {
        Self { blocks }
    }

    /// Capture the non-air blocks of a world-space box, origin at `min`.
    pub fn capture(world: &World, min: BlockPos, max: BlockPos) -> Self {
        let mut blocks = Vec::new();
        for y in min.y..=max.y {
            for z in min.z..=max.z {
                for x in min.x..=max.x {
                    let pos = BlockPos::new(x, y, z);
                    let ty = world.get_block(pos);
                    if !ty.is_air() {
                        blocks.push(BlockSnapshot {
                            offset: BlockPos::new(x - min.x, y - min.y, z - min.z),
                            block_type: ty,
                            rotation: Rotation::IDENTITY,
                        });
                    }
                }
            }
        }
        Self { blocks }
    }

    /// Paste through the internal block API (no events).
    pub fn paste(&self, world: &World, origin: BlockPos) {
        for snapshot in &self.blocks {
            world.set_block(
                BlockPos::new(
                    origin.x + snapshot.offset.x,
                    origin.y + snapshot.offset.y,
                    origin.z + snapshot.offset.z,
                ),
                snapshot.block_type,
            );
        }
    }

    /// Rotate the whole schematic around its origin; block rotations
    /// compose with the applied one.
    pub fn rotated(&self, rotation: Rotation) -> Schematic {
        Schematic {
            blocks: self
                .blocks
                .iter()
                .map(|snapshot| BlockSnapshot {
                    offset: rotation.apply_pos(snapshot.offset),
                    block_type: snapshot.block_type,
                    rotation: rotation.compose(snapshot.rotation),
                })
                .collect(),
        }
    }

    fn to_value(&self) -> Value {
        let blocks: Vec<Value> = self
            .blocks
            .iter()
            .map(|snapshot| {
                Value::Array(vec![
                    Value::Integer(Integer::from(snapshot.offset.x)),
                    Value::Integer(Integer::from(snapshot.offset.y)),
                    Value::Integer(Integer::from(snapshot.offset.z)),
                    Value::Text(snapshot.block_type.name().to_string()),
                    Value::Integer(Integer::from(snapshot.rotation.index())),
                ])
            })
            .collect();
        Value::Map(vec![
            (Value::Text("version".into()), Value::Integer(Integer::from(1u8))),
            (Value::Text("blocks".into()), Value::Array(blocks)),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, PersistError> {
        let Value::Map(map) = value else {
            return Err(PersistError::Corrupt("schematic is not a map".into()));
        };
        let blocks_value = map
            .iter()
            .find(|(key, _)| key.as_text() == Some("blocks"))
            .map(|(_, value)| value);
        let Some(Value::Array(entries)) = blocks_value else {
            return Err(PersistError::Corrupt("schematic missing blocks".into()));
        };
        let mut blocks = Vec::with_capacity(entries.len());
        for entry in entries {
            let Value::Array(fields) = entry else {
                return Err(PersistError::Corrupt("schematic block is not an array".into()));
            };
            if fields.len() != 5 {
                return Err(PersistError::Corrupt("schematic block arity".into()));
            }
            let int = |value: &Value| -> Result<i64, PersistError> {
                match value {
                    Value::Integer(i) => Ok(i128::from(*i) as i64),
                    _ => Err(PersistError::Corrupt("schematic field not an int".into())),
                }
            };
            let Value::Text(name) = &fields[3] else {
                return Err(PersistError::Corrupt("schematic type not text".into()));
            };
            blocks.push(BlockSnapshot {
                offset: BlockPos::new(
                    int(&fields[0])? as i32,
                    int(&fields[1])? as i32,
                    int(&fields[2])? as i32,
                ),
                block_type: BlockTypeId::from_name(name),
                rotation: Rotation::by_index(int(&fields[4])? as u8),
            });
        }
        Ok(Self { blocks })
    }

    /// Encode to the `.vxsc` wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut cbor = Vec::new();
        ciborium::ser::into_writer(&self.to_value(), &mut cbor)
            .expect("CBOR encoding to a Vec cannot fail");
        let compressed = lz4_flex::compress(&cbor);
        let mut out = Vec::with_capacity(8 + compressed.len());
        out.extend_from_slice(SCHEMATIC_MAGIC);
        out.extend_from_slice(&(cbor.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistError> {
        if bytes.len() < 8 || &bytes[0..4] != SCHEMATIC_MAGIC {
            return Err(PersistError::BadMagic("schematic"));
        }
        let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let cbor = lz4_flex::decompress(&bytes[8..], size)
            .map_err(|e| PersistError::Corrupt(format!("LZ4 decompression failed: {e}")))?;
        let value: Value = ciborium::de::from_reader(cbor.as_slice())
            .map_err(|e| PersistError::Corrupt(format!("CBOR decode failed: {e}")))?;
        Self::from_value(&value)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ty(name: &str) -> BlockTypeId {
        BlockTypeId::from_name(name)
    }

    fn sample() -> Schematic {
        Schematic::new(vec![
            BlockSnapshot {
                offset: BlockPos::new(0, 0, 0),
                block_type: ty("karst:schem_stone"),
                rotation: Rotation::IDENTITY,
            },
            BlockSnapshot {
                offset: BlockPos::new(2, 1, 0),
                block_type: ty("karst:schem_stairs"),
                rotation: Rotation::ROTATE_Y_90,
            },
        ])
    }

    // Serialize -> LZ4 -> deserialize is the identity on the snapshot
    // set.
    #[test]
    fn bytes_roundtrip_identity() {
        let schematic = sample();
        let restored = Schematic::from_bytes(&schematic.to_bytes()).unwrap();
        let before: HashSet<_> = schematic.blocks.iter().map(|b| (b.offset, b.block_type, b.rotation.index())).collect();
        let after: HashSet<_> = restored.blocks.iter().map(|b| (b.offset, b.block_type, b.rotation.index())).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn magic_is_checked() {
        assert!(matches!(
            Schematic::from_bytes(b"NOPE\x00\x00\x00\x00"),
            Err(PersistError::BadMagic("schematic"))
        ));
    }

    #[test]
    fn capture_paste_roundtrip() {
        let world = World::new();
        let stone = ty("karst:schem_cap_stone");
        world.set_block(BlockPos::new(1, 1, 1), stone);
        world.set_block(BlockPos::new(2, 2, 2), stone);
        let schematic =
            Schematic::capture(&world, BlockPos::new(0, 0, 0), BlockPos::new(3, 3, 3));
        assert_eq!(schematic.blocks.len(), 2);

        let target = World::new();
        schematic.paste(&target, BlockPos::new(100, 50, 100));
        assert_eq!(target.get_block(BlockPos::new(101, 51, 101)), stone);
        assert_eq!(target.get_block(BlockPos::new(102, 52, 102)), stone);
    }

    #[test]
    fn rotation_moves_offsets_and_composes() {
        let schematic = sample();
        let rotated = schematic.rotated(Rotation::ROTATE_Y_90);
        // (2, 1, 0) under Y90 becomes (0, 1, -2).
        assert!(rotated.blocks.iter().any(|b| b.offset == BlockPos::new(0, 1, -2)));
        let stairs = rotated
            .blocks
            .iter()
            .find(|b| b.block_type == ty("karst:schem_stairs"))
            .unwrap();
        assert_eq!(
            stairs.rotation,
            Rotation::ROTATE_Y_90.compose(Rotation::ROTATE_Y_90)
        );
    }
}
