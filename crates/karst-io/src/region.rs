//! Region files: 32x32 columns of LZ4-compressed CBOR with a journal TOC.
//!
//! On disk a region is two files:
//! - `r.<rx>.<rz>.dat`: chunk payloads, `[magic "VXCH"][flags][payload]`
//! - `r.<rx>.<rz>.toc`: `[magic "VXTC"][version]` then 24-byte entries,
//!   appended on every write; the newest timestamp per cell wins
//!
//! The append-only TOC gives crash consistency: a torn write leaves the
//! previous entry authoritative. Freed extents (from overwrites) are reused
//! best-fit before the data file grows.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use karst_core::ColumnPos;

use crate::codec::PersistError;

pub const REGION_SIZE: i32 = 32;
pub const COLUMNS_PER_REGION: i32 = REGION_SIZE * REGION_SIZE;

pub const DAT_CHUNK_MAGIC: u32 = 0x5658_4348; // "VXCH"
pub const TOC_MAGIC: u32 = 0x5658_5443; // "VXTC"
pub const TOC_VERSION: u32 = 1;
pub const FLAG_COMPRESSED_LZ4: u32 = 1 << 0;

const CHUNK_HEADER_SIZE: u64 = 8;

/// Which region file a column lives in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RegionPos {
    pub rx: i32,
    pub rz: i32,
}

impl RegionPos {
    pub fn from_column(pos: ColumnPos) -> Self {
        Self {
            rx: pos.x.div_euclid(REGION_SIZE),
            rz: pos.z.div_euclid(REGION_SIZE),
        }
    }

    /// Local cell coordinates within the region, each 0-31.
    pub fn local(pos: ColumnPos) -> (u16, u16) {
        (
            pos.x.rem_euclid(REGION_SIZE) as u16,
            pos.z.rem_euclid(REGION_SIZE) as u16,
        )
    }
}

/// One journal record: 24 bytes little-endian.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TocEntry {
    pub local_x: u16,
    pub local_z: u16,
    pub offset: u64,
    pub size: u32,
    pub timestamp: u64,
}

impl TocEntry {
    pub const SERIALIZED_SIZE: usize = 24;

    pub fn to_bytes(self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut out = [0u8; Self::SERIALIZED_SIZE];
        out[0..2].copy_from_slice(&self.local_x.to_le_bytes());
        out[2..4].copy_from_slice(&self.local_z.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<TocEntry> {
        if bytes.len() < Self::SERIALIZED_SIZE {
            return None;
        }
        Some(TocEntry {
            local_x: u16::from_le_bytes(bytes[0..2].try_into().ok()?),
            local_z: u16::from_le_bytes(bytes[2..4].try_into().ok()?),
            offset: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
            size: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
            timestamp: u64::from_le_bytes(bytes[16..24].try_into().ok()?),
        })
    }
}

fn local_key(local_x: u16, local_z: u16) -> u32 {
    local_z as u32 * REGION_SIZE as u32 + local_x as u32
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One open region: both file handles plus the in-memory index and free
/// spans rebuilt at open time.
pub struct RegionFile {
    pos: RegionPos,
    dat_path: PathBuf,
    toc_path: PathBuf,
    dat: File,
    toc: File,
    index: BTreeMap<u32, TocEntry>,
    // offset -> size of reusable extents, merged when adjacent.
    free: BTreeMap<u64, u64>,
    dat_end: u64,
}

impl RegionFile {
    /// Open or create the region under `dir` (the per-dimension regions
    /// directory).
    pub fn open(dir: &Path, pos: RegionPos) -> Result<Self, PersistError> {
        std::fs::create_dir_all(dir)?;
        let dat_path = dir.join(format!("r.{}.{}.dat", pos.rx, pos.rz));
        let toc_path = dir.join(format!("r.{}.{}.toc", pos.rx, pos.rz));
        let dat = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&dat_path)?;
        let mut toc = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&toc_path)?;
        let dat_end = dat.metadata()?.len();
        let bytes = toc_bytes(&mut toc)?;
        let mut region = Self {
            pos,
            dat_path,
            toc_path,
            dat,
            toc,
            index: BTreeMap::new(),
            free: BTreeMap::new(),
            dat_end,
        };
        region.load_toc(&bytes)?;
        region.rebuild_free_spans();
        Ok(region)
    }

    pub fn position(&self) -> RegionPos {
        self.pos
    }

    fn load_toc(&mut self, bytes: &[u8]) -> Result<(), PersistError> {
        if bytes.is_empty() {
            // Fresh file: write the header.
            self.toc.seek(SeekFrom::Start(0))?;
            self.toc.write_all(&TOC_MAGIC.to_le_bytes())?;
            self.toc.write_all(&TOC_VERSION.to_le_bytes())?;
            self.toc.flush()?;
            return Ok(());
        }
        if bytes.len() < 8 {
            return Err(PersistError::BadMagic("toc"));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != TOC_MAGIC {
            return Err(PersistError::BadMagic("toc"));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != TOC_VERSION {
            return Err(PersistError::UnknownVersion(version as u64));
        }
        // A torn trailing entry is expected after a crash; ignore it.
        for chunk in bytes[8..].chunks_exact(TocEntry::SERIALIZED_SIZE) {
            let Some(entry) = TocEntry::from_bytes(chunk) else {
                continue;
            };
            let key = local_key(entry.local_x, entry.local_z);
            match self.index.get(&key) {
                Some(existing) if existing.timestamp >= entry.timestamp => {}
                _ => {
                    self.index.insert(key, entry);
                }
            }
        }
        Ok(())
    }

    // Everything not covered by an authoritative extent is reusable,
    // including extents of superseded journal entries.
    fn rebuild_free_spans(&mut self) {
        self.free.clear();
        let mut extents: Vec<(u64, u64)> = self
            .index
            .values()
            .map(|e| (e.offset, e.size as u64))
            .collect();
        extents.sort_unstable();
        let mut cursor = 0u64;
        for (offset, size) in extents {
            if offset > cursor {
                self.free.insert(cursor, offset - cursor);
            }
            cursor = cursor.max(offset + size);
        }
        self.dat_end = self.dat_end.max(cursor);
        if cursor < self.dat_end {
            self.free.insert(cursor, self.dat_end - cursor);
        }
    }

    /// Best-fit span for `size` bytes, or `None` to append.
    fn allocate(&mut self, size: u64) -> Option<u64> {
        let (&offset, &span) = self
            .free
            .iter()
            .filter(|&(_, &span)| span >= size)
            .min_by_key(|&(_, &span)| span)?;
        self.free.remove(&offset);
        if span > size {
            self.free.insert(offset + size, span - size);
        }
        Some(offset)
    }

    fn release(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut offset = offset;
        let mut size = size;
        // Merge with the predecessor when contiguous.
        let prev = self
            .free
            .range(..offset)
            .next_back()
            .map(|(&off, &span)| (off, span));
        if let Some((prev_off, prev_size)) = prev {
            if prev_off + prev_size == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                size += prev_size;
            }
        }
        // Merge with the successor when contiguous.
        if let Some(next_size) = self.free.get(&(offset + size)).copied() {
            self.free.remove(&(offset + size));
            size += next_size;
        }
        self.free.insert(offset, size);
    }

    /// Write serialized column bytes for `pos`, LZ4-compressing the
    /// payload. The previous extent (if any) is freed after the new entry
    /// is journaled.
    pub fn save_column_raw(&mut self, pos: ColumnPos, cbor: &[u8]) -> Result<(), PersistError> {
        let (local_x, local_z) = RegionPos::local(pos);
        let key = local_key(local_x, local_z);
        let payload = lz4_flex::compress_prepend_size(cbor);
        let total = CHUNK_HEADER_SIZE + payload.len() as u64;

        let offset = match self.allocate(total) {
            Some(offset) => offset,
            None => {
                let offset = self.dat_end;
                self.dat_end += total;
                offset
            }
        };
        self.dat.seek(SeekFrom::Start(offset))?;
        self.dat.write_all(&DAT_CHUNK_MAGIC.to_le_bytes())?;
        self.dat.write_all(&FLAG_COMPRESSED_LZ4.to_le_bytes())?;
        self.dat.write_all(&payload)?;
        self.dat.flush()?;

        let entry = TocEntry {
            local_x,
            local_z,
            offset,
            size: total as u32,
            timestamp: self
                .index
                .get(&key)
                .map(|e| e.timestamp + 1)
                .unwrap_or(0)
                .max(now_millis()),
        };
        // Journal append happens only after the data write completed, so a
        // crash between the two preserves the previous version.
        self.toc.seek(SeekFrom::End(0))?;
        self.toc.write_all(&entry.to_bytes())?;
        self.toc.flush()?;

        if let Some(previous) = self.index.insert(key, entry) {
            self.release(previous.offset, previous.size as u64);
        }
        Ok(())
    }

    pub fn has_column(&self, pos: ColumnPos) -> bool {
        let (local_x, local_z) = RegionPos::local(pos);
        self.index.contains_key(&local_key(local_x, local_z))
    }

    /// Read and decompress the serialized column bytes for `pos`.
    pub fn load_column_raw(&mut self, pos: ColumnPos) -> Result<Option<Vec<u8>>, PersistError> {
        let (local_x, local_z) = RegionPos::local(pos);
        let Some(entry) = self.index.get(&local_key(local_x, local_z)).copied() else {
            return Ok(None);
        };
        if (entry.size as u64) < CHUNK_HEADER_SIZE {
            return Err(PersistError::Corrupt("chunk extent too small".into()));
        }
        let mut buf = vec![0u8; entry.size as usize];
        self.dat.seek(SeekFrom::Start(entry.offset))?;
        self.dat.read_exact(&mut buf)?;
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != DAT_CHUNK_MAGIC {
            return Err(PersistError::BadMagic("dat chunk"));
        }
        let flags = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let payload = &buf[CHUNK_HEADER_SIZE as usize..];
        if flags & FLAG_COMPRESSED_LZ4 != 0 {
            lz4_flex::decompress_size_prepended(payload)
                .map(Some)
                .map_err(|e| PersistError::Corrupt(format!("LZ4 decompression failed: {e}")))
        } else {
            Ok(Some(payload.to_vec()))
        }
    }

    /// Column positions present in this region.
    pub fn existing_columns(&self) -> Vec<ColumnPos> {
        self.index
            .values()
            .map(|entry| {
                ColumnPos::new(
                    self.pos.rx * REGION_SIZE + entry.local_x as i32,
                    self.pos.rz * REGION_SIZE + entry.local_z as i32,
                )
            })
            .collect()
    }

    /// Rewrite the TOC keeping only the latest entry per cell.
    pub fn compact_toc(&mut self) -> Result<(), PersistError> {
        let mut bytes = Vec::with_capacity(8 + self.index.len() * TocEntry::SERIALIZED_SIZE);
        bytes.extend_from_slice(&TOC_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&TOC_VERSION.to_le_bytes());
        for entry in self.index.values() {
            bytes.extend_from_slice(&entry.to_bytes());
        }
        let mut toc = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.toc_path)?;
        toc.write_all(&bytes)?;
        toc.flush()?;
        self.toc = OpenOptions::new().read(true).write(true).open(&self.toc_path)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), PersistError> {
        self.dat.flush()?;
        self.toc.flush()?;
        Ok(())
    }

    pub fn column_count(&self) -> usize {
        self.index.len()
    }

    pub fn free_span_count(&self) -> usize {
        self.free.len()
    }

    pub fn data_file_size(&self) -> u64 {
        self.dat_end
    }

    pub fn dat_path(&self) -> &Path {
        &self.dat_path
    }
}

fn toc_bytes(toc: &mut File) -> Result<Vec<u8>, PersistError> {
    let mut bytes = Vec::new();
    toc.seek(SeekFrom::Start(0))?;
    toc.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn region(dir: &TempDir) -> RegionFile {
        RegionFile::open(dir.path(), RegionPos { rx: 0, rz: 0 }).unwrap()
    }

    #[test]
    fn toc_entry_bytes_roundtrip() {
        let entry = TocEntry {
            local_x: 31,
            local_z: 7,
            offset: 0xDEAD_BEEF,
            size: 1234,
            timestamp: 0x0102_0304_0506_0708,
        };
        assert_eq!(TocEntry::from_bytes(&entry.to_bytes()), Some(entry));
    }

    #[test]
    fn region_pos_handles_negatives() {
        assert_eq!(
            RegionPos::from_column(ColumnPos::new(-1, -33)),
            RegionPos { rx: -1, rz: -2 }
        );
        assert_eq!(RegionPos::local(ColumnPos::new(-1, -33)), (31, 31));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut region = region(&dir);
        let pos = ColumnPos::new(5, 10);
        let payload = b"hello region".repeat(100);
        region.save_column_raw(pos, &payload).unwrap();
        assert!(region.has_column(pos));
        assert_eq!(region.load_column_raw(pos).unwrap().unwrap(), payload);
        assert_eq!(region.load_column_raw(ColumnPos::new(6, 10)).unwrap(), None);
    }

    // The journal keeps only the newest version authoritative.
    #[test]
    fn overwrite_retains_newest_across_reopen() {
        let dir = TempDir::new().unwrap();
        let pos = ColumnPos::new(5, 10);
        {
            let mut region = region(&dir);
            region.save_column_raw(pos, b"version one").unwrap();
            region.save_column_raw(pos, b"version two, longer payload").unwrap();
            assert_eq!(
                region.load_column_raw(pos).unwrap().unwrap(),
                b"version two, longer payload"
            );
            // The first extent is reusable.
            assert!(region.free_span_count() > 0);
        }
        // Reopen rebuilds the index from the journal; newest still wins.
        let mut reopened = region(&dir);
        assert_eq!(
            reopened.load_column_raw(pos).unwrap().unwrap(),
            b"version two, longer payload"
        );
        assert_eq!(reopened.column_count(), 1);
    }

    // Incompressible pseudo-random bytes, so LZ4 output tracks input size.
    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn freed_extents_are_reused_best_fit() {
        let dir = TempDir::new().unwrap();
        let mut region = region(&dir);
        let a = ColumnPos::new(0, 0);
        let b = ColumnPos::new(1, 0);
        let c = ColumnPos::new(2, 0);
        let big = noise(4000, 1);
        let small = noise(100, 2);
        let medium = noise(2000, 3);
        region.save_column_raw(a, &big).unwrap();
        region.save_column_raw(b, &small).unwrap();
        // Overwriting frees a's old 4000-byte extent.
        region.save_column_raw(a, &medium).unwrap();
        assert!(region.free_span_count() > 0);
        let size_after_overwrite = region.data_file_size();
        // A later write that fits goes into the hole instead of growing
        // the file.
        region.save_column_raw(c, &noise(1000, 4)).unwrap();
        assert_eq!(region.data_file_size(), size_after_overwrite);
        assert_eq!(region.load_column_raw(a).unwrap().unwrap(), medium);
        assert_eq!(region.load_column_raw(b).unwrap().unwrap(), small);
    }

    #[test]
    fn compact_toc_drops_stale_entries() {
        let dir = TempDir::new().unwrap();
        let pos = ColumnPos::new(3, 3);
        {
            let mut region = region(&dir);
            for i in 0..5u8 {
                region.save_column_raw(pos, &[i; 64]).unwrap();
            }
            region.compact_toc().unwrap();
        }
        let toc_len = std::fs::metadata(dir.path().join("r.0.0.toc")).unwrap().len();
        assert_eq!(toc_len, 8 + TocEntry::SERIALIZED_SIZE as u64);
        let mut reopened = region(&dir);
        assert_eq!(reopened.load_column_raw(pos).unwrap().unwrap(), vec![4u8; 64]);
    }

    #[test]
    fn bad_toc_magic_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("r.0.0.toc"), b"NOPE0000").unwrap();
        assert!(matches!(
            RegionFile::open(dir.path(), RegionPos { rx: 0, rz: 0 }),
            Err(PersistError::BadMagic("toc"))
        ));
    }
}
