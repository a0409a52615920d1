//! Immutable sorted segment files.
//!
//! Layout:
//! ```text
//!   [SegmentHeader]   - 32 bytes: magic, version, entry count, data offset, CRC
//!   [IndexRow; n]     - 32 bytes each, sorted by id
//!   [body 0] [pad] [body 1] [pad] ...   - each body starts on an 8-byte boundary
//! ```
//!
//! The CRC covers everything after the header. Files are memory-mapped and
//! bodies are read in place through [`EntryView`]. A bincode bloom sidecar
//! (`<file>.bloom`) lets point lookups skip the file without touching it.
//!
//! Cold archives use the same format.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytemuck::{Pod, Zeroable, bytes_of};
use memmap2::Mmap;
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};
use crate::index::bloom::BloomFilter;
use crate::storage::codec::{EntryView, StoredEntry};
use crate::types::{FrameId, Stage};

const SEGMENT_MAGIC: [u8; 4] = *b"FVSG";
const SEGMENT_VERSION: u32 = 1;
const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();
const ROW_SIZE: usize = std::mem::size_of::<IndexRow>();
const BODY_ALIGN: usize = 8;

/// Bloom false-positive rate for sidecar filters.
const SIDECAR_FP_RATE: f64 = 0.01;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SegmentHeader {
    magic: [u8; 4],
    version: u32,
    entry_count: u64,
    data_offset: u64,
    crc: u32,
    reserved: u32,
}

/// One index row per entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct IndexRow {
    pub id: u64,
    /// Creation time for live entries, death time for tombstones
    pub timestamp: u64,
    /// Body offset relative to the data region
    pub offset: u64,
    pub len: u32,
    pub stage: u8,
    pad: [u8; 3],
}

impl IndexRow {
    pub fn stage(&self) -> Option<Stage> {
        Stage::from_tag(self.stage)
    }
}

/// Path of the bloom sidecar for a segment or archive file.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bloom");
    PathBuf::from(name)
}

/// An open, immutable segment.
pub struct Segment {
    path: PathBuf,
    mmap: Mmap,
    entry_count: usize,
    data_offset: usize,
    bloom: BloomFilter,
    retired: AtomicBool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("entry_count", &self.entry_count)
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .finish()
    }
}

impl Segment {
    /// Write `entries` (one version per id) to `path` and open the result.
    ///
    /// The file is written under a temporary name, fsynced and renamed into
    /// place, so a crash never leaves a half-written segment behind.
    pub fn create(path: &Path, entries: &[StoredEntry]) -> VaultResult<Self> {
        let mut sorted: Vec<&StoredEntry> = entries.iter().collect();
        sorted.sort_by_key(|e| e.id());
        sorted.dedup_by_key(|e| e.id());

        let bloom = BloomFilter::new(sorted.len(), SIDECAR_FP_RATE);
        let mut rows = Vec::with_capacity(sorted.len());
        let mut data = Vec::new();
        for entry in &sorted {
            let body = entry.encode();
            rows.push(IndexRow {
                id: entry.id(),
                timestamp: entry.timestamp(),
                offset: data.len() as u64,
                len: body.len() as u32,
                stage: entry.stage().tag(),
                pad: [0; 3],
            });
            data.extend_from_slice(&body);
            data.resize(data.len().next_multiple_of(BODY_ALIGN), 0);
            bloom.insert_id(entry.id());
        }

        let index_bytes: &[u8] = bytemuck::cast_slice(&rows);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(index_bytes);
        hasher.update(&data);
        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            entry_count: rows.len() as u64,
            data_offset: (HEADER_SIZE + index_bytes.len()) as u64,
            crc: hasher.finalize(),
            reserved: 0,
        };

        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(bytes_of(&header))?;
            file.write_all(index_bytes)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        fs::write(sidecar_path(path), bloom.to_bytes()?)?;

        debug!(path = %path.display(), entries = rows.len(), "segment written");
        Self::open(path)
    }

    /// Open and verify an existing segment.
    ///
    /// # Errors
    ///
    /// [`VaultError::Corrupt`] for a bad magic, version, layout or checksum.
    pub fn open(path: &Path) -> VaultResult<Self> {
        let location = || path.display().to_string();
        let file = File::open(path)?;
        // SAFETY: segment files are immutable once renamed into place and are
        // only removed after every handle has been dropped.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE {
            return Err(VaultError::corrupt(location(), "shorter than header"));
        }
        let header: SegmentHeader = bytemuck::pod_read_unaligned(&mmap[..HEADER_SIZE]);
        if header.magic != SEGMENT_MAGIC {
            return Err(VaultError::corrupt(location(), "bad magic"));
        }
        if header.version != SEGMENT_VERSION {
            return Err(VaultError::corrupt(
                location(),
                format!("unsupported version {}", header.version),
            ));
        }
        let entry_count = header.entry_count as usize;
        let data_offset = header.data_offset as usize;
        if data_offset != HEADER_SIZE + entry_count * ROW_SIZE || data_offset > mmap.len() {
            return Err(VaultError::corrupt(location(), "index region out of bounds"));
        }
        if crc32fast::hash(&mmap[HEADER_SIZE..]) != header.crc {
            return Err(VaultError::corrupt(location(), "checksum mismatch"));
        }

        let mut segment = Self {
            path: path.to_path_buf(),
            mmap,
            entry_count,
            data_offset,
            bloom: BloomFilter::new(1, SIDECAR_FP_RATE),
            retired: AtomicBool::new(false),
        };
        let data_len = segment.mmap.len() - data_offset;
        if segment
            .rows()
            .iter()
            .any(|r| r.offset as usize + r.len as usize > data_len || r.stage().is_none())
        {
            return Err(VaultError::corrupt(location(), "index row out of bounds"));
        }
        segment.bloom = segment.load_sidecar();
        Ok(segment)
    }

    fn load_sidecar(&self) -> BloomFilter {
        let sidecar = sidecar_path(&self.path);
        match fs::read(&sidecar).map_err(VaultError::from).and_then(|b| BloomFilter::from_bytes(&b)) {
            Ok(bloom) => bloom,
            Err(e) => {
                warn!(path = %sidecar.display(), error = %e, "bloom sidecar unusable, rebuilding from index");
                let bloom = BloomFilter::new(self.entry_count, SIDECAR_FP_RATE);
                for row in self.rows() {
                    bloom.insert_id(row.id);
                }
                if let Ok(bytes) = bloom.to_bytes() {
                    let _ = fs::write(&sidecar, bytes);
                }
                bloom
            }
        }
    }

    /// Index rows, sorted by id.
    pub fn rows(&self) -> &[IndexRow] {
        // The mmap is page aligned and the header is 32 bytes, so the rows
        // are aligned; the bounds were checked on open.
        bytemuck::cast_slice(&self.mmap[HEADER_SIZE..self.data_offset])
    }

    fn body(&self, row: &IndexRow) -> &[u8] {
        let start = self.data_offset + row.offset as usize;
        &self.mmap[start..start + row.len as usize]
    }

    /// Borrow the entry for `id` in place.
    pub fn view(&self, id: FrameId) -> VaultResult<Option<EntryView<'_>>> {
        if !self.bloom.may_contain_id(id) {
            return Ok(None);
        }
        let rows = self.rows();
        let Ok(pos) = rows.binary_search_by_key(&id, |r| r.id) else {
            return Ok(None);
        };
        let row = &rows[pos];
        let stage = row
            .stage()
            .ok_or_else(|| VaultError::corrupt(self.path.display().to_string(), "bad stage tag"))?;
        EntryView::parse(stage, self.body(row)).map(Some)
    }

    /// Owned copy of the entry for `id`.
    pub fn get(&self, id: FrameId) -> VaultResult<Option<StoredEntry>> {
        match self.view(id)? {
            Some(view) => view.to_entry().map(Some),
            None => Ok(None),
        }
    }

    /// Decode every entry in id order.
    pub fn entries(&self) -> impl Iterator<Item = VaultResult<StoredEntry>> + '_ {
        self.rows().iter().map(move |row| {
            let stage = row.stage().unwrap_or(Stage::Full);
            EntryView::parse(stage, self.body(row))?.to_entry()
        })
    }

    pub fn may_contain(&self, id: FrameId) -> bool {
        self.bloom.may_contain_id(id)
    }

    pub fn len(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file in bytes.
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    /// Smallest and largest row timestamp.
    pub fn time_span(&self) -> Option<(u64, u64)> {
        let rows = self.rows();
        let min = rows.iter().map(|r| r.timestamp).min()?;
        let max = rows.iter().map(|r| r.timestamp).max()?;
        Some((min, max))
    }

    /// Mark the file for deletion once the last handle drops.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            let _ = fs::remove_file(&self.path);
            let _ = fs::remove_file(sidecar_path(&self.path));
            debug!(path = %self.path.display(), "retired segment removed");
        }
    }
}

/// Move a corrupt file (and its sidecar) into `quarantine_dir`.
pub fn quarantine(path: &Path, quarantine_dir: &Path) -> VaultResult<PathBuf> {
    fs::create_dir_all(quarantine_dir)?;
    let name = path
        .file_name()
        .ok_or_else(|| VaultError::corrupt(path.display().to_string(), "no file name"))?;
    let target = quarantine_dir.join(name);
    fs::rename(path, &target)?;
    let sidecar = sidecar_path(path);
    if sidecar.exists() {
        let _ = fs::rename(&sidecar, sidecar_path(&target));
    }
    warn!(from = %path.display(), to = %target.display(), "file quarantined");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::storage::codec::TombstoneRecord;
    use crate::types::Annotations;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(id: FrameId, dim: usize) -> StoredEntry {
        let mut v = vec![0.0; dim];
        v[id as usize % dim] = 1.0;
        let mut frame = FrameBuilder::new(2)
            .timestamp(1000 + id)
            .field(1, 0.7)
            .level(1, 0, v.clone())
            .level(1, 3, v)
            .build()
            .unwrap();
        frame.assign(id, 0);
        StoredEntry::live(Arc::new(frame), Stage::Full, Annotations::default())
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-00000001.fvs");
        // Odd dimension makes body lengths non-multiples of 8
        let mut entries: Vec<_> = (1..=20).rev().map(|id| entry(id, 5)).collect();
        entries.push(StoredEntry::Tombstone(TombstoneRecord::new(50, 2, 9, None)));

        let segment = Segment::create(&path, &entries).unwrap();
        assert_eq!(segment.len(), 21);
        assert!(sidecar_path(&path).exists());

        let ids: Vec<_> = segment.rows().iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        assert_eq!(segment.get(7).unwrap(), Some(entry(7, 5)));
        assert_eq!(segment.get(50).unwrap().unwrap().stage(), Stage::Tombstone);
        assert_eq!(segment.get(999).unwrap(), None);
        assert_eq!(segment.time_span(), Some((9, 1020)));

        let reopened = Segment::open(&path).unwrap();
        let all: Vec<_> = reopened.entries().collect::<VaultResult<_>>().unwrap();
        assert_eq!(all.len(), 21);
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-00000001.fvs");
        let entries: Vec<_> = (1..=4).map(|id| entry(id, 4)).collect();
        drop(Segment::create(&path, &entries).unwrap());

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0x55;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(Segment::open(&path), Err(VaultError::Corrupt { .. })));

        let moved = quarantine(&path, &dir.path().join("quarantine")).unwrap();
        assert!(!path.exists());
        assert!(moved.exists());
        assert!(sidecar_path(&moved).exists());
    }

    #[test]
    fn test_missing_sidecar_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-00000002.fvs");
        let entries: Vec<_> = (1..=3).map(|id| entry(id, 4)).collect();
        drop(Segment::create(&path, &entries).unwrap());
        fs::remove_file(sidecar_path(&path)).unwrap();

        let segment = Segment::open(&path).unwrap();
        assert!(segment.may_contain(2));
        assert!(sidecar_path(&path).exists());
    }

    #[test]
    fn test_retired_segment_removed_on_last_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-00000003.fvs");
        let segment = Arc::new(Segment::create(&path, &[entry(1, 4)]).unwrap());
        let reader = Arc::clone(&segment);
        segment.retire();
        drop(segment);
        // Still readable through the surviving handle
        assert!(path.exists());
        assert!(reader.get(1).unwrap().is_some());
        drop(reader);
        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());
    }
}
