//! Per-partition write-ahead log.
//!
//! Entry format: `[len u32][op u8][stage u8][reserved u16][frame_id u64][payload][crc32 u32]`.
//! `len` counts the bytes from `op` through the end of the payload; the CRC
//! covers the same range. Every op carries the full new version of the
//! record, so replay keeps the last entry per id.
//!
//! The log is owned by the partition's write section and needs no lock of its own.
//! A failed append is cut back off the file; if that cut fails too the log
//! refuses further appends until it is truncated.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::VaultResult;
use crate::storage::codec::StoredEntry;
use crate::types::{FrameId, Stage};

const LEN_SIZE: usize = 4;
const ENTRY_HEADER_SIZE: usize = 12; // op + stage + reserved + frame_id
const CRC_SIZE: usize = 4;

/// Upper bound on a single entry; anything larger is a broken length field.
const MAX_ENTRY_LEN: usize = 64 * 1024 * 1024;

/// What a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    /// A new record
    Append = 1,
    /// Compression stage change by the GC or archival
    Restage = 2,
    /// Supersession, pin or distillation annotation
    Annotate = 3,
}

impl WalOp {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(WalOp::Append),
            2 => Some(WalOp::Restage),
            3 => Some(WalOp::Annotate),
            _ => None,
        }
    }
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub op: WalOp,
    pub entry: StoredEntry,
}

/// Observable state of one partition's log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalHealth {
    /// Current size of `wal.log`
    pub bytes: u64,
    /// Entries appended since the last memtable flush
    pub entries_since_flush: u64,
    /// Entries skipped during replay because their CRC did not match
    pub corrupt_skipped: u64,
    /// Torn final entries discarded during replay
    pub truncated_tails: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Append-only log file.
pub struct Wal {
    path: PathBuf,
    file: File,
    sync_writes: bool,
    health: WalHealth,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("health", &self.health)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

/// Bytes an entry occupies in the log.
pub fn framed_len(entry: &StoredEntry) -> u64 {
    (LEN_SIZE + ENTRY_HEADER_SIZE + entry.encoded_len() + CRC_SIZE) as u64
}

impl Wal {
    /// Open (or create) the log at `path`, replaying what it holds.
    ///
    /// A torn final entry is cut off so the next append starts on a clean
    /// boundary.
    pub fn open(path: &Path, sync_writes: bool) -> VaultResult<(Self, Vec<WalRecord>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut health = WalHealth::default();
        let (records, good_len) = replay(path, &data, &mut health);

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if (good_len as usize) < data.len() {
            file.set_len(good_len)?;
            file.sync_all()?;
            warn!(path = %path.display(), kept = good_len, dropped = data.len() as u64 - good_len, "WAL tail truncated");
        }
        health.bytes = good_len;
        health.entries_since_flush = records.len() as u64;

        debug!(path = %path.display(), entries = records.len(), "WAL replayed");
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                sync_writes,
                health,
                poisoned: false,
                #[cfg(test)]
                fail_after: None,
            },
            records,
        ))
    }

    /// Append one entry and make it durable.
    ///
    /// Returns the number of bytes written. I/O errors are returned raw so
    /// the caller can map a full disk to a capacity error. On error the file
    /// is left ending at the previous entry.
    pub fn append(&mut self, op: WalOp, entry: &StoredEntry) -> io::Result<u64> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by an earlier failed write"));
        }
        let payload = entry.encode();
        let len = (ENTRY_HEADER_SIZE + payload.len()) as u32;

        let mut framed = Vec::with_capacity(LEN_SIZE + len as usize + CRC_SIZE);
        framed.extend_from_slice(&len.to_le_bytes());
        framed.push(op as u8);
        framed.push(entry.stage().tag());
        framed.extend_from_slice(&0u16.to_le_bytes());
        framed.extend_from_slice(&entry.id().to_le_bytes());
        framed.extend_from_slice(&payload);
        let crc = crc32fast::hash(&framed[LEN_SIZE..]);
        framed.extend_from_slice(&crc.to_le_bytes());

        if let Err(e) = self.write_framed(&framed) {
            self.roll_back();
            return Err(e);
        }

        let written = framed.len() as u64;
        self.health.bytes += written;
        self.health.entries_since_flush += 1;
        Ok(written)
    }

    fn write_framed(&mut self, framed: &[u8]) -> io::Result<()> {
        self.inject_failure(framed)?;
        self.file.write_all(framed)?;
        if self.sync_writes {
            self.file.sync_data()?;
            self.health.last_sync = Some(Utc::now());
        }
        Ok(())
    }

    /// Cut whatever part of a failed entry reached the file.
    fn roll_back(&mut self) {
        if let Err(e) = self.file.set_len(self.health.bytes) {
            error!(path = %self.path.display(), error = %e, "WAL rollback failed, refusing further appends");
            self.poisoned = true;
        }
    }

    #[cfg(test)]
    fn inject_failure(&mut self, framed: &[u8]) -> io::Result<()> {
        match self.fail_after.take() {
            Some(n) => {
                self.file.write_all(&framed[..n.min(framed.len())])?;
                Err(io::Error::other("injected write failure"))
            }
            None => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn inject_failure(&mut self, _framed: &[u8]) -> io::Result<()> {
        Ok(())
    }

    /// Discard every entry; called once the memtable is safely in a segment.
    pub fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.poisoned = false;
        self.health.bytes = 0;
        self.health.entries_since_flush = 0;
        self.health.last_sync = Some(Utc::now());
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.health.bytes
    }

    pub fn health(&self) -> &WalHealth {
        &self.health
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse entries from raw log bytes. Returns the records and the length of
/// the valid prefix.
fn replay(path: &Path, data: &[u8], health: &mut WalHealth) -> (Vec<WalRecord>, u64) {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        if data.len() - pos < LEN_SIZE {
            health.truncated_tails += 1;
            break;
        }
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        if !(ENTRY_HEADER_SIZE..=MAX_ENTRY_LEN).contains(&len) {
            warn!(path = %path.display(), offset = pos, len, "impossible WAL entry length, ending replay");
            health.corrupt_skipped += 1;
            break;
        }
        let end = pos + LEN_SIZE + len + CRC_SIZE;
        if end > data.len() {
            health.truncated_tails += 1;
            break;
        }

        let body = &data[pos + LEN_SIZE..pos + LEN_SIZE + len];
        let crc_at = pos + LEN_SIZE + len;
        let stored_crc = u32::from_le_bytes([
            data[crc_at],
            data[crc_at + 1],
            data[crc_at + 2],
            data[crc_at + 3],
        ]);
        if crc32fast::hash(body) != stored_crc {
            warn!(path = %path.display(), offset = pos, "WAL checksum mismatch, skipping entry");
            health.corrupt_skipped += 1;
            pos = end;
            continue;
        }

        match decode_body(body) {
            Ok(record) => records.push(record),
            Err(reason) => {
                warn!(path = %path.display(), offset = pos, %reason, "undecodable WAL entry, skipping");
                health.corrupt_skipped += 1;
            }
        }
        pos = end;
    }

    (records, pos as u64)
}

fn decode_body(body: &[u8]) -> Result<WalRecord, String> {
    let op = WalOp::from_tag(body[0]).ok_or_else(|| format!("unknown op {}", body[0]))?;
    let stage = Stage::from_tag(body[1]).ok_or_else(|| format!("unknown stage {}", body[1]))?;
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&body[4..12]);
    let frame_id = FrameId::from_le_bytes(id_bytes);

    let entry = StoredEntry::decode(stage, &body[ENTRY_HEADER_SIZE..]).map_err(|e| e.to_string())?;
    if entry.id() != frame_id {
        return Err(format!("entry id {} does not match header id {}", entry.id(), frame_id));
    }
    Ok(WalRecord { op, entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::storage::codec::TombstoneRecord;
    use crate::types::Annotations;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(id: FrameId) -> StoredEntry {
        let mut frame = FrameBuilder::new(1)
            .timestamp(100 + id)
            .field(0, 0.5)
            .level(0, 0, vec![1.0, 0.0, 0.0, 0.0])
            .build()
            .unwrap();
        frame.assign(id, 0);
        StoredEntry::live(Arc::new(frame), Stage::Full, Annotations::default())
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let (mut wal, records) = Wal::open(&path, true).unwrap();
            assert!(records.is_empty());
            wal.append(WalOp::Append, &entry(1)).unwrap();
            wal.append(WalOp::Append, &entry(2)).unwrap();
            let tomb = StoredEntry::Tombstone(TombstoneRecord::new(1, 1, 500, None));
            wal.append(WalOp::Restage, &tomb).unwrap();
            assert_eq!(wal.health().entries_since_flush, 3);
            assert!(wal.health().last_sync.is_some());
        }

        let (wal, records) = Wal::open(&path, true).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op, WalOp::Append);
        assert_eq!(records[1].entry, entry(2));
        assert_eq!(records[2].entry.stage(), Stage::Tombstone);
        assert_eq!(wal.size(), fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_truncated_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let first_len;
        {
            let (mut wal, _) = Wal::open(&path, false).unwrap();
            first_len = wal.append(WalOp::Append, &entry(1)).unwrap();
            wal.append(WalOp::Append, &entry(2)).unwrap();
        }
        // Tear the second entry in half.
        let full = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 10).unwrap();
        drop(file);

        let (mut wal, records) = Wal::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(wal.health().truncated_tails, 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), first_len);

        // New appends land after the last good entry.
        wal.append(WalOp::Append, &entry(3)).unwrap();
        drop(wal);
        let (_, records) = Wal::open(&path, false).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.entry.id()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_checksum_mismatch_skips_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let (mut wal, _) = Wal::open(&path, false).unwrap();
            wal.append(WalOp::Append, &entry(1)).unwrap();
            wal.append(WalOp::Append, &entry(2)).unwrap();
        }
        let mut data = fs::read(&path).unwrap();
        // Flip a byte inside the first entry's payload.
        data[LEN_SIZE + ENTRY_HEADER_SIZE + 20] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let (wal, records) = Wal::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.id(), 2);
        assert_eq!(wal.health().corrupt_skipped, 1);
    }

    #[test]
    fn test_truncate_after_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let (mut wal, _) = Wal::open(&path, false).unwrap();
        let written = wal.append(WalOp::Append, &entry(1)).unwrap();
        assert_eq!(written, framed_len(&entry(1)));
        wal.truncate().unwrap();
        assert_eq!(wal.size(), 0);
        wal.append(WalOp::Append, &entry(2)).unwrap();
        drop(wal);

        let (_, records) = Wal::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.id(), 2);
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let (mut wal, _) = Wal::open(&path, false).unwrap();
        let first_len = wal.append(WalOp::Append, &entry(1)).unwrap();

        // Half an entry reaches the file before the write fails
        wal.fail_after = Some(10);
        assert!(wal.append(WalOp::Append, &entry(2)).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), first_len);
        assert_eq!(wal.size(), first_len);
        assert_eq!(wal.health().entries_since_flush, 1);

        wal.append(WalOp::Append, &entry(3)).unwrap();
        drop(wal);

        let (wal, records) = Wal::open(&path, false).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.entry.id()).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(wal.health().truncated_tails, 0);
        assert_eq!(wal.health().corrupt_skipped, 0);
    }
}
