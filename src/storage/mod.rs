/// Durable, log-structured storage for one partition.
///
/// Every accepted version is written to the partition's WAL and memtable
/// before anything else learns about it. The memtable is flushed into an
/// immutable sorted segment once it grows past the configured size, and the
/// WAL is truncated. Segments are merged by compaction once there are enough
/// of them.
///
/// ```text
/// append ──► WAL (fsync) ──► memtable ──flush──► seg-N.fvs (+ .bloom)
///                                                    │
///                                 compaction ◄───────┘ (≥ max_segments)
/// ```
///
/// A [`PartitionStorage`] is owned by the partition's write section; nothing
/// here is shared with readers.
pub mod codec;
pub mod compaction;
pub mod memtable;
pub mod segment;
pub mod wal;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::concurrency::CancelFlag;
use crate::config::StorageConfig;
use crate::error::{VaultError, VaultResult};
use crate::types::{FrameId, PartitionId};

pub use codec::{EntryView, FrameHeader, LiveEntry, StoredEntry, TombstoneRecord};
pub use compaction::{CompactionStats, Compactor};
pub use memtable::Memtable;
pub use segment::{Segment, quarantine, sidecar_path};
pub use wal::{Wal, WalHealth, WalOp, WalRecord};

const WAL_FILE: &str = "wal.log";
const QUARANTINE_DIR: &str = "quarantine";

/// `<data_dir>/partitions/p<id>`
pub fn partition_dir(data_dir: &Path, partition: PartitionId) -> PathBuf {
    data_dir.join("partitions").join(format!("p{}", partition))
}

/// Parse the partition id out of a `p<id>` directory name.
pub fn parse_partition_dir(name: &str) -> Option<PartitionId> {
    name.strip_prefix('p')?.parse().ok()
}

fn segment_name(seq: u64) -> String {
    format!("seg-{:08}.fvs", seq)
}

fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix("seg-")?.strip_suffix(".fvs")?.parse().ok()
}

/// Latest version per id, as found on disk.
pub type Recovered = BTreeMap<FrameId, StoredEntry>;

/// WAL, memtable and segments of one partition.
#[derive(Debug)]
pub struct PartitionStorage {
    partition: PartitionId,
    dir: PathBuf,
    config: StorageConfig,
    wal: Wal,
    memtable: Memtable,
    /// Oldest first
    segments: Vec<Arc<Segment>>,
    next_segment_seq: u64,
    quarantined: usize,
}

impl PartitionStorage {
    /// Open the partition directory, recovering every persisted version.
    ///
    /// Segments are loaded oldest to newest and the WAL is replayed on top,
    /// so the returned map holds the latest version of each record. Corrupt
    /// segments are quarantined and skipped.
    pub fn open(
        partition: PartitionId,
        dir: &Path,
        config: &StorageConfig,
    ) -> VaultResult<(Self, Recovered)> {
        fs::create_dir_all(dir)?;

        let mut seqs: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(seq) = path.file_name().and_then(|n| n.to_str()).and_then(parse_segment_name) {
                seqs.push((seq, path));
            }
        }
        seqs.sort_by_key(|(seq, _)| *seq);

        let mut recovered = Recovered::new();
        let mut segments = Vec::with_capacity(seqs.len());
        let mut quarantined = 0;
        for (_, path) in &seqs {
            match Segment::open(path) {
                Ok(segment) => {
                    for entry in segment.entries() {
                        match entry {
                            Ok(entry) => {
                                recovered.insert(entry.id(), entry);
                            }
                            Err(e) => warn!(partition, path = %path.display(), error = %e, "skipping corrupt segment entry"),
                        }
                    }
                    segments.push(Arc::new(segment));
                }
                Err(VaultError::Corrupt { reason, .. }) => {
                    warn!(partition, path = %path.display(), %reason, "corrupt segment");
                    quarantine(path, &dir.join(QUARANTINE_DIR))?;
                    quarantined += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let (wal, records) = Wal::open(&dir.join(WAL_FILE), config.sync_writes)?;
        let mut memtable = Memtable::new();
        for record in records {
            recovered.insert(record.entry.id(), record.entry.clone());
            memtable.insert(record.entry);
        }

        let next_segment_seq = seqs.last().map_or(1, |(seq, _)| seq + 1);
        info!(
            partition,
            segments = segments.len(),
            quarantined,
            records = recovered.len(),
            "partition storage opened"
        );

        Ok((
            Self {
                partition,
                dir: dir.to_path_buf(),
                config: config.clone(),
                wal,
                memtable,
                segments,
                next_segment_seq,
                quarantined,
            },
            recovered,
        ))
    }

    /// Durably log one version. The version is acknowledged once this returns.
    ///
    /// # Errors
    ///
    /// [`VaultError::CapacityExceeded`] if the WAL cannot take the entry even
    /// after forcing a flush, or if the disk is full.
    pub fn log(&mut self, op: WalOp, entry: StoredEntry) -> VaultResult<()> {
        let needed = wal::framed_len(&entry);
        if self.wal.size() + needed > self.config.max_wal_bytes {
            self.flush()?;
            if self.wal.size() + needed > self.config.max_wal_bytes {
                return Err(VaultError::CapacityExceeded {
                    partition: self.partition,
                    reason: format!(
                        "entry of {} bytes exceeds WAL limit of {} bytes",
                        needed, self.config.max_wal_bytes
                    ),
                });
            }
        }

        self.wal
            .append(op, &entry)
            .map_err(|e| VaultError::from_append_io(self.partition, e))?;
        self.memtable.insert(entry);

        if self.memtable.approx_bytes() >= self.config.memtable_flush_bytes {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the memtable to a new segment and truncate the WAL.
    ///
    /// Returns `false` if there was nothing to flush.
    pub fn flush(&mut self) -> VaultResult<bool> {
        if self.memtable.is_empty() {
            return Ok(false);
        }
        let entries: Vec<StoredEntry> = self.memtable.iter().cloned().collect();
        let path = self.dir.join(segment_name(self.next_segment_seq));
        let segment = Segment::create(&path, &entries)?;
        self.next_segment_seq += 1;
        self.segments.push(Arc::new(segment));
        self.memtable.drain();
        self.wal.truncate()?;
        info!(partition = self.partition, entries = entries.len(), path = %path.display(), "memtable flushed");
        Ok(true)
    }

    pub fn needs_compaction(&self) -> bool {
        Compactor::should_compact(self.segments.len(), self.config.max_segments)
    }

    /// Merge every segment into one if there are enough of them.
    pub fn compact(&mut self, compactor: &Compactor, cancel: &CancelFlag) -> VaultResult<bool> {
        if !self.needs_compaction() {
            return Ok(false);
        }
        let output = self.dir.join(segment_name(self.next_segment_seq));
        match compactor.merge(&self.segments, &output, cancel)? {
            Some(result) => {
                self.next_segment_seq += 1;
                self.segments = vec![Arc::new(result.produced)];
                debug!(partition = self.partition, "segments replaced by compaction output");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn wal_health(&self) -> WalHealth {
        self.wal.health().clone()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn memtable_len(&self) -> usize {
        self.memtable.len()
    }

    /// Segments moved to `quarantine/` when this partition was opened.
    pub fn quarantined(&self) -> usize {
        self.quarantined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::types::{Annotations, Stage};
    use tempfile::TempDir;

    fn entry(id: FrameId) -> StoredEntry {
        let mut frame = FrameBuilder::new(1)
            .timestamp(id)
            .field(0, 0.5)
            .level(0, 0, vec![0.6, 0.8])
            .build()
            .unwrap();
        frame.assign(id, 0);
        StoredEntry::live(Arc::new(frame), Stage::Full, Annotations::default())
    }

    fn small_config() -> StorageConfig {
        StorageConfig {
            memtable_flush_bytes: 1024,
            sync_writes: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_flush_and_recover() {
        let dir = TempDir::new().unwrap();
        let pdir = partition_dir(dir.path(), 1);
        {
            let (mut storage, recovered) = PartitionStorage::open(1, &pdir, &small_config()).unwrap();
            assert!(recovered.is_empty());
            for id in 1..=20 {
                storage.log(WalOp::Append, entry(id)).unwrap();
            }
            assert!(storage.segment_count() >= 1);
        }
        let (storage, recovered) = PartitionStorage::open(1, &pdir, &small_config()).unwrap();
        assert_eq!(recovered.len(), 20);
        assert_eq!(recovered.keys().copied().collect::<Vec<_>>(), (1..=20).collect::<Vec<_>>());
        assert!(storage.segment_count() >= 1);
    }

    #[test]
    fn test_wal_overrides_segments() {
        let dir = TempDir::new().unwrap();
        let pdir = partition_dir(dir.path(), 2);
        {
            let (mut storage, _) = PartitionStorage::open(2, &pdir, &small_config()).unwrap();
            storage.log(WalOp::Append, entry(1)).unwrap();
            storage.flush().unwrap();
            let tomb = StoredEntry::Tombstone(TombstoneRecord::new(1, 2, 50, None));
            storage.log(WalOp::Restage, tomb).unwrap();
        }
        let (_, recovered) = PartitionStorage::open(2, &pdir, &small_config()).unwrap();
        assert_eq!(recovered[&1].stage(), Stage::Tombstone);
    }

    #[test]
    fn test_capacity_exceeded() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            max_wal_bytes: 64,
            sync_writes: false,
            ..Default::default()
        };
        let (mut storage, _) = PartitionStorage::open(3, &partition_dir(dir.path(), 3), &config).unwrap();
        let err = storage.log(WalOp::Append, entry(1)).unwrap_err();
        assert!(matches!(err, VaultError::CapacityExceeded { partition: 3, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_full_wal_forces_flush() {
        let dir = TempDir::new().unwrap();
        let one = wal::framed_len(&entry(1));
        let config = StorageConfig {
            max_wal_bytes: one * 2,
            sync_writes: false,
            ..Default::default()
        };
        let (mut storage, _) = PartitionStorage::open(4, &partition_dir(dir.path(), 4), &config).unwrap();
        for id in 1..=5 {
            storage.log(WalOp::Append, entry(id)).unwrap();
        }
        assert!(storage.segment_count() >= 2);
        assert!(storage.wal_health().bytes <= one * 2);
    }

    #[test]
    fn test_corrupt_segment_quarantined() {
        let dir = TempDir::new().unwrap();
        let pdir = partition_dir(dir.path(), 5);
        {
            let (mut storage, _) = PartitionStorage::open(5, &pdir, &small_config()).unwrap();
            storage.log(WalOp::Append, entry(1)).unwrap();
            storage.flush().unwrap();
            storage.log(WalOp::Append, entry(2)).unwrap();
            storage.flush().unwrap();
        }
        let victim = pdir.join(segment_name(1));
        let mut bytes = fs::read(&victim).unwrap();
        let n = bytes.len();
        bytes[n - 1] ^= 0xFF;
        fs::write(&victim, bytes).unwrap();

        let (storage, recovered) = PartitionStorage::open(5, &pdir, &small_config()).unwrap();
        assert_eq!(storage.quarantined(), 1);
        assert!(pdir.join(QUARANTINE_DIR).join(segment_name(1)).exists());
        assert!(recovered.contains_key(&2));
        assert!(!recovered.contains_key(&1));
    }

    #[test]
    fn test_compaction_merges_segments() {
        let dir = TempDir::new().unwrap();
        let pdir = partition_dir(dir.path(), 6);
        let (mut storage, _) = PartitionStorage::open(6, &pdir, &small_config()).unwrap();
        for id in 1..=4 {
            storage.log(WalOp::Append, entry(id)).unwrap();
            storage.flush().unwrap();
        }
        assert!(storage.needs_compaction());
        assert!(storage.compact(&Compactor::new(), &CancelFlag::new()).unwrap());
        assert_eq!(storage.segment_count(), 1);
        drop(storage);

        let (_, recovered) = PartitionStorage::open(6, &pdir, &small_config()).unwrap();
        assert_eq!(recovered.len(), 4);
    }

    #[test]
    fn test_dir_names() {
        assert_eq!(parse_partition_dir("p42"), Some(42));
        assert_eq!(parse_partition_dir("q42"), None);
        assert_eq!(parse_segment_name(&segment_name(7)), Some(7));
    }
}
