/// Cold tier: compressed archives on disk.
///
/// Each partition has its own directory of archive files in the segment
/// format, named `arc-<tmin>-<tmax>-<seq>.fvs`. The list of open archives is
/// published through an `ArcSwap`, so readers never lock it.
///
/// New cold versions (fresh demotions, GC restages, tombstones) first land in
/// a `pending` overlay that reads check before the archives. Sealing a
/// partition writes its pending versions into a new archive.
///
/// ```text
/// demote / restage ──► pending ──seal──► arc-*.fvs ──compact──► arc-*.fvs
/// ```
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::concurrency::CancelFlag;
use crate::error::{VaultError, VaultResult};
use crate::storage::{Compactor, CompactionStats, Segment, StoredEntry, parse_partition_dir, quarantine};
use crate::types::{FrameId, PartitionId};

const QUARANTINE_DIR: &str = "quarantine";

fn archive_name(tmin: u64, tmax: u64, seq: u64) -> String {
    format!("arc-{}-{}-{:08}.fvs", tmin, tmax, seq)
}

fn parse_archive_seq(name: &str) -> Option<u64> {
    let stem = name.strip_prefix("arc-")?.strip_suffix(".fvs")?;
    stem.rsplit('-').next()?.parse().ok()
}

/// Archives and pending versions of one partition.
#[derive(Debug)]
struct ColdPartition {
    dir: PathBuf,
    /// Oldest first
    archives: ArcSwap<Vec<Arc<Segment>>>,
    pending: DashMap<FrameId, StoredEntry>,
    next_seq: AtomicU64,
    /// Serializes seal and compaction, which both replace the archive list
    publish: Mutex<()>,
}

/// Handle on one partition's pending overlay.
#[derive(Debug)]
pub struct PendingSlot(Arc<ColdPartition>);

impl PendingSlot {
    pub fn stage(&self, entry: StoredEntry) {
        self.0.pending.insert(entry.id(), entry);
    }
}

impl ColdPartition {
    fn new(dir: PathBuf, archives: Vec<Arc<Segment>>, next_seq: u64) -> Self {
        Self {
            dir,
            archives: ArcSwap::from_pointee(archives),
            pending: DashMap::new(),
            next_seq: AtomicU64::new(next_seq),
            publish: Mutex::new(()),
        }
    }

    fn load_dir(dir: &Path) -> VaultResult<(Vec<Arc<Segment>>, u64, usize)> {
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(seq) = path.file_name().and_then(|n| n.to_str()).and_then(parse_archive_seq) {
                found.push((seq, path));
            }
        }
        found.sort_by_key(|(seq, _)| *seq);

        let mut archives = Vec::with_capacity(found.len());
        let mut quarantined = 0;
        for (_, path) in &found {
            match Segment::open(path) {
                Ok(archive) => archives.push(Arc::new(archive)),
                Err(VaultError::Corrupt { reason, .. }) => {
                    warn!(path = %path.display(), %reason, "corrupt archive");
                    quarantine(path, &dir.join(QUARANTINE_DIR))?;
                    quarantined += 1;
                }
                Err(e) => return Err(e),
            }
        }
        let next_seq = found.last().map_or(1, |(seq, _)| seq + 1);
        Ok((archives, next_seq, quarantined))
    }

    fn get(&self, id: FrameId) -> VaultResult<Option<StoredEntry>> {
        if let Some(entry) = self.pending.get(&id) {
            return Ok(Some(entry.clone()));
        }
        let archives = self.archives.load();
        for archive in archives.iter().rev() {
            if !archive.may_contain(id) {
                continue;
            }
            match archive.get(id) {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %archive.path().display(), frame_id = id, error = %e, "skipping corrupt archive entry");
                }
            }
        }
        Ok(None)
    }

    fn archived(&self, id: FrameId) -> VaultResult<Option<StoredEntry>> {
        let archives = self.archives.load();
        for archive in archives.iter().rev() {
            if !archive.may_contain(id) {
                continue;
            }
            match archive.get(id) {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %archive.path().display(), frame_id = id, error = %e, "skipping corrupt archive entry");
                }
            }
        }
        Ok(None)
    }

    fn next_path(&self, tmin: u64, tmax: u64) -> PathBuf {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.dir.join(archive_name(tmin, tmax, seq))
    }

    fn seal(&self, partition: PartitionId) -> VaultResult<Option<PathBuf>> {
        let _publish = self.publish.lock();
        let sealed: Vec<StoredEntry> = self.pending.iter().map(|e| e.value().clone()).collect();
        if sealed.is_empty() {
            return Ok(None);
        }
        let tmin = sealed.iter().map(|e| e.timestamp()).min().unwrap_or(0);
        let tmax = sealed.iter().map(|e| e.timestamp()).max().unwrap_or(0);
        let path = self.next_path(tmin, tmax);
        let archive = Arc::new(Segment::create(&path, &sealed)?);

        self.archives.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&archive));
            next
        });
        // Versions restaged while sealing stay pending
        for entry in &sealed {
            self.pending.remove_if(&entry.id(), |_, v| v == entry);
        }
        info!(partition, entries = sealed.len(), path = %path.display(), "pending versions sealed into archive");
        Ok(Some(path))
    }

    fn compact(
        &self,
        partition: PartitionId,
        max_archives: usize,
        compactor: &Compactor,
        cancel: &CancelFlag,
    ) -> VaultResult<bool> {
        let _publish = self.publish.lock();
        let inputs = self.archives.load_full();
        if inputs.len() <= max_archives || !Compactor::should_compact(inputs.len(), 2) {
            return Ok(false);
        }
        let spans: Vec<(u64, u64)> = inputs.iter().filter_map(|a| a.time_span()).collect();
        let tmin = spans.iter().map(|s| s.0).min().unwrap_or(0);
        let tmax = spans.iter().map(|s| s.1).max().unwrap_or(0);
        let output = self.next_path(tmin, tmax);

        match compactor.merge(&inputs, &output, cancel)? {
            Some(result) => {
                self.archives.store(Arc::new(vec![Arc::new(result.produced)]));
                info!(partition, merged = inputs.len(), "archives compacted");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// The cold tier.
#[derive(Debug)]
pub struct ColdTier {
    root: PathBuf,
    partitions: DashMap<PartitionId, Arc<ColdPartition>>,
    max_archives: usize,
    compactor: Compactor,
    quarantined: AtomicU64,
}

impl ColdTier {
    /// Open every partition's archives under `root` (`<data_dir>/cold`).
    pub fn open(root: &Path, max_archives: usize) -> VaultResult<Self> {
        fs::create_dir_all(root)?;
        let partitions = DashMap::new();
        let mut quarantined = 0u64;
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            let Some(partition) = path.file_name().and_then(|n| n.to_str()).and_then(parse_partition_dir) else {
                continue;
            };
            if !path.is_dir() {
                continue;
            }
            let (archives, next_seq, bad) = ColdPartition::load_dir(&path)?;
            quarantined += bad as u64;
            debug!(partition, archives = archives.len(), "cold partition opened");
            partitions.insert(partition, Arc::new(ColdPartition::new(path, archives, next_seq)));
        }
        Ok(Self {
            root: root.to_path_buf(),
            partitions,
            max_archives,
            compactor: Compactor::new(),
            quarantined: AtomicU64::new(quarantined),
        })
    }

    fn partition(&self, partition: PartitionId) -> VaultResult<Arc<ColdPartition>> {
        if let Some(p) = self.partitions.get(&partition) {
            return Ok(Arc::clone(&p));
        }
        let dir = self.root.join(format!("p{}", partition));
        fs::create_dir_all(&dir)?;
        Ok(Arc::clone(
            self.partitions
                .entry(partition)
                .or_insert_with(|| Arc::new(ColdPartition::new(dir, Vec::new(), 1)))
                .value(),
        ))
    }

    /// Open `partition`'s pending overlay, creating its directory if needed.
    ///
    /// Callers that log a move before staging it take the slot first, so
    /// nothing can fail between the log write and the stage.
    pub fn pending_slot(&self, partition: PartitionId) -> VaultResult<PendingSlot> {
        self.partition(partition).map(PendingSlot)
    }

    /// Add a cold version to the pending overlay.
    pub fn stage(&self, entry: StoredEntry) -> VaultResult<()> {
        self.pending_slot(entry.partition())?.stage(entry);
        Ok(())
    }

    /// Latest cold version of `id`: pending first, then newest archive first.
    pub fn get(&self, partition: PartitionId, id: FrameId) -> VaultResult<Option<StoredEntry>> {
        match self.partitions.get(&partition).map(|p| Arc::clone(&p)) {
            Some(cold) => cold.get(id),
            None => Ok(None),
        }
    }

    /// Version of `id` sealed into an archive, ignoring pending.
    pub fn archived(&self, partition: PartitionId, id: FrameId) -> VaultResult<Option<StoredEntry>> {
        match self.partitions.get(&partition).map(|p| Arc::clone(&p)) {
            Some(cold) => cold.archived(id),
            None => Ok(None),
        }
    }

    /// Write `partition`'s pending versions into a new archive.
    pub fn seal(&self, partition: PartitionId) -> VaultResult<Option<PathBuf>> {
        match self.partitions.get(&partition).map(|p| Arc::clone(&p)) {
            Some(cold) => cold.seal(partition),
            None => Ok(None),
        }
    }

    /// Seal every partition with pending versions.
    pub fn seal_all(&self) -> VaultResult<usize> {
        let mut sealed = 0;
        for partition in self.partition_ids() {
            if self.seal(partition)?.is_some() {
                sealed += 1;
            }
        }
        Ok(sealed)
    }

    /// Merge a partition's archives once it has more than the configured
    /// maximum.
    pub fn compact(&self, partition: PartitionId, cancel: &CancelFlag) -> VaultResult<bool> {
        match self.partitions.get(&partition).map(|p| Arc::clone(&p)) {
            Some(cold) => cold.compact(partition, self.max_archives, &self.compactor, cancel),
            None => Ok(false),
        }
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.iter().map(|p| *p.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn archive_count(&self, partition: PartitionId) -> usize {
        self.partitions
            .get(&partition)
            .map_or(0, |p| p.archives.load().len())
    }

    pub fn pending_count(&self, partition: PartitionId) -> usize {
        self.partitions.get(&partition).map_or(0, |p| p.pending.len())
    }

    pub fn stats(&self) -> ColdStats {
        let mut archives = 0;
        let mut pending = 0;
        let mut archived_entries = 0;
        for p in self.partitions.iter() {
            let list = p.archives.load();
            archives += list.len();
            archived_entries += list.iter().map(|a| a.len()).sum::<usize>();
            pending += p.pending.len();
        }
        ColdStats {
            partitions: self.partitions.len(),
            archives,
            archived_entries,
            pending,
            quarantined: self.quarantined.load(Ordering::Relaxed),
            compaction: self.compactor.stats(),
        }
    }
}

/// Cold tier statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ColdStats {
    pub partitions: usize,
    pub archives: usize,
    /// Entries across every archive, shadowed versions included
    pub archived_entries: usize,
    pub pending: usize,
    pub quarantined: u64,
    pub compaction: CompactionStats,
}
