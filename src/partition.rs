//! One partition ("strand"): its storage, metadata, indexes and epoch.
//!
//! Writers go through [`Partition::commit`], which enters the write section,
//! hands out the next sequence number, runs the caller's mutation and only
//! then publishes the sequence. Readers pin a [`Snapshot`] and skip metadata
//! stamped with a later sequence, so a half-applied write is never visible.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;

use crate::concurrency::{PartitionEpoch, Snapshot, WriteSection};
use crate::config::VaultConfig;
use crate::error::VaultResult;
use crate::index::PartitionIndex;
use crate::lifecycle::ScoreInputs;
use crate::storage::{PartitionStorage, Recovered, partition_dir};
use crate::types::{Annotations, FrameId, PartitionId, RecordSummary, Stage, Tier, Token};

/// Everything the engine tracks about a record besides its payload.
#[derive(Debug, Clone)]
pub struct RecordMeta {
    pub id: FrameId,
    pub partition: PartitionId,
    /// Sequence of the write that created the record
    pub seq: u64,
    pub timestamp: u64,
    pub confidence: f32,
    pub parent_ref: Option<FrameId>,
    pub stage: Stage,
    pub tier: Tier,
    pub annotations: Annotations,
    /// Live records naming this one as their parent
    pub ref_count: u32,
    /// `None` once tombstoned
    pub summary: Option<Arc<[f32]>>,
    pub tokens: Vec<Token>,
    pub died_at: Option<u64>,
}

impl RecordMeta {
    pub fn is_live(&self) -> bool {
        self.stage != Stage::Tombstone
    }

    /// Exempt records never go past Compressed.
    pub fn is_immortal(&self, ref_threshold: u32) -> bool {
        self.confidence >= 1.0 || self.ref_count > ref_threshold || self.annotations.pinned
    }

    /// Scoring inputs, with `age_nanos` measured from `since`.
    pub fn score_inputs(&self, now: u64, since: u64, importance: f32, active: PartitionId) -> ScoreInputs {
        ScoreInputs {
            age_nanos: now.saturating_sub(since),
            confidence: self.confidence,
            refs: self.ref_count,
            importance,
            superseded: self.annotations.superseded_in(active),
            summary: self.annotations.summary,
            distilled: self.annotations.distilled_into.is_some(),
        }
    }

    /// Summary as seen from partition `active`.
    pub fn to_summary(&self, active: PartitionId) -> RecordSummary {
        RecordSummary {
            id: self.id,
            partition: self.partition,
            timestamp: self.timestamp,
            confidence: self.confidence,
            stage: self.stage,
            tier: self.tier,
            parent_ref: self.parent_ref,
            superseded_by: self.annotations.superseded.map(|s| s.winner),
            authoritative: !self.annotations.superseded_in(active),
            similarity: None,
            rank_score: None,
        }
    }
}

/// A partition and everything it owns.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    epoch: PartitionEpoch,
    section: WriteSection<PartitionStorage>,
    meta: DashMap<FrameId, RecordMeta>,
    index: PartitionIndex,
    /// f32 bits
    importance: AtomicU32,
}

impl Partition {
    /// Open the partition's storage and return what it recovered.
    ///
    /// Metadata and indexes start empty; the caller rebuilds them from the
    /// recovered versions before the partition is shared.
    pub fn open(id: PartitionId, config: &VaultConfig) -> VaultResult<(Self, Recovered)> {
        let dir = partition_dir(&config.data_dir, id);
        let (storage, recovered) = PartitionStorage::open(id, &dir, &config.storage)?;
        let partition = Self {
            id,
            epoch: PartitionEpoch::new(0),
            section: WriteSection::new(id, config.storage.write_timeout(), storage),
            meta: DashMap::new(),
            index: PartitionIndex::new(&config.index),
            importance: AtomicU32::new(config.importance_of(id).to_bits()),
        };
        Ok((partition, recovered))
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn index(&self) -> &PartitionIndex {
        &self.index
    }

    /// Pin the current visibility watermark.
    pub fn snapshot(&self) -> Snapshot {
        self.epoch.pin()
    }

    /// Apply one write under the partition's write section.
    ///
    /// `apply` receives the storage and the write's sequence number. The
    /// sequence is published only if `apply` succeeds.
    ///
    /// # Errors
    ///
    /// `ContentionTimeout` if the section stays busy past the configured
    /// timeout, plus whatever `apply` returns.
    pub fn commit<R>(
        &self,
        apply: impl FnOnce(&mut PartitionStorage, u64) -> VaultResult<R>,
    ) -> VaultResult<R> {
        let mut storage = self.section.enter()?;
        let seq = self.epoch.allocate();
        let result = apply(&mut storage, seq)?;
        self.epoch.publish(seq);
        Ok(result)
    }

    /// Run `f` on the storage under the write section without a new sequence.
    pub fn with_storage<R>(&self, f: impl FnOnce(&mut PartitionStorage) -> VaultResult<R>) -> VaultResult<R> {
        let mut storage = self.section.enter()?;
        f(&mut storage)
    }

    pub fn insert_meta(&self, meta: RecordMeta) {
        self.meta.insert(meta.id, meta);
    }

    /// Latest metadata regardless of visibility.
    pub fn meta(&self, id: FrameId) -> Option<RecordMeta> {
        self.meta.get(&id).map(|m| m.clone())
    }

    /// Metadata of a record created at or before `snapshot`.
    pub fn visible(&self, id: FrameId, snapshot: Snapshot) -> Option<RecordMeta> {
        self.meta
            .get(&id)
            .filter(|m| snapshot.sees(m.seq))
            .map(|m| m.clone())
    }

    /// Exclusive handle on one record's metadata. Tier moves happen while
    /// it is held.
    pub fn meta_mut(&self, id: FrameId) -> Option<RefMut<'_, FrameId, RecordMeta>> {
        self.meta.get_mut(&id)
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.meta.contains_key(&id)
    }

    /// Every known id, tombstones included.
    pub fn ids(&self) -> Vec<FrameId> {
        let mut ids: Vec<FrameId> = self.meta.iter().map(|m| *m.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Metadata of every record matching `filter`, in id order.
    pub fn select(&self, filter: impl Fn(&RecordMeta) -> bool) -> Vec<RecordMeta> {
        let mut out: Vec<RecordMeta> = self
            .meta
            .iter()
            .filter(|m| filter(m.value()))
            .map(|m| m.clone())
            .collect();
        out.sort_unstable_by_key(|m| m.id);
        out
    }

    /// Records ever written, tombstones included.
    pub fn record_count(&self) -> usize {
        self.meta.len()
    }

    pub fn live_count(&self) -> usize {
        self.meta.iter().filter(|m| m.is_live()).count()
    }

    /// Add `delta` to a record's reference count.
    pub fn adjust_refs(&self, id: FrameId, delta: i32) -> bool {
        match self.meta.get_mut(&id) {
            Some(mut m) => {
                m.ref_count = m.ref_count.saturating_add_signed(delta);
                true
            }
            None => false,
        }
    }

    pub fn importance(&self) -> f32 {
        f32::from_bits(self.importance.load(Ordering::Relaxed))
    }

    pub fn set_importance(&self, importance: f32) {
        self.importance
            .store(importance.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Make a live record findable through every index.
    pub fn index_record(&self, meta: &RecordMeta) {
        if let Some(summary) = &meta.summary {
            self.index
                .insert(meta.id, meta.timestamp, Arc::clone(summary), &meta.tokens);
        } else {
            self.index.insert_id_only(meta.id);
        }
    }

    /// Grow the membership filter if it has saturated.
    ///
    /// Must run inside [`Partition::with_storage`] or [`Partition::commit`];
    /// an append indexed between the id snapshot and the swap would be
    /// missing from the new filter.
    pub fn maintain_filter(&self) -> bool {
        self.index.grow_filter_if_saturated(self.ids().into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use crate::types::Supersession;
    use tempfile::TempDir;

    fn meta(id: FrameId, seq: u64) -> RecordMeta {
        RecordMeta {
            id,
            partition: 1,
            seq,
            timestamp: id * 10,
            confidence: 0.5,
            parent_ref: None,
            stage: Stage::Full,
            tier: Tier::Hot,
            annotations: Annotations::default(),
            ref_count: 0,
            summary: Some(vec![1.0, 0.0].into()),
            tokens: vec![],
            died_at: None,
        }
    }

    fn config(dir: &TempDir) -> VaultConfig {
        let mut config = VaultConfig::new(dir.path());
        config.storage.sync_writes = false;
        config.storage.write_timeout_ms = 20;
        config
    }

    #[test]
    fn test_commit_publishes_on_success_only() {
        let dir = TempDir::new().unwrap();
        let (partition, recovered) = Partition::open(1, &config(&dir)).unwrap();
        assert!(recovered.is_empty());

        let seq = partition.commit(|_, seq| Ok(seq)).unwrap();
        assert_eq!(partition.snapshot().epoch(), seq);

        let failed: VaultResult<()> = partition.commit(|_, _| Err(VaultError::serialization("nope")));
        assert!(failed.is_err());
        assert_eq!(partition.snapshot().epoch(), seq);
    }

    #[test]
    fn test_visibility_follows_snapshot() {
        let dir = TempDir::new().unwrap();
        let (partition, _) = Partition::open(1, &config(&dir)).unwrap();
        let before = partition.snapshot();
        let seq = partition
            .commit(|_, seq| {
                partition.insert_meta(meta(7, seq));
                Ok(seq)
            })
            .unwrap();
        assert!(partition.visible(7, before).is_none());
        assert!(partition.visible(7, partition.snapshot()).is_some());
        assert_eq!(partition.meta(7).unwrap().seq, seq);
    }

    #[test]
    fn test_contention_timeout() {
        let dir = TempDir::new().unwrap();
        let (partition, _) = Partition::open(2, &config(&dir)).unwrap();
        let err = partition
            .commit(|_, _| partition.commit(|_, _| Ok(())))
            .unwrap_err();
        assert!(matches!(err, VaultError::ContentionTimeout { partition: 2, .. }));
    }

    #[test]
    fn test_summary_scope() {
        let mut m = meta(1, 1);
        m.annotations.superseded = Some(Supersession { winner: 2, scope: 1 });
        assert!(!m.to_summary(1).authoritative);
        assert!(m.to_summary(3).authoritative);
        assert_eq!(m.to_summary(1).superseded_by, Some(2));
    }

    #[test]
    fn test_immortality() {
        let mut m = meta(1, 1);
        assert!(!m.is_immortal(8));
        m.ref_count = 9;
        assert!(m.is_immortal(8));
        m.ref_count = 0;
        m.confidence = 1.0;
        assert!(m.is_immortal(8));
        m.confidence = 0.3;
        m.annotations.pinned = true;
        assert!(m.is_immortal(8));
    }

    #[test]
    fn test_importance_is_clamped() {
        let dir = TempDir::new().unwrap();
        let (partition, _) = Partition::open(3, &config(&dir)).unwrap();
        assert_eq!(partition.importance(), 0.5);
        partition.set_importance(3.0);
        assert_eq!(partition.importance(), 1.0);
    }
}
