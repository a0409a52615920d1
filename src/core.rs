/// Core framevault engine.
///
/// This module provides the main user-facing API. [`FrameVault`] ties the
/// per-partition storage, indexes and epochs to the shared memory tiers and
/// background processes, and hides every tier move behind a handful of
/// calls: append, query, fetch, recall.
///
/// # Design Philosophy
///
/// - **Durable first**: nothing is indexed or placed in a tier before its
///   WAL entry is written
/// - **Lock-free reads**: readers pin a partition snapshot and never touch
///   a write section
/// - **One owner per move**: a record changes tier only while its metadata
///   entry is held, and lands in the new tier before it leaves the old one
///
/// # Lock order
///
/// partition write section, then a record's metadata entry, then the tier
/// maps. Nothing that already holds a metadata entry takes another one.
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::concurrency::CancelFlag;
use crate::config::VaultConfig;
use crate::context::VaultContext;
use crate::error::{VaultError, VaultResult};
use crate::frame::Frame;
use crate::index::RangeCursor;
use crate::lifecycle::eviction_score;
use crate::memory::{ColdStats, ColdTier, Ghost, GhostSet, HotStats, HotTier, WarmStats, WarmTier};
use crate::partition::{Partition, RecordMeta};
use crate::processes::{
    ArchiveReport, BackgroundWorkers, BleedStats, CoherenceReport, CoherenceStats, DistillStats, GcReport,
    GcStats, ProcessRunner,
};
use crate::query::{FrameQuery, RangeIter, rank};
use crate::storage::{
    CompactionStats, Compactor, Recovered, StoredEntry, TombstoneRecord, WalHealth, WalOp, parse_partition_dir,
};
use crate::store::{self, FrameStore};
use crate::types::{
    Annotations, FrameId, PartitionId, RecordSummary, Stage, Supersession, Tier, Token, normalize, now_nanos,
};

const PARTITIONS_DIR: &str = "partitions";
const COLD_DIR: &str = "cold";

/// Result of a restage under the write section.
enum Restaged {
    Unchanged,
    Moved,
    Died { parent: Option<FrameId> },
}

/// Shared state behind every [`FrameVault`] handle and background worker.
#[derive(Debug)]
pub(crate) struct VaultInner {
    pub(crate) config: VaultConfig,
    pub(crate) context: VaultContext,
    partitions: DashMap<PartitionId, Arc<Partition>>,
    next_id: AtomicU64,
    pub(crate) hot: HotTier,
    /// Evicted from hot, not yet settled into warm
    in_flight: DashMap<FrameId, Arc<Frame>>,
    pub(crate) warm: WarmTier,
    pub(crate) cold: ColdTier,
    pub(crate) ghosts: GhostSet,
    pub(crate) processes: ProcessRunner,
    compactor: Compactor,
    pub(crate) cancel: CancelFlag,
    last_append: AtomicU64,
}

impl VaultInner {
    fn open(config: VaultConfig, context: VaultContext) -> VaultResult<Self> {
        config.validate()?;
        if context.codebook.dim() != config.record.vector_dim {
            return Err(VaultError::InvalidConfig(format!(
                "codebook dimension {} does not match record.vector_dim {}",
                context.codebook.dim(),
                config.record.vector_dim
            )));
        }
        fs::create_dir_all(&config.data_dir)?;
        let cold = ColdTier::open(&config.data_dir.join(COLD_DIR), config.tiers.max_archives)?;
        let now = now_nanos();

        let inner = Self {
            hot: HotTier::new(config.tiers.hot_capacity, config.tiers.hot_high_water()),
            warm: WarmTier::new(config.tiers.warm_capacity),
            ghosts: GhostSet::new(config.tiers.ghost_capacity),
            processes: ProcessRunner::from_config(&config),
            cold,
            context,
            partitions: DashMap::new(),
            next_id: AtomicU64::new(1),
            in_flight: DashMap::new(),
            compactor: Compactor::new(),
            cancel: CancelFlag::new(),
            last_append: AtomicU64::new(now),
            config,
        };

        let root = inner.config.data_dir.join(PARTITIONS_DIR);
        fs::create_dir_all(&root)?;
        let mut ids = Vec::new();
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(id) = path.file_name().and_then(|n| n.to_str()).and_then(parse_partition_dir) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut max_id = 0;
        for id in ids {
            let (partition, recovered) = Partition::open(id, &inner.config)?;
            if let Some(last) = recovered.keys().next_back() {
                max_id = max_id.max(*last);
            }
            inner.restore(&partition, recovered, now)?;
            inner.partitions.insert(id, Arc::new(partition));
        }
        inner.recount_refs();
        inner.next_id.store(max_id + 1, Ordering::SeqCst);

        info!(
            data_dir = %inner.config.data_dir.display(),
            partitions = inner.partitions.len(),
            warm = inner.warm.len(),
            next_id = max_id + 1,
            "vault opened"
        );
        Ok(inner)
    }

    /// Rebuild metadata, indexes and tier placement from recovered versions.
    fn restore(&self, partition: &Partition, recovered: Recovered, now: u64) -> VaultResult<()> {
        let p = partition.id();
        for (id, entry) in recovered {
            let meta = match &entry {
                StoredEntry::Tombstone(t) => RecordMeta {
                    id,
                    partition: p,
                    seq: 0,
                    timestamp: t.died_at,
                    confidence: 0.0,
                    parent_ref: None,
                    stage: Stage::Tombstone,
                    tier: Tier::Cold,
                    annotations: Annotations {
                        superseded: (t.superseded_by != 0).then_some(Supersession {
                            winner: t.superseded_by,
                            scope: p,
                        }),
                        ..Default::default()
                    },
                    ref_count: 0,
                    summary: None,
                    tokens: Vec::new(),
                    died_at: Some(t.died_at),
                },
                StoredEntry::Live(live) => {
                    let frame = &live.frame;
                    let archived = live.stage != Stage::Full || self.cold.archived(p, id)?.is_some();
                    RecordMeta {
                        id,
                        partition: p,
                        seq: 0,
                        timestamp: frame.timestamp(),
                        confidence: frame.confidence(),
                        parent_ref: frame.parent_ref(),
                        stage: live.stage,
                        tier: if archived { Tier::Cold } else { Tier::Warm },
                        annotations: live.annotations,
                        ref_count: 0,
                        summary: frame.summary_vector().map(Arc::from),
                        tokens: self.context.codebook.tokens_of(frame),
                        died_at: None,
                    }
                }
            };

            if meta.tier == Tier::Warm {
                if let StoredEntry::Live(live) = &entry {
                    self.warm.insert(Arc::clone(&live.frame), now);
                }
            } else if self.cold.get(p, id)?.as_ref() != Some(&entry) {
                self.cold.stage(entry)?;
            }
            partition.index_record(&meta);
            partition.insert_meta(meta);
        }
        Ok(())
    }

    fn recount_refs(&self) {
        let mut counts: HashMap<FrameId, i32> = HashMap::new();
        for partition in self.partitions() {
            for meta in partition.select(|m| m.is_live() && m.parent_ref.is_some()) {
                if let Some(parent) = meta.parent_ref {
                    *counts.entry(parent).or_default() += 1;
                }
            }
        }
        for (parent, refs) in counts {
            if let Some(owner) = self.find_partition_of(parent) {
                owner.adjust_refs(parent, refs);
            }
        }
    }

    // ── Partitions ─────────────────────────────────────────────────────

    pub(crate) fn partition(&self, partition: PartitionId) -> Option<Arc<Partition>> {
        self.partitions.get(&partition).map(|p| Arc::clone(p.value()))
    }

    /// Every open partition, by id.
    pub(crate) fn partitions(&self) -> Vec<Arc<Partition>> {
        let mut all: Vec<Arc<Partition>> = self.partitions.iter().map(|p| Arc::clone(p.value())).collect();
        all.sort_by_key(|p| p.id());
        all
    }

    fn open_partition(&self, partition: PartitionId) -> VaultResult<Arc<Partition>> {
        if let Some(existing) = self.partition(partition) {
            return Ok(existing);
        }
        let entry = self.partitions.entry(partition).or_try_insert_with(|| {
            let (opened, recovered) = Partition::open(partition, &self.config)?;
            self.restore(&opened, recovered, now_nanos())?;
            debug!(partition, "partition created");
            Ok::<_, VaultError>(Arc::new(opened))
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Partition owning `id`, found through the membership filters.
    pub(crate) fn find_partition_of(&self, id: FrameId) -> Option<Arc<Partition>> {
        self.partitions
            .iter()
            .find(|p| p.index().filter.may_contain_id(id) && p.contains(id))
            .map(|p| Arc::clone(p.value()))
    }

    pub(crate) fn is_in_flight(&self, id: FrameId) -> bool {
        self.in_flight.contains_key(&id)
    }

    pub(crate) fn last_append(&self) -> u64 {
        self.last_append.load(Ordering::Relaxed)
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// The write path shared by producers and distillation.
    pub(crate) fn write_frame(&self, mut frame: Frame, annotations: Annotations) -> VaultResult<FrameId> {
        frame.validate(self.config.record.vector_dim, self.config.record.max_payload_bytes)?;
        let summary: Arc<[f32]> = frame
            .summary_vector()
            .ok_or_else(|| VaultError::serialization("fields cancel out to a zero summary vector"))?
            .into();
        let tokens = self.context.codebook.tokens_of(&frame);
        let partition = self.open_partition(frame.partition())?;
        let now = now_nanos();

        let frame = partition.commit(|storage, seq| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            frame.assign(id, now);
            let frame = Arc::new(frame);
            storage.log(
                WalOp::Append,
                StoredEntry::live(Arc::clone(&frame), Stage::Full, annotations),
            )?;

            let meta = RecordMeta {
                id,
                partition: frame.partition(),
                seq,
                timestamp: frame.timestamp(),
                confidence: frame.confidence(),
                parent_ref: frame.parent_ref(),
                stage: Stage::Full,
                tier: Tier::Hot,
                annotations,
                ref_count: 0,
                summary: Some(summary),
                tokens,
                died_at: None,
            };
            partition.index_record(&meta);
            partition.insert_meta(meta);
            self.hot.insert(Arc::clone(&frame), now);
            Ok(frame)
        })?;

        let id = frame.id();
        if let Some(parent) = frame.parent_ref() {
            if let Some(owner) = self.find_partition_of(parent) {
                owner.adjust_refs(parent, 1);
            }
        }
        self.last_append.fetch_max(now, Ordering::Relaxed);
        trace!(partition = frame.partition(), frame_id = id, "frame appended");

        self.processes.bleed.enqueue_prefetch(frame.partition(), id);
        self.evict_if_needed(now);
        Ok(id)
    }

    /// Durably replace a record's annotations.
    ///
    /// Returns false if the record is unknown, dead, or already carries the
    /// resulting annotations.
    pub(crate) fn annotate(
        &self,
        partition: &Partition,
        id: FrameId,
        update: impl FnOnce(&mut Annotations),
    ) -> VaultResult<bool> {
        partition.commit(|storage, _| {
            let Some(mut meta) = partition.meta_mut(id) else {
                return Ok(false);
            };
            if !meta.is_live() {
                return Ok(false);
            }
            let mut annotations = meta.annotations;
            update(&mut annotations);
            if annotations == meta.annotations {
                return Ok(false);
            }
            let Some(frame) = self.resident_frame(&meta)? else {
                return Err(VaultError::missing_frame(partition.id(), id));
            };

            let slot = match meta.tier {
                Tier::Cold => Some(self.cold.pending_slot(partition.id())?),
                _ => None,
            };

            let entry = StoredEntry::live(frame, meta.stage, annotations);
            storage.log(WalOp::Annotate, entry.clone())?;
            if let Some(slot) = slot {
                slot.stage(entry);
            }
            meta.annotations = annotations;
            debug!(partition = partition.id(), frame_id = id, "annotations updated");
            Ok(true)
        })
    }

    /// Step a warm or cold record down to `target`, moving it into cold.
    pub(crate) fn restage(&self, partition: &Partition, id: FrameId, target: Stage, now: u64) -> VaultResult<bool> {
        let outcome = partition.commit(|storage, _| {
            let Some(mut meta) = partition.meta_mut(id) else {
                return Ok(Restaged::Unchanged);
            };
            if !meta.is_live() || target >= meta.stage || meta.tier == Tier::Hot || self.is_in_flight(id) {
                return Ok(Restaged::Unchanged);
            }

            let entry = if target == Stage::Tombstone {
                StoredEntry::Tombstone(TombstoneRecord::new(
                    id,
                    partition.id(),
                    now,
                    meta.annotations.superseded.map(|s| s.winner),
                ))
            } else {
                let Some(frame) = self.resident_frame(&meta)? else {
                    warn!(partition = partition.id(), frame_id = id, "no resident copy to restage");
                    return Ok(Restaged::Unchanged);
                };
                StoredEntry::live(Arc::new(frame.compressed_to(target)), target, meta.annotations)
            };

            let slot = self.cold.pending_slot(partition.id())?;
            storage.log(WalOp::Restage, entry.clone())?;
            slot.stage(entry);
            self.warm.demote(id);
            meta.stage = target;
            meta.tier = Tier::Cold;

            if target != Stage::Tombstone {
                return Ok(Restaged::Moved);
            }
            partition.index().remove(id, meta.timestamp, &meta.tokens);
            meta.died_at = Some(now);
            meta.summary = None;
            meta.tokens.clear();
            Ok(Restaged::Died {
                parent: meta.parent_ref,
            })
        })?;

        match outcome {
            Restaged::Unchanged => Ok(false),
            Restaged::Moved => {
                self.ghosts.relocate(id, Tier::Cold);
                Ok(true)
            }
            Restaged::Died { parent } => {
                self.ghosts.remove(id);
                if let Some(parent) = parent {
                    if let Some(owner) = self.find_partition_of(parent) {
                        owner.adjust_refs(parent, -1);
                    }
                }
                debug!(partition = partition.id(), frame_id = id, "record tombstoned");
                Ok(true)
            }
        }
    }

    /// Move a settled warm record into the cold pending overlay, compressed.
    pub(crate) fn demote_to_cold(&self, partition: &Partition, id: FrameId, now: u64) -> VaultResult<bool> {
        let moved = partition.commit(|storage, _| {
            let Some(mut meta) = partition.meta_mut(id) else {
                return Ok(false);
            };
            if !meta.is_live() || meta.tier != Tier::Warm || self.is_in_flight(id) {
                return Ok(false);
            }
            let Some(frame) = self.warm.peek(id) else {
                return Ok(false);
            };

            let stage = meta.stage.min(Stage::Compressed);
            let entry = StoredEntry::live(Arc::new(frame.compressed_to(stage)), stage, meta.annotations);
            let slot = self.cold.pending_slot(partition.id())?;
            if stage != meta.stage {
                storage.log(WalOp::Restage, entry.clone())?;
            }
            slot.stage(entry);
            self.warm.demote(id);
            meta.stage = stage;
            meta.tier = Tier::Cold;
            Ok(true)
        })?;
        if moved {
            self.ghosts.relocate(id, Tier::Cold);
            trace!(partition = partition.id(), frame_id = id, at = now, "archived to cold");
        }
        Ok(moved)
    }

    // ── Tier movement ──────────────────────────────────────────────────

    /// Evict the lowest scoring hot records until the tier is back at its
    /// high-water mark.
    pub(crate) fn evict_if_needed(&self, now: u64) {
        if !self.hot.needs_eviction() {
            return;
        }
        let Some(token) = self.hot.begin_eviction() else {
            return;
        };
        let weights = self.config.tiers.eviction;
        let victims = self.hot.select_victims(&token, |frame, last_access| {
            let Some(partition) = self.partition(frame.partition()) else {
                return f32::MIN;
            };
            partition.meta(frame.id()).map_or(f32::MIN, |meta| {
                let inputs = meta.score_inputs(now, last_access, partition.importance(), meta.partition);
                eviction_score(&weights, &inputs)
            })
        });
        for id in victims {
            self.evict(id, now);
        }
        drop(token);
    }

    fn evict(&self, id: FrameId, now: u64) {
        let Some(partition) = self.hot.peek(id).and_then(|f| self.partition(f.partition())) else {
            return;
        };
        let ghost = {
            let Some(mut meta) = partition.meta_mut(id) else {
                return;
            };
            if meta.tier != Tier::Hot {
                return;
            }
            let Some(frame) = self.hot.peek(id) else {
                return;
            };
            self.in_flight.insert(id, frame);
            self.hot.remove(id);
            meta.tier = Tier::Warm;
            meta.summary.clone().map(|summary| Ghost {
                id,
                partition: meta.partition,
                timestamp: meta.timestamp,
                confidence: meta.confidence,
                summary,
                location: Tier::Warm,
                evicted_at: now,
            })
        };
        if let Some(ghost) = ghost {
            self.ghosts.insert(ghost);
        }
        self.hot.record_eviction();
        trace!(partition = partition.id(), frame_id = id, "evicted to warm");

        if !self.processes.bleed.enqueue_consolidate(partition.id(), id) {
            self.processes.bleed.record_inline_consolidation();
            self.consolidate(partition.id(), id);
        }
    }

    /// Settle an evicted record into warm. Returns whether it moved.
    pub(crate) fn consolidate(&self, partition: PartitionId, id: FrameId) -> bool {
        let Some(part) = self.partition(partition) else {
            self.in_flight.remove(&id);
            return false;
        };
        let Some(meta) = part.meta_mut(id) else {
            self.in_flight.remove(&id);
            return false;
        };
        let flying = self.in_flight.get(&id).map(|f| Arc::clone(f.value()));
        let Some(frame) = flying else {
            return false;
        };
        if meta.tier == Tier::Warm {
            self.warm.insert(frame, now_nanos());
        }
        self.in_flight.remove(&id);
        drop(meta);
        true
    }

    /// Bring a live record into hot from wherever it is.
    pub(crate) fn promote(&self, partition: &Partition, id: FrameId) -> VaultResult<Option<Arc<Frame>>> {
        let now = now_nanos();
        let frame = {
            let Some(mut meta) = partition.meta_mut(id) else {
                return Ok(None);
            };
            if !meta.is_live() {
                return Ok(None);
            }
            let frame = match meta.tier {
                Tier::Hot => self.hot.get(id, now),
                Tier::Warm => {
                    let flying = self.in_flight.get(&id).map(|f| Arc::clone(f.value()));
                    match flying {
                        Some(frame) => {
                            self.hot.insert(Arc::clone(&frame), now);
                            self.in_flight.remove(&id);
                            Some(frame)
                        }
                        None => match self.warm.peek(id) {
                            Some(frame) => {
                                self.hot.insert(Arc::clone(&frame), now);
                                self.warm.promote(id);
                                Some(frame)
                            }
                            None => None,
                        },
                    }
                }
                Tier::Cold => match self.cold.get(partition.id(), id)? {
                    Some(StoredEntry::Live(live)) => {
                        self.hot.insert(Arc::clone(&live.frame), now);
                        Some(live.frame)
                    }
                    _ => None,
                },
            };
            match frame {
                Some(_) => meta.tier = Tier::Hot,
                None => warn!(partition = partition.id(), frame_id = id, tier = %meta.tier, "record missing from its tier"),
            }
            frame
        };

        if frame.is_some() {
            self.ghosts.remove(id);
            self.evict_if_needed(now);
        }
        Ok(frame)
    }

    /// Recall every ghost of `partition` at least `threshold` similar to
    /// the (normalized) `query`.
    fn recall_similar(&self, partition: &Partition, query: &[f32], threshold: f32) -> VaultResult<Vec<Arc<Frame>>> {
        let mut recalled = Vec::new();
        for (ghost, similarity) in self.ghosts.similar(partition.id(), query, threshold) {
            if let Some(frame) = self.promote(partition, ghost.id)? {
                self.processes.bleed.record_recall();
                debug!(partition = partition.id(), frame_id = ghost.id, similarity, "ghost recalled");
                recalled.push(frame);
            }
        }
        Ok(recalled)
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Current payload of a record without counting an access. Callers
    /// hold the record's metadata entry.
    fn resident_frame(&self, meta: &RecordMeta) -> VaultResult<Option<Arc<Frame>>> {
        if let Some(frame) = self.hot.peek(meta.id) {
            return Ok(Some(frame));
        }
        let flying = self.in_flight.get(&meta.id).map(|f| Arc::clone(f.value()));
        if flying.is_some() {
            return Ok(flying);
        }
        if let Some(frame) = self.warm.peek(meta.id) {
            return Ok(Some(frame));
        }
        Ok(self
            .cold
            .get(meta.partition, meta.id)?
            .and_then(|e| e.as_live().map(|l| Arc::clone(&l.frame))))
    }

    /// Find a record's payload, checking the tiers from fastest to slowest.
    ///
    /// A record moving between tiers can be missed by every lookup; if its
    /// metadata still says it is live, the lookups are tried once more.
    fn locate(&self, partition: &Partition, id: FrameId) -> VaultResult<Option<Arc<Frame>>> {
        let now = now_nanos();
        for _ in 0..2 {
            if let Some(frame) = self.hot.get(id, now) {
                return Ok(Some(frame));
            }
            let flying = self.in_flight.get(&id).map(|f| Arc::clone(f.value()));
            if flying.is_some() {
                return Ok(flying);
            }
            if let Some(frame) = self.warm.get(id, now) {
                return Ok(Some(frame));
            }
            if let Some(entry) = self.cold.get(partition.id(), id)? {
                return Ok(entry.as_live().map(|l| Arc::clone(&l.frame)));
            }
            if !partition.meta(id).is_some_and(|m| m.is_live()) {
                break;
            }
        }
        Ok(None)
    }

    fn query_vector(&self, vector: &[f32]) -> VaultResult<Vec<f32>> {
        let dim = self.config.record.vector_dim;
        if vector.len() != dim {
            return Err(VaultError::serialization(format!(
                "query vector has dimension {}, expected {}",
                vector.len(),
                dim
            )));
        }
        let mut query = vector.to_vec();
        if !normalize(&mut query) {
            return Err(VaultError::serialization("query vector is zero or non-finite"));
        }
        Ok(query)
    }

    /// Similarity hits of one partition, ranked from `active`'s point of view.
    fn similar_candidates(
        &self,
        partition: &Partition,
        query: &[f32],
        fetch: usize,
        active: PartitionId,
    ) -> Vec<RecordSummary> {
        let snapshot = partition.snapshot();
        let penalty = self.config.coherence.rank_penalty;
        partition
            .index()
            .similarity
            .search_default(query, fetch)
            .into_iter()
            .filter_map(|hit| {
                let meta = partition.visible(hit.id, snapshot).filter(|m| m.is_live())?;
                let mut summary = meta.to_summary(active);
                summary.similarity = Some(hit.similarity);
                summary.rank_score = Some(if summary.authoritative {
                    hit.similarity
                } else {
                    hit.similarity - penalty
                });
                Some(summary)
            })
            .collect()
    }

    // ── Maintenance ────────────────────────────────────────────────────

    pub(crate) fn flush(&self) -> VaultResult<usize> {
        let mut flushed = 0;
        for partition in self.partitions() {
            if partition.with_storage(|storage| storage.flush())? {
                flushed += 1;
            }
        }
        self.cold.seal_all()?;
        Ok(flushed)
    }

    pub(crate) fn compact(&self) -> VaultResult<usize> {
        let mut compacted = 0;
        for partition in self.partitions() {
            if self.cancel.is_cancelled() {
                return Ok(compacted);
            }
            // The filter swap shares the section with appends so none is lost
            let merged = partition.with_storage(|storage| {
                let merged = storage.compact(&self.compactor, &self.cancel)?;
                partition.maintain_filter();
                Ok(merged)
            })?;
            if merged {
                compacted += 1;
            }
        }
        for partition in self.cold.partition_ids() {
            if self.cold.compact(partition, &self.cancel)? {
                compacted += 1;
            }
        }
        Ok(compacted)
    }

    pub(crate) fn archive_pass_at(&self, now: u64) -> VaultResult<ArchiveReport> {
        self.processes
            .bleed
            .archive_pass(self, &self.config.tiers, now, &self.cancel)
    }

    pub(crate) fn collect_garbage_at(&self, now: u64) -> VaultResult<GcReport> {
        self.processes.gc.collect(self, now, &self.cancel)
    }

    pub(crate) fn coherence_pass(&self) -> VaultResult<CoherenceReport> {
        self.processes.coherence.scan(self, &self.cancel)
    }

    fn maintenance_cycle_at(&self, now: u64) -> VaultResult<MaintenanceReport> {
        let mut bleed_jobs = self.processes.bleed.drain(self);
        let archive = self.archive_pass_at(now)?;
        let compactions = self.compact()?;
        let gc = self.collect_garbage_at(now)?;
        let coherence = self.coherence_pass()?;
        bleed_jobs += self.processes.bleed.drain(self);
        Ok(MaintenanceReport {
            bleed_jobs,
            archive,
            compactions,
            gc,
            coherence,
        })
    }

    fn stats(&self) -> VaultResult<VaultStats> {
        let mut partitions = Vec::new();
        for partition in self.partitions() {
            let (segments, memtable, quarantined, wal) = partition.with_storage(|storage| {
                Ok((
                    storage.segment_count(),
                    storage.memtable_len(),
                    storage.quarantined(),
                    storage.wal_health(),
                ))
            })?;
            partitions.push(PartitionStats {
                id: partition.id(),
                records: partition.record_count(),
                live: partition.live_count(),
                importance: partition.importance(),
                segments,
                memtable,
                quarantined,
                wal,
                archives: self.cold.archive_count(partition.id()),
                pending: self.cold.pending_count(partition.id()),
            });
        }
        Ok(VaultStats {
            partitions,
            hot: self.hot.stats(),
            warm: self.warm.stats(),
            cold: self.cold.stats(),
            ghosts: self.ghosts.len(),
            ghost_capacity: self.ghosts.capacity(),
            in_flight: self.in_flight.len(),
            gc: self.processes.gc.stats(),
            bleed: self.processes.bleed.stats(),
            distillation: self.processes.distiller.stats(),
            coherence: self.processes.coherence.stats(),
            storage_compaction: self.compactor.stats(),
        })
    }
}

/// Per-partition section of [`VaultStats`].
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    pub id: PartitionId,
    /// Records ever written, tombstones included
    pub records: usize,
    pub live: usize,
    pub importance: f32,
    pub segments: usize,
    pub memtable: usize,
    pub quarantined: usize,
    pub wal: WalHealth,
    pub archives: usize,
    pub pending: usize,
}

/// Vault statistics.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStats {
    pub partitions: Vec<PartitionStats>,
    pub hot: HotStats,
    pub warm: WarmStats,
    pub cold: ColdStats,
    pub ghosts: usize,
    pub ghost_capacity: usize,
    pub in_flight: usize,
    pub gc: GcStats,
    pub bleed: BleedStats,
    pub distillation: DistillStats,
    pub coherence: CoherenceStats,
    pub storage_compaction: CompactionStats,
}

impl VaultStats {
    pub fn record_count(&self) -> usize {
        self.partitions.iter().map(|p| p.records).sum()
    }

    pub fn live_count(&self) -> usize {
        self.partitions.iter().map(|p| p.live).sum()
    }
}

/// What one [`FrameVault::maintenance_cycle`] did.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub bleed_jobs: usize,
    pub archive: ArchiveReport,
    pub compactions: usize,
    pub gc: GcReport,
    pub coherence: CoherenceReport,
}

/// The main framevault instance.
///
/// A `FrameVault` is cheap to clone; every clone shares the same
/// partitions, tiers and background workers.
///
/// # Example
///
/// ```ignore
/// use framevault::{FrameBuilder, FrameVault, VaultConfig};
///
/// let vault = FrameVault::open(VaultConfig::new("/tmp/vault"))?;
///
/// let id = vault.append(
///     FrameBuilder::new(1)
///         .field(0, 0.9)
///         .level(0, 0, vector)
///         .build()?,
/// )?;
///
/// let nearest = vault.query_similar(1, &vector, 5)?;
/// let frame = vault.fetch(1, id)?;
/// ```
#[derive(Clone)]
pub struct FrameVault {
    inner: Arc<VaultInner>,
    workers: Arc<Mutex<Option<BackgroundWorkers>>>,
}

impl std::fmt::Debug for FrameVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameVault")
            .field("data_dir", &self.inner.config.data_dir)
            .field("partitions", &self.inner.partitions.len())
            .field("workers", &self.workers_running())
            .finish()
    }
}

impl FrameVault {
    /// Open (or create) the vault at `config.data_dir`, recovering every
    /// partition. Background workers are not started.
    pub fn open(config: VaultConfig) -> VaultResult<Self> {
        let context = VaultContext::from_config(&config);
        Self::open_with_context(config, context)
    }

    /// Open with an explicitly built codebook and capability registry.
    pub fn open_with_context(config: VaultConfig, context: VaultContext) -> VaultResult<Self> {
        Ok(Self {
            inner: Arc::new(VaultInner::open(config, context)?),
            workers: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &VaultContext {
        &self.inner.context
    }

    /// Ids of every known partition.
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.inner.partitions().iter().map(|p| p.id()).collect()
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// Append a fully formed frame and return its assigned id.
    ///
    /// The frame is durable in the partition's WAL before it is indexed and
    /// placed in the hot tier.
    ///
    /// # Errors
    ///
    /// - `Serialization` for a malformed or empty frame
    /// - `PayloadTooLarge` over `record.max_payload_bytes`
    /// - `CapacityExceeded` when the WAL cannot grow
    /// - `ContentionTimeout` when the partition's write section stays busy
    pub fn append(&self, frame: Frame) -> VaultResult<FrameId> {
        self.inner.write_frame(frame, Annotations::default())
    }

    /// Pin a record so the garbage collector never takes it past Compressed.
    pub fn pin(&self, partition: PartitionId, id: FrameId) -> VaultResult<()> {
        self.set_pinned(partition, id, true)
    }

    pub fn unpin(&self, partition: PartitionId, id: FrameId) -> VaultResult<()> {
        self.set_pinned(partition, id, false)
    }

    fn set_pinned(&self, partition: PartitionId, id: FrameId, pinned: bool) -> VaultResult<()> {
        let part = self
            .inner
            .partition(partition)
            .filter(|p| p.meta(id).is_some_and(|m| m.is_live()))
            .ok_or_else(|| VaultError::missing_frame(partition, id))?;
        self.inner.annotate(&part, id, |a| a.pinned = pinned)?;
        Ok(())
    }

    /// Change a partition's importance at runtime.
    pub fn set_partition_importance(&self, partition: PartitionId, importance: f32) -> VaultResult<()> {
        self.inner.open_partition(partition)?.set_importance(importance);
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// The `top_k` records most similar to `vector`.
    pub fn query_similar(&self, partition: PartitionId, vector: &[f32], top_k: usize) -> VaultResult<Vec<RecordSummary>> {
        self.query_similar_in(partition, &[partition], vector, top_k)
    }

    /// Similarity search across several partitions, ranked from the point
    /// of view of `active`: only supersessions scoped to `active` count.
    pub fn query_similar_in(
        &self,
        active: PartitionId,
        partitions: &[PartitionId],
        vector: &[f32],
        top_k: usize,
    ) -> VaultResult<Vec<RecordSummary>> {
        let query = self.inner.query_vector(vector)?;
        let fetch = (top_k * 2).max(top_k + 8);
        let scope: BTreeSet<PartitionId> = partitions.iter().copied().collect();
        let mut hits = Vec::new();
        for id in scope {
            if let Some(partition) = self.inner.partition(id) {
                hits.extend(self.inner.similar_candidates(&partition, &query, fetch, active));
            }
        }
        Ok(rank(hits, top_k))
    }

    /// Like [`query_similar`](Self::query_similar) without records
    /// superseded in `partition`.
    pub fn query_authoritative(
        &self,
        partition: PartitionId,
        vector: &[f32],
        top_k: usize,
    ) -> VaultResult<Vec<RecordSummary>> {
        let query = self.inner.query_vector(vector)?;
        let Some(part) = self.inner.partition(partition) else {
            return Ok(Vec::new());
        };
        let fetch = (top_k * 2).max(top_k + 8);
        let hits = self
            .inner
            .similar_candidates(&part, &query, fetch, partition)
            .into_iter()
            .filter(|h| h.authoritative)
            .collect();
        Ok(rank(hits, top_k))
    }

    /// Records created in `[start, end]`, lazily, in `(timestamp, id)` order.
    pub fn query_range(&self, partition: PartitionId, start: u64, end: u64) -> RangeIter {
        RangeIter::new(
            self.inner.partition(partition),
            start,
            end,
            None,
            self.inner.config.index.range_page_size,
        )
    }

    /// Continue a range scan after `cursor` (see [`RangeIter::cursor`]).
    pub fn resume_range(&self, partition: PartitionId, start: u64, end: u64, cursor: RangeCursor) -> RangeIter {
        RangeIter::new(
            self.inner.partition(partition),
            start,
            end,
            Some(cursor),
            self.inner.config.index.range_page_size,
        )
    }

    /// Ids of the live records carrying `token`.
    pub fn query_token(&self, partition: PartitionId, token: Token) -> BTreeSet<FrameId> {
        let Some(part) = self.inner.partition(partition) else {
            return BTreeSet::new();
        };
        if !part.index().filter.may_contain_token(token) {
            return BTreeSet::new();
        }
        let snapshot = part.snapshot();
        part.index()
            .tokens
            .get(token)
            .into_iter()
            .filter(|id| part.visible(*id, snapshot).is_some_and(|m| m.is_live()))
            .collect()
    }

    /// Run a composed query.
    pub fn query(&self, query: &FrameQuery) -> VaultResult<Vec<RecordSummary>> {
        let Some(partition) = self.inner.partition(query.partition) else {
            return Ok(Vec::new());
        };
        let index = partition.index();
        if query.tokens.iter().any(|t| !index.filter.may_contain_token(*t)) {
            return Ok(Vec::new());
        }
        let allowed = (!query.tokens.is_empty()).then(|| index.tokens.intersect(&query.tokens));
        let keep = |s: &RecordSummary| {
            allowed.as_ref().is_none_or(|ids| ids.contains(&s.id))
                && query.between.is_none_or(|(start, end)| (start..=end).contains(&s.timestamp))
                && (!query.authoritative_only || s.authoritative)
        };

        if let Some(vector) = &query.similar_to {
            let vector = self.inner.query_vector(vector)?;
            if let Some(threshold) = query.recall_threshold {
                self.inner.recall_similar(&partition, &vector, threshold)?;
            }
            let fetch = (query.limit * 4).max(32);
            let hits = self
                .inner
                .similar_candidates(&partition, &vector, fetch, partition.id())
                .into_iter()
                .filter(|s| keep(s))
                .collect();
            return Ok(rank(hits, query.limit));
        }

        if query.between.is_none() {
            if let Some(ids) = &allowed {
                let snapshot = partition.snapshot();
                return Ok(ids
                    .iter()
                    .filter_map(|id| partition.visible(*id, snapshot).filter(|m| m.is_live()))
                    .map(|m| m.to_summary(partition.id()))
                    .filter(|s| keep(s))
                    .take(query.limit)
                    .collect());
            }
        }

        let (start, end) = query.between.unwrap_or((0, u64::MAX));
        Ok(self
            .query_range(query.partition, start, end)
            .filter(|s| keep(s))
            .take(query.limit)
            .collect())
    }

    // ── Records ────────────────────────────────────────────────────────

    /// A live record's payload, from whichever tier holds it.
    pub fn fetch(&self, partition: PartitionId, id: FrameId) -> VaultResult<Option<Arc<Frame>>> {
        let Some(part) = self.inner.partition(partition) else {
            return Ok(None);
        };
        if !part.visible(id, part.snapshot()).is_some_and(|m| m.is_live()) {
            return Ok(None);
        }
        self.inner.locate(&part, id)
    }

    /// Fetch by id alone, routed through the partitions' membership filters.
    pub fn get(&self, id: FrameId) -> VaultResult<Option<Arc<Frame>>> {
        match self.inner.find_partition_of(id) {
            Some(partition) => self.fetch(partition.id(), id),
            None => Ok(None),
        }
    }

    /// A record's summary. Tombstones are included.
    pub fn summary(&self, partition: PartitionId, id: FrameId) -> Option<RecordSummary> {
        let part = self.inner.partition(partition)?;
        part.visible(id, part.snapshot()).map(|m| m.to_summary(partition))
    }

    /// Ghost of an evicted record.
    pub fn ghost(&self, id: FrameId) -> Option<Ghost> {
        self.inner.ghosts.get(id)
    }

    /// Ghosts of `partition`, oldest first.
    pub fn ghosts(&self, partition: PartitionId) -> Vec<Ghost> {
        self.inner.ghosts.in_partition(partition)
    }

    /// Bring a record back into the hot tier and return it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the partition has no live record `id`.
    pub fn recall(&self, partition: PartitionId, id: FrameId) -> VaultResult<Arc<Frame>> {
        let part = self
            .inner
            .partition(partition)
            .ok_or_else(|| VaultError::missing_frame(partition, id))?;
        let frame = self
            .inner
            .promote(&part, id)?
            .ok_or_else(|| VaultError::missing_frame(partition, id))?;
        self.inner.processes.bleed.record_recall();
        Ok(frame)
    }

    /// Recall every evicted record whose ghost is at least `threshold`
    /// similar to `vector`.
    pub fn recall_similar(&self, partition: PartitionId, vector: &[f32], threshold: f32) -> VaultResult<Vec<Arc<Frame>>> {
        let query = self.inner.query_vector(vector)?;
        match self.inner.partition(partition) {
            Some(part) => self.inner.recall_similar(&part, &query, threshold),
            None => Ok(Vec::new()),
        }
    }

    /// Exact-match tokens the vault derives for `frame`.
    pub fn tokens_of(&self, frame: &Frame) -> Vec<Token> {
        self.inner.context.codebook.tokens_of(frame)
    }

    /// Resolve a registered capability into a store.
    ///
    /// # Errors
    ///
    /// `Unauthorized` if no descriptor is registered under `name`.
    pub fn connect(&self, name: &str) -> VaultResult<Box<dyn FrameStore>> {
        store::connect(self, name)
    }

    // ── Administration ─────────────────────────────────────────────────

    pub fn stats(&self) -> VaultResult<VaultStats> {
        self.inner.stats()
    }

    /// Flush every memtable into a segment and seal pending cold versions.
    /// Returns the number of partitions flushed.
    pub fn flush(&self) -> VaultResult<usize> {
        self.inner.flush()
    }

    /// Run storage and archive compaction where thresholds are met.
    pub fn compact(&self) -> VaultResult<usize> {
        self.inner.compact()
    }

    /// One synchronous pass of every background process.
    pub fn maintenance_cycle(&self) -> VaultResult<MaintenanceReport> {
        self.inner.maintenance_cycle_at(now_nanos())
    }

    /// [`maintenance_cycle`](Self::maintenance_cycle) as if the clock read `now`.
    pub fn maintenance_cycle_at(&self, now: u64) -> VaultResult<MaintenanceReport> {
        self.inner.maintenance_cycle_at(now)
    }

    pub fn archive_pass(&self) -> VaultResult<ArchiveReport> {
        self.inner.archive_pass_at(now_nanos())
    }

    pub fn archive_pass_at(&self, now: u64) -> VaultResult<ArchiveReport> {
        self.inner.archive_pass_at(now)
    }

    pub fn collect_garbage(&self) -> VaultResult<GcReport> {
        self.inner.collect_garbage_at(now_nanos())
    }

    /// A garbage collection pass scored as if the clock read `now`.
    pub fn collect_garbage_at(&self, now: u64) -> VaultResult<GcReport> {
        self.inner.collect_garbage_at(now)
    }

    pub fn coherence_pass(&self) -> VaultResult<CoherenceReport> {
        self.inner.coherence_pass()
    }

    /// Settle queued bleed jobs on the calling thread.
    pub fn drain_bleed_queue(&self) -> usize {
        self.inner.processes.bleed.drain(&self.inner)
    }

    /// Start the background workers on the current tokio runtime.
    /// Does nothing if they are already running.
    pub fn start_workers(&self) -> VaultResult<()> {
        let mut workers = self.workers.lock();
        if workers.is_none() {
            *workers = Some(BackgroundWorkers::spawn(Arc::clone(&self.inner))?);
        }
        Ok(())
    }

    pub fn workers_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Stop the workers, settle queued jobs and flush everything to disk.
    pub async fn close(&self) -> VaultResult<()> {
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            workers.shutdown(&self.inner).await;
        }
        self.drain_bleed_queue();
        self.flush()?;
        info!(data_dir = %self.inner.config.data_dir.display(), "vault closed");
        Ok(())
    }
}
