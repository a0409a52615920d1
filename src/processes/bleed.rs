/// Bleed engine: the movement of records between tiers that nobody asked for.
///
/// Three kinds of traffic:
///
/// - **Prefetch**: after an append, warm records close to the new one are
///   pulled back into hot before anyone queries them.
/// - **Consolidation**: records evicted from hot wait in the in-flight set
///   until the worker settles them into warm.
/// - **Archival**: under warm pressure or when the vault is idle, warm
///   records are distilled, compressed and sealed into cold archives.
///
/// Prefetch and consolidation travel as [`BleedJob`]s on a bounded queue.
/// The queue never blocks a producer: a full queue drops the prefetch and
/// makes the evictor consolidate inline instead.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::{debug, info, warn};

use crate::concurrency::CancelFlag;
use crate::config::{BleedConfig, TierConfig};
use crate::core::VaultInner;
use crate::error::VaultResult;
use crate::frame::Frame;
use crate::types::{Annotations, FrameId, NANOS_PER_SEC, PartitionId, Tier};

/// Work item for the bleed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleedJob {
    /// Promote warm neighbours of a freshly appended record
    Prefetch { partition: PartitionId, id: FrameId },
    /// Move an evicted record from in-flight into warm
    Consolidate { partition: PartitionId, id: FrameId },
}

/// Outcome of one archival pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveReport {
    /// Warm tier was over its high-water mark
    pub pressured: bool,
    /// No appends for the configured idle period
    pub idle: bool,
    pub candidates: usize,
    pub archived: usize,
    pub summaries: usize,
    pub sealed: usize,
    pub cancelled: bool,
}

/// The bleed engine.
#[derive(Debug)]
pub struct BleedProcess {
    config: BleedConfig,
    sender: Sender<BleedJob>,
    receiver: AsyncMutex<Receiver<BleedJob>>,

    prefetch_queued: AtomicU64,
    prefetch_dropped: AtomicU64,
    prefetched: AtomicU64,
    consolidated: AtomicU64,
    consolidated_inline: AtomicU64,
    recalled: AtomicU64,
    archived: AtomicU64,
    archive_passes: AtomicU64,
}

impl BleedProcess {
    pub fn new(config: BleedConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            sender,
            receiver: AsyncMutex::new(receiver),
            prefetch_queued: AtomicU64::new(0),
            prefetch_dropped: AtomicU64::new(0),
            prefetched: AtomicU64::new(0),
            consolidated: AtomicU64::new(0),
            consolidated_inline: AtomicU64::new(0),
            recalled: AtomicU64::new(0),
            archived: AtomicU64::new(0),
            archive_passes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BleedConfig {
        &self.config
    }

    /// Queue a prefetch. A full queue drops it.
    pub fn enqueue_prefetch(&self, partition: PartitionId, id: FrameId) {
        match self.sender.try_send(BleedJob::Prefetch { partition, id }) {
            Ok(()) => {
                self.prefetch_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.prefetch_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(partition, frame_id = id, "bleed queue full, prefetch dropped");
            }
        }
    }

    /// Queue a consolidation. Returns false if the caller must consolidate
    /// inline.
    pub fn enqueue_consolidate(&self, partition: PartitionId, id: FrameId) -> bool {
        self.sender
            .try_send(BleedJob::Consolidate { partition, id })
            .is_ok()
    }

    pub(crate) fn record_inline_consolidation(&self) {
        self.consolidated_inline.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recall(&self) {
        self.recalled.fetch_add(1, Ordering::Relaxed);
    }

    /// Run every queued job on the calling thread. Returns how many ran.
    ///
    /// Does nothing if the background worker currently owns the queue.
    pub(crate) fn drain(&self, vault: &VaultInner) -> usize {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(job) = receiver.try_recv() {
            self.handle(vault, job);
            handled += 1;
        }
        handled
    }

    /// Wait for the next job. Used by the background worker.
    pub(crate) async fn next_job(&self) -> Option<BleedJob> {
        self.receiver.lock().await.recv().await
    }

    pub(crate) fn handle(&self, vault: &VaultInner, job: BleedJob) {
        match job {
            BleedJob::Prefetch { partition, id } => match self.prefetch(vault, partition, id) {
                Ok(n) => {
                    self.prefetched.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => warn!(partition, frame_id = id, error = %e, "prefetch failed"),
            },
            BleedJob::Consolidate { partition, id } => {
                if vault.consolidate(partition, id) {
                    self.consolidated.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Promote up to `prefetch_k` warm neighbours of `id` into hot.
    fn prefetch(&self, vault: &VaultInner, partition: PartitionId, id: FrameId) -> VaultResult<usize> {
        let Some(part) = vault.partition(partition) else {
            return Ok(0);
        };
        let Some(summary) = part.meta(id).and_then(|m| m.summary) else {
            return Ok(0);
        };
        let neighbors = part
            .index()
            .similarity
            .search_default(&summary, self.config.prefetch_k * 2 + 1);

        let mut promoted = 0;
        for neighbor in neighbors {
            if promoted >= self.config.prefetch_k {
                break;
            }
            if neighbor.id == id || neighbor.similarity < self.config.prefetch_min_similarity {
                continue;
            }
            let in_warm = part
                .meta(neighbor.id)
                .is_some_and(|m| m.is_live() && m.tier == Tier::Warm);
            if !in_warm || vault.is_in_flight(neighbor.id) || !vault.warm.contains(neighbor.id) {
                continue;
            }
            if vault.promote(&part, neighbor.id)?.is_some() {
                promoted += 1;
                debug!(partition, frame_id = neighbor.id, "prefetched into hot");
            }
        }
        Ok(promoted)
    }

    /// Move warm records into cold if the warm tier is pressured or the
    /// vault has been idle.
    pub(crate) fn archive_pass(
        &self,
        vault: &VaultInner,
        tiers: &TierConfig,
        now: u64,
        cancel: &CancelFlag,
    ) -> VaultResult<ArchiveReport> {
        let warm_len = vault.warm.len();
        let mut report = ArchiveReport {
            pressured: warm_len >= tiers.warm_high_water(),
            idle: now.saturating_sub(vault.last_append()) >= tiers.idle_after_secs * NANOS_PER_SEC,
            ..Default::default()
        };
        if !report.pressured && !report.idle {
            return Ok(report);
        }

        let mut candidates: BTreeSet<(PartitionId, FrameId)> = BTreeSet::new();
        if report.pressured {
            let excess = warm_len.saturating_sub(tiers.warm_low_water());
            candidates.extend(vault.warm.demotion_candidates(excess));
        }
        if report.idle {
            let cutoff = now.saturating_sub(tiers.warm_idle_secs * NANOS_PER_SEC);
            candidates.extend(vault.warm.idle_candidates(cutoff));
        }
        report.candidates = candidates.len();

        let mut by_partition: BTreeMap<PartitionId, Vec<FrameId>> = BTreeMap::new();
        for (partition, id) in candidates {
            by_partition.entry(partition).or_default().push(id);
        }

        for (partition, ids) in by_partition {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Some(part) = vault.partition(partition) else {
                continue;
            };

            report.summaries += self.distill(vault, partition, &ids)?;

            for id in ids {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                if vault.demote_to_cold(&part, id, now)? {
                    report.archived += 1;
                }
            }
            if vault.cold.seal(partition)?.is_some() {
                report.sealed += 1;
            }
            if report.cancelled {
                break;
            }
        }

        self.archive_passes.fetch_add(1, Ordering::Relaxed);
        self.archived
            .fetch_add(report.archived as u64, Ordering::Relaxed);
        info!(
            pressured = report.pressured,
            idle = report.idle,
            archived = report.archived,
            summaries = report.summaries,
            "archival pass complete"
        );
        Ok(report)
    }

    /// Distill clusters among one partition's archival candidates. Returns
    /// the number of summaries written.
    fn distill(&self, vault: &VaultInner, partition: PartitionId, ids: &[FrameId]) -> VaultResult<usize> {
        let Some(part) = vault.partition(partition) else {
            return Ok(0);
        };
        let distiller = &vault.processes.distiller;

        let mut frames: BTreeMap<FrameId, Arc<Frame>> = BTreeMap::new();
        let mut vectors = Vec::new();
        for &id in ids {
            let Some(meta) = part.meta(id) else { continue };
            if !meta.is_live() || meta.annotations.summary || meta.annotations.distilled_into.is_some() {
                continue;
            }
            let (Some(summary), Some(frame)) = (meta.summary.clone(), vault.warm.peek(id)) else {
                continue;
            };
            vectors.push((id, summary));
            frames.insert(id, frame);
        }

        let mut written = 0;
        for cluster in distiller.clusters(&vectors) {
            let members: Vec<Arc<Frame>> = cluster
                .members
                .iter()
                .filter_map(|id| frames.get(id).cloned())
                .collect();
            let Some(summary) = distiller.summarize(&members)? else {
                continue;
            };
            let summary_id = vault.write_frame(
                summary,
                Annotations {
                    summary: true,
                    ..Default::default()
                },
            )?;
            for member in &cluster.members {
                vault.annotate(&part, *member, |a| a.distilled_into = Some(summary_id))?;
            }
            info!(partition, summary = summary_id, members = cluster.len(), "cluster distilled");
            written += 1;
        }
        Ok(written)
    }

    pub fn stats(&self) -> BleedStats {
        BleedStats {
            queue_depth: self.config.queue_capacity.max(1) - self.sender.capacity(),
            prefetch_queued: self.prefetch_queued.load(Ordering::Relaxed),
            prefetch_dropped: self.prefetch_dropped.load(Ordering::Relaxed),
            prefetched: self.prefetched.load(Ordering::Relaxed),
            consolidated: self.consolidated.load(Ordering::Relaxed),
            consolidated_inline: self.consolidated_inline.load(Ordering::Relaxed),
            recalled: self.recalled.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            archive_passes: self.archive_passes.load(Ordering::Relaxed),
        }
    }
}

/// Bleed engine statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BleedStats {
    pub queue_depth: usize,
    pub prefetch_queued: u64,
    pub prefetch_dropped: u64,
    pub prefetched: u64,
    pub consolidated: u64,
    pub consolidated_inline: u64,
    pub recalled: u64,
    pub archived: u64,
    pub archive_passes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_prefetch_and_refuses_consolidate() {
        let bleed = BleedProcess::new(BleedConfig {
            queue_capacity: 1,
            ..Default::default()
        });
        bleed.enqueue_prefetch(1, 1);
        bleed.enqueue_prefetch(1, 2);
        assert!(!bleed.enqueue_consolidate(1, 3));

        let stats = bleed.stats();
        assert_eq!(stats.prefetch_queued, 1);
        assert_eq!(stats.prefetch_dropped, 1);
        assert_eq!(stats.queue_depth, 1);
    }
}
