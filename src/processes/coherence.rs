/// Coherence: single-winner resolution of contradictory records.
///
/// Two live records of a partition contradict each other when one's summary
/// vector points almost exactly away from the other's. The scan finds such
/// pairs through the similarity index by searching with the negated
/// summary, and marks the weaker record as superseded by the stronger one
/// within that partition. Nothing is deleted: the loser stays queryable, it
/// just ranks lower and is no longer authoritative in the partition's scope.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use crate::concurrency::CancelFlag;
use crate::config::CoherenceConfig;
use crate::core::VaultInner;
use crate::error::VaultResult;
use crate::partition::RecordMeta;
use crate::types::Supersession;

/// Pick the authoritative record of a contradictory pair.
///
/// Higher confidence wins; ties go to the newer timestamp, then the larger
/// id. Returns `(winner, loser)`.
pub fn resolve<'a>(a: &'a RecordMeta, b: &'a RecordMeta) -> (&'a RecordMeta, &'a RecordMeta) {
    let a_wins = a
        .confidence
        .total_cmp(&b.confidence)
        .then(a.timestamp.cmp(&b.timestamp))
        .then(a.id.cmp(&b.id))
        .is_gt();
    if a_wins { (a, b) } else { (b, a) }
}

/// Outcome of one coherence pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoherenceReport {
    pub scanned: usize,
    pub contradictions: usize,
    pub superseded: usize,
    pub cancelled: bool,
}

/// The coherence manager.
#[derive(Debug)]
pub struct CoherenceManager {
    config: CoherenceConfig,
    passes: AtomicU64,
    scanned: AtomicU64,
    contradictions: AtomicU64,
    superseded: AtomicU64,
}

impl CoherenceManager {
    pub fn new(config: CoherenceConfig) -> Self {
        Self {
            config,
            passes: AtomicU64::new(0),
            scanned: AtomicU64::new(0),
            contradictions: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    /// Scan every partition once.
    pub(crate) fn scan(&self, vault: &VaultInner, cancel: &CancelFlag) -> VaultResult<CoherenceReport> {
        let mut report = CoherenceReport::default();

        'partitions: for partition in vault.partitions() {
            let scope = partition.id();
            let candidates =
                partition.select(|m| m.is_live() && m.annotations.superseded.is_none() && m.summary.is_some());

            for candidate in candidates {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'partitions;
                }
                // An earlier pair in this pass may already have decided it.
                let Some(current) = partition
                    .meta(candidate.id)
                    .filter(|m| m.is_live() && m.annotations.superseded.is_none())
                else {
                    continue;
                };
                let Some(summary) = current.summary.as_deref() else {
                    continue;
                };
                report.scanned += 1;

                let negated: Vec<f32> = summary.iter().map(|x| -x).collect();
                let neighbors = partition
                    .index()
                    .similarity
                    .search_default(&negated, self.config.neighbors);

                for neighbor in neighbors {
                    if neighbor.id == current.id || neighbor.similarity < self.config.contradiction_threshold {
                        continue;
                    }
                    let Some(other) = partition
                        .meta(neighbor.id)
                        .filter(|m| m.is_live() && m.annotations.superseded.is_none())
                    else {
                        continue;
                    };
                    report.contradictions += 1;

                    let (winner, loser) = resolve(&current, &other);
                    let supersession = Supersession {
                        winner: winner.id,
                        scope,
                    };
                    if vault.annotate(&partition, loser.id, |a| a.superseded = Some(supersession))? {
                        report.superseded += 1;
                        info!(
                            partition = scope,
                            winner = winner.id,
                            loser = loser.id,
                            similarity = neighbor.similarity,
                            "contradiction resolved"
                        );
                    }
                    if loser.id == current.id {
                        break;
                    }
                }
            }
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        self.scanned
            .fetch_add(report.scanned as u64, Ordering::Relaxed);
        self.contradictions
            .fetch_add(report.contradictions as u64, Ordering::Relaxed);
        self.superseded
            .fetch_add(report.superseded as u64, Ordering::Relaxed);
        debug!(
            scanned = report.scanned,
            superseded = report.superseded,
            "coherence pass complete"
        );
        Ok(report)
    }

    pub fn stats(&self) -> CoherenceStats {
        CoherenceStats {
            passes: self.passes.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            contradictions: self.contradictions.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
        }
    }
}

/// Coherence statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoherenceStats {
    pub passes: u64,
    pub scanned: u64,
    pub contradictions: u64,
    pub superseded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Annotations, Stage, Tier};

    fn meta(id: u64, confidence: f32, timestamp: u64) -> RecordMeta {
        RecordMeta {
            id,
            partition: 1,
            seq: 1,
            timestamp,
            confidence,
            parent_ref: None,
            stage: Stage::Full,
            tier: Tier::Hot,
            annotations: Annotations::default(),
            ref_count: 0,
            summary: None,
            tokens: vec![],
            died_at: None,
        }
    }

    #[test]
    fn test_higher_confidence_wins() {
        let strong = meta(1, 0.9, 10);
        let weak = meta(2, 0.6, 20);
        let (winner, loser) = resolve(&weak, &strong);
        assert_eq!((winner.id, loser.id), (1, 2));
    }

    #[test]
    fn test_ties_go_to_newer_then_larger_id() {
        let older = meta(5, 0.7, 10);
        let newer = meta(3, 0.7, 20);
        assert_eq!(resolve(&older, &newer).0.id, 3);

        let a = meta(4, 0.7, 10);
        let b = meta(8, 0.7, 10);
        assert_eq!(resolve(&a, &b).0.id, 8);
        assert_eq!(resolve(&b, &a).0.id, 8);
    }
}
