/// Garbage collector: staged, score-driven compression.
///
/// Each pass scores every warm and cold record with the retention score and
/// steps the ones under their stage's floor down exactly one stage:
///
/// ```text
/// Full ──► Compressed ──► Gist ──► Tombstone
/// ```
///
/// Exempt records (confidence 1.0, heavily referenced, or pinned) stop at
/// Compressed. Hot and in-flight records are never touched.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use crate::concurrency::CancelFlag;
use crate::config::GcConfig;
use crate::core::VaultInner;
use crate::error::VaultResult;
use crate::lifecycle::retention_score;
use crate::partition::RecordMeta;
use crate::types::{Stage, Tier};

/// What a pass should do with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    /// Score is under the floor but the record is exempt
    Exempt,
    StepDown(Stage),
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub scanned: usize,
    pub compressed: usize,
    pub gisted: usize,
    pub tombstoned: usize,
    pub exempted: usize,
    pub cancelled: bool,
}

impl GcReport {
    pub fn transitions(&self) -> usize {
        self.compressed + self.gisted + self.tombstoned
    }
}

/// The garbage collector.
#[derive(Debug)]
pub struct GarbageCollector {
    config: GcConfig,
    passes: AtomicU64,
    compressed: AtomicU64,
    gisted: AtomicU64,
    tombstoned: AtomicU64,
    exempted: AtomicU64,
}

impl GarbageCollector {
    pub fn new(config: GcConfig) -> Self {
        Self {
            config,
            passes: AtomicU64::new(0),
            compressed: AtomicU64::new(0),
            gisted: AtomicU64::new(0),
            tombstoned: AtomicU64::new(0),
            exempted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Decide the fate of one record at time `now`.
    pub fn judge(&self, meta: &RecordMeta, importance: f32, now: u64) -> Verdict {
        let Some(floor) = self.config.floor_for(meta.stage) else {
            return Verdict::Keep;
        };
        let inputs = meta.score_inputs(now, meta.timestamp, importance, meta.partition);
        if retention_score(&self.config.retention, &inputs) >= floor {
            return Verdict::Keep;
        }
        match meta.stage.next() {
            Some(next) if next < Stage::Compressed && meta.is_immortal(self.config.immortal_ref_threshold) => {
                Verdict::Exempt
            }
            Some(next) => Verdict::StepDown(next),
            None => Verdict::Keep,
        }
    }

    /// Run one pass over every partition.
    pub(crate) fn collect(&self, vault: &VaultInner, now: u64, cancel: &CancelFlag) -> VaultResult<GcReport> {
        let mut report = GcReport::default();

        'partitions: for partition in vault.partitions() {
            let importance = partition.importance();
            let candidates = partition.select(|m| m.is_live() && m.tier != Tier::Hot);
            let mut touched = false;

            for meta in candidates {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'partitions;
                }
                if vault.is_in_flight(meta.id) {
                    continue;
                }
                report.scanned += 1;

                match self.judge(&meta, importance, now) {
                    Verdict::Keep => {}
                    Verdict::Exempt => report.exempted += 1,
                    Verdict::StepDown(next) => {
                        if !vault.restage(&partition, meta.id, next, now)? {
                            continue;
                        }
                        touched = true;
                        debug!(partition = partition.id(), frame_id = meta.id, stage = %next, "record stepped down");
                        match next {
                            Stage::Compressed => report.compressed += 1,
                            Stage::Gist => report.gisted += 1,
                            Stage::Tombstone => report.tombstoned += 1,
                            Stage::Full => {}
                        }
                    }
                }
            }

            if touched {
                vault.cold.seal(partition.id())?;
            }
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        self.compressed
            .fetch_add(report.compressed as u64, Ordering::Relaxed);
        self.gisted.fetch_add(report.gisted as u64, Ordering::Relaxed);
        self.tombstoned
            .fetch_add(report.tombstoned as u64, Ordering::Relaxed);
        self.exempted
            .fetch_add(report.exempted as u64, Ordering::Relaxed);
        info!(
            scanned = report.scanned,
            compressed = report.compressed,
            gisted = report.gisted,
            tombstoned = report.tombstoned,
            exempted = report.exempted,
            "gc pass complete"
        );
        Ok(report)
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            passes: self.passes.load(Ordering::Relaxed),
            compressed: self.compressed.load(Ordering::Relaxed),
            gisted: self.gisted.load(Ordering::Relaxed),
            tombstoned: self.tombstoned.load(Ordering::Relaxed),
            exempted: self.exempted.load(Ordering::Relaxed),
        }
    }
}

/// Garbage collector statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStats {
    pub passes: u64,
    pub compressed: u64,
    pub gisted: u64,
    pub tombstoned: u64,
    pub exempted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Annotations, NANOS_PER_SEC, Supersession};

    const DAY: u64 = 86_400 * NANOS_PER_SEC;

    fn meta(stage: Stage, confidence: f32) -> RecordMeta {
        RecordMeta {
            id: 1,
            partition: 1,
            seq: 1,
            timestamp: 0,
            confidence,
            parent_ref: None,
            stage,
            tier: Tier::Cold,
            annotations: Annotations::default(),
            ref_count: 0,
            summary: None,
            tokens: vec![],
            died_at: None,
        }
    }

    #[test]
    fn test_fresh_confident_record_kept() {
        let gc = GarbageCollector::new(GcConfig::default());
        assert_eq!(gc.judge(&meta(Stage::Full, 0.9), 0.5, 0), Verdict::Keep);
    }

    #[test]
    fn test_old_weak_record_steps_one_stage() {
        let gc = GarbageCollector::new(GcConfig::default());
        let now = 365 * DAY;
        assert_eq!(
            gc.judge(&meta(Stage::Full, 0.1), 0.0, now),
            Verdict::StepDown(Stage::Compressed)
        );
        assert_eq!(
            gc.judge(&meta(Stage::Compressed, 0.1), 0.0, now),
            Verdict::StepDown(Stage::Gist)
        );
        assert_eq!(gc.judge(&meta(Stage::Tombstone, 0.0), 0.0, now), Verdict::Keep);
    }

    #[test]
    fn test_immortal_stops_at_compressed() {
        let gc = GarbageCollector::new(GcConfig::default());
        let now = 365 * DAY;
        let mut pinned = meta(Stage::Compressed, 0.0);
        pinned.annotations.pinned = true;
        pinned.annotations.superseded = Some(Supersession { winner: 2, scope: 1 });
        assert_eq!(gc.judge(&pinned, 0.0, now), Verdict::Exempt);

        let mut full = meta(Stage::Full, 0.0);
        full.annotations.pinned = true;
        full.annotations.superseded = pinned.annotations.superseded;
        assert_eq!(gc.judge(&full, 0.0, now), Verdict::StepDown(Stage::Compressed));
    }
}
