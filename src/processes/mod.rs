/// Background processes for automated memory management.
///
/// These processes keep the tiers balanced and the stored history lean:
/// - Bleed: prefetch, consolidation and archival between tiers
/// - Distillation: cluster summaries written during archival
/// - GC: score-driven stage compression down to tombstones
/// - Coherence: single-winner contradiction resolution
///
/// Each process owns its configuration and counters and operates on the
/// vault it is handed. [`workers::BackgroundWorkers`] drives them on tokio
/// timers; `FrameVault::maintenance_cycle` runs them once, synchronously.
pub mod bleed;
pub mod coherence;
pub mod distillation;
pub mod gc;
pub mod workers;

pub use bleed::{ArchiveReport, BleedJob, BleedProcess, BleedStats};
pub use coherence::{CoherenceManager, CoherenceReport, CoherenceStats, resolve};
pub use distillation::{Cluster, DistillStats, Distiller};
pub use gc::{GarbageCollector, GcReport, GcStats, Verdict};
pub use workers::BackgroundWorkers;

use crate::config::VaultConfig;

/// Process runner for all background processes.
///
/// Coordinates the four processes of one vault.
#[derive(Debug)]
pub struct ProcessRunner {
    pub(crate) bleed: BleedProcess,
    pub(crate) distiller: Distiller,
    pub(crate) gc: GarbageCollector,
    pub(crate) coherence: CoherenceManager,
}

impl ProcessRunner {
    /// Create the processes from the vault configuration.
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            bleed: BleedProcess::new(config.bleed.clone()),
            distiller: Distiller::new(config.bleed.distill.clone()),
            gc: GarbageCollector::new(config.gc.clone()),
            coherence: CoherenceManager::new(config.coherence.clone()),
        }
    }

    pub fn bleed(&self) -> &BleedProcess {
        &self.bleed
    }

    pub fn distiller(&self) -> &Distiller {
        &self.distiller
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn coherence(&self) -> &CoherenceManager {
        &self.coherence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_runner_from_config() {
        let mut config = VaultConfig::new("/tmp/fv");
        config.gc.full_floor = 0.6;
        config.coherence.neighbors = 3;
        config.bleed.distill.min_cluster_size = 7;

        let runner = ProcessRunner::from_config(&config);
        assert_eq!(runner.gc().config().full_floor, 0.6);
        assert_eq!(runner.coherence().config().neighbors, 3);
        assert_eq!(runner.distiller().config().min_cluster_size, 7);
        assert_eq!(runner.bleed().stats().prefetch_queued, 0);
    }
}
