//! Engine configuration.
//!
//! Every section deserializes with `#[serde(default)]`, so a config file only
//! needs the values it changes:
//!
//! ```json
//! { "data_dir": "/var/lib/framevault", "tiers": { "hot_capacity": 512 } }
//! ```

use crate::error::{VaultError, VaultResult};
use crate::frame::DEFAULT_VECTOR_DIM;
use crate::index::hnsw::HnswConfig;
use crate::lifecycle::{EvictionWeights, RetentionWeights};
use crate::types::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root of the persisted layout
    pub data_dir: PathBuf,
    pub record: RecordConfig,
    pub storage: StorageConfig,
    pub index: IndexConfig,
    pub tiers: TierConfig,
    pub bleed: BleedConfig,
    pub gc: GcConfig,
    pub coherence: CoherenceConfig,
    pub workers: WorkerConfig,
    /// Importance per partition, used by eviction and retention scoring
    pub partition_importance: HashMap<PartitionId, f32>,
    /// Importance of partitions not listed above
    pub default_importance: f32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            record: RecordConfig::default(),
            storage: StorageConfig::default(),
            index: IndexConfig::default(),
            tiers: TierConfig::default(),
            bleed: BleedConfig::default(),
            gc: GcConfig::default(),
            coherence: CoherenceConfig::default(),
            workers: WorkerConfig::default(),
            partition_importance: HashMap::new(),
            default_importance: 0.5,
        }
    }
}

/// `~/.local/share/framevault` (or the platform equivalent).
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("framevault")
}

impl VaultConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file.
    pub fn from_file(path: &Path) -> VaultResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: VaultConfig = serde_json::from_str(&raw)
            .map_err(|e| VaultError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> VaultResult<()> {
        fn fraction(name: &str, v: f32) -> VaultResult<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(VaultError::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, v
                )))
            }
        }

        if self.record.vector_dim == 0 {
            return Err(VaultError::InvalidConfig("record.vector_dim must be > 0".into()));
        }
        if self.tiers.hot_capacity == 0 || self.tiers.warm_capacity == 0 {
            return Err(VaultError::InvalidConfig("tier capacities must be > 0".into()));
        }
        if self.storage.max_segments < 2 {
            return Err(VaultError::InvalidConfig("storage.max_segments must be >= 2".into()));
        }
        if self.index.hnsw.m < 2 {
            return Err(VaultError::InvalidConfig("index.hnsw.m must be >= 2".into()));
        }
        if !(self.index.bloom_fp_rate > 0.0 && self.index.bloom_fp_rate < 1.0) {
            return Err(VaultError::InvalidConfig("index.bloom_fp_rate must be in (0, 1)".into()));
        }
        fraction("tiers.eviction_watermark", self.tiers.eviction_watermark)?;
        fraction("tiers.archive_low_watermark", self.tiers.archive_low_watermark)?;
        if self.tiers.archive_low_watermark > self.tiers.eviction_watermark {
            return Err(VaultError::InvalidConfig(
                "tiers.archive_low_watermark must not exceed tiers.eviction_watermark".into(),
            ));
        }
        fraction("default_importance", self.default_importance)?;
        for (p, v) in &self.partition_importance {
            fraction(&format!("partition_importance[{}]", p), *v)?;
        }
        if !(self.gc.gist_floor <= self.gc.compressed_floor
            && self.gc.compressed_floor <= self.gc.full_floor)
        {
            return Err(VaultError::InvalidConfig(
                "gc floors must satisfy gist <= compressed <= full".into(),
            ));
        }
        Ok(())
    }

    /// Importance of `partition` as configured at open time.
    pub fn importance_of(&self, partition: PartitionId) -> f32 {
        self.partition_importance
            .get(&partition)
            .copied()
            .unwrap_or(self.default_importance)
    }
}

/// Record shape limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Dimension of every payload vector
    pub vector_dim: usize,
    /// Maximum raw payload size per record
    pub max_payload_bytes: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            vector_dim: DEFAULT_VECTOR_DIM,
            max_payload_bytes: 64 * 1024, // 16 fields x 4 levels x 256 dims x 4 bytes
        }
    }
}

/// Durable storage knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Memtable size that triggers a flush to a new segment
    pub memtable_flush_bytes: usize,
    /// Segment count per partition that triggers compaction
    pub max_segments: usize,
    /// Hard limit on a partition's WAL size
    pub max_wal_bytes: u64,
    /// fsync every WAL append before acknowledging it
    pub sync_writes: bool,
    /// How long a writer waits for the partition write section
    pub write_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memtable_flush_bytes: 4 * 1024 * 1024, // 4 MiB
            max_segments: 4,
            max_wal_bytes: 256 * 1024 * 1024, // 256 MiB
            sync_writes: true,
            write_timeout_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Index construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub hnsw: HnswConfig,
    /// Expected ids + tokens per partition membership filter
    pub bloom_expected_items: usize,
    /// Target false-positive rate of membership filters
    pub bloom_fp_rate: f64,
    /// Number of centroids in the shared codebook
    pub codebook_size: usize,
    /// Seed for the generated codebook
    pub codebook_seed: u64,
    /// Entries fetched per page by range iterators
    pub range_page_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hnsw: HnswConfig::default(),
            bloom_expected_items: 100_000,
            bloom_fp_rate: 0.01, // 1% false positives
            codebook_size: 256,
            codebook_seed: 42,
            range_page_size: 256,
        }
    }
}

/// Tier capacities and movement thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Maximum records in the hot tier
    pub hot_capacity: usize,
    /// Maximum records in the warm tier
    pub warm_capacity: usize,
    /// Utilization at which eviction (hot) or archival (warm) starts
    pub eviction_watermark: f32,
    /// Utilization archival drains the warm tier down to
    pub archive_low_watermark: f32,
    /// Maximum ghosts kept in the hot tier
    pub ghost_capacity: usize,
    /// No appends for this long counts as idle
    pub idle_after_secs: u64,
    /// Warm records untouched this long are archived on idle cycles
    pub warm_idle_secs: u64,
    /// Archive files per partition before they are merged
    pub max_archives: usize,
    pub eviction: EvictionWeights,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 256,
            warm_capacity: 10_000,
            eviction_watermark: 0.8,     // Start moving at 80%
            archive_low_watermark: 0.7,  // Drain warm back to 70%
            ghost_capacity: 1000,
            idle_after_secs: 60,
            warm_idle_secs: 3600, // 1 hour
            max_archives: 8,
            eviction: EvictionWeights::default(),
        }
    }
}

impl TierConfig {
    /// Hot tier size at which eviction starts.
    pub fn hot_high_water(&self) -> usize {
        fraction_of(self.hot_capacity, self.eviction_watermark).max(1)
    }

    /// Warm tier size at which archival starts.
    pub fn warm_high_water(&self) -> usize {
        fraction_of(self.warm_capacity, self.eviction_watermark).max(1)
    }

    /// Warm tier size archival drains to.
    pub fn warm_low_water(&self) -> usize {
        fraction_of(self.warm_capacity, self.archive_low_watermark)
    }
}

// f32 watermarks are not exact (0.7f32 < 0.7), so round within a small epsilon.
fn fraction_of(capacity: usize, fraction: f32) -> usize {
    (capacity as f64 * fraction as f64 + 1e-3).floor() as usize
}

/// Cluster distillation during archival.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    /// Minimum members for a cluster to produce a summary
    pub min_cluster_size: usize,
    /// Cosine similarity linking two records into a cluster
    pub similarity_threshold: f32,
    /// Confidence assigned to every field of a summary
    pub summary_confidence: f32,
    /// Summaries emitted per partition per pass
    pub max_summaries: usize,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 5,
            similarity_threshold: 0.85,
            summary_confidence: 0.95,
            max_summaries: 4,
        }
    }
}

/// Bleed engine: prefetch, recall, consolidation and archival.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleedConfig {
    /// Warm records promoted per prefetch
    pub prefetch_k: usize,
    /// Minimum similarity for a prefetch candidate
    pub prefetch_min_similarity: f32,
    /// Ghost similarity that triggers recall
    pub recall_threshold: f32,
    /// Bound of the background job queue
    pub queue_capacity: usize,
    pub distill: DistillConfig,
}

impl Default for BleedConfig {
    fn default() -> Self {
        Self {
            prefetch_k: 4,
            prefetch_min_similarity: 0.5,
            recall_threshold: 0.8,
            queue_capacity: 1024,
            distill: DistillConfig::default(),
        }
    }
}

/// Garbage collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub retention: RetentionWeights,
    /// Full records scoring below this are compressed
    pub full_floor: f32,
    /// Compressed records scoring below this become gists
    pub compressed_floor: f32,
    /// Gists scoring below this are tombstoned
    pub gist_floor: f32,
    /// Reference count above which a record is immortal
    pub immortal_ref_threshold: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            retention: RetentionWeights::default(),
            full_floor: 0.5,
            compressed_floor: 0.3,
            gist_floor: 0.1,
            immortal_ref_threshold: 8,
        }
    }
}

impl GcConfig {
    /// Floor for records currently at `stage`.
    pub fn floor_for(&self, stage: crate::types::Stage) -> Option<f32> {
        use crate::types::Stage;
        match stage {
            Stage::Full => Some(self.full_floor),
            Stage::Compressed => Some(self.compressed_floor),
            Stage::Gist => Some(self.gist_floor),
            Stage::Tombstone => None,
        }
    }
}

/// Coherence scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherenceConfig {
    /// Similarity to a negated summary that flags a contradiction
    pub contradiction_threshold: f32,
    /// Neighbours examined per record
    pub neighbors: usize,
    /// Subtracted from the similarity of superseded records when ranking
    pub rank_penalty: f32,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            contradiction_threshold: 0.85,
            neighbors: 8,
            rank_penalty: 0.25,
        }
    }
}

/// Background worker intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub archival_interval_secs: u64,
    pub compaction_interval_secs: u64,
    pub gc_interval_secs: u64,
    pub coherence_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            archival_interval_secs: 30,
            compaction_interval_secs: 60,
            gc_interval_secs: 300,       // 5 minutes
            coherence_interval_secs: 120, // 2 minutes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = VaultConfig::new("/tmp/fv");
        assert!(config.validate().is_ok());
        assert_eq!(config.tiers.hot_high_water(), 204);
        assert_eq!(config.tiers.warm_high_water(), 8000);
        assert_eq!(config.tiers.warm_low_water(), 7000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "data_dir": "/data", "tiers": { "hot_capacity": 10 }, "partition_importance": { "3": 0.9 } }"#;
        let config: VaultConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tiers.hot_capacity, 10);
        assert_eq!(config.tiers.warm_capacity, 10_000);
        assert_eq!(config.importance_of(3), 0.9);
        assert_eq!(config.importance_of(4), 0.5);
        assert_eq!(config.storage.max_segments, 4);
    }

    #[test]
    fn test_validate_rejects_inverted_floors() {
        let mut config = VaultConfig::new("/tmp/fv");
        config.gc.gist_floor = 0.6;
        assert!(matches!(config.validate(), Err(VaultError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        std::fs::write(&path, r#"{ "storage": { "sync_writes": false } }"#).unwrap();
        let config = VaultConfig::from_file(&path).unwrap();
        assert!(!config.storage.sync_writes);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(VaultConfig::from_file(&path).is_err());
    }
}
