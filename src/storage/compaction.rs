//! Segment compaction.
//!
//! Merges a set of segments (or cold archives) into one:
//! 1. Newer files shadow older ones; only the latest version per id survives.
//! 2. Tombstones are kept as 32-byte markers so existence queries still work.
//! 3. The replaced files are retired, not deleted: a reader that still holds
//!    one keeps a valid mapping until it lets go.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::concurrency::CancelFlag;
use crate::error::VaultResult;
use crate::storage::codec::StoredEntry;
use crate::storage::segment::Segment;
use crate::types::FrameId;

/// How often (in entries) a merge checks for cancellation.
const CANCEL_CHECK_INTERVAL: usize = 256;

/// Result of one merge.
#[derive(Debug)]
pub struct CompactionResult {
    /// The merged file
    pub produced: Segment,
    /// Versions read from the inputs
    pub entries_read: u64,
    /// Versions written to the output
    pub entries_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Compaction counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub runs_completed: u64,
    pub runs_cancelled: u64,
    pub files_consumed: u64,
    pub shadowed_dropped: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Merges files and keeps counters across runs.
#[derive(Debug, Default)]
pub struct Compactor {
    runs_completed: AtomicU64,
    runs_cancelled: AtomicU64,
    files_consumed: AtomicU64,
    shadowed_dropped: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Compactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `count` files warrant a merge.
    pub fn should_compact(count: usize, threshold: usize) -> bool {
        count >= threshold && count >= 2
    }

    /// Merge `inputs` (oldest first) into a new file at `output`.
    ///
    /// Returns `Ok(None)` if cancelled; nothing is written in that case.
    /// Entries that fail to decode are logged and dropped, matching how the
    /// rest of the engine treats recovered corruption.
    pub fn merge(
        &self,
        inputs: &[Arc<Segment>],
        output: &Path,
        cancel: &CancelFlag,
    ) -> VaultResult<Option<CompactionResult>> {
        let mut latest: BTreeMap<FrameId, StoredEntry> = BTreeMap::new();
        let mut entries_read = 0u64;
        let mut bytes_read = 0u64;

        for segment in inputs {
            bytes_read += segment.file_size() as u64;
            for (i, entry) in segment.entries().enumerate() {
                if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                    self.runs_cancelled.fetch_add(1, Ordering::Relaxed);
                    info!(output = %output.display(), "compaction cancelled");
                    return Ok(None);
                }
                match entry {
                    Ok(entry) => {
                        entries_read += 1;
                        latest.insert(entry.id(), entry);
                    }
                    Err(e) => {
                        warn!(path = %segment.path().display(), error = %e, "dropping undecodable entry during compaction");
                    }
                }
            }
        }

        let merged: Vec<StoredEntry> = latest.into_values().collect();
        let produced = Segment::create(output, &merged)?;
        let entries_written = merged.len() as u64;
        let bytes_written = produced.file_size() as u64;

        for segment in inputs {
            segment.retire();
        }

        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        self.files_consumed.fetch_add(inputs.len() as u64, Ordering::Relaxed);
        self.shadowed_dropped
            .fetch_add(entries_read - entries_written, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);

        info!(
            inputs = inputs.len(),
            entries_read,
            entries_written,
            output = %output.display(),
            "compaction complete"
        );
        Ok(Some(CompactionResult {
            produced,
            entries_read,
            entries_written,
            bytes_read,
            bytes_written,
        }))
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            files_consumed: self.files_consumed.load(Ordering::Relaxed),
            shadowed_dropped: self.shadowed_dropped.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}
