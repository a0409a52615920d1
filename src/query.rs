/// Query types for framevault.
///
/// The composed query path narrows candidates in a fixed order:
///
/// 1. **Routing**: the partition is looked up directly
/// 2. **Membership**: any requested token the partition's filter has never
///    seen ends the query with no results
/// 3. **Index**: similarity search, a time range, or the token set itself
/// 4. **Tokens**: candidates outside the token intersection are dropped
/// 5. **Fetch**: candidates become [`RecordSummary`]s
///
/// # Example
///
/// ```ignore
/// use framevault::query::FrameQuery;
///
/// let query = FrameQuery::new(1)
///     .similar_to(vector)
///     .with_token(token)
///     .authoritative_only()
///     .limit(5);
///
/// let results = vault.query(&query)?;
/// ```
use std::collections::VecDeque;
use std::sync::Arc;

use crate::concurrency::{CancelFlag, Snapshot};
use crate::index::RangeCursor;
use crate::partition::Partition;
use crate::types::{PartitionId, RecordSummary, Token};

/// Default number of results of a composed query.
pub const DEFAULT_LIMIT: usize = 10;

/// A composed query against one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameQuery {
    pub partition: PartitionId,
    pub similar_to: Option<Vec<f32>>,
    /// Inclusive time bounds
    pub between: Option<(u64, u64)>,
    pub tokens: Vec<Token>,
    pub limit: usize,
    pub authoritative_only: bool,
    /// Recall ghosts at least this similar before searching
    pub recall_threshold: Option<f32>,
}

impl FrameQuery {
    /// Create an empty query for `partition`.
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            similar_to: None,
            between: None,
            tokens: Vec::new(),
            limit: DEFAULT_LIMIT,
            authoritative_only: false,
            recall_threshold: None,
        }
    }

    /// Rank by similarity to `vector`.
    pub fn similar_to(mut self, vector: Vec<f32>) -> Self {
        self.similar_to = Some(vector);
        self
    }

    /// Restrict to records created in `[start, end]`.
    pub fn between(mut self, start: u64, end: u64) -> Self {
        self.between = Some((start, end));
        self
    }

    /// Require an exact-match token. Repeated calls intersect.
    pub fn with_token(mut self, token: Token) -> Self {
        self.tokens.push(token);
        self
    }

    /// Maximum number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Drop records superseded in this partition.
    pub fn authoritative_only(mut self) -> Self {
        self.authoritative_only = true;
        self
    }

    /// Recall evicted records whose ghosts are at least `threshold` similar
    /// to the query vector.
    pub fn recall_ghosts(mut self, threshold: f32) -> Self {
        self.recall_threshold = Some(threshold);
        self
    }
}

/// Sort similarity hits by rank score (then id) and keep the best `k`.
pub(crate) fn rank(mut hits: Vec<RecordSummary>, k: usize) -> Vec<RecordSummary> {
    hits.sort_by(|a, b| {
        let ra = a.rank_score.unwrap_or(f32::MIN);
        let rb = b.rank_score.unwrap_or(f32::MIN);
        rb.total_cmp(&ra).then(a.id.cmp(&b.id))
    });
    hits.truncate(k);
    hits
}

/// Lazy, paged iterator over a partition's records in `(timestamp, id)`
/// order.
///
/// The partition's snapshot is pinned when the iterator is created; records
/// written afterwards are not yielded. Each page holds the range index's
/// read guard only while it is being copied out. Dropping the iterator
/// stops the scan; so does cancelling the flag given to
/// [`RangeIter::with_cancel`].
#[derive(Debug)]
pub struct RangeIter {
    partition: Option<Arc<Partition>>,
    snapshot: Snapshot,
    start: u64,
    end: u64,
    fetched: Option<RangeCursor>,
    yielded: Option<RangeCursor>,
    buffer: VecDeque<RecordSummary>,
    page_size: usize,
    exhausted: bool,
    cancel: Option<CancelFlag>,
}

impl RangeIter {
    pub(crate) fn new(
        partition: Option<Arc<Partition>>,
        start: u64,
        end: u64,
        after: Option<RangeCursor>,
        page_size: usize,
    ) -> Self {
        let snapshot = partition
            .as_ref()
            .map_or_else(Snapshot::latest, |p| p.snapshot());
        Self {
            exhausted: partition.is_none() || start > end,
            partition,
            snapshot,
            start,
            end,
            fetched: after,
            yielded: after,
            buffer: VecDeque::new(),
            page_size: page_size.max(1),
            cancel: None,
        }
    }

    /// An iterator that yields nothing.
    pub fn empty() -> Self {
        Self::new(None, 1, 0, None, 1)
    }

    /// Stop early once `cancel` is set.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Position after the last yielded record, for `resume_range`.
    pub fn cursor(&self) -> Option<RangeCursor> {
        self.yielded
    }

    fn fill(&mut self) {
        let Some(partition) = &self.partition else {
            self.exhausted = true;
            return;
        };
        while self.buffer.is_empty() && !self.exhausted {
            let keys = partition
                .index()
                .temporal
                .page(self.start, self.end, self.fetched, self.page_size);
            if keys.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = keys.last() {
                self.fetched = Some(*last);
            }
            for (_, id) in keys {
                if let Some(meta) = partition.visible(id, self.snapshot).filter(|m| m.is_live()) {
                    self.buffer.push_back(meta.to_summary(partition.id()));
                }
            }
        }
    }
}

impl Iterator for RangeIter {
    type Item = RecordSummary;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return None;
        }
        if self.buffer.is_empty() {
            self.fill();
        }
        let summary = self.buffer.pop_front()?;
        self.yielded = Some((summary.timestamp, summary.id));
        Some(summary)
    }
}
