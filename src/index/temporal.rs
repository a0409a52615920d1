//! Range index over record timestamps.
//!
//! Keys are `(timestamp, id)` so records sharing a timestamp keep a stable,
//! total order. Scans are paged from an exclusive cursor: a caller asks for
//! the next `limit` keys after the last one it saw, and the read guard is
//! held only for the duration of one page.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::types::FrameId;

/// Position in a range scan: the last `(timestamp, id)` returned.
pub type RangeCursor = (u64, FrameId);

#[derive(Debug, Default)]
pub struct TemporalIndex {
    entries: RwLock<BTreeMap<(u64, FrameId), ()>>,
}

impl TemporalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, timestamp: u64, id: FrameId) {
        self.entries.write().insert((timestamp, id), ());
    }

    pub fn remove(&self, timestamp: u64, id: FrameId) {
        self.entries.write().remove(&(timestamp, id));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Up to `limit` keys in `[start, end]` strictly after `after`.
    pub fn page(
        &self,
        start: u64,
        end: u64,
        after: Option<RangeCursor>,
        limit: usize,
    ) -> Vec<RangeCursor> {
        if start > end || limit == 0 {
            return Vec::new();
        }
        let lower = match after {
            Some(cursor) if cursor >= (start, 0) => Bound::Excluded(cursor),
            _ => Bound::Included((start, 0)),
        };
        let upper = (end, FrameId::MAX);
        if let Bound::Excluded(lo) = lower {
            if lo >= upper {
                return Vec::new();
            }
        }
        self.entries
            .read()
            .range((lower, Bound::Included(upper)))
            .take(limit)
            .map(|(k, _)| *k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paged_scan_is_ordered_and_complete() {
        let index = TemporalIndex::new();
        for id in 1..=100u64 {
            // Reverse insert order, with timestamp collisions
            index.insert(1000 - (id / 2) * 10, 101 - id);
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = index.page(0, u64::MAX, cursor, 7);
            if page.is_empty() {
                break;
            }
            cursor = page.last().copied();
            seen.extend(page);
        }
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let index = TemporalIndex::new();
        for (ts, id) in [(10, 1), (20, 2), (30, 3), (30, 4), (40, 5)] {
            index.insert(ts, id);
        }
        let ids: Vec<_> = index.page(20, 30, None, 10).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![2, 3, 4]);

        let resumed: Vec<_> = index.page(20, 30, Some((30, 3)), 10).into_iter().map(|(_, id)| id).collect();
        assert_eq!(resumed, vec![4]);

        assert!(index.page(31, 39, None, 10).is_empty());
        assert!(index.page(40, 10, None, 10).is_empty());
    }

    #[test]
    fn test_remove() {
        let index = TemporalIndex::new();
        index.insert(5, 1);
        index.insert(5, 2);
        index.remove(5, 1);
        assert_eq!(index.page(0, 10, None, 10), vec![(5, 2)]);
    }
}
