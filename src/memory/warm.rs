/// Warm tier: full-fidelity records evicted from hot.
///
/// Larger than hot and still in RAM. Records leave warm in two ways: recall
/// promotes them back to hot, and archival compresses them into cold. The
/// archival pass asks for candidates through
/// [`WarmTier::demotion_candidates`] (pressure) and
/// [`WarmTier::idle_candidates`] (scheduled idle cycles).
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::frame::Frame;
use crate::types::{FrameId, PartitionId};

#[derive(Debug)]
struct WarmEntry {
    frame: Arc<Frame>,
    last_access: AtomicU64,
}

/// The warm tier.
#[derive(Debug)]
pub struct WarmTier {
    entries: DashMap<FrameId, WarmEntry>,
    capacity: usize,

    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
}

impl WarmTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
        }
    }

    /// Insert or replace a record, keeping its last access time.
    pub fn insert(&self, frame: Arc<Frame>, last_access: u64) {
        self.entries.insert(
            frame.id(),
            WarmEntry {
                frame,
                last_access: AtomicU64::new(last_access),
            },
        );
    }

    /// Read a record and refresh its access time.
    pub fn get(&self, id: FrameId, now: u64) -> Option<Arc<Frame>> {
        match self.entries.get(&id) {
            Some(entry) => {
                entry.last_access.store(now, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.frame))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn peek(&self, id: FrameId) -> Option<Arc<Frame>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.frame))
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove a record on its way back to hot.
    pub fn promote(&self, id: FrameId) -> Option<Arc<Frame>> {
        let (_, entry) = self.entries.remove(&id)?;
        self.promotions.fetch_add(1, Ordering::Relaxed);
        Some(entry.frame)
    }

    /// Remove a record on its way down to cold.
    pub fn demote(&self, id: FrameId) -> Option<Arc<Frame>> {
        let (_, entry) = self.entries.remove(&id)?;
        self.demotions.fetch_add(1, Ordering::Relaxed);
        Some(entry.frame)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Up to `limit` records, least recently accessed first.
    pub fn demotion_candidates(&self, limit: usize) -> Vec<(PartitionId, FrameId)> {
        let mut all: Vec<(u64, PartitionId, FrameId)> = self
            .entries
            .iter()
            .map(|e| (e.last_access.load(Ordering::Relaxed), e.frame.partition(), *e.key()))
            .collect();
        all.sort_unstable();
        all.into_iter().take(limit).map(|(_, p, id)| (p, id)).collect()
    }

    /// Records not accessed since `cutoff`.
    pub fn idle_candidates(&self, cutoff: u64) -> Vec<(PartitionId, FrameId)> {
        self.entries
            .iter()
            .filter(|e| e.last_access.load(Ordering::Relaxed) < cutoff)
            .map(|e| (e.frame.partition(), *e.key()))
            .collect()
    }

    pub fn stats(&self) -> WarmStats {
        WarmStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity,
        }
    }
}

/// Warm tier statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WarmStats {
    pub hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl WarmStats {
    /// Calculate utilization (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.current_size as f64 / self.capacity as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;

    fn frame(id: FrameId) -> Arc<Frame> {
        let mut frame = FrameBuilder::new(id % 2)
            .field(0, 0.5)
            .level(0, 0, vec![0.0, 1.0])
            .build()
            .unwrap();
        frame.assign(id, id);
        Arc::new(frame)
    }

    #[test]
    fn test_demotion_candidates_oldest_first() {
        let warm = WarmTier::new(10);
        warm.insert(frame(1), 300);
        warm.insert(frame(2), 100);
        warm.insert(frame(3), 200);
        warm.get(2, 400);

        let ids: Vec<_> = warm.demotion_candidates(2).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn test_idle_candidates() {
        let warm = WarmTier::new(10);
        warm.insert(frame(1), 100);
        warm.insert(frame(2), 500);
        let idle = warm.idle_candidates(200);
        assert_eq!(idle, vec![(1, 1)]);
    }

    #[test]
    fn test_promote_and_demote_counts() {
        let warm = WarmTier::new(10);
        warm.insert(frame(1), 0);
        warm.insert(frame(2), 0);
        assert!(warm.promote(1).is_some());
        assert!(warm.demote(2).is_some());
        assert!(warm.demote(2).is_none());
        let stats = warm.stats();
        assert_eq!((stats.promotions, stats.demotions, stats.current_size), (1, 1, 0));
    }
}
