//! Ghosts: what the hot tier remembers about records it evicted.
//!
//! A ghost keeps the summary vector, so a query that comes close to an
//! evicted record can notice and recall it. Ghosts are dropped oldest first
//! once the set is full, and removed outright on recall or tombstone.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{FrameId, PartitionId, Tier, cosine};

/// Trace of an evicted record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ghost {
    pub id: FrameId,
    pub partition: PartitionId,
    pub timestamp: u64,
    pub confidence: f32,
    pub summary: Arc<[f32]>,
    /// Where the record lives now
    pub location: Tier,
    pub evicted_at: u64,
}

/// Bounded FIFO of ghosts.
#[derive(Debug)]
pub struct GhostSet {
    ghosts: DashMap<FrameId, Ghost>,
    order: Mutex<VecDeque<FrameId>>,
    capacity: usize,
}

impl GhostSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            ghosts: DashMap::new(),
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Add a ghost, dropping the oldest ones over capacity.
    pub fn insert(&self, ghost: Ghost) {
        if self.capacity == 0 {
            return;
        }
        let id = ghost.id;
        let mut order = self.order.lock();
        if self.ghosts.insert(id, ghost).is_none() {
            order.push_back(id);
        }
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.ghosts.remove(&oldest);
            }
        }
    }

    pub fn remove(&self, id: FrameId) -> Option<Ghost> {
        let mut order = self.order.lock();
        let (_, ghost) = self.ghosts.remove(&id)?;
        order.retain(|g| *g != id);
        Some(ghost)
    }

    pub fn get(&self, id: FrameId) -> Option<Ghost> {
        self.ghosts.get(&id).map(|g| g.clone())
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.ghosts.contains_key(&id)
    }

    /// Record that the ghost's record moved to `location`.
    pub fn relocate(&self, id: FrameId, location: Tier) {
        if let Some(mut ghost) = self.ghosts.get_mut(&id) {
            ghost.location = location;
        }
    }

    /// Ghosts of `partition`, oldest first.
    pub fn in_partition(&self, partition: PartitionId) -> Vec<Ghost> {
        let order = self.order.lock();
        order
            .iter()
            .filter_map(|id| self.ghosts.get(id))
            .filter(|g| g.partition == partition)
            .map(|g| g.clone())
            .collect()
    }

    /// Ghosts of `partition` within `threshold` cosine similarity of
    /// `vector`, most similar first.
    pub fn similar(&self, partition: PartitionId, vector: &[f32], threshold: f32) -> Vec<(Ghost, f32)> {
        let mut hits: Vec<(Ghost, f32)> = self
            .ghosts
            .iter()
            .filter(|g| g.partition == partition)
            .filter_map(|g| {
                let sim = cosine(&g.summary, vector);
                (sim >= threshold).then(|| (g.clone(), sim))
            })
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
        hits
    }

    pub fn len(&self) -> usize {
        self.ghosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ghost(id: FrameId, partition: PartitionId, summary: Vec<f32>) -> Ghost {
        Ghost {
            id,
            partition,
            timestamp: id,
            confidence: 0.5,
            summary: summary.into(),
            location: Tier::Warm,
            evicted_at: 0,
        }
    }

    #[test]
    fn test_fifo_bound() {
        let ghosts = GhostSet::new(3);
        for id in 1..=5 {
            ghosts.insert(ghost(id, 0, vec![1.0, 0.0]));
        }
        assert_eq!(ghosts.len(), 3);
        assert!(!ghosts.contains(1));
        assert!(!ghosts.contains(2));
        let ids: Vec<_> = ghosts.in_partition(0).iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_remove_and_relocate() {
        let ghosts = GhostSet::new(10);
        ghosts.insert(ghost(1, 0, vec![1.0, 0.0]));
        ghosts.relocate(1, Tier::Cold);
        assert_eq!(ghosts.get(1).unwrap().location, Tier::Cold);
        assert!(ghosts.remove(1).is_some());
        assert!(ghosts.is_empty());
        assert!(ghosts.remove(1).is_none());
    }

    #[test]
    fn test_similar_is_partition_scoped() {
        let ghosts = GhostSet::new(10);
        ghosts.insert(ghost(1, 0, vec![1.0, 0.0]));
        ghosts.insert(ghost(2, 0, vec![0.0, 1.0]));
        ghosts.insert(ghost(3, 1, vec![1.0, 0.0]));

        let hits = ghosts.similar(0, &[0.9, 0.1], 0.8);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, 1);
    }
}
