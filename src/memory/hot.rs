/// Hot tier: working set of recently written and recently recalled records.
///
/// Fixed capacity, fully in RAM. Once the tier grows past its high-water
/// mark the records with the lowest eviction score are pushed down to warm,
/// each leaving a ghost behind.
///
/// ## Eviction
///
/// Scores depend on partition metadata the tier does not own, so the caller
/// supplies the scoring function to [`HotTier::select_victims`]. Only one
/// evictor runs at a time; [`HotTier::begin_eviction`] hands out the token.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::frame::Frame;
use crate::types::{FrameId, PartitionId};

#[derive(Debug)]
struct HotEntry {
    frame: Arc<Frame>,
    last_access: AtomicU64,
}

/// The hot tier.
#[derive(Debug)]
pub struct HotTier {
    entries: DashMap<FrameId, HotEntry>,
    size: AtomicUsize,
    capacity: usize,
    high_water: usize,
    evicting: AtomicBool,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl HotTier {
    /// `high_water` is the size eviction drains the tier back down to.
    pub fn new(capacity: usize, high_water: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            size: AtomicUsize::new(0),
            capacity,
            high_water: high_water.min(capacity),
            evicting: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Insert or replace a record.
    pub fn insert(&self, frame: Arc<Frame>, now: u64) {
        let previous = self.entries.insert(
            frame.id(),
            HotEntry {
                frame,
                last_access: AtomicU64::new(now),
            },
        );
        if previous.is_none() {
            self.size.fetch_add(1, Ordering::AcqRel);
        }
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

    /// Read a record without counting it as an access.
    pub fn peek(&self, id: FrameId) -> Option<Arc<Frame>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.frame))
    }

    pub fn remove(&self, id: FrameId) -> Option<Arc<Frame>> {
        let (_, entry) = self.entries.remove(&id)?;
        self.size.fetch_sub(1, Ordering::AcqRel);
        Some(entry.frame)
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size at which eviction starts, and the size it drains to.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn needs_eviction(&self) -> bool {
        self.len() > self.high_water
    }

    /// Claim the single evictor slot. `None` if another evictor is running.
    pub fn begin_eviction(&self) -> Option<EvictionToken<'_>> {
        self.evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| EvictionToken { tier: self })
    }

    /// Ids of the records to evict to get back to the high-water mark,
    /// lowest score first.
    ///
    /// `score` receives the frame and its last access time.
    pub fn select_victims(
        &self,
        _token: &EvictionToken<'_>,
        score: impl Fn(&Frame, u64) -> f32,
    ) -> Vec<FrameId> {
        let excess = self.len().saturating_sub(self.high_water);
        if excess == 0 {
            return Vec::new();
        }
        // Score outside the map's shard guards: `score` may lock other maps.
        let entries: Vec<(Arc<Frame>, u64)> = self
            .entries
            .iter()
            .map(|e| (Arc::clone(&e.frame), e.last_access.load(Ordering::Relaxed)))
            .collect();
        let mut scored: Vec<(f32, u64, FrameId)> = entries
            .iter()
            .map(|(frame, last_access)| (score(frame, *last_access), *last_access, frame.id()))
            .collect();
        // Equal scores: least recently used first.
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        scored.into_iter().take(excess).map(|(_, _, id)| id).collect()
    }

    /// Count one eviction.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Ids held for `partition`.
    pub fn ids_in(&self, partition: PartitionId) -> Vec<FrameId> {
        self.entries
            .iter()
            .filter(|e| e.frame.partition() == partition)
            .map(|e| *e.key())
            .collect()
    }

    pub fn stats(&self) -> HotStats {
        HotStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity,
        }
    }
}

/// Held by the one running evictor; releases the slot on drop.
#[derive(Debug)]
pub struct EvictionToken<'a> {
    tier: &'a HotTier,
}

impl Drop for EvictionToken<'_> {
    fn drop(&mut self) {
        self.tier.evicting.store(false, Ordering::Release);
    }
}

/// Hot tier statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HotStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl HotStats {
    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate utilization (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.current_size as f64 / self.capacity as f64
        }
    }
}
