/// Index subsystem.
///
/// Each partition carries four structures, queried in a fixed order so each
/// narrows the candidates for the next:
///
/// 1. [`MembershipFilter`]: definite-absence check for ids and tokens
/// 2. [`HnswIndex`] (similarity) or [`TemporalIndex`] (range)
/// 3. [`TokenIndex`]: exact-match intersection
///
/// Writers update all of them under the partition's write section before
/// publishing the write's sequence number; readers filter anything newer than
/// their pinned snapshot.
pub mod bloom;
pub mod hnsw;
pub mod temporal;
pub mod token;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use bloom::{BloomFilter, MembershipFilter};
pub use hnsw::{HnswConfig, HnswIndex, Neighbor};
pub use temporal::{RangeCursor, TemporalIndex};
pub use token::TokenIndex;

use crate::config::IndexConfig;
use crate::types::{FrameId, Token};

/// All indexes of one partition.
#[derive(Debug)]
pub struct PartitionIndex {
    pub similarity: HnswIndex,
    pub temporal: TemporalIndex,
    pub tokens: TokenIndex,
    pub filter: MembershipFilter,
    expected_items: AtomicUsize,
}

impl PartitionIndex {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            similarity: HnswIndex::new(config.hnsw),
            temporal: TemporalIndex::new(),
            tokens: TokenIndex::new(),
            filter: MembershipFilter::new(config.bloom_expected_items, config.bloom_fp_rate),
            expected_items: AtomicUsize::new(config.bloom_expected_items),
        }
    }

    /// Make a live record discoverable.
    pub fn insert(&self, id: FrameId, timestamp: u64, summary: Arc<[f32]>, tokens: &[Token]) {
        self.similarity.add(id, summary);
        self.temporal.insert(timestamp, id);
        for token in tokens {
            self.tokens.insert(*token, id);
            self.filter.insert_token(*token);
        }
        self.filter.insert_id(id);
    }

    /// Register an id that is known but not searchable (a tombstone).
    pub fn insert_id_only(&self, id: FrameId) {
        self.filter.insert_id(id);
    }

    /// Remove a record from the searchable indexes. The id stays in the
    /// membership filter so existence lookups still find the tombstone.
    pub fn remove(&self, id: FrameId, timestamp: u64, tokens: &[Token]) {
        self.similarity.remove(id);
        self.temporal.remove(timestamp, id);
        for token in tokens {
            self.tokens.remove(*token, id);
        }
    }

    /// Rebuild the membership filter larger once it has saturated.
    ///
    /// `ids` must list every id the partition knows about, and the caller
    /// must hold the partition's write section until this returns. Returns
    /// whether a rebuild happened.
    pub fn grow_filter_if_saturated(&self, ids: impl Iterator<Item = FrameId>) -> bool {
        if !self.filter.is_saturated() {
            return false;
        }
        let ids: Vec<FrameId> = ids.collect();
        let tokens = self.tokens.tokens();
        let expected = (self.expected_items.load(Ordering::Relaxed) * 2).max((ids.len() + tokens.len()) * 2);
        self.expected_items.store(expected, Ordering::Relaxed);
        self.filter.rebuild(expected, |fresh| {
            for id in &ids {
                fresh.insert_id(*id);
            }
            for token in &tokens {
                fresh.insert_token(*token);
            }
        });
        tracing::info!(expected, "membership filter rebuilt");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IndexConfig {
        IndexConfig {
            bloom_expected_items: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_remove_everywhere() {
        let index = PartitionIndex::new(&config());
        let token = Token::new(0, 3);
        index.insert(1, 100, vec![1.0, 0.0].into(), &[token]);

        assert!(index.filter.may_contain_id(1));
        assert!(index.filter.may_contain_token(token));
        assert_eq!(index.similarity.len(), 1);
        assert_eq!(index.temporal.len(), 1);
        assert!(index.tokens.get(token).contains(&1));

        index.remove(1, 100, &[token]);
        assert!(index.similarity.is_empty());
        assert!(index.temporal.is_empty());
        assert!(index.tokens.get(token).is_empty());
        assert!(index.filter.may_contain_id(1));
    }

    #[test]
    fn test_filter_grows() {
        let index = PartitionIndex::new(&config());
        for id in 1..=20u64 {
            index.insert(id, id, vec![1.0, id as f32].into(), &[]);
        }
        assert!(index.grow_filter_if_saturated(1..=20u64));
        assert!(!index.filter.is_saturated());
        assert!((1..=20u64).all(|id| index.filter.may_contain_id(id)));
    }
}
