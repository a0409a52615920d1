//! Exact-match index: token → ids carrying it.

use std::collections::BTreeSet;

use dashmap::DashMap;

use crate::types::{FrameId, Token};

#[derive(Debug, Default)]
pub struct TokenIndex {
    postings: DashMap<Token, BTreeSet<FrameId>>,
}

impl TokenIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: Token, id: FrameId) {
        self.postings.entry(token).or_default().insert(id);
    }

    pub fn remove(&self, token: Token, id: FrameId) {
        if let Some(mut ids) = self.postings.get_mut(&token) {
            ids.remove(&id);
        }
        self.postings.remove_if(&token, |_, ids| ids.is_empty());
    }

    /// Ids carrying `token`.
    pub fn get(&self, token: Token) -> BTreeSet<FrameId> {
        self.postings
            .get(&token)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Ids carrying every token in `tokens`. An empty token list matches nothing.
    pub fn intersect(&self, tokens: &[Token]) -> BTreeSet<FrameId> {
        let mut sets: Vec<BTreeSet<FrameId>> = tokens.iter().map(|t| self.get(*t)).collect();
        // Start from the smallest posting list
        sets.sort_by_key(|s| s.len());
        let mut iter = sets.into_iter();
        let Some(mut acc) = iter.next() else {
            return BTreeSet::new();
        };
        for set in iter {
            acc.retain(|id| set.contains(id));
            if acc.is_empty() {
                break;
            }
        }
        acc
    }

    /// Number of distinct tokens.
    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Every token currently indexed.
    pub fn tokens(&self) -> Vec<Token> {
        self.postings.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let index = TokenIndex::new();
        let t = Token::new(1, 5);
        index.insert(t, 10);
        index.insert(t, 3);
        assert_eq!(index.get(t).into_iter().collect::<Vec<_>>(), vec![3, 10]);

        index.remove(t, 3);
        index.remove(t, 10);
        assert!(index.get(t).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_intersection() {
        let index = TokenIndex::new();
        let a = Token::new(0, 1);
        let b = Token::new(2, 9);
        for id in 1..=10 {
            index.insert(a, id);
        }
        for id in [2, 4, 11] {
            index.insert(b, id);
        }
        assert_eq!(index.intersect(&[a, b]).into_iter().collect::<Vec<_>>(), vec![2, 4]);
        assert!(index.intersect(&[a, Token::new(7, 7)]).is_empty());
        assert!(index.intersect(&[]).is_empty());
    }
}
