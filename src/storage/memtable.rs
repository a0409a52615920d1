//! Sorted in-memory write buffer.
//!
//! Every accepted version lands here after the WAL. Latest version per id
//! wins. When the approximate size passes the flush threshold the whole
//! table is written out as one segment and the WAL is truncated.

use std::collections::BTreeMap;

use crate::storage::codec::StoredEntry;
use crate::types::FrameId;

/// Fixed per-entry overhead added to the encoded size.
const ENTRY_OVERHEAD: usize = 48;

#[derive(Debug, Default)]
pub struct Memtable {
    map: BTreeMap<FrameId, StoredEntry>,
    approx_bytes: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a version, replacing any earlier one for the same id.
    pub fn insert(&mut self, entry: StoredEntry) {
        let size = entry.encoded_len() + ENTRY_OVERHEAD;
        if let Some(old) = self.map.insert(entry.id(), entry) {
            self.approx_bytes -= old.encoded_len() + ENTRY_OVERHEAD;
        }
        self.approx_bytes += size;
    }

    pub fn get(&self, id: FrameId) -> Option<&StoredEntry> {
        self.map.get(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    /// Entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredEntry> {
        self.map.values()
    }

    /// Take every entry out, leaving the table empty.
    pub fn drain(&mut self) -> Vec<StoredEntry> {
        self.approx_bytes = 0;
        std::mem::take(&mut self.map).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::TombstoneRecord;

    fn tomb(id: FrameId, died_at: u64) -> StoredEntry {
        StoredEntry::Tombstone(TombstoneRecord::new(id, 0, died_at, None))
    }

    #[test]
    fn test_latest_version_wins() {
        let mut table = Memtable::new();
        table.insert(tomb(5, 1));
        table.insert(tomb(2, 1));
        let before = table.approx_bytes();
        table.insert(tomb(5, 9));

        assert_eq!(table.len(), 2);
        assert_eq!(table.approx_bytes(), before);
        assert_eq!(table.get(5).unwrap().timestamp(), 9);
    }

    #[test]
    fn test_drain_is_sorted_and_resets() {
        let mut table = Memtable::new();
        for id in [9, 3, 7] {
            table.insert(tomb(id, id));
        }
        let ids: Vec<_> = table.drain().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![3, 7, 9]);
        assert!(table.is_empty());
        assert_eq!(table.approx_bytes(), 0);
    }
}
