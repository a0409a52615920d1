//! Concurrency primitives shared by every partition.
//!
//! Readers never lock. Each partition publishes a monotone visibility
//! watermark ([`PartitionEpoch`]); every write is stamped with the next
//! sequence number and becomes visible only when the writer publishes it,
//! after all indexes and metadata carry the entry. A reader pins the current
//! watermark once ([`Snapshot`]) and ignores anything stamped later.
//!
//! Writers to one partition serialize on its [`WriteSection`]; writers to
//! different partitions never meet.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::error::{VaultError, VaultResult};
use crate::types::PartitionId;

// ── PartitionEpoch ─────────────────────────────────────────────────────

/// Per-partition sequence allocator and visibility watermark.
///
/// `next` is only advanced by the holder of the partition's write section;
/// `visible` is read lock-free by any number of readers.
#[derive(Debug)]
pub struct PartitionEpoch {
    next: AtomicU64,
    visible: AtomicU64,
}

impl PartitionEpoch {
    /// Start with every sequence up to `published` visible.
    pub fn new(published: u64) -> Self {
        Self {
            next: AtomicU64::new(published + 1),
            visible: AtomicU64::new(published),
        }
    }

    /// Reserve the next sequence number for a write.
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Make every write up to and including `seq` visible (Release ordering).
    ///
    /// The watermark never moves backwards.
    pub fn publish(&self, seq: u64) {
        self.visible.fetch_max(seq, Ordering::Release);
        trace!(seq, "epoch published");
    }

    /// Read the current watermark (Acquire ordering).
    pub fn current(&self) -> u64 {
        self.visible.load(Ordering::Acquire)
    }

    /// Pin a read snapshot.
    pub fn pin(&self) -> Snapshot {
        Snapshot {
            epoch: self.current(),
        }
    }
}

/// A pinned view of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    epoch: u64,
}

impl Snapshot {
    /// A snapshot that sees everything; used by maintenance passes that
    /// already hold the write section.
    pub fn latest() -> Self {
        Self { epoch: u64::MAX }
    }

    /// Watermark this snapshot was taken at.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a write stamped with `seq` is visible.
    pub fn sees(&self, seq: u64) -> bool {
        seq <= self.epoch
    }
}

// ── WriteSection ───────────────────────────────────────────────────────

/// Mutual exclusion for one partition's writers.
#[derive(Debug)]
pub struct WriteSection<T> {
    partition: PartitionId,
    timeout: Duration,
    inner: Mutex<T>,
}

impl<T> WriteSection<T> {
    pub fn new(partition: PartitionId, timeout: Duration, value: T) -> Self {
        Self {
            partition,
            timeout,
            inner: Mutex::new(value),
        }
    }

    /// Enter the section, waiting at most the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::ContentionTimeout`] if another writer holds the
    /// section for longer than the timeout.
    pub fn enter(&self) -> VaultResult<SectionGuard<'_, T>> {
        let started = Instant::now();
        match self.inner.try_lock_for(self.timeout) {
            Some(guard) => Ok(SectionGuard {
                partition: self.partition,
                guard,
            }),
            None => Err(VaultError::ContentionTimeout {
                partition: self.partition,
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Partition this section protects.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }
}

/// Exclusive access to a partition's writer state.
pub struct SectionGuard<'a, T> {
    partition: PartitionId,
    guard: MutexGuard<'a, T>,
}

impl<T> SectionGuard<'_, T> {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }
}

impl<T> Deref for SectionGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SectionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// ── CancelFlag ─────────────────────────────────────────────────────────

/// Cooperative cancellation shared between a pass and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Re-arm the flag for the next pass.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_epoch_visibility() {
        let epoch = PartitionEpoch::new(0);
        let before = epoch.pin();

        let s1 = epoch.allocate();
        let s2 = epoch.allocate();
        assert_eq!((s1, s2), (1, 2));
        assert!(!before.sees(s1));

        epoch.publish(s1);
        let mid = epoch.pin();
        assert!(mid.sees(s1));
        assert!(!mid.sees(s2));
        // The earlier snapshot stays where it was
        assert!(!before.sees(s1));

        epoch.publish(s2);
        epoch.publish(s1);
        assert_eq!(epoch.current(), 2);
    }

    #[test]
    fn test_epoch_resumes_after_recovery() {
        let epoch = PartitionEpoch::new(41);
        assert_eq!(epoch.current(), 41);
        assert_eq!(epoch.allocate(), 42);
    }

    #[test]
    fn test_write_section_timeout() {
        let section = Arc::new(WriteSection::new(5, Duration::from_millis(20), 0u32));
        let held = section.enter().unwrap();

        let other = Arc::clone(&section);
        let result = thread::spawn(move || other.enter().map(|_| ())).join().unwrap();
        match result {
            Err(VaultError::ContentionTimeout { partition, waited_ms }) => {
                assert_eq!(partition, 5);
                assert!(waited_ms >= 15);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        drop(held);
        assert!(section.enter().is_ok());
    }

    #[test]
    fn test_write_section_serializes_writers() {
        let section = Arc::new(WriteSection::new(1, Duration::from_secs(5), 0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&section);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *s.enter().unwrap() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*section.enter().unwrap(), 8000);
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!clone.is_cancelled());
    }
}
