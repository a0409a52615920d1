/// Memory tiering subsystem.
///
/// Records move between three tiers based on pressure and access:
///
/// - **Hot**: working set (fast, small, scored eviction)
/// - **Warm**: full-fidelity records evicted from hot
/// - **Cold**: compressed archives on disk
///
/// ## The Flow
///
/// ```text
/// append → Hot ──evict──► in flight ──consolidate──► Warm
///           ▲   (ghost stays)                          │
///           └────────────── recall ◄───────────────────┤
///                                                      ▼ pressure / idle
///                                                    Cold (Compressed → Gist → Tombstone)
/// ```
///
/// Ghosts let a query that lands near an evicted record find and recall it.
pub mod cold;
pub mod ghost;
pub mod hot;
pub mod warm;

pub use cold::{ColdStats, ColdTier, PendingSlot};
pub use ghost::{Ghost, GhostSet};
pub use hot::{EvictionToken, HotStats, HotTier};
pub use warm::{WarmStats, WarmTier};
