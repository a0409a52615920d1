//! # framevault: tiered memory for vector frames
//!
//! framevault stores fixed-shape **frames**: up to sixteen fields, each a
//! stack of unit vectors at increasing resolution, plus a confidence and an
//! optional lineage pointer. It gives you:
//! - **Durable appends** - every write is in a per-partition WAL before it is acknowledged
//! - **Three indexes** - HNSW similarity, time range, and exact-match tokens
//! - **Tiered memory** - hot, warm and cold tiers, with ghosts left behind on eviction
//! - **Staged forgetting** - records lose resolution step by step before they die
//! - **Coherence** - contradicting records are resolved and ranked below the winner
//!
//! ## Quick Start
//!
//! ```ignore
//! use framevault::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let vault = FrameVault::open(VaultConfig::new("./vault"))?;
//!     vault.start_workers()?;
//!
//!     // Append a frame with one field at two resolutions
//!     let id = vault.append(
//!         FrameBuilder::new(1)
//!             .field(0, 0.9)
//!             .level(0, 0, coarse)
//!             .level(0, 1, fine)
//!             .build()?,
//!     )?;
//!
//!     // Nearest neighbours, authoritative records first
//!     for hit in vault.query_similar(1, &coarse, 5)? {
//!         println!("{} {:?}", hit.id, hit.rank_score);
//!     }
//!
//!     // Everything from the last minute, lazily
//!     let now = framevault::now_nanos();
//!     for summary in vault.query_range(1, now - 60_000_000_000, now) {
//!         println!("{} at {}", summary.id, summary.timestamp);
//!     }
//!
//!     vault.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **FrameVault API** (`core`) - routing, tier moves, queries
//! 2. **Partitions** (`partition`) - metadata, epochs and write sections
//! 3. **Storage** (`storage`) - WAL, memtable, segments and compaction
//! 4. **Indexes** (`index`) - HNSW, temporal, token and membership filter
//! 5. **Memory** (`memory`) - hot, warm and cold tiers plus ghosts
//! 6. **Processes** (`processes`) - bleed, distillation, GC and coherence
//!
//! ## Thread Safety
//!
//! `FrameVault` is cheap to clone and every operation takes `&self`.
//! Writers to the same partition are serialized; readers never block on
//! writers.

mod concurrency;
pub mod config;
pub mod context;
mod core;
mod error;
pub mod frame;
pub mod index;
pub mod lifecycle;
pub mod memory;
mod partition;
pub mod processes;
pub mod query;
pub mod storage;
pub mod store;
mod types;

// Public API exports
pub use crate::concurrency::CancelFlag;
pub use crate::config::VaultConfig;
pub use crate::context::{CapabilityDescriptor, CapabilityScope, Codebook, Permission, VaultContext};
pub use crate::core::{FrameVault, MaintenanceReport, PartitionStats, VaultStats};
pub use crate::error::{VaultError, VaultResult};
pub use crate::frame::{Field, Frame, FrameBuilder, MAX_FIELDS};
pub use crate::memory::Ghost;
pub use crate::partition::RecordMeta;
pub use crate::query::{FrameQuery, RangeIter};
pub use crate::store::{FrameStore, ScopedStore};
pub use crate::types::{
    Annotations, FrameId, NANOS_PER_SEC, PartitionId, RecordSummary, Stage, Supersession, Tier, Token, cosine,
    now_nanos,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use framevault::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::VaultConfig;
    pub use crate::core::{FrameVault, VaultStats};
    pub use crate::error::{VaultError, VaultResult};
    pub use crate::frame::{Frame, FrameBuilder};
    pub use crate::query::FrameQuery;
    pub use crate::store::FrameStore;
    pub use crate::types::{FrameId, PartitionId, RecordSummary, Stage, Tier, Token};
}
