/// Common types used throughout framevault.
///
/// Identifiers, the compression stage and tier enums, exact-match tokens,
/// record annotations and the `RecordSummary` returned by every query.
use serde::{Deserialize, Serialize};

/// Engine-assigned record identifier. `0` means "not yet assigned".
pub type FrameId = u64;

/// Logical shard ("strand") a record belongs to.
pub type PartitionId = u64;

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or(0)
}

/// Nanoseconds per second, for converting config durations.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Compression stage of a stored record.
///
/// Ordered so that `Tombstone < Gist < Compressed < Full`; the garbage
/// collector only ever moves a record downwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Id and death time only
    Tombstone = 0,
    /// Coarsest resolution per field
    Gist = 1,
    /// Two coarsest resolutions per field
    Compressed = 2,
    /// Complete payload
    Full = 3,
}

impl Stage {
    /// Decode from the on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Stage::Tombstone),
            1 => Some(Stage::Gist),
            2 => Some(Stage::Compressed),
            3 => Some(Stage::Full),
            _ => None,
        }
    }

    /// On-disk tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// The next, smaller stage, or `None` for a tombstone.
    pub fn next(self) -> Option<Self> {
        match self {
            Stage::Full => Some(Stage::Compressed),
            Stage::Compressed => Some(Stage::Gist),
            Stage::Gist => Some(Stage::Tombstone),
            Stage::Tombstone => None,
        }
    }

    /// How many resolutions per field the stage keeps.
    pub fn kept_resolutions(self) -> usize {
        match self {
            Stage::Full => crate::frame::NUM_RESOLUTIONS,
            Stage::Compressed => 2,
            Stage::Gist => 1,
            Stage::Tombstone => 0,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Full => write!(f, "full"),
            Stage::Compressed => write!(f, "compressed"),
            Stage::Gist => write!(f, "gist"),
            Stage::Tombstone => write!(f, "tombstone"),
        }
    }
}

/// Storage tier a record currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Small, fixed capacity, in RAM
    Hot,
    /// Larger, full fidelity, indexed
    Warm,
    /// Compressed archives on disk
    Cold,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Warm => write!(f, "warm"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

/// Quantized exact-match key: `(field << 16) | code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub u32);

impl Token {
    /// Build a token from a field index and a codebook code.
    pub fn new(field: usize, code: u16) -> Self {
        Token(((field as u32) << 16) | code as u32)
    }

    /// Field index this token was derived from.
    pub fn field(self) -> usize {
        (self.0 >> 16) as usize
    }

    /// Codebook code.
    pub fn code(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field(), self.code())
    }
}

/// Result of a coherence resolution: the record lost to `winner`
/// within partition `scope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supersession {
    /// The record that stays authoritative
    pub winner: FrameId,
    /// Partition in which the loss applies
    pub scope: PartitionId,
}

/// Lifecycle annotations stored alongside every version of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    /// Externally pinned (immortal)
    pub pinned: bool,
    /// This record is a distilled cluster summary
    pub summary: bool,
    /// Summary this record was distilled into
    pub distilled_into: Option<FrameId>,
    /// Set once the coherence scan resolved a contradiction against it
    pub superseded: Option<Supersession>,
}

impl Annotations {
    /// Whether the record is superseded when `active` is the querying partition.
    pub fn superseded_in(&self, active: PartitionId) -> bool {
        self.superseded.is_some_and(|s| s.scope == active)
    }
}

/// Compact description of a record, returned by all query entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    /// Record id
    pub id: FrameId,
    /// Owning partition
    pub partition: PartitionId,
    /// Creation time (ns)
    pub timestamp: u64,
    /// Confidence as stored at creation
    pub confidence: f32,
    /// Current compression stage
    pub stage: Stage,
    /// Tier the record currently lives in
    pub tier: Tier,
    /// Lineage pointer
    pub parent_ref: Option<FrameId>,
    /// Winner, if the record was superseded
    pub superseded_by: Option<FrameId>,
    /// False when superseded in the querying partition's scope
    pub authoritative: bool,
    /// Cosine similarity to the query vector (similarity queries only)
    pub similarity: Option<f32>,
    /// Similarity after the supersession penalty (similarity queries only)
    pub rank_score: Option<f32>,
}

/// Dot product of two equally sized vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean norm.
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity, `0.0` when either side is a zero vector or dims differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let denom = norm(a) * norm(b);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / denom
}

/// Scale `v` to unit length in place. Returns false for a zero vector.
pub fn normalize(v: &mut [f32]) -> bool {
    let n = norm(v);
    if n <= f32::EPSILON || !n.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= n;
    }
    true
}
