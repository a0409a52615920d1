//! Binary record format shared by the WAL, segments and cold archives.
//!
//! A live entry body is a [`FrameHeader`] followed by one `u32` tag per
//! populated `(field, resolution)` pair (`field << 8 | resolution`, sorted),
//! then the vectors in tag order. A tombstone body is a bare
//! [`TombstoneRecord`]. The stage travels outside the body (WAL entry header,
//! segment index row), which is how the two shapes are told apart.
//!
//! Segment bodies are 8-byte aligned inside an mmap and are read in place
//! through [`EntryView`]; WAL bodies have no alignment guarantee and go
//! through [`StoredEntry::decode`], which copies with `pod_read_unaligned`.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable, bytes_of, pod_read_unaligned};

use crate::error::{VaultError, VaultResult};
use crate::frame::{Field, Frame, MAX_FIELDS, NUM_RESOLUTIONS};
use crate::types::{Annotations, FrameId, PartitionId, Stage, Supersession};

pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();
pub const TOMBSTONE_SIZE: usize = std::mem::size_of::<TombstoneRecord>();

const NO_CODE: u16 = u16::MAX;
const FLAG_PINNED: u8 = 0b01;
const FLAG_SUMMARY: u8 = 0b10;

/// Fixed-size prefix of every live entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameHeader {
    pub id: u64,
    pub partition: u64,
    pub timestamp: u64,
    /// 0 = no parent
    pub parent_ref: u64,
    /// 0 = authoritative
    pub superseded_by: u64,
    pub supersession_scope: u64,
    /// 0 = not distilled
    pub distilled_into: u64,
    pub confidence: f32,
    pub slot_mask: u16,
    pub stage: u8,
    pub flags: u8,
    pub dim: u32,
    pub vector_count: u32,
    pub resolution_mask: [u8; MAX_FIELDS],
    pub field_confidence: [f32; MAX_FIELDS],
    /// `u16::MAX` = no producer code
    pub codebook: [u16; MAX_FIELDS],
}

impl FrameHeader {
    pub fn annotations(&self) -> Annotations {
        Annotations {
            pinned: self.flags & FLAG_PINNED != 0,
            summary: self.flags & FLAG_SUMMARY != 0,
            distilled_into: nonzero(self.distilled_into),
            superseded: nonzero(self.superseded_by).map(|winner| Supersession {
                winner,
                scope: self.supersession_scope,
            }),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        Stage::from_tag(self.stage)
    }
}

fn nonzero(v: u64) -> Option<u64> {
    (v != 0).then_some(v)
}

/// What remains of a record after the last compression stage.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct TombstoneRecord {
    pub id: u64,
    pub partition: u64,
    pub died_at: u64,
    /// 0 = none
    pub superseded_by: u64,
}

impl TombstoneRecord {
    pub fn new(
        id: FrameId,
        partition: PartitionId,
        died_at: u64,
        superseded_by: Option<FrameId>,
    ) -> Self {
        Self {
            id,
            partition,
            died_at,
            superseded_by: superseded_by.unwrap_or(0),
        }
    }
}

/// A record version that is not yet a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEntry {
    pub frame: Arc<Frame>,
    pub stage: Stage,
    pub annotations: Annotations,
}

/// One version of a record as persisted. The latest version per id wins.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredEntry {
    Live(LiveEntry),
    Tombstone(TombstoneRecord),
}

impl StoredEntry {
    pub fn live(frame: Arc<Frame>, stage: Stage, annotations: Annotations) -> Self {
        StoredEntry::Live(LiveEntry {
            frame,
            stage,
            annotations,
        })
    }

    pub fn id(&self) -> FrameId {
        match self {
            StoredEntry::Live(e) => e.frame.id(),
            StoredEntry::Tombstone(t) => t.id,
        }
    }

    pub fn partition(&self) -> PartitionId {
        match self {
            StoredEntry::Live(e) => e.frame.partition(),
            StoredEntry::Tombstone(t) => t.partition,
        }
    }

    /// Creation time for live entries, death time for tombstones.
    pub fn timestamp(&self) -> u64 {
        match self {
            StoredEntry::Live(e) => e.frame.timestamp(),
            StoredEntry::Tombstone(t) => t.died_at,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            StoredEntry::Live(e) => e.stage,
            StoredEntry::Tombstone(_) => Stage::Tombstone,
        }
    }

    pub fn as_live(&self) -> Option<&LiveEntry> {
        match self {
            StoredEntry::Live(e) => Some(e),
            StoredEntry::Tombstone(_) => None,
        }
    }

    /// Size of [`encode`](Self::encode)'s output.
    pub fn encoded_len(&self) -> usize {
        match self {
            StoredEntry::Live(e) => live_len(&e.frame),
            StoredEntry::Tombstone(_) => TOMBSTONE_SIZE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            StoredEntry::Tombstone(t) => bytes_of(t).to_vec(),
            StoredEntry::Live(e) => encode_live(e),
        }
    }

    /// Decode a body of unknown alignment.
    pub fn decode(stage: Stage, bytes: &[u8]) -> VaultResult<Self> {
        if stage == Stage::Tombstone {
            if bytes.len() != TOMBSTONE_SIZE {
                return Err(VaultError::corrupt(
                    "tombstone",
                    format!("expected {} bytes, got {}", TOMBSTONE_SIZE, bytes.len()),
                ));
            }
            return Ok(StoredEntry::Tombstone(pod_read_unaligned(bytes)));
        }

        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(VaultError::corrupt(
                "frame",
                format!("{} bytes is shorter than the header", bytes.len()),
            ));
        }
        let header: FrameHeader = pod_read_unaligned(&bytes[..FRAME_HEADER_SIZE]);
        let (tag_bytes, vector_bytes) = split_body(&header, &bytes[FRAME_HEADER_SIZE..])?;
        let tags: Vec<u32> = tag_bytes.chunks_exact(4).map(pod_read_unaligned).collect();
        let vectors: Vec<f32> = vector_bytes.chunks_exact(4).map(pod_read_unaligned).collect();
        decode_live(stage, &header, &tags, &vectors).map(StoredEntry::Live)
    }
}

fn live_len(frame: &Frame) -> usize {
    let n = frame.vector_count();
    FRAME_HEADER_SIZE + n * 4 + n * frame.dim() * 4
}

fn encode_live(entry: &LiveEntry) -> Vec<u8> {
    let frame = &entry.frame;
    let ann = &entry.annotations;
    let mut header = FrameHeader::zeroed();
    header.id = frame.id();
    header.partition = frame.partition();
    header.timestamp = frame.timestamp();
    header.parent_ref = frame.parent_ref().unwrap_or(0);
    if let Some(s) = ann.superseded {
        header.superseded_by = s.winner;
        header.supersession_scope = s.scope;
    }
    header.distilled_into = ann.distilled_into.unwrap_or(0);
    header.confidence = frame.confidence();
    header.slot_mask = frame.slot_mask();
    header.stage = entry.stage.tag();
    header.flags = (if ann.pinned { FLAG_PINNED } else { 0 })
        | (if ann.summary { FLAG_SUMMARY } else { 0 });
    header.dim = frame.dim() as u32;
    header.vector_count = frame.vector_count() as u32;
    header.resolution_mask = *frame.resolution_mask();
    header.codebook = [NO_CODE; MAX_FIELDS];
    for (i, field) in frame.fields() {
        header.field_confidence[i] = field.confidence();
        header.codebook[i] = field.code().unwrap_or(NO_CODE);
    }

    let mut out = Vec::with_capacity(live_len(frame));
    out.extend_from_slice(bytes_of(&header));
    for (i, field) in frame.fields() {
        for (r, _) in field.levels() {
            let tag = ((i as u32) << 8) | r as u32;
            out.extend_from_slice(&tag.to_ne_bytes());
        }
    }
    for (_, field) in frame.fields() {
        for (_, v) in field.levels() {
            out.extend_from_slice(bytemuck::cast_slice(v));
        }
    }
    out
}

/// Split the bytes after the header into tag and vector regions.
fn split_body<'a>(header: &FrameHeader, body: &'a [u8]) -> VaultResult<(&'a [u8], &'a [u8])> {
    let location = || format!("frame {}", header.id);
    let n = header.vector_count as usize;
    let dim = header.dim as usize;
    let tag_len = n.checked_mul(4);
    let expected = tag_len
        .zip(n.checked_mul(dim).and_then(|x| x.checked_mul(4)))
        .and_then(|(tags, vectors)| tags.checked_add(vectors))
        .ok_or_else(|| {
            VaultError::corrupt(
                location(),
                format!("{} vectors of dimension {} overflow the body size", n, dim),
            )
        })?;
    if body.len() != expected {
        return Err(VaultError::corrupt(
            location(),
            format!("body is {} bytes, header implies {}", body.len(), expected),
        ));
    }
    Ok(body.split_at(n * 4))
}

fn decode_live(
    stage: Stage,
    header: &FrameHeader,
    tags: &[u32],
    vectors: &[f32],
) -> VaultResult<LiveEntry> {
    let location = || format!("frame {}", header.id);
    if header.stage() != Some(stage) {
        return Err(VaultError::corrupt(
            location(),
            format!("stage tag {} disagrees with {}", header.stage, stage),
        ));
    }
    let dim = header.dim as usize;
    let mut levels: [[Option<Vec<f32>>; NUM_RESOLUTIONS]; MAX_FIELDS] = Default::default();
    for (i, tag) in tags.iter().enumerate() {
        let field = (tag >> 8) as usize;
        let res = (tag & 0xFF) as usize;
        if field >= MAX_FIELDS || res >= NUM_RESOLUTIONS {
            return Err(VaultError::corrupt(location(), format!("bad vector tag {:#x}", tag)));
        }
        levels[field][res] = Some(vectors[i * dim..(i + 1) * dim].to_vec());
    }

    let mut fields: [Option<Field>; MAX_FIELDS] = Default::default();
    for (i, field_levels) in levels.into_iter().enumerate() {
        if field_levels.iter().any(Option::is_some) {
            let code = (header.codebook[i] != NO_CODE).then_some(header.codebook[i]);
            fields[i] = Some(Field::from_parts(header.field_confidence[i], code, field_levels));
        }
    }

    let frame = Frame::from_parts(
        header.id,
        header.partition,
        header.timestamp,
        nonzero(header.parent_ref),
        fields,
    )
    .map_err(|e| VaultError::corrupt(location(), e.to_string()))?;
    if frame.slot_mask() != header.slot_mask || frame.resolution_mask() != &header.resolution_mask {
        return Err(VaultError::corrupt(location(), "masks disagree with vector tags"));
    }

    Ok(LiveEntry {
        frame: Arc::new(frame),
        stage,
        annotations: header.annotations(),
    })
}

/// Zero-copy view over an aligned entry body.
#[derive(Debug, Clone, Copy)]
pub enum EntryView<'a> {
    Live {
        header: &'a FrameHeader,
        tags: &'a [u32],
        vectors: &'a [f32],
    },
    Tombstone(&'a TombstoneRecord),
}

impl<'a> EntryView<'a> {
    /// Borrow `bytes` in place. `bytes` must start on an 8-byte boundary.
    pub fn parse(stage: Stage, bytes: &'a [u8]) -> VaultResult<Self> {
        let cast_err = |e: bytemuck::PodCastError| VaultError::corrupt("entry view", format!("{:?}", e));
        if stage == Stage::Tombstone {
            return bytemuck::try_from_bytes(bytes)
                .map(EntryView::Tombstone)
                .map_err(cast_err);
        }
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(VaultError::corrupt("entry view", "truncated header"));
        }
        let header: &FrameHeader =
            bytemuck::try_from_bytes(&bytes[..FRAME_HEADER_SIZE]).map_err(cast_err)?;
        let (tag_bytes, vector_bytes) = split_body(header, &bytes[FRAME_HEADER_SIZE..])?;
        Ok(EntryView::Live {
            header,
            tags: bytemuck::try_cast_slice(tag_bytes).map_err(cast_err)?,
            vectors: bytemuck::try_cast_slice(vector_bytes).map_err(cast_err)?,
        })
    }

    pub fn id(&self) -> FrameId {
        match self {
            EntryView::Live { header, .. } => header.id,
            EntryView::Tombstone(t) => t.id,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            EntryView::Live { header, .. } => header.stage().unwrap_or(Stage::Full),
            EntryView::Tombstone(_) => Stage::Tombstone,
        }
    }

    /// Copy into an owned entry.
    pub fn to_entry(&self) -> VaultResult<StoredEntry> {
        match *self {
            EntryView::Tombstone(t) => Ok(StoredEntry::Tombstone(*t)),
            EntryView::Live {
                header,
                tags,
                vectors,
            } => {
                let stage = header
                    .stage()
                    .ok_or_else(|| VaultError::corrupt(format!("frame {}", header.id), "bad stage"))?;
                decode_live(stage, header, tags, vectors).map(StoredEntry::Live)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;

    fn sample() -> StoredEntry {
        let mut frame = FrameBuilder::new(3)
            .timestamp(1234)
            .parent(7)
            .field(0, 0.9)
            .field(5, 0.4)
            .code(5, 17)
            .level(0, 0, vec![1.0, 0.0, 0.0, 0.0])
            .level(0, 2, vec![0.0, 1.0, 0.0, 0.0])
            .level(5, 1, vec![0.0, 0.0, 3.0, 4.0])
            .build()
            .unwrap();
        frame.assign(42, 0);
        StoredEntry::live(
            Arc::new(frame),
            Stage::Full,
            Annotations {
                pinned: true,
                summary: false,
                distilled_into: Some(99),
                superseded: Some(Supersession { winner: 8, scope: 3 }),
            },
        )
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(FRAME_HEADER_SIZE, 184);
        assert_eq!(TOMBSTONE_SIZE, 32);
        assert_eq!(FRAME_HEADER_SIZE % 8, 0);
    }

    #[test]
    fn test_live_entry_survives_unaligned_decode() {
        let entry = sample();
        let bytes = entry.encode();
        assert_eq!(bytes.len(), entry.encoded_len());

        // Shift by one byte so the body is deliberately misaligned.
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        let decoded = StoredEntry::decode(Stage::Full, &shifted[1..]).unwrap();
        assert_eq!(decoded, entry);

        let live = decoded.as_live().unwrap();
        assert_eq!(live.frame.field(5).unwrap().code(), Some(17));
        assert_eq!(live.frame.parent_ref(), Some(7));
        assert_eq!(live.frame.confidence(), 0.4);
    }

    #[test]
    fn test_entry_view_reads_in_place() {
        let entry = sample();
        let bytes = entry.encode();
        // Vec<u64> backing guarantees 8-byte alignment.
        let mut aligned = vec![0u64; bytes.len().div_ceil(8)];
        bytemuck::cast_slice_mut::<u64, u8>(&mut aligned)[..bytes.len()].copy_from_slice(&bytes);
        let slice = &bytemuck::cast_slice::<u64, u8>(&aligned)[..bytes.len()];

        let view = EntryView::parse(Stage::Full, slice).unwrap();
        assert_eq!(view.id(), 42);
        match view {
            EntryView::Live { header, tags, .. } => {
                assert_eq!(header.annotations(), entry.as_live().unwrap().annotations);
                assert_eq!(tags, &[0x000, 0x002, 0x501]);
            }
            EntryView::Tombstone(_) => panic!("expected live view"),
        }
        assert_eq!(view.to_entry().unwrap(), entry);
    }

    #[test]
    fn test_tombstone_is_32_bytes() {
        let entry = StoredEntry::Tombstone(TombstoneRecord::new(5, 2, 777, Some(9)));
        let bytes = entry.encode();
        assert_eq!(bytes.len(), 32);
        assert_eq!(StoredEntry::decode(Stage::Tombstone, &bytes).unwrap(), entry);
        assert_eq!(entry.timestamp(), 777);
    }

    #[test]
    fn test_corrupt_bodies_are_rejected() {
        let bytes = sample().encode();
        assert!(matches!(
            StoredEntry::decode(Stage::Full, &bytes[..bytes.len() - 4]),
            Err(VaultError::Corrupt { .. })
        ));
        assert!(matches!(
            StoredEntry::decode(Stage::Gist, &bytes),
            Err(VaultError::Corrupt { .. })
        ));
        assert!(StoredEntry::decode(Stage::Tombstone, &bytes[..10]).is_err());
    }

    #[test]
    fn test_oversized_vector_counts_are_rejected() {
        let mut bytes = sample().encode();
        let mut header: FrameHeader = pod_read_unaligned(&bytes[..FRAME_HEADER_SIZE]);
        header.vector_count = u32::MAX;
        header.dim = u32::MAX;
        bytes[..FRAME_HEADER_SIZE].copy_from_slice(bytes_of(&header));

        assert!(matches!(
            StoredEntry::decode(Stage::Full, &bytes),
            Err(VaultError::Corrupt { .. })
        ));

        // Counts that fit in usize but not in the body
        header.vector_count = 1 << 20;
        header.dim = 1 << 12;
        bytes[..FRAME_HEADER_SIZE].copy_from_slice(bytes_of(&header));
        assert!(matches!(
            StoredEntry::decode(Stage::Full, &bytes),
            Err(VaultError::Corrupt { .. })
        ));
    }
}
