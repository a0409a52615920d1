//! Record model: the frame.
//!
//! A frame is a fixed-shape sparse payload: up to [`MAX_FIELDS`] named fields,
//! each populated at one or more of [`NUM_RESOLUTIONS`] detail levels with a
//! unit vector. Level 0 is the coarsest. Masks and the frame confidence are
//! always derived from the populated fields, never set by hand, so the
//! `slot_mask` and weakest-link confidence rules hold by construction.

use crate::error::{VaultError, VaultResult};
use crate::types::{FrameId, PartitionId, Stage, normalize};

/// Number of named fields in a frame.
pub const MAX_FIELDS: usize = 16;

/// Number of detail levels per field.
pub const NUM_RESOLUTIONS: usize = 4;

/// Default dimension of every payload vector.
pub const DEFAULT_VECTOR_DIM: usize = 256;

const UNIT_TOLERANCE: f32 = 1e-3;

/// One populated field of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    confidence: f32,
    code: Option<u16>,
    levels: [Option<Vec<f32>>; NUM_RESOLUTIONS],
}

impl Field {
    pub(crate) fn from_parts(
        confidence: f32,
        code: Option<u16>,
        levels: [Option<Vec<f32>>; NUM_RESOLUTIONS],
    ) -> Self {
        Self {
            confidence,
            code,
            levels,
        }
    }

    /// Producer confidence for this field.
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Producer-assigned codebook code, if any.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    /// Vector at resolution `level`.
    pub fn level(&self, level: usize) -> Option<&[f32]> {
        self.levels.get(level)?.as_deref()
    }

    /// Populated `(resolution, vector)` pairs, coarsest first.
    pub fn levels(&self) -> impl Iterator<Item = (usize, &[f32])> {
        self.levels
            .iter()
            .enumerate()
            .filter_map(|(r, v)| v.as_deref().map(|v| (r, v)))
    }

    /// Bitfield of populated resolutions.
    pub fn resolution_mask(&self) -> u8 {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .fold(0u8, |mask, (r, _)| mask | (1 << r))
    }

    /// The coarsest populated vector.
    pub fn coarsest(&self) -> Option<&[f32]> {
        self.levels.iter().find_map(|v| v.as_deref())
    }

    /// Copy keeping only the `keep` coarsest populated levels.
    fn truncated(&self, keep: usize) -> Field {
        let mut levels: [Option<Vec<f32>>; NUM_RESOLUTIONS] = Default::default();
        for (r, v) in self.levels().take(keep) {
            levels[r] = Some(v.to_vec());
        }
        Field {
            confidence: self.confidence,
            code: self.code,
            levels,
        }
    }
}

/// The unit of storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    id: FrameId,
    partition: PartitionId,
    timestamp: u64,
    confidence: f32,
    slot_mask: u16,
    resolution_mask: [u8; MAX_FIELDS],
    fields: [Option<Field>; MAX_FIELDS],
    parent_ref: Option<FrameId>,
}

impl Frame {
    /// Assemble a frame from fields, deriving masks and confidence.
    pub(crate) fn from_parts(
        id: FrameId,
        partition: PartitionId,
        timestamp: u64,
        parent_ref: Option<FrameId>,
        fields: [Option<Field>; MAX_FIELDS],
    ) -> VaultResult<Self> {
        let mut slot_mask = 0u16;
        let mut resolution_mask = [0u8; MAX_FIELDS];
        let mut confidence: Option<f32> = None;

        for (i, field) in fields.iter().enumerate() {
            let Some(field) = field else { continue };
            let mask = field.resolution_mask();
            if mask == 0 {
                return Err(VaultError::serialization(format!(
                    "field {} has no populated resolution",
                    i
                )));
            }
            if !(0.0..=1.0).contains(&field.confidence) {
                return Err(VaultError::serialization(format!(
                    "field {} confidence {} outside [0, 1]",
                    i, field.confidence
                )));
            }
            slot_mask |= 1 << i;
            resolution_mask[i] = mask;
            confidence = Some(confidence.map_or(field.confidence, |c| c.min(field.confidence)));
        }

        let confidence =
            confidence.ok_or_else(|| VaultError::serialization("frame has no populated fields"))?;

        Ok(Self {
            id,
            partition,
            timestamp,
            confidence,
            slot_mask,
            resolution_mask,
            fields,
            parent_ref,
        })
    }

    /// Engine-assigned id (0 before append).
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Owning partition.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Creation time in nanoseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Weakest-link confidence over populated fields.
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Bit `i` set iff field `i` is populated.
    pub fn slot_mask(&self) -> u16 {
        self.slot_mask
    }

    /// Per-field populated resolution bits.
    pub fn resolution_mask(&self) -> &[u8; MAX_FIELDS] {
        &self.resolution_mask
    }

    /// Lineage pointer.
    pub fn parent_ref(&self) -> Option<FrameId> {
        self.parent_ref
    }

    /// Field `index`, if populated.
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)?.as_ref()
    }

    /// Populated `(index, field)` pairs.
    pub fn fields(&self) -> impl Iterator<Item = (usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (i, f)))
    }

    /// Number of payload vectors.
    pub fn vector_count(&self) -> usize {
        self.resolution_mask
            .iter()
            .map(|m| m.count_ones() as usize)
            .sum()
    }

    /// Dimension of the payload vectors (taken from the first one).
    pub fn dim(&self) -> usize {
        self.fields()
            .find_map(|(_, f)| f.coarsest().map(|v| v.len()))
            .unwrap_or(0)
    }

    /// Raw payload size in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.vector_count() * self.dim() * std::mem::size_of::<f32>()
    }

    /// L2-normalized superposition of every field's coarsest vector.
    ///
    /// Every compression stage keeps the coarsest level, so the summary of a
    /// record does not change as it is compressed.
    pub fn summary_vector(&self) -> Option<Vec<f32>> {
        let mut sum = vec![0.0f32; self.dim()];
        for (_, field) in self.fields() {
            let v = field.coarsest()?;
            for (acc, x) in sum.iter_mut().zip(v) {
                *acc += x;
            }
        }
        normalize(&mut sum).then_some(sum)
    }

    /// Check shape constraints before the record reaches the log.
    pub fn validate(&self, dim: usize, max_payload_bytes: usize) -> VaultResult<()> {
        if self.slot_mask == 0 {
            return Err(VaultError::serialization("frame has no populated fields"));
        }
        for (i, field) in self.fields() {
            for (r, v) in field.levels() {
                if v.len() != dim {
                    return Err(VaultError::serialization(format!(
                        "field {} resolution {} has dimension {}, expected {}",
                        i,
                        r,
                        v.len(),
                        dim
                    )));
                }
                if v.iter().any(|x| !x.is_finite()) {
                    return Err(VaultError::serialization(format!(
                        "field {} resolution {} contains non-finite values",
                        i, r
                    )));
                }
                let n = crate::types::norm(v);
                if (n - 1.0).abs() > UNIT_TOLERANCE {
                    return Err(VaultError::serialization(format!(
                        "field {} resolution {} is not a unit vector (norm {})",
                        i, r, n
                    )));
                }
            }
        }
        let size = self.payload_bytes();
        if size > max_payload_bytes {
            return Err(VaultError::PayloadTooLarge {
                size,
                max: max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Copy of this frame reduced to `stage`.
    ///
    /// `Full` returns an identical copy; `Tombstone` is not representable as a
    /// frame and also returns the input unchanged.
    pub fn compressed_to(&self, stage: Stage) -> Frame {
        if matches!(stage, Stage::Full | Stage::Tombstone) {
            return self.clone();
        }
        let keep = stage.kept_resolutions();
        let mut fields: [Option<Field>; MAX_FIELDS] = Default::default();
        let mut resolution_mask = [0u8; MAX_FIELDS];
        for (i, field) in self.fields() {
            let reduced = field.truncated(keep);
            resolution_mask[i] = reduced.resolution_mask();
            fields[i] = Some(reduced);
        }
        Frame {
            resolution_mask,
            fields,
            ..self.clone()
        }
    }

    /// Copy keeping only the fields whose bit is set in `mask`.
    ///
    /// Masks and confidence are re-derived from what remains; `None` if no
    /// populated field is left.
    pub fn masked(&self, mask: u16) -> Option<Frame> {
        if self.slot_mask & !mask == 0 {
            return Some(self.clone());
        }
        let mut fields: [Option<Field>; MAX_FIELDS] = Default::default();
        for (i, field) in self.fields() {
            if mask & (1 << i) != 0 {
                fields[i] = Some(field.clone());
            }
        }
        Frame::from_parts(self.id, self.partition, self.timestamp, self.parent_ref, fields).ok()
    }

    pub(crate) fn assign(&mut self, id: FrameId, timestamp: u64) {
        self.id = id;
        if self.timestamp == 0 {
            self.timestamp = timestamp;
        }
    }
}

/// Builder for frames handed to `append`.
///
/// Vectors are normalized on `build`; any shape problem is reported then.
///
/// ```
/// use framevault::frame::FrameBuilder;
///
/// let frame = FrameBuilder::new(1)
///     .field(0, 0.9)
///     .level(0, 0, vec![1.0, 0.0, 0.0])
///     .build()
///     .unwrap();
/// assert_eq!(frame.slot_mask(), 0b1);
/// assert_eq!(frame.confidence(), 0.9);
/// ```
#[derive(Debug, Default)]
pub struct FrameBuilder {
    partition: PartitionId,
    timestamp: u64,
    parent_ref: Option<FrameId>,
    confidences: [Option<f32>; MAX_FIELDS],
    codes: [Option<u16>; MAX_FIELDS],
    levels: Vec<(usize, usize, Vec<f32>)>,
}

impl FrameBuilder {
    /// Start a frame for `partition`.
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            ..Default::default()
        }
    }

    /// Creation time in nanoseconds; 0 lets the engine stamp it.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Lineage pointer.
    pub fn parent(mut self, parent: FrameId) -> Self {
        self.parent_ref = Some(parent);
        self
    }

    /// Declare field `index` with its producer confidence.
    pub fn field(mut self, index: usize, confidence: f32) -> Self {
        if let Some(slot) = self.confidences.get_mut(index) {
            *slot = Some(confidence);
        } else {
            // Remembered so build() can report it.
            self.levels.push((index, 0, Vec::new()));
        }
        self
    }

    /// Attach a producer codebook code to field `index`.
    pub fn code(mut self, index: usize, code: u16) -> Self {
        if let Some(slot) = self.codes.get_mut(index) {
            *slot = Some(code);
        }
        self
    }

    /// Populate field `index` at `resolution`.
    pub fn level(mut self, index: usize, resolution: usize, vector: Vec<f32>) -> Self {
        self.levels.push((index, resolution, vector));
        self
    }

    /// Normalize vectors, derive masks and confidence.
    pub fn build(self) -> VaultResult<Frame> {
        let mut fields: [Option<Field>; MAX_FIELDS] = Default::default();
        for (index, resolution, mut vector) in self.levels {
            if index >= MAX_FIELDS {
                return Err(VaultError::serialization(format!(
                    "field index {} out of range (max {})",
                    index,
                    MAX_FIELDS - 1
                )));
            }
            if resolution >= NUM_RESOLUTIONS {
                return Err(VaultError::serialization(format!(
                    "resolution {} out of range (max {})",
                    resolution,
                    NUM_RESOLUTIONS - 1
                )));
            }
            let confidence = self.confidences[index].ok_or_else(|| {
                VaultError::serialization(format!("field {} populated but not declared", index))
            })?;
            if !normalize(&mut vector) {
                return Err(VaultError::serialization(format!(
                    "field {} resolution {} is a zero vector",
                    index, resolution
                )));
            }
            let field = fields[index].get_or_insert_with(|| Field {
                confidence,
                code: self.codes[index],
                levels: Default::default(),
            });
            field.levels[resolution] = Some(vector);
        }
        Frame::from_parts(0, self.partition, self.timestamp, self.parent_ref, fields)
    }
}
