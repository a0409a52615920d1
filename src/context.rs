//! Shared, read-mostly state handed to the vault at open time.
//!
//! Nothing here is global: a [`VaultContext`] is built by the caller (or from
//! config) and owned by one vault, and is dropped with it.

use std::sync::Arc;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::frame::Frame;
use crate::types::{PartitionId, Token, dot, normalize};

// ── Codebook ───────────────────────────────────────────────────────────

/// Vector quantizer used to derive exact-match tokens.
#[derive(Debug, Clone)]
pub struct Codebook {
    dim: usize,
    centroids: Vec<Vec<f32>>,
}

impl Codebook {
    /// `size` random unit centroids from a fixed seed, so every process
    /// opened with the same config derives the same tokens.
    pub fn seeded(size: usize, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let size = size.clamp(1, u16::MAX as usize);
        let centroids = (0..size)
            .map(|_| loop {
                let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
                if normalize(&mut v) {
                    break v;
                }
            })
            .collect();
        Self { dim, centroids }
    }

    /// Use producer-supplied centroids. They are normalized here.
    pub fn from_centroids(centroids: Vec<Vec<f32>>) -> VaultResult<Self> {
        let dim = centroids
            .first()
            .map(|c| c.len())
            .ok_or_else(|| VaultError::InvalidConfig("codebook needs at least one centroid".into()))?;
        if centroids.len() > u16::MAX as usize {
            return Err(VaultError::InvalidConfig(format!(
                "codebook has {} centroids, at most {} fit a token",
                centroids.len(),
                u16::MAX
            )));
        }
        let mut normalized = Vec::with_capacity(centroids.len());
        for (i, mut c) in centroids.into_iter().enumerate() {
            if c.len() != dim || !normalize(&mut c) {
                return Err(VaultError::InvalidConfig(format!("codebook centroid {} is malformed", i)));
            }
            normalized.push(c);
        }
        Ok(Self {
            dim,
            centroids: normalized,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Index of the centroid with the largest dot product with `v`.
    pub fn quantize(&self, v: &[f32]) -> u16 {
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (i, c) in self.centroids.iter().enumerate() {
            let score = dot(c, v);
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        best as u16
    }

    /// Exact-match tokens of a frame: the producer code of each field if it
    /// has one, the nearest centroid to its coarsest vector otherwise.
    pub fn tokens_of(&self, frame: &Frame) -> Vec<Token> {
        frame
            .fields()
            .filter_map(|(i, field)| {
                let code = match field.code() {
                    Some(code) => code,
                    None => self.quantize(field.coarsest()?),
                };
                Some(Token::new(i, code))
            })
            .collect()
    }
}

// ── Capabilities ───────────────────────────────────────────────────────

/// Access level of a capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Queries and fetches only
    Read,
    /// Queries, fetches and appends
    Write,
}

impl Permission {
    /// Check if this permission includes another.
    pub fn includes(&self, other: Permission) -> bool {
        matches!(
            (self, other),
            (Permission::Write, _) | (Permission::Read, Permission::Read)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
        }
    }
}

/// What a capability may touch; also selects the store implementation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityScope {
    /// Every partition and field
    Unrestricted,
    /// One partition, limited to the fields in `field_mask`
    Partition {
        partition: PartitionId,
        field_mask: u16,
    },
}

impl CapabilityScope {
    /// Scope covering every field of one partition.
    pub fn partition(partition: PartitionId) -> Self {
        CapabilityScope::Partition {
            partition,
            field_mask: u16::MAX,
        }
    }
}

impl std::fmt::Display for CapabilityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityScope::Unrestricted => write!(f, "*"),
            CapabilityScope::Partition {
                partition,
                field_mask,
            } => write!(f, "p{}/{:#06x}", partition, field_mask),
        }
    }
}

/// A named producer or consumer plugin and what it is allowed to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub scope: CapabilityScope,
    pub permission: Permission,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, scope: CapabilityScope, permission: Permission) -> Self {
        Self {
            name: name.into(),
            scope,
            permission,
        }
    }
}

/// Descriptors by name.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    descriptors: DashMap<String, CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a descriptor.
    pub fn register(&self, descriptor: CapabilityDescriptor) {
        tracing::debug!(name = %descriptor.name, scope = %descriptor.scope, "capability registered");
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<CapabilityDescriptor> {
        self.descriptors.get(name).map(|d| d.clone())
    }

    /// Remove a descriptor. Stores already connected keep working.
    pub fn revoke(&self, name: &str) -> bool {
        self.descriptors.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.descriptors.iter().map(|d| d.key().clone()).collect();
        names.sort();
        names
    }
}

// ── VaultContext ───────────────────────────────────────────────────────

/// Explicitly passed shared state.
#[derive(Debug, Clone)]
pub struct VaultContext {
    pub codebook: Arc<Codebook>,
    pub capabilities: Arc<CapabilityRegistry>,
}

impl VaultContext {
    pub fn new(codebook: Codebook) -> Self {
        Self {
            codebook: Arc::new(codebook),
            capabilities: Arc::new(CapabilityRegistry::new()),
        }
    }

    /// Seeded codebook sized by config, empty registry.
    pub fn from_config(config: &VaultConfig) -> Self {
        Self::new(Codebook::seeded(
            config.index.codebook_size,
            config.record.vector_dim,
            config.index.codebook_seed,
        ))
    }

    pub fn with_capability(self, descriptor: CapabilityDescriptor) -> Self {
        self.capabilities.register(descriptor);
        self
    }
}

/// Mask of the fields a frame populates outside `allowed`.
pub(crate) fn fields_outside(frame: &Frame, allowed: u16) -> u16 {
    frame.slot_mask() & !allowed
}
