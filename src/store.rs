//! Capability-scoped access to a vault.
//!
//! Producer and consumer plugins never hold a [`FrameVault`] directly. They
//! name a registered [`CapabilityDescriptor`] and get back a
//! `Box<dyn FrameStore>`: the vault itself for unrestricted writers, or a
//! [`ScopedStore`] that checks every call against the descriptor.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::context::{CapabilityDescriptor, CapabilityScope, Permission, fields_outside};
use crate::core::FrameVault;
use crate::error::{VaultError, VaultResult};
use crate::frame::Frame;
use crate::query::RangeIter;
use crate::types::{FrameId, PartitionId, RecordSummary, Token};

/// The operations a plugin can perform.
pub trait FrameStore: Send + Sync {
    /// Append a frame and return its id.
    fn append(&self, frame: Frame) -> VaultResult<FrameId>;

    fn query_similar(&self, partition: PartitionId, vector: &[f32], top_k: usize) -> VaultResult<Vec<RecordSummary>>;

    fn query_range(&self, partition: PartitionId, start: u64, end: u64) -> VaultResult<RangeIter>;

    fn query_token(&self, partition: PartitionId, token: Token) -> VaultResult<BTreeSet<FrameId>>;

    fn fetch(&self, partition: PartitionId, id: FrameId) -> VaultResult<Option<Arc<Frame>>>;
}

impl FrameStore for FrameVault {
    fn append(&self, frame: Frame) -> VaultResult<FrameId> {
        FrameVault::append(self, frame)
    }

    fn query_similar(&self, partition: PartitionId, vector: &[f32], top_k: usize) -> VaultResult<Vec<RecordSummary>> {
        FrameVault::query_similar(self, partition, vector, top_k)
    }

    fn query_range(&self, partition: PartitionId, start: u64, end: u64) -> VaultResult<RangeIter> {
        Ok(FrameVault::query_range(self, partition, start, end))
    }

    fn query_token(&self, partition: PartitionId, token: Token) -> VaultResult<BTreeSet<FrameId>> {
        Ok(FrameVault::query_token(self, partition, token))
    }

    fn fetch(&self, partition: PartitionId, id: FrameId) -> VaultResult<Option<Arc<Frame>>> {
        FrameVault::fetch(self, partition, id)
    }
}

/// A store restricted to one descriptor's partition, fields and permission.
#[derive(Debug, Clone)]
pub struct ScopedStore {
    vault: FrameVault,
    descriptor: CapabilityDescriptor,
    /// `None` for unrestricted read-only descriptors
    partition: Option<PartitionId>,
    field_mask: u16,
}

impl ScopedStore {
    pub fn new(vault: FrameVault, descriptor: CapabilityDescriptor) -> Self {
        let (partition, field_mask) = match descriptor.scope {
            CapabilityScope::Unrestricted => (None, u16::MAX),
            CapabilityScope::Partition {
                partition,
                field_mask,
            } => (Some(partition), field_mask),
        };
        Self {
            vault,
            descriptor,
            partition,
            field_mask,
        }
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    fn denied(&self, reason: impl Into<String>) -> VaultError {
        let reason = reason.into();
        debug!(capability = %self.descriptor.name, reason = %reason, "capability check failed");
        VaultError::Unauthorized {
            capability: self.descriptor.name.clone(),
            reason,
        }
    }

    fn check_partition(&self, partition: PartitionId) -> VaultResult<()> {
        match self.partition {
            Some(allowed) if allowed != partition => {
                Err(self.denied(format!("partition {} outside scope p{}", partition, allowed)))
            }
            _ => Ok(()),
        }
    }
}

impl FrameStore for ScopedStore {
    fn append(&self, frame: Frame) -> VaultResult<FrameId> {
        if !self.descriptor.permission.includes(Permission::Write) {
            return Err(self.denied("read-only capability"));
        }
        self.check_partition(frame.partition())?;
        let outside = fields_outside(&frame, self.field_mask);
        if outside != 0 {
            return Err(self.denied(format!("fields {:#06x} outside the allowed mask", outside)));
        }
        self.vault.append(frame)
    }

    fn query_similar(&self, partition: PartitionId, vector: &[f32], top_k: usize) -> VaultResult<Vec<RecordSummary>> {
        self.check_partition(partition)?;
        self.vault.query_similar(partition, vector, top_k)
    }

    fn query_range(&self, partition: PartitionId, start: u64, end: u64) -> VaultResult<RangeIter> {
        self.check_partition(partition)?;
        Ok(self.vault.query_range(partition, start, end))
    }

    fn query_token(&self, partition: PartitionId, token: Token) -> VaultResult<BTreeSet<FrameId>> {
        self.check_partition(partition)?;
        if token.field() >= 16 || self.field_mask & (1 << token.field()) == 0 {
            return Err(self.denied(format!("token field {} outside the allowed mask", token.field())));
        }
        Ok(self.vault.query_token(partition, token))
    }

    /// Fields outside the mask are stripped from the returned frame.
    fn fetch(&self, partition: PartitionId, id: FrameId) -> VaultResult<Option<Arc<Frame>>> {
        self.check_partition(partition)?;
        let Some(frame) = self.vault.fetch(partition, id)? else {
            return Ok(None);
        };
        if self.field_mask == u16::MAX {
            return Ok(Some(frame));
        }
        Ok(frame.masked(self.field_mask).map(Arc::new))
    }
}

/// Resolve `name` in the vault's registry into a store.
pub(crate) fn connect(vault: &FrameVault, name: &str) -> VaultResult<Box<dyn FrameStore>> {
    let Some(descriptor) = vault.context().capabilities.get(name) else {
        return Err(VaultError::Unauthorized {
            capability: name.to_string(),
            reason: "not registered".into(),
        });
    };
    debug!(capability = name, scope = %descriptor.scope, permission = descriptor.permission.as_str(), "capability connected");
    match (&descriptor.scope, descriptor.permission) {
        (CapabilityScope::Unrestricted, Permission::Write) => Ok(Box::new(vault.clone())),
        _ => Ok(Box::new(ScopedStore::new(vault.clone(), descriptor))),
    }
}
