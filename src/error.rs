/// Error types for framevault operations.
///
/// The taxonomy is small on purpose: callers either retry (`CapacityExceeded`,
/// `ContentionTimeout`), fix their input (`Serialization`, `PayloadTooLarge`),
/// or treat the condition as an empty result (`NotFound`). `Corrupt` is mostly
/// recovered internally: the offending WAL entry, segment or archive is skipped
/// and logged.
use crate::types::{FrameId, PartitionId};
use thiserror::Error;

/// The main error type for framevault operations.
#[derive(Error, Debug)]
pub enum VaultError {
    /// The requested record or partition does not exist
    #[error("Not found: {what}")]
    NotFound {
        /// Description of what was looked up
        what: String,
    },

    /// The partition's durable log cannot be extended within configured limits
    #[error("Capacity exceeded in partition {partition}: {reason}")]
    CapacityExceeded {
        /// Partition that rejected the write
        partition: PartitionId,
        /// Why the log could not grow
        reason: String,
    },

    /// A checksum or structural check failed on persisted bytes
    #[error("Corrupt data at {location}: {reason}")]
    Corrupt {
        /// File or record that failed the check
        location: String,
        /// What was wrong with it
        reason: String,
    },

    /// The per-partition write section could not be acquired in time
    #[error("Write section of partition {partition} busy for {waited_ms}ms")]
    ContentionTimeout {
        /// Partition whose section was contended
        partition: PartitionId,
        /// How long the writer waited
        waited_ms: u64,
    },

    /// Malformed record on ingestion
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of why the record was rejected
        reason: String,
    },

    /// Encoded payload is larger than the configured maximum
    #[error("Payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Encoded payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// A capability-scoped store refused the operation
    #[error("Capability '{capability}' not authorized: {reason}")]
    Unauthorized {
        /// Name of the capability descriptor
        capability: String,
        /// Which rule was violated
        reason: String,
    },

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Whether the caller should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::CapacityExceeded { .. } | VaultError::ContentionTimeout { .. }
        )
    }

    pub(crate) fn missing_frame(partition: PartitionId, id: FrameId) -> Self {
        VaultError::NotFound {
            what: format!("frame {} in partition {}", id, partition),
        }
    }

    pub(crate) fn serialization(reason: impl Into<String>) -> Self {
        VaultError::Serialization {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(location: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::Corrupt {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Map an I/O failure during a log append. A full disk is a capacity
    /// condition the caller can react to; anything else stays an I/O error.
    pub(crate) fn from_append_io(partition: PartitionId, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            VaultError::CapacityExceeded {
                partition,
                reason: err.to_string(),
            }
        } else {
            VaultError::Io(err)
        }
    }
}

impl From<bincode::Error> for VaultError {
    fn from(err: bincode::Error) -> Self {
        VaultError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for framevault operations.
pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = VaultError::ContentionTimeout {
            partition: 3,
            waited_ms: 50,
        };
        assert!(timeout.is_retryable());

        let full = VaultError::CapacityExceeded {
            partition: 1,
            reason: "wal limit".to_string(),
        };
        assert!(full.is_retryable());

        assert!(!VaultError::serialization("bad mask").is_retryable());
        assert!(!VaultError::missing_frame(1, 2).is_retryable());
    }

    #[test]
    fn test_storage_full_maps_to_capacity() {
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        let err = VaultError::from_append_io(7, io);
        assert!(matches!(err, VaultError::CapacityExceeded { partition: 7, .. }));

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(VaultError::from_append_io(7, io), VaultError::Io(_)));
    }

    #[test]
    fn test_error_display() {
        let err = VaultError::PayloadTooLarge {
            size: 70_000,
            max: 65_536,
        };
        assert_eq!(
            err.to_string(),
            "Payload of 70000 bytes exceeds maximum of 65536 bytes"
        );
    }
}
