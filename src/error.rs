// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public error type for datasource operations.
//!
//! Backend failures arrive as [`StorageError`] and are wrapped transparently;
//! everything else is raised by the datasource itself before any state is touched.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::{ChannelId, ObjectTypeId};
use crate::storage::traits::StorageError;

/// Result alias used throughout the crate.
pub type Result<T, E = DatasourceError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum DatasourceError {
    /// Channel ids were not positive, not unique, or the tree could not be numbered.
    /// The previously persisted structure is left untouched.
    #[error("Invalid channel structure: {0}")]
    StructureValidation(String),

    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// Filters cannot reference attributes whose values live on the filesystem.
    #[error("Filter references filesystem attribute '{0}'")]
    FilterUnsupported(String),

    #[error("Stream ordinal {ordinal} out of range for '{attribute}' ({count} values stored)")]
    StreamRange {
        attribute: String,
        ordinal: usize,
        count: usize,
    },

    #[error("No stream available for attribute '{0}'")]
    StreamUnavailable(String),

    #[error("Channel structure consistency check failed: {}", .findings.join("; "))]
    ConsistencyCheckFailure { findings: Vec<String> },

    #[error("Unknown object type {0}")]
    UnknownObjectType(ObjectTypeId),

    #[error("Unknown attribute '{attribute}' for object type {obj_type}")]
    UnknownAttribute {
        obj_type: ObjectTypeId,
        attribute: String,
    },

    #[error("Invalid value for '{attribute}': {reason}")]
    InvalidValue { attribute: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Filesystem error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DatasourceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_value(attribute: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_failure_lists_findings() {
        let err = DatasourceError::ConsistencyCheckFailure {
            findings: vec!["gap at 4".into(), "overlap 2/3".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("gap at 4; overlap 2/3"));
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: DatasourceError = StorageError::Backend("disk full".into()).into();
        assert_eq!(err.to_string(), "Storage backend error: disk full");
    }

    #[test]
    fn test_stream_range_message() {
        let err = DatasourceError::StreamRange {
            attribute: "binary".into(),
            ordinal: 3,
            count: 2,
        };
        assert!(err.to_string().contains("ordinal 3"));
        assert!(err.to_string().contains("2 values"));
    }
}
