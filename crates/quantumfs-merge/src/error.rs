//! Error types for the three-way merge engine.

use thiserror::Error;

use quantumfs_core::domain::directory_record::ObjectType;
use quantumfs_core::domain::errors::QfsError;

/// Errors that can occur while merging two workspace roots against a common
/// ancestor.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A record referenced by one side could not be decoded or resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// Both sides changed the same name to an incompatible object type
    /// (e.g. one side replaced a file with a directory) and neither
    /// deletion-timestamp nor preference resolves it.
    #[error("conflicting types at {path}: local is {local:?}, remote is {remote:?}")]
    TypeConflict {
        path: String,
        local: ObjectType,
        remote: ObjectType,
    },

    /// The object store or workspace database returned an error while
    /// loading or publishing the merged tree.
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),

    /// The merge traversal panicked. Carries the panic payload so the
    /// caller can publish a recovery workspace documenting it.
    #[error("merge panicked: {0}")]
    Panicked(String),
}

impl From<MergeError> for QfsError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::NotFound(s) => QfsError::NotFound(s),
            MergeError::TypeConflict { .. } => QfsError::Internal(err.to_string()),
            MergeError::Backend(e) => QfsError::Backend(e),
            MergeError::Panicked(s) => QfsError::Internal(s),
        }
    }
}
