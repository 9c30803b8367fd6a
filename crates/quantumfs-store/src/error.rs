//! Error taxonomy for the DataStore cache and test-double adapters.

use quantumfs_core::domain::errors::QfsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("workspace advance is out of date")]
    OutOfDate,

    #[error("embedded keys are never issued to the backend")]
    EmbeddedKey,

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for QfsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => QfsError::not_found(what),
            StoreError::WorkspaceNotFound(what) => QfsError::not_found(what),
            StoreError::OutOfDate => QfsError::OutOfDate,
            StoreError::EmbeddedKey => QfsError::Internal(err.to_string()),
            StoreError::Backend(e) => QfsError::Backend(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_converts_to_qfs_not_found() {
        let err: QfsError = StoreError::NotFound("Data:abcd".into()).into();
        assert!(matches!(err, QfsError::NotFound(_)));
    }

    #[test]
    fn out_of_date_converts_to_qfs_out_of_date() {
        let err: QfsError = StoreError::OutOfDate.into();
        assert!(matches!(err, QfsError::OutOfDate));
    }

    #[test]
    fn backend_converts_to_qfs_backend() {
        let err: QfsError = StoreError::Backend(anyhow::anyhow!("timeout")).into();
        assert!(matches!(err, QfsError::Backend(_)));
    }
}
