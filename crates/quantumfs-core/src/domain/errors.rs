//! Domain error taxonomy
//!
//! `QfsError` enumerates error *kinds*, not type names, matching the
//! categories a FUSE client can observe: not-found, permission, exists,
//! not-dir/is-dir/not-empty, out-of-range, out-of-date, backend, and
//! internal. Component crates define narrower `thiserror` enums and
//! convert into this one via `#[from]`.

use thiserror::Error;

/// Top-level error taxonomy for QuantumFS, shared by every crate above
/// `quantumfs-core`.
#[derive(Debug, Error)]
pub enum QfsError {
    /// Requested name, key, or workspace does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Permission check failed: wrong uid/gid, cross-workspace link, or a
    /// write against the immutable null workspace.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Name already present on create/mkdir/symlink/mknod.
    #[error("already exists: {0}")]
    Exists(String),

    /// Expected a directory, found something else.
    #[error("not a directory: {0}")]
    NotDir(String),

    /// Expected a non-directory, found a directory.
    #[error("is a directory: {0}")]
    IsDir(String),

    /// rmdir on a non-empty directory.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Attempt to exceed a block, file, or xattr-list bound.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Workspace advance lost a race against a concurrent publisher.
    #[error("out of date: stored root no longer matches expected root or nonce")]
    OutOfDate,

    /// The object store or workspace database returned an error.
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),

    /// Invariant violation. Reserved for conditions that indicate a bug
    /// rather than a request that can be retried or denied.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl QfsError {
    pub fn not_found(what: impl Into<String>) -> Self {
        QfsError::NotFound(what.into())
    }

    pub fn permission(what: impl Into<String>) -> Self {
        QfsError::Permission(what.into())
    }

    pub fn exists(what: impl Into<String>) -> Self {
        QfsError::Exists(what.into())
    }

    /// Whether retrying the same request without external changes could
    /// plausibly succeed (used by the flusher to decide whether to keep a
    /// workspace local-only after a publish failure).
    pub fn is_retryable(&self) -> bool {
        matches!(self, QfsError::OutOfDate | QfsError::Backend(_))
    }
}

/// Maps a `QfsError` to the `libc` errno surfaced to the FUSE kernel
/// transport.
impl From<&QfsError> for libc::c_int {
    fn from(err: &QfsError) -> libc::c_int {
        match err {
            QfsError::NotFound(_) => libc::ENOENT,
            QfsError::Permission(_) => libc::EPERM,
            QfsError::Exists(_) => libc::EEXIST,
            QfsError::NotDir(_) => libc::ENOTDIR,
            QfsError::IsDir(_) => libc::EISDIR,
            QfsError::NotEmpty(_) => libc::ENOTEMPTY,
            QfsError::OutOfRange(_) => libc::ENOSPC,
            QfsError::OutOfDate => libc::EAGAIN,
            QfsError::Backend(_) => libc::EIO,
            QfsError::Internal(_) => libc::EIO,
        }
    }
}

impl From<QfsError> for libc::c_int {
    fn from(err: QfsError) -> libc::c_int {
        libc::c_int::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_enoent() {
        let err = QfsError::not_found("/a/b");
        assert_eq!(libc::c_int::from(&err), libc::ENOENT);
    }

    #[test]
    fn exists_maps_to_eexist() {
        let err = QfsError::exists("dup");
        assert_eq!(libc::c_int::from(&err), libc::EEXIST);
    }

    #[test]
    fn out_of_date_is_retryable_but_not_found_is_not() {
        assert!(QfsError::OutOfDate.is_retryable());
        assert!(!QfsError::not_found("x").is_retryable());
    }

    #[test]
    fn backend_error_wraps_anyhow_and_maps_to_eio() {
        let err: QfsError = anyhow::anyhow!("disk offline").into();
        assert_eq!(libc::c_int::from(&err), libc::EIO);
        assert!(err.to_string().contains("disk offline"));
    }

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(
            QfsError::NotDir("/a".into()).to_string(),
            "not a directory: /a"
        );
        assert_eq!(
            QfsError::NotEmpty("/a".into()).to_string(),
            "directory not empty: /a"
        );
    }
}
