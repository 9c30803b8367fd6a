//! Type-safe identifiers used throughout QuantumFS.
//!
//! Follows the same newtype discipline used elsewhere in the domain layer:
//! wrap a primitive, validate at construction, and implement `Display`/
//! `FromStr` so the type can cross a textual boundary (the `/api` protocol,
//! a config file, a log line) without losing its identity.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A name failed the validation rules for a typespace/namespace/workspace
/// component (non-empty, no `/`, no NUL byte).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid name {0:?}: {1}")]
pub struct InvalidNameError(pub String, pub &'static str);

fn validate_name_component(raw: &str) -> Result<(), InvalidNameError> {
    if raw.is_empty() {
        return Err(InvalidNameError(raw.to_string(), "must not be empty"));
    }
    if raw.contains('/') {
        return Err(InvalidNameError(raw.to_string(), "must not contain '/'"));
    }
    if raw.contains('\0') {
        return Err(InvalidNameError(raw.to_string(), "must not contain NUL"));
    }
    Ok(())
}

macro_rules! name_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Result<Self, InvalidNameError> {
                let raw = raw.into();
                validate_name_component(&raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = InvalidNameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidNameError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.0
            }
        }
    };
}

name_newtype!(TypespaceName, "Top-level namespace of workspaces, e.g. `test`.");
name_newtype!(
    NamespaceName,
    "Second-level namespace of workspaces, e.g. `user`."
);
name_newtype!(WorkspaceName, "The leaf branch name of a workspace.");

/// The reserved, always-immutable workspace. Writes against it fail with
/// `QfsError::Permission`.
pub const NULL_WORKSPACE: (&str, &str, &str) = ("_null", "null", "null");

/// A 64-bit, process-wide-unique, never-reused identifier for a logical
/// file. Stable across renames, hardlink promotion, and branches.
///
/// Generated from the high-entropy half of a random UUIDv4 rather than a
/// counter, so FileIds minted independently by two mounts of the same
/// workspace (before they have synchronized) do not collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(u64);

impl FileId {
    /// The sentinel FileId used for entries that do not participate in any
    /// hardlink group.
    pub const INVALID: FileId = FileId(0);

    pub fn generate() -> Self {
        let bytes = uuid::Uuid::new_v4();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes.as_bytes()[0..8]);
        FileId(u64::from_le_bytes(buf).max(1))
    }

    pub fn from_raw(v: u64) -> Self {
        FileId(v)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for FileId {
    fn from(v: u64) -> Self {
        FileId(v)
    }
}

impl From<FileId> for u64 {
    fn from(v: FileId) -> Self {
        v.0
    }
}

/// An in-memory inode identifier. Distinct from the kernel-visible FUSE
/// inode number only in name: QuantumFS hands the same value to the kernel,
/// but keeps the type separate so the registry's internal bookkeeping
/// (the allocator, the hardlink table's `inode_id` field) cannot be
/// accidentally mixed up with raw offsets or FileIds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(u64);

/// Inode ids `1..=InodeId::RESERVED_END` are reserved for the root and the
/// synthetic namespace listings / `/api` file, and are never returned by
/// the allocator.
impl InodeId {
    pub const ROOT: InodeId = InodeId(1);
    pub const API: InodeId = InodeId(2);
    pub const RESERVED_END: u64 = 16;

    pub fn new(v: u64) -> Self {
        InodeId(v)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn is_reserved(&self) -> bool {
        self.0 <= Self::RESERVED_END
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InodeId {
    fn from(v: u64) -> Self {
        InodeId(v)
    }
}

impl From<InodeId> for u64 {
    fn from(v: InodeId) -> Self {
        v.0
    }
}

/// Monotonic counter returned by the workspace database alongside a
/// workspace's root key; `advance` fails with `OutOfDate` if the caller's
/// nonce no longer matches the store's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Nonce(u64);

impl Nonce {
    pub fn zero() -> Self {
        Nonce(0)
    }

    pub fn next(&self) -> Self {
        Nonce(self.0 + 1)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Nonce {
    fn from(v: u64) -> Self {
        Nonce(v)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide monotonic source for handle ids (file handles, directory
/// stream handles) that do not need to survive a restart.
#[derive(Debug, Default)]
pub struct HandleIdAllocator(AtomicU64);

impl HandleIdAllocator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod name_tests {
        use super::*;

        #[test]
        fn rejects_empty_and_slash_and_nul() {
            assert!(TypespaceName::new("").is_err());
            assert!(TypespaceName::new("a/b").is_err());
            assert!(TypespaceName::new("a\0b").is_err());
        }

        #[test]
        fn accepts_plain_component() {
            let n = WorkspaceName::new("feature-branch").unwrap();
            assert_eq!(n.as_str(), "feature-branch");
            assert_eq!(n.to_string(), "feature-branch");
        }

        #[test]
        fn from_str_round_trips() {
            let n: NamespaceName = "user".parse().unwrap();
            assert_eq!(n.as_str(), "user");
        }
    }

    mod file_id_tests {
        use super::*;

        #[test]
        fn invalid_is_zero() {
            assert!(!FileId::INVALID.is_valid());
            assert_eq!(FileId::INVALID.raw(), 0);
        }

        #[test]
        fn generate_produces_distinct_valid_ids() {
            let a = FileId::generate();
            let b = FileId::generate();
            assert!(a.is_valid());
            assert!(b.is_valid());
            assert_ne!(a, b);
        }

        #[test]
        fn display_is_fixed_width_hex() {
            let id = FileId::from_raw(0xabcd);
            assert_eq!(id.to_string(), "000000000000abcd");
        }
    }

    mod inode_id_tests {
        use super::*;

        #[test]
        fn root_and_api_are_reserved() {
            assert!(InodeId::ROOT.is_reserved());
            assert!(InodeId::API.is_reserved());
            assert!(!InodeId::new(InodeId::RESERVED_END + 1).is_reserved());
        }

        #[test]
        fn round_trips_through_u64() {
            let id = InodeId::new(42);
            let raw: u64 = id.into();
            assert_eq!(raw, 42);
        }
    }

    mod nonce_tests {
        use super::*;

        #[test]
        fn next_increments() {
            let n = Nonce::zero();
            assert_eq!(n.next().get(), 1);
            assert_eq!(n.next().next().get(), 2);
        }
    }

    mod handle_id_tests {
        use super::*;

        #[test]
        fn allocates_increasing_ids() {
            let alloc = HandleIdAllocator::new();
            let a = alloc.next();
            let b = alloc.next();
            assert!(b > a);
        }
    }
}
