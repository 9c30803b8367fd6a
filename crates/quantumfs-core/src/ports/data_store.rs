//! The pluggable content-addressed object-store backend.
//!
//! Errors at this boundary are adapter-specific (a timeout talking to S3
//! means something different than a local-disk `ENOSPC`) and don't need
//! domain-level classification, so the port returns `anyhow::Result` the
//! way every other backend-facing port in this codebase does; the caller
//! (`quantumfs-store`) is responsible for folding failures into
//! `QfsError::Backend` at the point where a domain-level decision (retry,
//! surface to the kernel) actually needs to be made.

use async_trait::async_trait;

use crate::domain::object_key::ObjectKey;

/// The object-store backend QuantumFS's `DataStoreCache` sits in front of.
/// `set` must be idempotent by content: storing the same bytes twice
/// yields the same key and is a no-op the second time.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetches the bytes for `key`. Must fail for an `Embedded` key --
    /// embedded keys never reach the backend.
    async fn get(&self, key: &ObjectKey) -> anyhow::Result<Vec<u8>>;

    /// Stores `bytes`, returning the content-addressed key they hash to.
    async fn set(&self, bytes: &[u8]) -> anyhow::Result<ObjectKey>;

    /// Extends the backend's retention/TTL for `key` where applicable.
    /// A backend with no such concept treats this as a no-op.
    async fn freshen(&self, key: &ObjectKey) -> anyhow::Result<()>;
}
