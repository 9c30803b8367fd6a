//! The administrative command channel exposed through the synthetic `/api`
//! file: one JSON request in, one JSON response out. The domain core depends
//! only on this trait; the concrete dispatch (branch/merge/status and the
//! rest of the command surface) lives in the daemon, which is the one crate
//! allowed to depend on both the filesystem and the merge engine.

use async_trait::async_trait;

#[async_trait]
pub trait ApiHandler: Send + Sync {
    /// Handles one request written to `/api` and returns the bytes to hand
    /// back on the following read. Never panics: a malformed request must
    /// come back as an encoded error response, not a dropped connection.
    async fn handle(&self, request: &[u8]) -> Vec<u8>;
}
