//! The pluggable workspace-database backend.

use async_trait::async_trait;

use crate::domain::newtypes::{NamespaceName, Nonce, TypespaceName, WorkspaceName};
use crate::domain::object_key::ObjectKey;

/// The externally-observed state of one workspace, as streamed by
/// `WorkspaceDB::set_callback`.
#[derive(Debug, Clone)]
pub struct WorkspaceState {
    pub root_key: ObjectKey,
    pub nonce: Nonce,
    pub immutable: bool,
    pub deleted: bool,
}

/// One update delivered on a subscription stream: the fully-qualified
/// workspace name plus its new state.
#[derive(Debug, Clone)]
pub struct WorkspaceUpdate {
    pub typespace: TypespaceName,
    pub namespace: NamespaceName,
    pub workspace: WorkspaceName,
    pub state: WorkspaceState,
}

/// The workspace-database backend: the small, atomically-advanced root
/// pointer store that sits alongside the content-addressed object store.
#[async_trait]
pub trait WorkspaceDB: Send + Sync {
    async fn typespace_exists(&self, t: &TypespaceName) -> anyhow::Result<bool>;
    async fn namespace_exists(&self, t: &TypespaceName, n: &NamespaceName) -> anyhow::Result<bool>;
    async fn workspace_exists(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
    ) -> anyhow::Result<bool>;

    async fn num_typespaces(&self) -> anyhow::Result<usize>;
    async fn num_namespaces(&self, t: &TypespaceName) -> anyhow::Result<usize>;
    async fn num_workspaces(&self, t: &TypespaceName, n: &NamespaceName) -> anyhow::Result<usize>;

    /// Returns the current root key and nonce for a workspace.
    async fn workspace(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
    ) -> anyhow::Result<(ObjectKey, Nonce)>;

    /// Creates `dst` as a new workspace sharing `src`'s current root (an
    /// O(1) branch: only the workspace-database entry is new).
    async fn branch(
        &self,
        src: (&TypespaceName, &NamespaceName, &WorkspaceName),
        dst: (&TypespaceName, &NamespaceName, &WorkspaceName),
    ) -> anyhow::Result<()>;

    /// Atomic compare-and-set: advances the workspace's root to `new` iff
    /// the stored root still matches `old` and the stored nonce still
    /// matches `nonce`. Returns the new root key on success.
    ///
    /// Implementations return `Err` carrying a downcastable
    /// [`crate::domain::errors::QfsError::OutOfDate`] on a lost race; the
    /// workspace root wrapper in `quantumfs-workspace` is responsible for
    /// recognizing that case and returning it to its own caller typed.
    async fn advance(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
        nonce: Nonce,
        old: ObjectKey,
        new: ObjectKey,
    ) -> anyhow::Result<ObjectKey>;

    async fn delete_workspace(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
    ) -> anyhow::Result<()>;

    /// Requests streamed updates for one fully-qualified workspace name.
    async fn subscribe_to(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
    ) -> anyhow::Result<()>;
}
