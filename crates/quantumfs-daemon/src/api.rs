//! The concrete dispatcher behind `/api`: decodes a JSON command, calls into
//! `WorkspaceDB`/the merge engine/the flusher, and encodes a JSON response.
//!
//! Scoped to the commands a mounted instance needs to serve an administration
//! client (`branch`, `merge`, `status`, `delete-workspace`, the flusher's
//! `workspace-finished`). The remaining commands the wire protocol names --
//! `insert-inode`, accessed-paths and block introspection, `subscribe` --
//! need infrastructure (a splice-by-extended-key operation, per-path access
//! tracking, a streaming reply channel) this crate doesn't otherwise build;
//! they come back as a structured "unsupported" response rather than being
//! silently accepted.

use std::sync::Arc;

use async_trait::async_trait;
use quantumfs_core::domain::codec::Codec;
use quantumfs_core::domain::newtypes::{NamespaceName, TypespaceName, WorkspaceName};
use quantumfs_core::domain::object_key::ObjectKey;
use quantumfs_core::ports::api_handler::ApiHandler;
use quantumfs_core::ports::data_store::DataStore;
use quantumfs_core::ports::workspace_db::WorkspaceDB;
use quantumfs_fs::block::BlockLimits;
use quantumfs_merge::policy::RecreateConflictPreference;
use quantumfs_merge::use_cases::{merge_workspace_roots, MergeLabels};
use quantumfs_workspace::Flusher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct WorkspaceRef {
    typespace: String,
    namespace: String,
    workspace: String,
}

impl WorkspaceRef {
    fn resolve(&self) -> Result<(TypespaceName, NamespaceName, WorkspaceName), String> {
        let t = TypespaceName::new(self.typespace.clone()).map_err(|e| e.to_string())?;
        let n = NamespaceName::new(self.namespace.clone()).map_err(|e| e.to_string())?;
        let w = WorkspaceName::new(self.workspace.clone()).map_err(|e| e.to_string())?;
        Ok((t, n, w))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
enum Command {
    Branch { src: WorkspaceRef, dst: WorkspaceRef },
    Merge { base: WorkspaceRef, local: WorkspaceRef, remote: WorkspaceRef },
    Status { workspace: WorkspaceRef },
    DeleteWorkspace { workspace: WorkspaceRef },
    WorkspaceFinished,
}

#[derive(Serialize)]
struct ApiError<'a> {
    error: &'a str,
}

/// Wires the mounted workspace's `/api` file to the backends it was built
/// against. One instance per mounted `QuantumFs`.
pub struct DaemonApiHandler {
    store: Arc<dyn DataStore>,
    workspace_db: Arc<dyn WorkspaceDB>,
    codec: Arc<dyn Codec>,
    limits: BlockLimits,
    preference: RecreateConflictPreference,
    flusher: Arc<Flusher>,
}

impl DaemonApiHandler {
    pub fn new(
        store: Arc<dyn DataStore>,
        workspace_db: Arc<dyn WorkspaceDB>,
        codec: Arc<dyn Codec>,
        limits: BlockLimits,
        preference: RecreateConflictPreference,
        flusher: Arc<Flusher>,
    ) -> Self {
        DaemonApiHandler { store, workspace_db, codec, limits, preference, flusher }
    }

    async fn dispatch(&self, command: Command) -> Value {
        match command {
            Command::Branch { src, dst } => self.branch(src, dst).await,
            Command::Merge { base, local, remote } => self.merge(base, local, remote).await,
            Command::Status { workspace } => self.status(workspace).await,
            Command::DeleteWorkspace { workspace } => self.delete_workspace(workspace).await,
            Command::WorkspaceFinished => self.workspace_finished().await,
        }
    }

    async fn branch(&self, src: WorkspaceRef, dst: WorkspaceRef) -> Value {
        let (src, dst) = match (src.resolve(), dst.resolve()) {
            (Ok(s), Ok(d)) => (s, d),
            (Err(e), _) | (_, Err(e)) => return json!({ "error": e }),
        };
        let src_ref = (&src.0, &src.1, &src.2);
        let dst_ref = (&dst.0, &dst.1, &dst.2);
        match self.workspace_db.branch(src_ref, dst_ref).await {
            Ok(()) => {
                info!(dst = %dst.2, "branched workspace");
                json!({ "ok": true })
            }
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    async fn merge(&self, base: WorkspaceRef, local: WorkspaceRef, remote: WorkspaceRef) -> Value {
        let (base, local, remote) = match (base.resolve(), local.resolve(), remote.resolve()) {
            (Ok(b), Ok(l), Ok(r)) => (b, l, r),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return json!({ "error": e }),
        };

        let base_key = match self.workspace_db.workspace(&base.0, &base.1, &base.2).await {
            Ok((key, _)) => key,
            Err(_) => ObjectKey::empty_block(),
        };
        let (local_key, local_nonce) = match self.workspace_db.workspace(&local.0, &local.1, &local.2).await {
            Ok(v) => v,
            Err(e) => return json!({ "error": e.to_string() }),
        };
        let (remote_key, _) = match self.workspace_db.workspace(&remote.0, &remote.1, &remote.2).await {
            Ok(v) => v,
            Err(e) => return json!({ "error": e.to_string() }),
        };

        let labels = MergeLabels {
            base: format!("{}/{}/{}", base.0, base.1, base.2),
            local: format!("{}/{}/{}", local.0, local.1, local.2),
            remote: format!("{}/{}/{}", remote.0, remote.1, remote.2),
        };

        let outcome = match merge_workspace_roots(
            self.store.clone(),
            self.codec.clone(),
            self.limits,
            self.preference,
            base_key,
            local_key,
            remote_key,
            labels,
        )
        .await
        {
            Ok(o) => o,
            Err(e) => return json!({ "error": e.to_string() }),
        };

        match self
            .workspace_db
            .advance(&local.0, &local.1, &local.2, local_nonce, local_key, outcome.root_key)
            .await
        {
            Ok(new_root) => {
                if outcome.panicked {
                    warn!(workspace = %local.2, "merge traversal panicked; published recovery workspace");
                }
                json!({ "ok": true, "root_key": new_root.to_string(), "panicked": outcome.panicked })
            }
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    async fn status(&self, workspace: WorkspaceRef) -> Value {
        let (t, n, w) = match workspace.resolve() {
            Ok(v) => v,
            Err(e) => return json!({ "error": e }),
        };
        match self.workspace_db.workspace(&t, &n, &w).await {
            Ok((key, nonce)) => json!({
                "typespace": t.to_string(),
                "namespace": n.to_string(),
                "workspace": w.to_string(),
                "root_key": key.to_string(),
                "nonce": nonce.get(),
            }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    async fn delete_workspace(&self, workspace: WorkspaceRef) -> Value {
        let (t, n, w) = match workspace.resolve() {
            Ok(v) => v,
            Err(e) => return json!({ "error": e }),
        };
        match self.workspace_db.delete_workspace(&t, &n, &w).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    async fn workspace_finished(&self) -> Value {
        match self.flusher.sync_now().await {
            Ok(key) => json!({ "ok": true, "root_key": key.to_string() }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }
}

#[async_trait]
impl ApiHandler for DaemonApiHandler {
    async fn handle(&self, request: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<Command>(request) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => json!({ "error": format!("malformed request: {e}") }),
        };
        serde_json::to_vec(&response).unwrap_or_else(|_| {
            serde_json::to_vec(&ApiError { error: "failed to encode response" }).unwrap()
        })
    }
}
