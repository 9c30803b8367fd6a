//! In-memory `DataStore`/`WorkspaceDB` test doubles.
//!
//! These back every other crate's unit and integration tests; they are not
//! meant for production use (no persistence, no eviction beyond what
//! `DataStoreCache` layers on top).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use quantumfs_core::domain::newtypes::{NamespaceName, Nonce, TypespaceName, WorkspaceName};
use quantumfs_core::domain::object_key::{KeyType, ObjectKey};
use quantumfs_core::ports::data_store::DataStore;
use quantumfs_core::ports::workspace_db::WorkspaceDB;

use crate::error::StoreError;

/// An in-memory content-addressed object store, keyed by `ObjectKey`.
#[derive(Default)]
pub struct InMemoryDataStore {
    objects: Mutex<HashMap<ObjectKey, Vec<u8>>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get(&self, key: &ObjectKey) -> anyhow::Result<Vec<u8>> {
        if key.key_type() == KeyType::Embedded {
            return Err(StoreError::EmbeddedKey.into());
        }
        if *key == ObjectKey::empty_block() {
            return Ok(Vec::new());
        }
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()).into())
    }

    async fn set(&self, bytes: &[u8]) -> anyhow::Result<ObjectKey> {
        if bytes.is_empty() {
            return Ok(ObjectKey::empty_block());
        }
        let key = ObjectKey::from_content(KeyType::Data, bytes);
        self.objects
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| bytes.to_vec());
        Ok(key)
    }

    async fn freshen(&self, _key: &ObjectKey) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct WorkspaceEntry {
    root_key: ObjectKey,
    nonce: Nonce,
}

/// An in-memory workspace database: one flat map keyed by the fully
/// qualified `(typespace, namespace, workspace)` triple.
#[derive(Default)]
pub struct InMemoryWorkspaceDB {
    workspaces: Mutex<HashMap<(TypespaceName, NamespaceName, WorkspaceName), WorkspaceEntry>>,
}

impl InMemoryWorkspaceDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a workspace directly, bypassing `branch`/`advance`. Used by
    /// tests to set up fixtures.
    pub fn seed(
        &self,
        t: TypespaceName,
        n: NamespaceName,
        w: WorkspaceName,
        root_key: ObjectKey,
    ) {
        self.workspaces.lock().unwrap().insert(
            (t, n, w),
            WorkspaceEntry {
                root_key,
                nonce: Nonce::default(),
            },
        );
    }
}

#[async_trait]
impl WorkspaceDB for InMemoryWorkspaceDB {
    async fn typespace_exists(&self, t: &TypespaceName) -> anyhow::Result<bool> {
        Ok(self
            .workspaces
            .lock()
            .unwrap()
            .keys()
            .any(|(ts, _, _)| ts == t))
    }

    async fn namespace_exists(&self, t: &TypespaceName, n: &NamespaceName) -> anyhow::Result<bool> {
        Ok(self
            .workspaces
            .lock()
            .unwrap()
            .keys()
            .any(|(ts, ns, _)| ts == t && ns == n))
    }

    async fn workspace_exists(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
    ) -> anyhow::Result<bool> {
        Ok(self
            .workspaces
            .lock()
            .unwrap()
            .contains_key(&(t.clone(), n.clone(), w.clone())))
    }

    async fn num_typespaces(&self) -> anyhow::Result<usize> {
        let workspaces = self.workspaces.lock().unwrap();
        let unique: std::collections::HashSet<_> = workspaces.keys().map(|(t, _, _)| t).collect();
        Ok(unique.len())
    }

    async fn num_namespaces(&self, t: &TypespaceName) -> anyhow::Result<usize> {
        let workspaces = self.workspaces.lock().unwrap();
        let unique: std::collections::HashSet<_> = workspaces
            .keys()
            .filter(|(ts, _, _)| ts == t)
            .map(|(_, n, _)| n)
            .collect();
        Ok(unique.len())
    }

    async fn num_workspaces(&self, t: &TypespaceName, n: &NamespaceName) -> anyhow::Result<usize> {
        Ok(self
            .workspaces
            .lock()
            .unwrap()
            .keys()
            .filter(|(ts, ns, _)| ts == t && ns == n)
            .count())
    }

    async fn workspace(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
    ) -> anyhow::Result<(ObjectKey, Nonce)> {
        self.workspaces
            .lock()
            .unwrap()
            .get(&(t.clone(), n.clone(), w.clone()))
            .map(|entry| (entry.root_key, entry.nonce))
            .ok_or_else(|| StoreError::WorkspaceNotFound(format!("{t}/{n}/{w}")).into())
    }

    async fn branch(
        &self,
        src: (&TypespaceName, &NamespaceName, &WorkspaceName),
        dst: (&TypespaceName, &NamespaceName, &WorkspaceName),
    ) -> anyhow::Result<()> {
        let mut workspaces = self.workspaces.lock().unwrap();
        let src_key = (src.0.clone(), src.1.clone(), src.2.clone());
        let entry = workspaces
            .get(&src_key)
            .cloned()
            .ok_or_else(|| StoreError::WorkspaceNotFound(format!("{}/{}/{}", src.0, src.1, src.2)))?;
        let dst_key = (dst.0.clone(), dst.1.clone(), dst.2.clone());
        workspaces.insert(
            dst_key,
            WorkspaceEntry {
                root_key: entry.root_key,
                nonce: Nonce::default(),
            },
        );
        Ok(())
    }

    async fn advance(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
        nonce: Nonce,
        old: ObjectKey,
        new: ObjectKey,
    ) -> anyhow::Result<ObjectKey> {
        let mut workspaces = self.workspaces.lock().unwrap();
        let entry = workspaces
            .get_mut(&(t.clone(), n.clone(), w.clone()))
            .ok_or_else(|| StoreError::WorkspaceNotFound(format!("{t}/{n}/{w}")))?;
        if entry.nonce != nonce || entry.root_key != old {
            return Err(StoreError::OutOfDate.into());
        }
        entry.root_key = new;
        entry.nonce = entry.nonce.next();
        Ok(new)
    }

    async fn delete_workspace(
        &self,
        t: &TypespaceName,
        n: &NamespaceName,
        w: &WorkspaceName,
    ) -> anyhow::Result<()> {
        self.workspaces
            .lock()
            .unwrap()
            .remove(&(t.clone(), n.clone(), w.clone()))
            .map(|_| ())
            .ok_or_else(|| StoreError::WorkspaceNotFound(format!("{t}/{n}/{w}")).into())
    }

    async fn subscribe_to(
        &self,
        _t: &TypespaceName,
        _n: &NamespaceName,
        _w: &WorkspaceName,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> (TypespaceName, NamespaceName, WorkspaceName) {
        (
            TypespaceName::new("typespace").unwrap(),
            NamespaceName::new("namespace").unwrap(),
            WorkspaceName::new("workspace").unwrap(),
        )
    }

    mod data_store {
        use super::*;

        #[tokio::test]
        async fn set_then_get_round_trips() {
            let store = InMemoryDataStore::new();
            let key = store.set(b"content").await.unwrap();
            assert_eq!(store.get(&key).await.unwrap(), b"content");
        }

        #[tokio::test]
        async fn missing_key_errors() {
            let store = InMemoryDataStore::new();
            let key = ObjectKey::from_content(KeyType::Data, b"never stored");
            assert!(store.get(&key).await.is_err());
        }

        #[tokio::test]
        async fn empty_bytes_use_empty_block_key() {
            let store = InMemoryDataStore::new();
            let key = store.set(b"").await.unwrap();
            assert_eq!(key, ObjectKey::empty_block());
            assert_eq!(store.get(&key).await.unwrap(), Vec::<u8>::new());
            assert!(store.is_empty());
        }
    }

    mod workspace_db {
        use super::*;

        #[tokio::test]
        async fn seeded_workspace_is_readable() {
            let db = InMemoryWorkspaceDB::new();
            let (t, n, w) = names();
            let root = ObjectKey::empty_block();
            db.seed(t.clone(), n.clone(), w.clone(), root);

            assert!(db.workspace_exists(&t, &n, &w).await.unwrap());
            let (key, _nonce) = db.workspace(&t, &n, &w).await.unwrap();
            assert_eq!(key, root);
        }

        #[tokio::test]
        async fn advance_with_stale_nonce_fails() {
            let db = InMemoryWorkspaceDB::new();
            let (t, n, w) = names();
            let root = ObjectKey::empty_block();
            db.seed(t.clone(), n.clone(), w.clone(), root);

            let new_key = ObjectKey::from_content(KeyType::Metadata, b"new root");
            let stale_nonce = Nonce::default().next();
            let result = db.advance(&t, &n, &w, stale_nonce, root, new_key).await;
            assert!(result.is_err());
        }

        #[tokio::test]
        async fn advance_with_correct_nonce_and_old_key_succeeds() {
            let db = InMemoryWorkspaceDB::new();
            let (t, n, w) = names();
            let root = ObjectKey::empty_block();
            db.seed(t.clone(), n.clone(), w.clone(), root);

            let (_, nonce) = db.workspace(&t, &n, &w).await.unwrap();
            let new_key = ObjectKey::from_content(KeyType::Metadata, b"new root");
            let advanced = db.advance(&t, &n, &w, nonce, root, new_key).await.unwrap();
            assert_eq!(advanced, new_key);

            let (key, new_nonce) = db.workspace(&t, &n, &w).await.unwrap();
            assert_eq!(key, new_key);
            assert_ne!(new_nonce, nonce);
        }

        #[tokio::test]
        async fn branch_copies_root_into_new_workspace() {
            let db = InMemoryWorkspaceDB::new();
            let (t, n, w) = names();
            let root = ObjectKey::from_content(KeyType::Metadata, b"shared root");
            db.seed(t.clone(), n.clone(), w.clone(), root);

            let dst_w = WorkspaceName::new("branch").unwrap();
            db.branch((&t, &n, &w), (&t, &n, &dst_w)).await.unwrap();

            let (key, _) = db.workspace(&t, &n, &dst_w).await.unwrap();
            assert_eq!(key, root);
        }

        #[tokio::test]
        async fn delete_removes_workspace() {
            let db = InMemoryWorkspaceDB::new();
            let (t, n, w) = names();
            db.seed(t.clone(), n.clone(), w.clone(), ObjectKey::empty_block());

            db.delete_workspace(&t, &n, &w).await.unwrap();
            assert!(!db.workspace_exists(&t, &n, &w).await.unwrap());
        }
    }
}
