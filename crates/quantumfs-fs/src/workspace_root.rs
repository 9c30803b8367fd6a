//! The workspace root: the root directory, the hardlink table, and the
//! `(typespace, namespace, workspace)` identity plus the monotonic nonce
//! the workspace database hands back on every read.

use quantumfs_core::domain::codec::{Codec, PublishedHardlinkEntry, WorkspaceRootView};
use quantumfs_core::domain::errors::QfsError;
use quantumfs_core::domain::newtypes::{NamespaceName, Nonce, TypespaceName, WorkspaceName};
use quantumfs_core::domain::object_key::ObjectKey;
use quantumfs_core::ports::data_store::DataStore;
use quantumfs_core::ports::workspace_db::WorkspaceDB;
use quantumfs_store::StoreError;

use crate::directory::ChildTable;
use crate::hardlink::HardlinkTable;

/// The fully-qualified name of one workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceIdentity {
    pub typespace: TypespaceName,
    pub namespace: NamespaceName,
    pub workspace: WorkspaceName,
}

/// The in-memory state backing one mounted workspace: its root directory,
/// hardlink table, identity, and the last-known root key/nonce pair used
/// to compare-and-set against the backend.
pub struct WorkspaceRoot {
    pub identity: WorkspaceIdentity,
    pub root: ChildTable,
    pub hardlinks: HardlinkTable,
    root_key: ObjectKey,
    nonce: Nonce,
}

impl WorkspaceRoot {
    pub fn new(identity: WorkspaceIdentity, root: ChildTable, root_key: ObjectKey, nonce: Nonce) -> Self {
        WorkspaceRoot {
            identity,
            root,
            hardlinks: HardlinkTable::new(),
            root_key,
            nonce,
        }
    }

    /// Loads a workspace's current root directory and identity from the
    /// backend without touching the hardlink table (callers that also need
    /// the hardlink table should decode it from the same root block via
    /// [`Self::load_full`]).
    pub async fn load(
        identity: WorkspaceIdentity,
        db: &dyn WorkspaceDB,
        store: &dyn DataStore,
        codec: &dyn Codec,
    ) -> anyhow::Result<Self> {
        let (root_key, nonce) = db
            .workspace(&identity.typespace, &identity.namespace, &identity.workspace)
            .await?;
        let mut this = WorkspaceRoot::new(identity, ChildTable::empty(), root_key, nonce);
        this.reload_from(root_key, store, codec).await?;
        Ok(this)
    }

    /// Decodes the workspace root block at `key`, replacing this
    /// instance's root directory and hardlink table with the result.
    async fn reload_from(
        &mut self,
        key: ObjectKey,
        store: &dyn DataStore,
        codec: &dyn Codec,
    ) -> anyhow::Result<()> {
        if key == ObjectKey::empty_block() {
            self.root = ChildTable::empty();
            self.hardlinks = HardlinkTable::new();
            return Ok(());
        }
        let bytes = store.get(&key).await?;
        let view = codec
            .decode_workspace_root(&bytes)
            .map_err(|e| anyhow::anyhow!(e))?;
        self.root = ChildTable::load(view.root_directory_key, store, codec).await?;
        let hardlinks = HardlinkTable::new();
        for entry in view.hardlinks {
            hardlinks.insert_published(entry.file_id, entry.record, entry.nlink as i64, 0);
        }
        self.hardlinks = hardlinks;
        Ok(())
    }

    pub fn root_key(&self) -> ObjectKey {
        self.root_key
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Publishes the root directory and the hardlink table's publishable
    /// entries into one workspace-root block, returning its key without
    /// advancing the backend's pointer -- the caller decides when to race
    /// that compare-and-set via [`Self::advance`].
    pub async fn publish(&self, store: &dyn DataStore, codec: &dyn Codec) -> anyhow::Result<ObjectKey> {
        let root_directory_key = self.root.publish(store, codec).await?;
        let hardlinks = self
            .hardlinks
            .publishable_entries()
            .into_iter()
            .map(|(file_id, record, _created_at)| PublishedHardlinkEntry {
                file_id,
                nlink: self
                    .hardlinks
                    .leg_count(file_id)
                    .unwrap_or(1)
                    .max(0) as u32,
                record,
            })
            .collect();
        let view = WorkspaceRootView {
            root_directory_key,
            hardlinks,
            nonce: self.nonce,
        };
        let bytes = codec
            .encode_workspace_root(&view)
            .map_err(|e| anyhow::anyhow!(e))?;
        store.set(&bytes).await
    }

    /// Atomically compare-and-sets the workspace database's stored root
    /// from `self.root_key()`/`self.nonce()` to `new_root`, advancing this
    /// instance's cached root/nonce on success. Fails with
    /// [`QfsError::OutOfDate`] if a concurrent publisher won the race.
    pub async fn advance(&mut self, db: &dyn WorkspaceDB, new_root: ObjectKey) -> Result<ObjectKey, QfsError> {
        let result = db
            .advance(
                &self.identity.typespace,
                &self.identity.namespace,
                &self.identity.workspace,
                self.nonce,
                self.root_key,
                new_root,
            )
            .await;
        match result {
            Ok(key) => {
                self.root_key = key;
                self.nonce = self.nonce.next();
                Ok(key)
            }
            Err(err) => Err(downcast_to_qfs_error(err)),
        }
    }
}

pub(crate) fn downcast_to_qfs_error(err: anyhow::Error) -> QfsError {
    match err.downcast::<StoreError>() {
        Ok(store_err) => store_err.into(),
        Err(err) => QfsError::Backend(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::codec::JsonCodec;
    use quantumfs_core::domain::directory_record::{DirectoryRecord, ObjectType};
    use quantumfs_core::domain::newtypes::{FileId, InodeId};
    use quantumfs_store::{InMemoryDataStore, InMemoryWorkspaceDB};

    fn names() -> WorkspaceIdentity {
        WorkspaceIdentity {
            typespace: TypespaceName::new("t").unwrap(),
            namespace: NamespaceName::new("n").unwrap(),
            workspace: WorkspaceName::new("w").unwrap(),
        }
    }

    #[tokio::test]
    async fn publish_then_advance_round_trips_through_backend() {
        let store = InMemoryDataStore::new();
        let db = InMemoryWorkspaceDB::new();
        let codec = JsonCodec;
        let identity = names();
        db.seed(
            identity.typespace.clone(),
            identity.namespace.clone(),
            identity.workspace.clone(),
            ObjectKey::empty_block(),
        );

        let mut root = WorkspaceRoot::load(identity, &db, &store, &codec)
            .await
            .unwrap();
        root.root.load_child(
            DirectoryRecord::new(
                "a.txt".into(),
                FileId::generate(),
                ObjectType::SmallFile,
                ObjectKey::empty_block(),
            ),
            InodeId::new(100),
        );

        let new_key = root.publish(&store, &codec).await.unwrap();
        let advanced = root.advance(&db, new_key).await.unwrap();
        assert_eq!(advanced, new_key);
        assert_eq!(root.root_key(), new_key);
    }

    #[tokio::test]
    async fn advance_with_stale_root_fails_out_of_date() {
        let store = InMemoryDataStore::new();
        let db = InMemoryWorkspaceDB::new();
        let codec = JsonCodec;
        let identity = names();
        db.seed(
            identity.typespace.clone(),
            identity.namespace.clone(),
            identity.workspace.clone(),
            ObjectKey::empty_block(),
        );

        let mut root = WorkspaceRoot::load(identity, &db, &store, &codec)
            .await
            .unwrap();
        // Simulate a concurrent publisher winning first.
        let other_key = ObjectKey::from_content(
            quantumfs_core::domain::object_key::KeyType::Metadata,
            b"other",
        );
        db.seed(
            root.identity.typespace.clone(),
            root.identity.namespace.clone(),
            root.identity.workspace.clone(),
            other_key,
        );

        let new_key = root.publish(&store, &codec).await.unwrap();
        let err = root.advance(&db, new_key).await.unwrap_err();
        assert!(matches!(err, QfsError::OutOfDate));
    }
}
