//! The entry point a daemon's `merge` command calls: given a local and a
//! remote workspace-root key plus their common ancestor, publishes a merged
//! workspace-root block and hands back its key. The caller is responsible
//! for racing that key into its own workspace database via the usual
//! compare-and-set `advance`.

use std::collections::HashMap;
use std::sync::Arc;

use quantumfs_core::domain::codec::{Codec, PublishedHardlinkEntry, WorkspaceRootView};
use quantumfs_core::domain::directory_record::DirectoryRecord;
use quantumfs_core::domain::newtypes::{FileId, InodeId, Nonce};
use quantumfs_core::domain::object_key::ObjectKey;
use quantumfs_core::ports::data_store::DataStore;
use quantumfs_fs::block::{BlockLimits, FileAccessor};
use quantumfs_fs::directory::ChildTable;

use crate::error::MergeError;
use crate::policy::RecreateConflictPreference;
use crate::resolver::MergeEngine;

/// The three workspace-root identities named in a panic-recovery README,
/// purely for a human reading the recovered tree.
pub struct MergeLabels {
    pub base: String,
    pub local: String,
    pub remote: String,
}

pub struct MergeOutcome {
    pub root_key: ObjectKey,
    /// Set when the merge traversal panicked and `root_key` instead points
    /// at a single-file recovery workspace naming the three roots.
    pub panicked: bool,
}

async fn load_root_view(
    key: ObjectKey,
    store: &dyn DataStore,
    codec: &dyn Codec,
) -> Result<WorkspaceRootView, MergeError> {
    if key == ObjectKey::empty_block() {
        return Ok(WorkspaceRootView {
            root_directory_key: ObjectKey::empty_block(),
            hardlinks: Vec::new(),
            nonce: Nonce::zero(),
        });
    }
    let bytes = store.get(&key).await.map_err(MergeError::Backend)?;
    codec
        .decode_workspace_root(&bytes)
        .map_err(|e| MergeError::Backend(anyhow::anyhow!(e)))
}

async fn publish_root_view(
    root_directory_key: ObjectKey,
    hardlinks: Vec<PublishedHardlinkEntry>,
    store: &dyn DataStore,
    codec: &dyn Codec,
) -> Result<ObjectKey, MergeError> {
    let view = WorkspaceRootView {
        root_directory_key,
        hardlinks,
        nonce: Nonce::zero(),
    };
    let bytes = codec
        .encode_workspace_root(&view)
        .map_err(|e| MergeError::Backend(anyhow::anyhow!(e)))?;
    store.set(&bytes).await.map_err(MergeError::Backend)
}

/// Merges `local_key` and `remote_key` against their common ancestor
/// `base_key` (pass `ObjectKey::empty_block()` when there is none), and
/// publishes the result. Runs the traversal on its own task so a panic
/// deep in the recursion surfaces as a [`MergeOutcome::panicked`] recovery
/// workspace instead of taking the caller down with it.
pub async fn merge_workspace_roots(
    store: Arc<dyn DataStore>,
    codec: Arc<dyn Codec>,
    limits: BlockLimits,
    preference: RecreateConflictPreference,
    base_key: ObjectKey,
    local_key: ObjectKey,
    remote_key: ObjectKey,
    labels: MergeLabels,
) -> Result<MergeOutcome, MergeError> {
    if local_key == remote_key {
        return Ok(MergeOutcome {
            root_key: local_key,
            panicked: false,
        });
    }
    if local_key == base_key {
        let root_key =
            recount_legs_and_republish(&store, &codec, limits, preference, remote_key).await?;
        return Ok(MergeOutcome {
            root_key,
            panicked: false,
        });
    }

    let task_store = store.clone();
    let task_codec = codec.clone();
    let handle = tokio::spawn(async move {
        run_merge(
            task_store, task_codec, limits, preference, base_key, local_key, remote_key,
        )
        .await
    });

    match handle.await {
        Ok(result) => result.map(|root_key| MergeOutcome {
            root_key,
            panicked: false,
        }),
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                "merge traversal panicked".to_string()
            } else {
                "merge task was cancelled".to_string()
            };
            let root_key = publish_panic_workspace(store.as_ref(), codec.as_ref(), limits, &labels, &reason)
                .await
                .map_err(MergeError::Backend)?;
            Ok(MergeOutcome {
                root_key,
                panicked: true,
            })
        }
    }
}

/// Used by the `R != L == B` shortcut in [`merge_workspace_roots`]: remote's
/// tree is taken wholesale, but its hardlink table is still recomputed by
/// walking the subtree rather than reused as stored, since a workspace
/// root's raw hardlink table can carry dead legs not yet GC'd.
async fn recount_legs_and_republish(
    store: &Arc<dyn DataStore>,
    codec: &Arc<dyn Codec>,
    limits: BlockLimits,
    preference: RecreateConflictPreference,
    remote_key: ObjectKey,
) -> Result<ObjectKey, MergeError> {
    let remote_view = load_root_view(remote_key, store.as_ref(), codec.as_ref()).await?;
    let engine = MergeEngine::new(store.clone(), codec.clone(), limits, preference);
    let legs = engine.collect_legs(remote_view.root_directory_key).await?;

    let mut records: HashMap<FileId, DirectoryRecord> = HashMap::new();
    for entry in remote_view.hardlinks {
        records.entry(entry.file_id).or_insert(entry.record);
    }
    let mut nlink: HashMap<FileId, u32> = HashMap::new();
    for file_id in legs {
        *nlink.entry(file_id).or_insert(0) += 1;
    }
    let hardlinks = nlink
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .filter_map(|(file_id, n)| {
            records.get(&file_id).cloned().map(|record| PublishedHardlinkEntry { file_id, record, nlink: n })
        })
        .collect();

    publish_root_view(remote_view.root_directory_key, hardlinks, store.as_ref(), codec.as_ref()).await
}

async fn run_merge(
    store: Arc<dyn DataStore>,
    codec: Arc<dyn Codec>,
    limits: BlockLimits,
    preference: RecreateConflictPreference,
    base_key: ObjectKey,
    local_key: ObjectKey,
    remote_key: ObjectKey,
) -> Result<ObjectKey, MergeError> {
    let base_view = load_root_view(base_key, store.as_ref(), codec.as_ref()).await?;
    let local_view = load_root_view(local_key, store.as_ref(), codec.as_ref()).await?;
    let remote_view = load_root_view(remote_key, store.as_ref(), codec.as_ref()).await?;

    let engine = MergeEngine::new(store.clone(), codec.clone(), limits, preference);
    let (merged_directory_key, legs) = engine
        .merge_directory(
            base_view.root_directory_key,
            local_view.root_directory_key,
            remote_view.root_directory_key,
        )
        .await?;

    let mut records: HashMap<FileId, DirectoryRecord> = HashMap::new();
    for entry in local_view.hardlinks.into_iter().chain(remote_view.hardlinks) {
        records.entry(entry.file_id).or_insert(entry.record);
    }

    let mut nlink: HashMap<FileId, u32> = HashMap::new();
    for file_id in legs {
        *nlink.entry(file_id).or_insert(0) += 1;
    }

    let hardlinks = nlink
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .filter_map(|(file_id, n)| {
            records.get(&file_id).cloned().map(|record| PublishedHardlinkEntry {
                file_id,
                record,
                nlink: n,
            })
        })
        .collect();

    publish_root_view(merged_directory_key, hardlinks, store.as_ref(), codec.as_ref()).await
}

/// Publishes a single-file workspace whose root holds one `README` naming
/// the three roots a failed merge was attempting to combine, so a human can
/// retry manually instead of silently losing history.
async fn publish_panic_workspace(
    store: &dyn DataStore,
    codec: &dyn Codec,
    limits: BlockLimits,
    labels: &MergeLabels,
    reason: &str,
) -> anyhow::Result<ObjectKey> {
    let text = format!(
        "Automatic merge failed: {reason}\n\nancestor: {}\nlocal: {}\nremote: {}\n",
        labels.base, labels.local, labels.remote
    );
    let mut accessor = FileAccessor::empty(limits);
    accessor.write(limits, 0, text.as_bytes());
    let file_key = accessor.write_to_store(limits, store, codec).await?;

    let mut record = DirectoryRecord::new("README".into(), FileId::INVALID, accessor.object_type(), file_key);
    record.size = accessor.file_length();

    let mut dir = ChildTable::empty();
    dir.load_child(record, InodeId::new(InodeId::RESERVED_END + 1));
    let root_directory_key = dir.publish(store, codec).await?;

    let view = WorkspaceRootView {
        root_directory_key,
        hardlinks: Vec::new(),
        nonce: Nonce::zero(),
    };
    let bytes = codec.encode_workspace_root(&view).map_err(|e| anyhow::anyhow!(e))?;
    store.set(&bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::codec::JsonCodec;
    use quantumfs_core::domain::directory_record::ObjectType;
    use quantumfs_store::InMemoryDataStore;

    fn limits() -> BlockLimits {
        BlockLimits {
            max_block_size: 64,
            max_blocks_medium_file: 4,
            max_blocks_large_file: 16,
        }
    }

    fn labels() -> MergeLabels {
        MergeLabels {
            base: "base@0".into(),
            local: "local@1".into(),
            remote: "remote@1".into(),
        }
    }

    #[tokio::test]
    async fn identical_local_and_remote_short_circuits() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let key = ObjectKey::empty_block();
        let outcome = merge_workspace_roots(
            store,
            codec,
            limits(),
            RecreateConflictPreference::PreferLocal,
            key,
            key,
            key,
            labels(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.root_key, key);
        assert!(!outcome.panicked);
    }

    #[tokio::test]
    async fn unchanged_local_takes_remote_wholesale() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);

        let mut remote_dir = ChildTable::empty();
        remote_dir.load_child(
            DirectoryRecord::new(
                "new.txt".into(),
                FileId::INVALID,
                ObjectType::SmallFile,
                ObjectKey::empty_block(),
            ),
            InodeId::new(100),
        );
        let remote_dir_key = remote_dir.publish(store.as_ref(), codec.as_ref()).await.unwrap();
        let remote_root_key = publish_root_view(remote_dir_key, Vec::new(), store.as_ref(), codec.as_ref())
            .await
            .unwrap();

        let base_key = ObjectKey::empty_block();
        let outcome = merge_workspace_roots(
            store,
            codec,
            limits(),
            RecreateConflictPreference::PreferLocal,
            base_key,
            base_key,
            remote_root_key,
            labels(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.root_key, remote_root_key);
        assert!(!outcome.panicked);
    }

    #[tokio::test]
    async fn unchanged_local_recounts_remote_hardlink_legs() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let file_id = FileId::from_raw(7);

        let mut remote_dir = ChildTable::empty();
        remote_dir.load_child(
            DirectoryRecord::new("leg-a".into(), file_id, ObjectType::Hardlink, ObjectKey::empty_block()),
            InodeId::new(100),
        );
        let remote_dir_key = remote_dir.publish(store.as_ref(), codec.as_ref()).await.unwrap();

        // The stored table claims two legs (stale, from before a leg was
        // removed); only one actually appears in the tree.
        let stale_record = DirectoryRecord::new("leg-a".into(), file_id, ObjectType::Hardlink, ObjectKey::empty_block());
        let remote_root_key = publish_root_view(
            remote_dir_key,
            vec![PublishedHardlinkEntry {
                file_id,
                record: stale_record,
                nlink: 2,
            }],
            store.as_ref(),
            codec.as_ref(),
        )
        .await
        .unwrap();

        let base_key = ObjectKey::empty_block();
        let outcome = merge_workspace_roots(
            store.clone(),
            codec.clone(),
            limits(),
            RecreateConflictPreference::PreferLocal,
            base_key,
            base_key,
            remote_root_key,
            labels(),
        )
        .await
        .unwrap();
        assert!(!outcome.panicked);

        let republished = load_root_view(outcome.root_key, store.as_ref(), codec.as_ref()).await.unwrap();
        assert_eq!(republished.hardlinks.len(), 1);
        assert_eq!(republished.hardlinks[0].nlink, 1);
    }
}
