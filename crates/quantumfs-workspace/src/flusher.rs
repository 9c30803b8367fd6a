//! The background flusher: polls a workspace for dirty inodes and drains
//! them once they have been dirty for the configured delay.
//!
//! Grounded on the debounce-queue poll loop shape: a timer ticks at
//! `poll_interval`, and a quiet/dirty window is tracked against
//! `flush_delay` rather than pushing individual dirty events through a
//! channel -- `QuantumFs::flush_dirty` always drains the whole dirty set in
//! one pass, so there is nothing to coalesce per-path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use quantumfs_core::domain::errors::QfsError;
use quantumfs_core::domain::object_key::ObjectKey;
use quantumfs_fs::filesystem::QuantumFs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drains one workspace's dirty inodes on a delay timer, or immediately on
/// request. One `Flusher` is created per mounted workspace.
pub struct Flusher {
    fs: Arc<QuantumFs>,
    flush_delay: Duration,
    poll_interval: Duration,
    dirty_since: Mutex<Option<Instant>>,
    shutdown: CancellationToken,
}

impl Flusher {
    /// Builds a flusher for `fs`. Returns the flusher and a cancellation
    /// token the caller signals on unmount to stop [`Flusher::run`].
    pub fn new(fs: Arc<QuantumFs>, flush_delay: Duration, poll_interval: Duration) -> (Arc<Self>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let flusher = Arc::new(Self {
            fs,
            flush_delay,
            poll_interval,
            dirty_since: Mutex::new(None),
            shutdown: shutdown.clone(),
        });
        (flusher, shutdown)
    }

    /// Runs until the cancellation token fires: on every tick, checks
    /// whether the workspace has dirty inodes, starts a window on the
    /// first dirty tick, and drains once the window has been open for
    /// `flush_delay`.
    pub async fn run(&self) {
        info!(
            delay_ms = self.flush_delay.as_millis() as u64,
            poll_ms = self.poll_interval.as_millis() as u64,
            "flusher starting"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        if self.fs.has_dirty() {
            debug!("draining remaining dirty inodes before shutdown");
            self.drain().await;
        }
        info!("flusher stopped");
    }

    async fn tick(&self) {
        if !self.fs.has_dirty() {
            *self.dirty_since.lock().await = None;
            return;
        }

        let mut dirty_since = self.dirty_since.lock().await;
        let opened_at = *dirty_since.get_or_insert_with(Instant::now);
        if opened_at.elapsed() >= self.flush_delay {
            *dirty_since = None;
            drop(dirty_since);
            self.drain().await;
        }
    }

    async fn drain(&self) {
        match self.fs.flush_dirty().await {
            Ok(key) => debug!(root = %key, "flushed dirty inodes"),
            Err(QfsError::OutOfDate) => {
                warn!("flush lost the root compare-and-set race, will retry next tick")
            }
            Err(err) => warn!(error = %err, "flush failed"),
        }
    }

    /// Forces an immediate flush to quiescence, bypassing the delay
    /// window. Used by `sync_workspace` requests (the CLI's `sync --now`
    /// and the `/api` `workspace-finished` command).
    pub async fn sync_now(&self) -> Result<ObjectKey, QfsError> {
        *self.dirty_since.lock().await = None;
        self.fs.flush_dirty().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::codec::{Codec, JsonCodec};
    use quantumfs_core::domain::directory_record::ObjectType;
    use quantumfs_core::domain::newtypes::{InodeId, NamespaceName, TypespaceName, WorkspaceName};
    use quantumfs_core::ports::data_store::DataStore;
    use quantumfs_core::ports::workspace_db::WorkspaceDB;
    use quantumfs_fs::block::BlockLimits;
    use quantumfs_fs::workspace_root::WorkspaceIdentity;
    use quantumfs_store::{InMemoryDataStore, InMemoryWorkspaceDB};

    fn test_fs() -> Arc<QuantumFs> {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let db = InMemoryWorkspaceDB::new();
        let identity = WorkspaceIdentity {
            typespace: TypespaceName::new("t").unwrap(),
            namespace: NamespaceName::new("n").unwrap(),
            workspace: WorkspaceName::new("w").unwrap(),
        };
        db.seed(
            identity.typespace.clone(),
            identity.namespace.clone(),
            identity.workspace.clone(),
            ObjectKey::empty_block(),
        );
        let workspace_db: Arc<dyn WorkspaceDB> = Arc::new(db);
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let limits = BlockLimits { max_block_size: 64, max_blocks_medium_file: 4, max_blocks_large_file: 16 };
        Arc::new(
            QuantumFs::new(
                tokio::runtime::Handle::current(),
                store,
                workspace_db,
                codec,
                limits,
                identity,
                1000,
                1000,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn sync_now_advances_the_root_with_no_dirty_inodes() {
        let fs = test_fs();
        let (flusher, _shutdown) = Flusher::new(fs, Duration::from_secs(60), Duration::from_millis(10));
        let key = flusher.sync_now().await.unwrap();
        assert_eq!(key, ObjectKey::empty_block());
    }

    #[tokio::test]
    async fn tick_opens_a_window_but_does_not_drain_before_the_delay() {
        let fs = test_fs();
        fs.create_child_impl(1000, 1000, InodeId::ROOT.get(), "a.txt", ObjectType::SmallFile, 0o644, None)
            .unwrap();
        let (flusher, _shutdown) = Flusher::new(fs.clone(), Duration::from_secs(60), Duration::from_millis(10));
        flusher.tick().await;
        assert!(flusher.dirty_since.lock().await.is_some());
        assert!(fs.has_dirty());
    }

    #[tokio::test]
    async fn run_drains_remaining_dirty_work_on_shutdown() {
        let fs = test_fs();
        fs.create_child_impl(1000, 1000, InodeId::ROOT.get(), "a.txt", ObjectType::SmallFile, 0o644, None)
            .unwrap();
        let (flusher, shutdown) = Flusher::new(fs.clone(), Duration::from_secs(60), Duration::from_millis(5));
        let handle = tokio::spawn({
            let flusher = flusher.clone();
            async move { flusher.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("flusher should exit promptly once cancelled")
            .unwrap();
        assert!(!fs.has_dirty());
    }
}
