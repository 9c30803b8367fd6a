//! QuantumFS mount daemon.
//!
//! Seeds (or attaches to) an in-memory backend, mounts one workspace at a
//! given path via FUSE, wires the synthetic `/api` file to the branch/merge
//! administration surface, and runs the background flusher until the mount
//! is torn down.

mod api;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use quantumfs_core::config::Config;
use quantumfs_core::domain::newtypes::{NamespaceName, TypespaceName, WorkspaceName};
use quantumfs_core::domain::object_key::ObjectKey;
use quantumfs_core::ports::data_store::DataStore;
use quantumfs_core::ports::workspace_db::WorkspaceDB;
use quantumfs_fs::block::BlockLimits;
use quantumfs_fs::filesystem::{QuantumFs, SharedQuantumFs};
use quantumfs_fs::workspace_root::WorkspaceIdentity;
use quantumfs_merge::policy::RecreateConflictPreference;
use quantumfs_store::{DataStoreCache, InMemoryDataStore, InMemoryWorkspaceDB};
use quantumfs_workspace::Flusher;
use tokio::signal;
use tracing::info;

use crate::api::DaemonApiHandler;

#[derive(Parser, Debug)]
#[command(name = "quantumfsd", about = "Mount a QuantumFS workspace")]
struct Args {
    /// Typespace to mount.
    #[arg(long, default_value = "default")]
    typespace: String,

    /// Namespace to mount.
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Workspace to mount.
    #[arg(long, default_value = "default")]
    workspace: String,

    /// Directory to mount at; overrides `mount.mount_point` in the config file.
    #[arg(long, value_name = "PATH")]
    mount_point: Option<PathBuf>,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    /// Path to the YAML config file; falls back to the platform default.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path);
    if let Err(errors) = config.validate().into_iter().map(Err).collect::<Result<(), _>>() {
        anyhow::bail!("invalid configuration: {errors}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .with_target(false)
        .init();

    let mount_point = args.mount_point.unwrap_or_else(|| PathBuf::from(&config.mount.mount_point));
    if !mount_point.exists() {
        std::fs::create_dir_all(&mount_point).context("creating mount point directory")?;
    }
    if !std::path::Path::new("/dev/fuse").exists() {
        anyhow::bail!("/dev/fuse does not exist; is the FUSE kernel module loaded?");
    }

    let limits = BlockLimits {
        max_block_size: config.blocks.max_block_size,
        max_blocks_medium_file: config.blocks.max_blocks_medium_file,
        max_blocks_large_file: config.blocks.max_blocks_large_file,
    };
    let preference = RecreateConflictPreference::from_config(&config.merge);

    let backend: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
    let store: Arc<dyn DataStore> = Arc::new(DataStoreCache::new(backend, config.cache.max_cache_bytes));
    let workspace_db = Arc::new(InMemoryWorkspaceDB::new());

    let typespace = TypespaceName::new(args.typespace)?;
    let namespace = NamespaceName::new(args.namespace)?;
    let workspace = WorkspaceName::new(args.workspace)?;
    if !workspace_db.workspace_exists(&typespace, &namespace, &workspace).await? {
        workspace_db.seed(typespace.clone(), namespace.clone(), workspace.clone(), ObjectKey::empty_block());
    }
    let workspace_db: Arc<dyn WorkspaceDB> = workspace_db;

    let codec = Arc::new(quantumfs_core::domain::codec::JsonCodec);
    let identity = WorkspaceIdentity { typespace, namespace, workspace };

    let rt_handle = tokio::runtime::Handle::current();
    let fs = Arc::new(QuantumFs::new(
        rt_handle,
        store.clone(),
        workspace_db.clone(),
        codec.clone(),
        limits,
        identity,
        unsafe { libc::getuid() },
        unsafe { libc::getgid() },
    )?);

    let (flusher, shutdown) = Flusher::new(
        fs.clone(),
        std::time::Duration::from_millis(config.workspace.flush_delay_ms),
        std::time::Duration::from_millis(100),
    );

    let handler = Arc::new(DaemonApiHandler::new(
        store,
        workspace_db,
        codec,
        limits,
        preference,
        flusher.clone(),
    ));
    fs.set_api_handler(handler);

    let flusher_task = tokio::spawn({
        let flusher = flusher.clone();
        async move { flusher.run().await }
    });

    let mut mount_options = vec![
        fuser::MountOption::FSName("quantumfs".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if args.allow_other || config.mount.allow_other {
        mount_options.push(fuser::MountOption::AllowOther);
    }

    info!(mount_point = %mount_point.display(), "mounting QuantumFS");
    let session = fuser::spawn_mount2(SharedQuantumFs::from(fs.clone()), &mount_point, &mount_options)
        .context("failed to mount FUSE filesystem")?;

    signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    info!("received Ctrl+C, unmounting");

    shutdown.cancel();
    flusher_task.await.ok();
    session.join();
    Ok(())
}
