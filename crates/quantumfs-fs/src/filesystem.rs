//! FUSE filesystem implementation.
//!
//! Bridges the kernel's synchronous `fuser::Filesystem` callbacks to the
//! async backend (`DataStore`/`WorkspaceDB`) via `rt_handle.block_on`. One
//! `QuantumFs` mounts exactly one workspace.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use quantumfs_core::domain::codec::{Codec, PublishedHardlinkEntry, WorkspaceRootView};
use quantumfs_core::domain::directory_record::{DirectoryRecord, ObjectType};
use quantumfs_core::domain::errors::QfsError;
use quantumfs_core::domain::newtypes::{FileId, HandleIdAllocator, InodeId, NULL_WORKSPACE};
use quantumfs_core::domain::object_key::ObjectKey;
use quantumfs_core::ports::api_handler::ApiHandler;
use quantumfs_core::ports::data_store::DataStore;
use quantumfs_core::ports::workspace_db::WorkspaceDB;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::block::{BlockLimits, FileAccessor};
use crate::directory::{check_sticky_unlink, check_write_permission, ChildTable};
use crate::hardlink::HardlinkTable;
use crate::inode::{Inode, InodeKind, InodeRegistry, ParentPointer};
use crate::workspace_root::{downcast_to_qfs_error, WorkspaceIdentity, WorkspaceRoot};
use crate::xattr;

/// TTL for FUSE attribute/entry caching.
const TTL: Duration = Duration::from_secs(1);

/// POSIX `NAME_MAX`.
const NAME_MAX: usize = 255;

/// An open file handle: the inode it was opened against. Content access
/// always goes back through the inode's own block accessor, not through
/// per-handle state, so there is nothing else to carry here.
struct FileHandleState {
    inode_id: InodeId,
}

/// One mounted workspace.
pub struct QuantumFs {
    rt_handle: Handle,
    store: Arc<dyn DataStore>,
    workspace_db: Arc<dyn WorkspaceDB>,
    codec: Arc<dyn Codec>,
    limits: BlockLimits,
    registry: InodeRegistry,
    hardlinks: HardlinkTable,
    identity: WorkspaceIdentity,
    root_key: Mutex<ObjectKey>,
    nonce: Mutex<quantumfs_core::domain::newtypes::Nonce>,
    handles: HandleIdAllocator,
    file_handles: DashMap<u64, FileHandleState>,
    dir_handles: DashMap<u64, Vec<DirectoryRecord>>,
    uid: u32,
    gid: u32,
    api_handler: Mutex<Option<Arc<dyn ApiHandler>>>,
}

impl QuantumFs {
    pub fn new(
        rt_handle: Handle,
        store: Arc<dyn DataStore>,
        workspace_db: Arc<dyn WorkspaceDB>,
        codec: Arc<dyn Codec>,
        limits: BlockLimits,
        identity: WorkspaceIdentity,
        uid: u32,
        gid: u32,
    ) -> anyhow::Result<Self> {
        let loaded = rt_handle.block_on(WorkspaceRoot::load(
            identity.clone(),
            workspace_db.as_ref(),
            store.as_ref(),
            codec.as_ref(),
        ))?;
        let root_key = loaded.root_key();
        let nonce = loaded.nonce();

        let registry = InodeRegistry::new(Duration::from_secs(30), InodeId::RESERVED_END);
        let mut root_record = DirectoryRecord::new(
            String::new(),
            FileId::INVALID,
            ObjectType::Directory,
            root_key,
        );
        root_record.permissions = 0o755;
        root_record.owner = uid;
        root_record.group = gid;
        registry.insert(Inode::new(
            InodeId::ROOT,
            ParentPointer::Directory(InodeId::ROOT),
            String::new(),
            InodeKind::Directory(loaded.root),
            root_record,
        ));

        let mut api_record = DirectoryRecord::new(
            "api".into(),
            FileId::INVALID,
            ObjectType::SmallFile,
            ObjectKey::empty_block(),
        );
        api_record.permissions = 0o600;
        api_record.owner = uid;
        api_record.group = gid;
        registry.insert(Inode::new(
            InodeId::API,
            ParentPointer::Directory(InodeId::ROOT),
            "api".into(),
            InodeKind::Api(Mutex::new(Vec::new())),
            api_record,
        ));

        Ok(QuantumFs {
            rt_handle,
            store,
            workspace_db,
            codec,
            limits,
            registry,
            hardlinks: loaded.hardlinks,
            identity,
            root_key: Mutex::new(root_key),
            nonce: Mutex::new(nonce),
            handles: HandleIdAllocator::new(),
            file_handles: DashMap::new(),
            dir_handles: DashMap::new(),
            uid,
            gid,
            api_handler: Mutex::new(None),
        })
    }

    /// Injects the command dispatcher behind `/api`. Left unset in tests and
    /// in any mount that doesn't need the administrative surface; writes to
    /// `/api` before this is called come back with an error response rather
    /// than panicking.
    pub fn set_api_handler(&self, handler: Arc<dyn ApiHandler>) {
        *self.api_handler.lock().unwrap() = Some(handler);
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn is_null_workspace(&self) -> bool {
        (
            self.identity.typespace.as_str(),
            self.identity.namespace.as_str(),
            self.identity.workspace.as_str(),
        ) == NULL_WORKSPACE
    }

    fn get_inode(&self, ino: u64) -> Result<Arc<Inode>, QfsError> {
        self.registry
            .get(InodeId::new(ino))
            .ok_or_else(|| QfsError::not_found(format!("inode {ino}")))
    }

    fn to_file_attr(&self, inode: &Inode, record: &DirectoryRecord) -> FileAttr {
        let kind = record.object_type.to_fuser_file_type();
        let size = match record.object_type {
            ObjectType::Directory => 0,
            _ => record.size,
        };
        let time = UNIX_EPOCH + Duration::from_secs(record.modification_time.max(0) as u64);
        let nlink = if record.object_type == ObjectType::Hardlink {
            self.hardlinks.leg_count(record.file_id).unwrap_or(1).max(1) as u32
        } else if kind == FileType::Directory {
            2
        } else {
            1
        };
        FileAttr {
            ino: inode.id.get(),
            size,
            blocks: size.div_ceil(512),
            atime: time,
            mtime: time,
            ctime: time,
            crtime: time,
            kind,
            perm: record.permissions,
            nlink,
            uid: record.owner,
            gid: record.group,
            rdev: 0,
            blksize: self.limits.max_block_size,
            flags: 0,
        }
    }

    /// Caller's supplementary group set -- the host process-status view is
    /// a platform-specific concern left to the daemon binary; within the
    /// library this defaults to no supplementary groups, matching the
    /// teacher's own refusal to shell out to `/proc` from library code.
    fn caller_groups(&self) -> Vec<u32> {
        Vec::new()
    }

    fn with_directory<R>(
        &self,
        ino: u64,
        f: impl FnOnce(&Inode, &mut ChildTable) -> Result<R, QfsError>,
    ) -> Result<R, QfsError> {
        let inode = self.get_inode(ino)?;
        let mut kind = inode.kind.write().unwrap();
        match &mut *kind {
            InodeKind::Directory(table) => f(&inode, table),
            _ => Err(QfsError::NotDir(format!("inode {ino}"))),
        }
    }

    fn ensure_child_inode(&self, parent: &Inode, parent_table: &mut ChildTable, record: &DirectoryRecord) -> InodeId {
        if let Some(id) = parent_table.inode_of(&record.filename) {
            return id;
        }
        let id = self.registry.allocate_id();
        let kind = self.new_inode_kind(record);
        let inode = Inode::new(id, ParentPointer::Directory(parent.id), record.filename.clone(), kind, record.clone());
        self.registry.insert(inode);
        parent_table.load_child(record.clone(), id);
        if record.object_type == ObjectType::Hardlink {
            self.hardlinks.bind_inode(record.file_id, id);
        }
        id
    }

    fn new_inode_kind(&self, record: &DirectoryRecord) -> InodeKind {
        match record.object_type {
            ObjectType::Directory => InodeKind::Directory(ChildTable::empty()),
            ObjectType::Symlink => {
                let target = record
                    .key
                    .embedded_payload()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_default();
                InodeKind::Symlink(target)
            }
            ObjectType::Special => InodeKind::Special { major: 0, minor: 0 },
            ObjectType::Hardlink => {
                let target = self
                    .hardlinks
                    .get_hardlink(record.file_id)
                    .unwrap_or_else(|| record.clone());
                self.new_inode_kind(&target)
            }
            // Content is loaded lazily on first `open`/`read`; an empty
            // accessor is a safe placeholder until then.
            _ => InodeKind::File(FileAccessor::empty(self.limits)),
        }
    }

    fn resolve_attrs_key(&self, record: &DirectoryRecord) -> ObjectKey {
        if record.object_type == ObjectType::Hardlink {
            self.hardlinks
                .get_hardlink(record.file_id)
                .map(|r| r.extended_attributes)
                .unwrap_or(record.extended_attributes)
        } else {
            record.extended_attributes
        }
    }

    /// Marks `inode` dirty and walks its parent chain marking every
    /// ancestor dirty too, stopping as soon as an already-dirty ancestor is
    /// reached (its own ancestors were marked the first time it was). This
    /// is the "every mutating operation marks its inode dirty and
    /// recursively marks its parent" rule the background flusher relies on
    /// to know which directories need re-publishing.
    pub(crate) fn mark_dirty_chain(&self, inode: &Inode) {
        inode.mark_dirty();
        let mut current = match *inode.parent.read().unwrap() {
            ParentPointer::Directory(id) if id != inode.id => Some(id),
            _ => None,
        };
        while let Some(id) = current {
            let Some(parent) = self.registry.get(id) else { break };
            if parent.dirty.swap(true, Ordering::SeqCst) {
                break;
            }
            current = match *parent.parent.read().unwrap() {
                ParentPointer::Directory(pid) if pid != parent.id => Some(pid),
                _ => None,
            };
        }
    }

    /// Distance from `inode` up to the workspace root, used to order the
    /// flusher's drain so that every child is republished before the
    /// directory that references it.
    fn depth_of(&self, inode: &Inode) -> u32 {
        let mut depth = 0;
        let mut current = *inode.parent.read().unwrap();
        while let ParentPointer::Directory(id) = current {
            if id == inode.id {
                break;
            }
            depth += 1;
            match self.registry.get(id) {
                Some(parent) => current = *parent.parent.read().unwrap(),
                None => break,
            }
        }
        depth
    }

    /// Publishes one dirty inode's own content (a directory's child table
    /// or a file's blocks) and installs the resulting key into its parent's
    /// child-table entry, without holding any inode lock across the
    /// backend call: the content is snapshotted under the lock, then
    /// published against a detached copy.
    async fn publish_inode(&self, inode: &Arc<Inode>) -> anyhow::Result<()> {
        enum Snapshot {
            Dir(ChildTable),
            File(FileAccessor),
            Other,
        }

        let snapshot = match &*inode.kind.read().unwrap() {
            InodeKind::Directory(table) => Snapshot::Dir(ChildTable::from_base(table.publishable_records())),
            InodeKind::File(accessor) => Snapshot::File(accessor.clone()),
            InodeKind::Symlink(_) | InodeKind::Special { .. } | InodeKind::Listing(_) | InodeKind::Api(_) => {
                Snapshot::Other
            }
        };

        let (new_key, new_size) = match snapshot {
            Snapshot::Dir(table) => {
                let key = table.publish(self.store.as_ref(), self.codec.as_ref()).await?;
                (key, 0)
            }
            Snapshot::File(mut accessor) => {
                let key = accessor
                    .write_to_store(self.limits, self.store.as_ref(), self.codec.as_ref())
                    .await?;
                (key, accessor.file_length())
            }
            Snapshot::Other => return Ok(()),
        };

        {
            let mut record = inode.cached_record.write().unwrap();
            record.key = new_key;
            if matches!(&*inode.kind.read().unwrap(), InodeKind::File(_)) {
                record.size = new_size;
            }
        }

        let parent_id = match *inode.parent.read().unwrap() {
            ParentPointer::Directory(id) if id != inode.id => Some(id),
            _ => None,
        };
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.registry.get(parent_id) {
                let record = inode.cached_record.read().unwrap().clone();
                if let InodeKind::Directory(table) = &mut *parent.kind.write().unwrap() {
                    table.update_record(inode.id, record);
                }
            }
        }

        // A hardlinked inode's canonical attributes live in the hardlink
        // table, not in any single directory's child table -- every leg
        // resolves key/size through `get_hardlink`, so the group's entry
        // needs the same refresh every other leg's lookup relies on.
        let (is_hardlink, file_id) = self.hardlinks.check_hardlink(inode.id);
        if is_hardlink {
            let file_id = file_id.unwrap();
            let record = inode.cached_record.read().unwrap().clone();
            self.hardlinks.update_record(file_id, record);
        }
        Ok(())
    }

    /// Republishes the workspace root block (the root directory's own
    /// content plus the hardlink table's publishable entries) and advances
    /// the backend's stored root via compare-and-set.
    async fn publish_root(&self) -> Result<ObjectKey, QfsError> {
        let root_inode = self.get_inode(InodeId::ROOT.get())?;
        if root_inode.take_dirty() {
            self.publish_inode(&root_inode)
                .await
                .map_err(QfsError::Backend)?;
        }

        let root_directory_key = root_inode.cached_record.read().unwrap().key;
        let hardlinks: Vec<PublishedHardlinkEntry> = self
            .hardlinks
            .publishable_entries()
            .into_iter()
            .map(|(file_id, record, _created_at)| PublishedHardlinkEntry {
                file_id,
                nlink: self.hardlinks.leg_count(file_id).unwrap_or(1).max(0) as u32,
                record,
            })
            .collect();
        let nonce = *self.nonce.lock().unwrap();
        let view = WorkspaceRootView { root_directory_key, hardlinks, nonce };
        let bytes = self
            .codec
            .encode_workspace_root(&view)
            .map_err(|e| QfsError::Backend(anyhow::anyhow!(e)))?;
        let new_root = self
            .store
            .set(&bytes)
            .await
            .map_err(QfsError::Backend)?;

        let old_root = *self.root_key.lock().unwrap();
        let result = self
            .workspace_db
            .advance(
                &self.identity.typespace,
                &self.identity.namespace,
                &self.identity.workspace,
                nonce,
                old_root,
                new_root,
            )
            .await;
        match result {
            Ok(key) => {
                *self.root_key.lock().unwrap() = key;
                let mut nonce_guard = self.nonce.lock().unwrap();
                *nonce_guard = nonce_guard.next();
                Ok(key)
            }
            Err(err) => Err(downcast_to_qfs_error(err)),
        }
    }

    /// Drains every dirty inode bottom-up (deepest first, so a directory
    /// always sees its children's freshly-published keys before it
    /// republishes its own chain), then advances the workspace root.
    /// Returns the new root key on success.
    pub async fn flush_dirty(&self) -> Result<ObjectKey, QfsError> {
        let mut dirty: Vec<(u32, Arc<Inode>)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|inode| inode.dirty.load(Ordering::SeqCst) && inode.id != InodeId::ROOT)
            .map(|inode| (self.depth_of(&inode), inode))
            .collect();
        dirty.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, inode) in dirty {
            if inode.take_dirty() {
                self.publish_inode(&inode).await.map_err(QfsError::Backend)?;
            }
        }

        self.publish_root().await
    }

    /// True if any non-root inode is currently dirty. Polled by the
    /// background flusher to decide whether a flush window should open.
    pub fn has_dirty(&self) -> bool {
        self.registry
            .snapshot()
            .iter()
            .any(|inode| inode.id != InodeId::ROOT && inode.dirty.load(Ordering::SeqCst))
    }
}

impl QuantumFs {
    // Shared (`&self`) bodies for every `Filesystem` method. Kept as plain
    // inherent methods so that both `QuantumFs` itself (used directly in
    // tests) and `Arc<QuantumFs>` (used by the mount daemon, which also
    // hands a clone to the background flusher) can implement `Filesystem`
    // by forwarding into the same code; none of these ever needs exclusive
    // access, since every field they touch is behind a `Mutex`/`RwLock`/
    // `DashMap`.
    fn lookup_shared(&self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        if name.len() > NAME_MAX {
            reply.error(libc::ENAMETOOLONG);
            return;
        }

        if parent == InodeId::ROOT.get() && name == "api" {
            let inode = self.get_inode(InodeId::API.get()).expect("api inode always registered");
            inode.increment_lookup();
            let record = inode.cached_record.read().unwrap().clone();
            let attr = self.to_file_attr(&inode, &record);
            reply.entry(&TTL, &attr, 0);
            return;
        }

        let result = self.with_directory(parent, |parent_inode, table| {
            let record = table
                .record_by_name(name)
                .cloned()
                .ok_or_else(|| QfsError::not_found(name))?;
            let id = self.ensure_child_inode(parent_inode, table, &record);
            Ok((id, record))
        });

        match result {
            Ok((id, record)) => {
                let child = self.registry.get(id).expect("just ensured");
                child.increment_lookup();
                let attr = self.to_file_attr(&child, &record);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => {
                debug!(parent, name, error = %err, "lookup failed");
                reply.error(libc::c_int::from(&err));
            }
        }
    }

    fn forget_shared(&self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if let Some(inode) = self.registry.get(InodeId::new(ino)) {
            inode.forget(nlookup);
            if inode.is_expired() {
                self.registry.drop_inode(inode.id);
            }
        }
    }

    fn getattr_shared(&self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.get_inode(ino) {
            Ok(inode) => {
                let record = inode.cached_record.read().unwrap().clone();
                reply.attr(&TTL, &self.to_file_attr(&inode, &record));
            }
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn setattr_shared(
        &self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };

        let mut record = inode.cached_record.write().unwrap();
        if let Some(m) = mode {
            record.permissions = m as u16;
        }
        if let Some(u) = uid {
            record.owner = u;
        }
        if let Some(g) = gid {
            record.group = g;
        }
        if let Some(new_size) = size {
            let mut kind = inode.kind.write().unwrap();
            if let InodeKind::File(accessor) = &mut *kind {
                accessor.truncate(new_size);
                record.size = new_size;
            }
        }
        record.modification_time = Self::now();
        record.content_time = Self::now();
        let attr = self.to_file_attr(&inode, &record);
        drop(record);
        self.mark_dirty_chain(&inode);
        reply.attr(&TTL, &attr);
    }

    fn readlink_shared(&self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.get_inode(ino) {
            Ok(inode) => match &*inode.kind.read().unwrap() {
                InodeKind::Symlink(target) => reply.data(target.as_bytes()),
                _ => reply.error(libc::EINVAL),
            },
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn mknod_shared(
        &self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        self.create_child(req, parent, name, ObjectType::SmallFile, mode as u16, None, reply_as_entry(reply));
    }

    fn mkdir_shared(
        &self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        self.create_child(req, parent, name, ObjectType::Directory, mode as u16, None, reply_as_entry(reply));
    }

    fn symlink_shared(
        &self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let payload = target.to_string_lossy().into_owned().into_bytes();
        self.create_child(req, parent, name, ObjectType::Symlink, 0o777, Some(payload), reply_as_entry(reply));
    }

    fn unlink_shared(&self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.unlink_impl(req.uid(), req.gid(), parent, name, false) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn rmdir_shared(&self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.unlink_impl(req.uid(), req.gid(), parent, name, true) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn rename_shared(
        &self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        if self.is_null_workspace() {
            reply.error(libc::EPERM);
            return;
        }

        let result = if parent == newparent {
            self.with_directory(parent, |_inode, table| {
                table.rename_child(name, newname, &self.hardlinks)
            })
            .map(|_| ())
        } else {
            // Neither `with_directory` call below holds its directory's
            // lock across the other, so there is no ordering hazard between
            // `parent` and `newparent` to arrange here -- just take the
            // record out of the source and install it in the destination.
            let record = match self.with_directory(parent, |_inode, table| {
                table
                    .delete_child(name, &self.hardlinks)
                    .map(|(record, _reparented)| record)
                    .ok_or_else(|| QfsError::not_found(name))
            }) {
                Ok(r) => r,
                Err(err) => {
                    reply.error(libc::c_int::from(&err));
                    return;
                }
            };
            let mut moved = record;
            moved.filename = newname.to_string();
            self.with_directory(newparent, |parent_inode, table| {
                if table.record_by_name(newname).is_some() {
                    table.delete_child(newname, &self.hardlinks);
                }
                let id = self.ensure_child_inode(parent_inode, table, &moved);
                if let Some(child) = self.registry.get(id) {
                    *child.parent.write().unwrap() = ParentPointer::Directory(parent_inode.id);
                    *child.name.write().unwrap() = newname.to_string();
                }
                Ok(())
            })
        };

        match result {
            Ok(()) => {
                if let Ok(inode) = self.get_inode(parent) {
                    self.mark_dirty_chain(&inode);
                }
                if let Ok(inode) = self.get_inode(newparent) {
                    self.mark_dirty_chain(&inode);
                }
                reply.ok();
            }
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn link_shared(&self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let Some(newname) = newname.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        if self.is_null_workspace() {
            reply.error(libc::EPERM);
            return;
        }

        let source = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };
        if source.is_orphan() {
            reply.error(libc::EPERM);
            return;
        }

        let mut record = source.cached_record.write().unwrap().clone();
        let (is_link, file_id) = self.hardlinks.check_hardlink(source.id);
        let now = Self::now();
        let leg = if is_link {
            let file_id = file_id.unwrap();
            self.hardlinks.inc(file_id);
            let mut leg = record.clone();
            leg.filename = newname.to_string();
            leg
        } else {
            record.filename = newname.to_string();
            self.hardlinks.new_hardlink(source.id, record.clone(), now)
        };
        *source.cached_record.write().unwrap() = {
            let mut r = record.clone();
            r.object_type = ObjectType::Hardlink;
            r
        };

        let result = self.with_directory(newparent, |parent_inode, table| {
            if table.record_by_name(newname).is_some() {
                return Err(QfsError::exists(newname));
            }
            table.load_child(leg.clone(), source.id);
            self.hardlinks.bind_inode(leg.file_id, source.id);
            let _ = parent_inode;
            Ok(())
        });

        match result {
            Ok(()) => {
                source.increment_lookup();
                self.mark_dirty_chain(&source);
                if let Ok(newparent_inode) = self.get_inode(newparent) {
                    self.mark_dirty_chain(&newparent_inode);
                }
                let attr = self.to_file_attr(&source, &leg);
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn open_shared(&self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.get_inode(ino) {
            Ok(inode) => {
                inode.increment_open_handles();
                let fh = self.handles.next();
                self.file_handles.insert(fh, FileHandleState { inode_id: inode.id });
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn create_shared(
        &self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name_str) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.create_child_impl(req.uid(), req.gid(), parent, name_str, ObjectType::SmallFile, mode as u16, None) {
            Ok((inode, record)) => {
                inode.increment_lookup();
                inode.increment_open_handles();
                let fh = self.handles.next();
                self.file_handles.insert(fh, FileHandleState { inode_id: inode.id });
                let attr = self.to_file_attr(&inode, &record);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn read_shared(
        &self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.get_inode(ino) {
            Ok(inode) => match &*inode.kind.read().unwrap() {
                InodeKind::File(accessor) => {
                    let mut buf = vec![0u8; size as usize];
                    let n = accessor.read(offset.max(0) as u64, &mut buf);
                    buf.truncate(n);
                    reply.data(&buf);
                }
                InodeKind::Api(pending) => {
                    let pending = pending.lock().unwrap();
                    let start = (offset.max(0) as usize).min(pending.len());
                    let end = (start + size as usize).min(pending.len());
                    reply.data(&pending[start..end]);
                }
                _ => reply.error(libc::EISDIR),
            },
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn write_shared(
        &self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };

        if ino == InodeId::API.get() {
            let handler = self.api_handler.lock().unwrap().clone();
            let response = match handler {
                Some(handler) => {
                    let request = data.to_vec();
                    self.rt_handle.block_on(handler.handle(&request))
                }
                None => br#"{"error":"api handler not configured"}"#.to_vec(),
            };
            if let InodeKind::Api(pending) = &*inode.kind.read().unwrap() {
                *pending.lock().unwrap() = response;
            }
            reply.written(data.len() as u32);
            return;
        }

        let limits = self.limits;
        let mut kind = inode.kind.write().unwrap();
        let n = match &mut *kind {
            InodeKind::File(accessor) => accessor.write(limits, offset.max(0) as u64, data),
            _ => {
                reply.error(libc::EISDIR);
                return;
            }
        };
        let new_len = match &*kind {
            InodeKind::File(accessor) => accessor.file_length(),
            _ => unreachable!(),
        };
        drop(kind);
        {
            let mut record = inode.cached_record.write().unwrap();
            record.size = new_len;
            record.modification_time = Self::now();
            record.content_time = Self::now();
        }
        self.mark_dirty_chain(&inode);
        reply.written(n as u32);
    }

    fn flush_shared(&self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release_shared(
        &self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some((_, state)) = self.file_handles.remove(&fh) {
            debug_assert_eq!(state.inode_id, InodeId::new(ino));
        }
        if let Some(inode) = self.registry.get(InodeId::new(ino)) {
            inode.decrement_open_handles();
            if ino == InodeId::API.get() {
                if let InodeKind::Api(pending) = &*inode.kind.read().unwrap() {
                    pending.lock().unwrap().clear();
                }
            }
            if inode.is_expired() {
                self.registry.drop_inode(inode.id);
            }
        }
        reply.ok();
    }

    fn fsync_shared(&self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir_shared(&self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.get_inode(ino) {
            Ok(inode) => {
                inode.increment_open_handles();
                let fh = self.handles.next();
                let records = match &*inode.kind.read().unwrap() {
                    InodeKind::Directory(table) => table.publishable_records(),
                    _ => Vec::new(),
                };
                self.dir_handles.insert(fh, records);
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    /// Lists `.`, `..`, then every live child record, all resolved against
    /// the stable snapshot captured at `opendir` time so that concurrent
    /// mutation mid-listing cannot shift entries out from under the
    /// kernel's offset-based paging.
    fn readdir_shared(&self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };
        let Some(snapshot) = self.dir_handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let parent_id = match *inode.parent.read().unwrap() {
            ParentPointer::Directory(id) => id,
            ParentPointer::Orphan => inode.id,
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (inode.id.get(), FileType::Directory, ".".to_string()),
            (parent_id.get(), FileType::Directory, "..".to_string()),
        ];
        for record in snapshot.iter() {
            let kind = record.object_type.to_fuser_file_type();
            entries.push((0, kind, record.filename.clone()));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    /// Same snapshot-at-`opendir`-time listing as `readdir_shared`, but each
    /// live child also gets a resolved inode id and a full `FileAttr`. Per
    /// readdirplus's contract the kernel treats every non-`.`/`..` entry it
    /// actually receives as if it had called `lookup` on it, so each one
    /// bumps the child's lookup count the same way `lookup_shared` does.
    fn readdirplus_shared(&self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectoryPlus) {
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };
        let Some(snapshot) = self.dir_handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let parent_id = match *inode.parent.read().unwrap() {
            ParentPointer::Directory(id) => id,
            ParentPointer::Orphan => inode.id,
        };
        let dot_attr = self.to_file_attr(&inode, &inode.cached_record.read().unwrap().clone());
        let dotdot_attr = match self.registry.get(parent_id) {
            Some(parent) => {
                let record = parent.cached_record.read().unwrap().clone();
                self.to_file_attr(&parent, &record)
            }
            None => dot_attr,
        };

        let resolved = self.with_directory(ino, |parent_inode, table| {
            let mut out = Vec::new();
            for record in snapshot.iter() {
                let id = self.ensure_child_inode(parent_inode, table, record);
                out.push((id, record.clone()));
            }
            Ok(out)
        });
        drop(snapshot);
        let resolved: Vec<(InodeId, DirectoryRecord)> = match resolved {
            Ok(r) => r,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String, FileAttr, Option<InodeId>)> = vec![
            (inode.id.get(), FileType::Directory, ".".to_string(), dot_attr, None),
            (parent_id.get(), FileType::Directory, "..".to_string(), dotdot_attr, None),
        ];
        for (id, record) in resolved {
            if let Some(child) = self.registry.get(id) {
                let kind = record.object_type.to_fuser_file_type();
                let attr = self.to_file_attr(&child, &record);
                entries.push((id.get(), kind, record.filename.clone(), attr, Some(id)));
            }
        }

        for (i, (entry_ino, _kind, name, attr, maybe_id)) in
            entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, &name, &TTL, &attr, 0) {
                break;
            }
            if let Some(id) = maybe_id {
                if let Some(child) = self.registry.get(id) {
                    child.increment_lookup();
                }
            }
        }
        reply.ok();
    }

    fn releasedir_shared(&self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.remove(&fh);
        if let Some(inode) = self.registry.get(InodeId::new(ino)) {
            inode.decrement_open_handles();
            if inode.is_expired() {
                self.registry.drop_inode(inode.id);
            }
        }
        reply.ok();
    }

    fn statfs_shared(&self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(
            u64::MAX,
            u64::MAX,
            u64::MAX,
            self.registry.len() as u64,
            u64::MAX,
            self.limits.max_block_size,
            NAME_MAX as u32,
            self.limits.max_block_size,
        );
    }

    fn access_shared(&self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn getxattr_shared(&self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };
        let record = inode.cached_record.read().unwrap().clone();
        let attrs_key = self.resolve_attrs_key(&record);
        let store = Arc::clone(&self.store);
        let codec = Arc::clone(&self.codec);
        let result = self.rt_handle.block_on(xattr::get(
            name,
            attrs_key,
            record.key,
            record.object_type,
            record.size,
            store.as_ref(),
            codec.as_ref(),
        ));
        match result {
            Ok(Some(value)) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() as u32 > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Ok(None) => reply.error(libc::ENODATA),
            Err(err) => reply.error(QfsError::Backend(err).into()),
        }
    }

    fn listxattr_shared(&self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };
        let record = inode.cached_record.read().unwrap().clone();
        let attrs_key = self.resolve_attrs_key(&record);
        let store = Arc::clone(&self.store);
        let codec = Arc::clone(&self.codec);
        match self.rt_handle.block_on(xattr::list(attrs_key, store.as_ref(), codec.as_ref())) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32);
                } else if buf.len() as u32 > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&buf);
                }
            }
            Err(err) => reply.error(QfsError::Backend(err).into()),
        }
    }

    fn setxattr_shared(
        &self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };
        let attrs_key = {
            let record = inode.cached_record.read().unwrap();
            self.resolve_attrs_key(&record)
        };
        let store = Arc::clone(&self.store);
        let codec = Arc::clone(&self.codec);
        let result = self
            .rt_handle
            .block_on(xattr::set(name, value.to_vec(), attrs_key, store.as_ref(), codec.as_ref()));
        match result {
            Ok(new_key) => {
                inode.cached_record.write().unwrap().extended_attributes = new_key;
                self.mark_dirty_chain(&inode);
                reply.ok();
            }
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }

    fn removexattr_shared(&self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let inode = match self.get_inode(ino) {
            Ok(i) => i,
            Err(err) => {
                reply.error(libc::c_int::from(&err));
                return;
            }
        };
        let attrs_key = {
            let record = inode.cached_record.read().unwrap();
            self.resolve_attrs_key(&record)
        };
        let store = Arc::clone(&self.store);
        let codec = Arc::clone(&self.codec);
        let result = self.rt_handle.block_on(xattr::remove(name, attrs_key, store.as_ref(), codec.as_ref()));
        match result {
            Ok(new_key) => {
                inode.cached_record.write().unwrap().extended_attributes = new_key;
                self.mark_dirty_chain(&inode);
                reply.ok();
            }
            Err(err) => reply.error(libc::c_int::from(&err)),
        }
    }
}

impl Filesystem for QuantumFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        self.lookup_shared(_req, parent, name, reply)
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.forget_shared(_req, ino, nlookup)
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.getattr_shared(_req, ino, _fh, reply)
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.setattr_shared(_req, ino, mode, uid, gid, size, _atime, _mtime, _ctime, _fh, _crtime, _chgtime, _bkuptime, _flags, reply)
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.readlink_shared(_req, ino, reply)
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        self.mknod_shared(req, parent, name, mode, _umask, _rdev, reply)
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        self.mkdir_shared(req, parent, name, mode, _umask, reply)
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        self.symlink_shared(req, parent, name, target, reply)
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.unlink_shared(req, parent, name, reply)
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.rmdir_shared(req, parent, name, reply)
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        self.rename_shared(_req, parent, name, newparent, newname, _flags, reply)
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        self.link_shared(_req, ino, newparent, newname, reply)
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.open_shared(_req, ino, _flags, reply)
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        self.create_shared(req, parent, name, mode, _umask, _flags, reply)
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.read_shared(_req, ino, _fh, offset, size, _flags, _lock_owner, reply)
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        self.write_shared(_req, ino, _fh, offset, data, _write_flags, _flags, _lock_owner, reply)
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.flush_shared(_req, _ino, _fh, _lock_owner, reply)
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.release_shared(_req, ino, fh, _flags, _lock_owner, _flush, reply)
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.fsync_shared(_req, _ino, _fh, _datasync, reply)
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.opendir_shared(_req, ino, _flags, reply)
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, reply: ReplyDirectory) {
        self.readdir_shared(_req, ino, fh, offset, reply)
    }

    fn readdirplus(&mut self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, reply: ReplyDirectoryPlus) {
        self.readdirplus_shared(_req, ino, fh, offset, reply)
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.releasedir_shared(_req, ino, fh, _flags, reply)
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.statfs_shared(_req, _ino, reply)
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        self.access_shared(_req, _ino, _mask, reply)
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        self.getxattr_shared(_req, ino, name, size, reply)
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        self.listxattr_shared(_req, ino, size, reply)
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        self.setxattr_shared(_req, ino, name, value, _flags, _position, reply)
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        self.removexattr_shared(_req, ino, name, reply)
    }
}

/// Lets the mount daemon hand the kernel session an `Arc<QuantumFs>` while
/// a background flusher task holds its own clone of the same `Arc`: every
/// method here just derefs through to the `_shared` body above.
///
/// `fuser::Filesystem` can't be implemented directly on `Arc<QuantumFs>`
/// (orphan rules forbid implementing a foreign trait on a foreign type),
/// so this newtype wraps it.
pub struct SharedQuantumFs(pub Arc<QuantumFs>);

impl From<Arc<QuantumFs>> for SharedQuantumFs {
    fn from(fs: Arc<QuantumFs>) -> Self {
        SharedQuantumFs(fs)
    }
}

impl std::ops::Deref for SharedQuantumFs {
    type Target = QuantumFs;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Filesystem for SharedQuantumFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        self.lookup_shared(_req, parent, name, reply)
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.forget_shared(_req, ino, nlookup)
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.getattr_shared(_req, ino, _fh, reply)
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.setattr_shared(_req, ino, mode, uid, gid, size, _atime, _mtime, _ctime, _fh, _crtime, _chgtime, _bkuptime, _flags, reply)
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.readlink_shared(_req, ino, reply)
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        self.mknod_shared(req, parent, name, mode, _umask, _rdev, reply)
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        self.mkdir_shared(req, parent, name, mode, _umask, reply)
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        self.symlink_shared(req, parent, name, target, reply)
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.unlink_shared(req, parent, name, reply)
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.rmdir_shared(req, parent, name, reply)
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        self.rename_shared(_req, parent, name, newparent, newname, _flags, reply)
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        self.link_shared(_req, ino, newparent, newname, reply)
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.open_shared(_req, ino, _flags, reply)
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        self.create_shared(req, parent, name, mode, _umask, _flags, reply)
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.read_shared(_req, ino, _fh, offset, size, _flags, _lock_owner, reply)
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        self.write_shared(_req, ino, _fh, offset, data, _write_flags, _flags, _lock_owner, reply)
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.flush_shared(_req, _ino, _fh, _lock_owner, reply)
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.release_shared(_req, ino, fh, _flags, _lock_owner, _flush, reply)
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.fsync_shared(_req, _ino, _fh, _datasync, reply)
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.opendir_shared(_req, ino, _flags, reply)
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, reply: ReplyDirectory) {
        self.readdir_shared(_req, ino, fh, offset, reply)
    }

    fn readdirplus(&mut self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, reply: ReplyDirectoryPlus) {
        self.readdirplus_shared(_req, ino, fh, offset, reply)
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.releasedir_shared(_req, ino, fh, _flags, reply)
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.statfs_shared(_req, _ino, reply)
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        self.access_shared(_req, _ino, _mask, reply)
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        self.getxattr_shared(_req, ino, name, size, reply)
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        self.listxattr_shared(_req, ino, size, reply)
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        self.setxattr_shared(_req, ino, name, value, _flags, _position, reply)
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        self.removexattr_shared(_req, ino, name, reply)
    }
}

/// Adapts `ReplyEntry`'s API behind a closure boundary so `create_child`
/// can be shared by `mknod`/`mkdir`/`symlink`, each of which only differs
/// in the object type and embedded payload they pass in.
fn reply_as_entry(reply: ReplyEntry) -> impl FnOnce(Result<(FileAttr, u64), QfsError>) {
    move |result| match result {
        Ok((attr, generation)) => reply.entry(&TTL, &attr, generation),
        Err(err) => reply.error(libc::c_int::from(&err)),
    }
}

impl QuantumFs {
    fn create_child(
        &self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        object_type: ObjectType,
        mode: u16,
        embedded_payload: Option<Vec<u8>>,
        on_result: impl FnOnce(Result<(FileAttr, u64), QfsError>),
    ) {
        let Some(name) = name.to_str() else {
            on_result(Err(QfsError::Internal("invalid UTF-8 in name".into())));
            return;
        };
        match self.create_child_impl(req.uid(), req.gid(), parent, name, object_type, mode, embedded_payload) {
            Ok((inode, record)) => {
                inode.increment_lookup();
                let attr = self.to_file_attr(&inode, &record);
                on_result(Ok((attr, 0)));
            }
            Err(err) => on_result(Err(err)),
        }
    }

    /// Creates `name` under `parent` with `object_type`. Exposed publicly
    /// (beyond the FUSE trait's own `create`/`mknod`/`mkdir`/`symlink`
    /// call sites) so that an external inode-insertion request -- the
    /// `/api` protocol's `insert-inode` command -- can splice a node in
    /// without fabricating a `fuser::Request`.
    pub fn create_child_impl(
        &self,
        uid: u32,
        gid: u32,
        parent: u64,
        name: &str,
        object_type: ObjectType,
        mode: u16,
        embedded_payload: Option<Vec<u8>>,
    ) -> Result<(Arc<Inode>, DirectoryRecord), QfsError> {
        if name.len() > NAME_MAX {
            return Err(QfsError::OutOfRange(format!("name {name} exceeds NAME_MAX")));
        }
        if self.is_null_workspace() {
            warn!(parent, name, "refused mutation of the null workspace");
            return Err(QfsError::permission("the null workspace is immutable"));
        }

        let key = embedded_payload
            .as_deref()
            .map(ObjectKey::embedded)
            .unwrap_or_else(ObjectKey::empty_block);

        let parent_inode = self.get_inode(parent)?;
        let groups = self.caller_groups();
        let (id, record) = {
            let mut kind = parent_inode.kind.write().unwrap();
            let table = match &mut *kind {
                InodeKind::Directory(t) => t,
                _ => return Err(QfsError::NotDir(format!("inode {parent}"))),
            };
            if table.record_by_name(name).is_some() {
                return Err(QfsError::exists(name));
            }
            let parent_record = parent_inode.cached_record.read().unwrap();
            check_write_permission(&parent_record, true, parent == InodeId::ROOT.get(), uid, gid, &groups)?;
            drop(parent_record);

            let mut record = DirectoryRecord::new(name.to_string(), FileId::generate(), object_type, key);
            record.permissions = mode;
            record.owner = uid;
            record.group = gid;
            record.modification_time = Self::now();
            record.content_time = Self::now();

            let id = self.registry.allocate_id();
            let child_kind = match object_type {
                ObjectType::Directory => InodeKind::Directory(ChildTable::empty()),
                ObjectType::Symlink => InodeKind::Symlink(
                    embedded_payload
                        .as_ref()
                        .map(|p| String::from_utf8_lossy(p).into_owned())
                        .unwrap_or_default(),
                ),
                _ => InodeKind::File(FileAccessor::empty(self.limits)),
            };
            self.registry.insert(Inode::new(id, ParentPointer::Directory(parent_inode.id), name.to_string(), child_kind, record.clone()));
            table.load_child(record.clone(), id);
            (id, record)
        };
        let inode = self.registry.get(id).expect("just inserted");
        self.mark_dirty_chain(&inode);
        Ok((inode, record))
    }

    pub fn unlink_impl(&self, uid: u32, gid: u32, parent: u64, name: &OsStr, expect_dir: bool) -> Result<(), QfsError> {
        let Some(name) = name.to_str() else {
            return Err(QfsError::Internal("invalid UTF-8 in name".into()));
        };
        if self.is_null_workspace() {
            return Err(QfsError::permission("the null workspace is immutable"));
        }

        let parent_inode = self.get_inode(parent)?;
        let groups = self.caller_groups();
        let (record, reparented, child_inode_id) = {
            let mut kind = parent_inode.kind.write().unwrap();
            let table = match &mut *kind {
                InodeKind::Directory(t) => t,
                _ => return Err(QfsError::NotDir(format!("inode {parent}"))),
            };
            let record = table
                .record_by_name(name)
                .cloned()
                .ok_or_else(|| QfsError::not_found(name))?;
            if expect_dir && record.object_type != ObjectType::Directory {
                return Err(QfsError::NotDir(name.to_string()));
            }
            if !expect_dir && record.object_type == ObjectType::Directory {
                return Err(QfsError::IsDir(name.to_string()));
            }
            let child_inode_id = table.inode_of(name);
            if expect_dir {
                if let Some(id) = child_inode_id {
                    if let Some(child) = self.registry.get(id) {
                        if let InodeKind::Directory(child_table) = &*child.kind.read().unwrap() {
                            if !child_table.is_empty() {
                                return Err(QfsError::NotEmpty(name.to_string()));
                            }
                        }
                    }
                }
            }

            let parent_record = parent_inode.cached_record.read().unwrap();
            check_write_permission(&parent_record, true, parent == InodeId::ROOT.get(), uid, gid, &groups)?;
            check_sticky_unlink(&parent_record, &record, uid)?;
            drop(parent_record);

            let (record, reparented) = table
                .delete_child(name, &self.hardlinks)
                .ok_or_else(|| QfsError::not_found(name))?;
            (record, reparented, child_inode_id)
        };

        let _ = reparented;
        if let Some(id) = child_inode_id {
            if let Some(child) = self.registry.get(id) {
                if child.open_handles() > 0 {
                    *child.parent.write().unwrap() = ParentPointer::Orphan;
                    *child.cached_record.write().unwrap() = record;
                } else {
                    self.registry.drop_inode(id);
                }
            }
        }
        self.mark_dirty_chain(&parent_inode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::codec::JsonCodec;
    use quantumfs_core::domain::newtypes::{NamespaceName, TypespaceName, WorkspaceName};
    use quantumfs_store::{InMemoryDataStore, InMemoryWorkspaceDB};

    fn test_limits() -> BlockLimits {
        BlockLimits {
            max_block_size: 64,
            max_blocks_medium_file: 4,
            max_blocks_large_file: 16,
        }
    }

    /// Builds a fresh, empty workspace ready for FUSE calls, mirroring the
    /// teacher's own `create_test_setup` helper.
    fn create_test_setup() -> QuantumFs {
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
        let rt = tokio::runtime::Runtime::new().unwrap();
        QuantumFs::new(rt.handle().clone(), store, workspace_db, codec, test_limits(), identity, 1000, 1000)
            .unwrap()
    }

    const UID: u32 = 1000;
    const GID: u32 = 1000;

    #[test]
    fn mkdir_then_lookup_round_trips() {
        let fs = create_test_setup();
        let (inode, record) = fs
            .create_child_impl(UID, GID, InodeId::ROOT.get(), "sub", ObjectType::Directory, 0o755, None)
            .unwrap();
        assert_eq!(record.filename, "sub");
        assert!(matches!(&*inode.kind.read().unwrap(), InodeKind::Directory(_)));

        let looked_up = fs.with_directory(InodeId::ROOT.get(), |_parent, table| {
            table.record_by_name("sub").cloned().ok_or_else(|| QfsError::not_found("sub"))
        });
        assert!(looked_up.is_ok());
    }

    #[test]
    fn create_write_read_round_trips_content() {
        let fs = create_test_setup();
        let (inode, _record) = fs
            .create_child_impl(UID, GID, InodeId::ROOT.get(), "a.txt", ObjectType::SmallFile, 0o644, None)
            .unwrap();
        let ino = inode.id.get();

        {
            let limits = fs.limits;
            let loaded = fs.get_inode(ino).unwrap();
            let mut kind = loaded.kind.write().unwrap();
            if let InodeKind::File(accessor) = &mut *kind {
                accessor.write(limits, 0, b"hello world");
            }
        }

        let loaded = fs.get_inode(ino).unwrap();
        let kind = loaded.kind.read().unwrap();
        let InodeKind::File(accessor) = &*kind else {
            panic!("expected a file");
        };
        let mut buf = vec![0u8; 11];
        let n = accessor.read(0, &mut buf);
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn rename_within_same_directory_updates_name() {
        let fs = create_test_setup();
        fs.create_child_impl(UID, GID, InodeId::ROOT.get(), "old.txt", ObjectType::SmallFile, 0o644, None)
            .unwrap();

        let hardlinks = fs_hardlinks_ref(&fs);
        let result = fs.with_directory(InodeId::ROOT.get(), |_parent, table| {
            table.rename_child("old.txt", "new.txt", hardlinks)
        });
        assert!(result.is_ok());

        let has_new = fs
            .with_directory(InodeId::ROOT.get(), |_parent, table| Ok(table.record_by_name("new.txt").is_some()))
            .unwrap();
        let has_old = fs
            .with_directory(InodeId::ROOT.get(), |_parent, table| Ok(table.record_by_name("old.txt").is_some()))
            .unwrap();
        assert!(has_new);
        assert!(!has_old);
    }

    #[test]
    fn rmdir_on_non_empty_directory_fails() {
        let fs = create_test_setup();
        let (dir_inode, _) = fs
            .create_child_impl(UID, GID, InodeId::ROOT.get(), "d", ObjectType::Directory, 0o755, None)
            .unwrap();
        fs.create_child_impl(UID, GID, dir_inode.id.get(), "f", ObjectType::SmallFile, 0o644, None)
            .unwrap();

        let err = fs
            .unlink_impl(UID, GID, InodeId::ROOT.get(), OsStr::new("d"), true)
            .unwrap_err();
        assert!(matches!(err, QfsError::NotEmpty(_)));
    }

    #[test]
    fn unlink_removes_entry_from_parent() {
        let fs = create_test_setup();
        fs.create_child_impl(UID, GID, InodeId::ROOT.get(), "f", ObjectType::SmallFile, 0o644, None)
            .unwrap();
        fs.unlink_impl(UID, GID, InodeId::ROOT.get(), OsStr::new("f"), false)
            .unwrap();

        let result = fs.with_directory(InodeId::ROOT.get(), |_parent, table| {
            Ok(table.record_by_name("f").is_none())
        });
        assert!(matches!(result, Ok(true)));
    }

    #[test]
    fn setattr_truncate_shrinks_size() {
        let fs = create_test_setup();
        let (inode, _) = fs
            .create_child_impl(UID, GID, InodeId::ROOT.get(), "a.txt", ObjectType::SmallFile, 0o644, None)
            .unwrap();
        let ino = inode.id.get();
        {
            let limits = fs.limits;
            let loaded = fs.get_inode(ino).unwrap();
            let mut kind = loaded.kind.write().unwrap();
            if let InodeKind::File(accessor) = &mut *kind {
                accessor.write(limits, 0, b"hello world");
            }
        }

        let loaded = fs.get_inode(ino).unwrap();
        {
            let mut kind = loaded.kind.write().unwrap();
            if let InodeKind::File(accessor) = &mut *kind {
                accessor.truncate(5);
            }
        }
        let kind = loaded.kind.read().unwrap();
        let InodeKind::File(accessor) = &*kind else {
            panic!("expected a file");
        };
        assert_eq!(accessor.file_length(), 5);
    }

    #[test]
    fn is_null_workspace_detects_reserved_identity() {
        let mut fs = create_test_setup();
        assert!(!fs.is_null_workspace());
        fs.identity = WorkspaceIdentity {
            typespace: TypespaceName::new("_null").unwrap(),
            namespace: NamespaceName::new("null").unwrap(),
            workspace: WorkspaceName::new("null").unwrap(),
        };
        assert!(fs.is_null_workspace());
    }

    fn fs_hardlinks_ref(fs: &QuantumFs) -> &HardlinkTable {
        &fs.hardlinks
    }
}
