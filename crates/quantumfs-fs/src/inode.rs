//! The process-wide inode registry: id allocation with a reuse delay,
//! id-to-inode mapping, lookup-count accounting, and orphan handling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use quantumfs_core::domain::directory_record::DirectoryRecord;
use quantumfs_core::domain::newtypes::InodeId;

use crate::block::FileAccessor;
use crate::directory::ChildTable;

/// Where an inode's parent-directory pointer leads: a live directory, or
/// the "orphan" sentinel for a file unlinked while a handle was still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentPointer {
    Directory(InodeId),
    Orphan,
}

/// The subtype-specific state a tagged-union inode carries. Directories own
/// a [`ChildTable`]; files own a [`FileAccessor`]; symlinks and special
/// files carry their (small, embeddable) payload directly; listings are
/// synthetic read-only directories generated on demand (typespace,
/// namespace, or workspace level) rather than backed by a child table. `Api`
/// is the single synthetic control file at a reserved inode id: a write
/// dispatches a request to the injected handler immediately, and the
/// response sits in the buffer for the next read.
#[derive(Debug)]
pub enum InodeKind {
    Directory(ChildTable),
    File(FileAccessor),
    Symlink(String),
    Special { major: u32, minor: u32 },
    Listing(ListingKind),
    Api(Mutex<Vec<u8>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
    Typespaces,
    Namespaces,
    Workspaces,
}

/// One live inode. Mutated under its own lock; reachable only through the
/// registry (and, while open, through the file-handle table).
pub struct Inode {
    pub id: InodeId,
    pub parent: RwLock<ParentPointer>,
    pub name: RwLock<String>,
    pub kind: RwLock<InodeKind>,
    /// A cached copy of this inode's own directory record, kept current on
    /// every metadata mutation. Used to answer `getattr` while orphaned,
    /// when no parent directory holds the authoritative record any more.
    pub cached_record: RwLock<DirectoryRecord>,
    pub dirty: std::sync::atomic::AtomicBool,
    lookup_count: AtomicU64,
    open_handles: AtomicU64,
}

impl Inode {
    pub fn new(id: InodeId, parent: ParentPointer, name: String, kind: InodeKind, record: DirectoryRecord) -> Self {
        Inode {
            id,
            parent: RwLock::new(parent),
            name: RwLock::new(name),
            kind: RwLock::new(kind),
            cached_record: RwLock::new(record),
            dirty: std::sync::atomic::AtomicBool::new(false),
            lookup_count: AtomicU64::new(0),
            open_handles: AtomicU64::new(0),
        }
    }

    pub fn increment_lookup(&self) {
        self.lookup_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the lookup count by `n` (the FUSE `forget(nlookup)`
    /// contract) and returns the count afterward.
    pub fn forget(&self, n: u64) -> u64 {
        let prev = self.lookup_count.fetch_sub(n.min(self.lookup_count.load(Ordering::SeqCst)), Ordering::SeqCst);
        prev.saturating_sub(n)
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::SeqCst)
    }

    pub fn increment_open_handles(&self) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_open_handles(&self) -> u64 {
        self.open_handles.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn open_handles(&self) -> u64 {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// True once both the kernel lookup count and the open-handle count
    /// have drained to zero -- the inode is then eligible to be dropped
    /// from the registry and its id returned to the allocator.
    pub fn is_expired(&self) -> bool {
        self.lookup_count() == 0 && self.open_handles() == 0
    }

    pub fn is_orphan(&self) -> bool {
        matches!(*self.parent.read().unwrap(), ParentPointer::Orphan)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("name", &*self.name.read().unwrap())
            .field("lookup_count", &self.lookup_count())
            .field("open_handles", &self.open_handles())
            .finish()
    }
}

/// Rolling high-water-mark allocator with delayed id reuse: a released id
/// is not handed back out until `reuse_delay` has elapsed, long enough to
/// outlast any kernel-side dentry cache referring to it.
pub struct InodeIdAllocator {
    high_water_mark: AtomicU64,
    released: std::sync::Mutex<VecDeque<(InodeId, Instant)>>,
    reuse_delay: Duration,
    reserved_end: u64,
}

impl InodeIdAllocator {
    pub fn new(reuse_delay: Duration, reserved_end: u64) -> Self {
        InodeIdAllocator {
            high_water_mark: AtomicU64::new(reserved_end),
            released: std::sync::Mutex::new(VecDeque::new()),
            reuse_delay,
            reserved_end,
        }
    }

    /// (a) drops ids above the high-water mark that are already expired --
    /// an id released after the mark shrank past it is pure garbage, never
    /// worth reusing; (b) returns the oldest reusable id below the mark, if
    /// any; (c) else issues a fresh id and advances the mark.
    pub fn allocate(&self) -> InodeId {
        let now = Instant::now();
        let mark = self.high_water_mark.load(Ordering::SeqCst);
        let mut released = self.released.lock().unwrap();

        released.retain(|(id, _)| id.get() <= mark);

        if let Some(front) = released.front() {
            if front.1 <= now {
                let (id, _) = released.pop_front().unwrap();
                return id;
            }
        }
        drop(released);

        let next = self.high_water_mark.fetch_add(1, Ordering::SeqCst) + 1;
        InodeId::new(next)
    }

    pub fn release(&self, id: InodeId) {
        if id.is_reserved() {
            return;
        }
        let reusable_at = Instant::now() + self.reuse_delay;
        self.released.lock().unwrap().push_back((id, reusable_at));
    }

    /// Lowers the high-water mark by `shrink_fraction` (0.0-1.0) of the
    /// distance above `InodeIdReservedEnd`, run periodically to bound
    /// memory growth after a burst of short-lived inodes.
    pub fn gc(&self, shrink_fraction: f64) {
        let mark = self.high_water_mark.load(Ordering::SeqCst);
        if mark <= self.reserved_end {
            return;
        }
        let span = mark - self.reserved_end;
        let shrink = ((span as f64) * shrink_fraction) as u64;
        let new_mark = mark.saturating_sub(shrink).max(self.reserved_end);
        self.high_water_mark.store(new_mark, Ordering::SeqCst);
        self.released.lock().unwrap().retain(|(id, _)| id.get() <= new_mark);
    }

    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark.load(Ordering::SeqCst)
    }
}

/// The process-wide inode table: lock-free concurrent access from every
/// FUSE worker thread via `DashMap`, matching the kernel's expectation that
/// `lookup`/`getattr`/`forget` never contend with each other needlessly.
pub struct InodeRegistry {
    inodes: DashMap<u64, Arc<Inode>>,
    allocator: InodeIdAllocator,
}

impl InodeRegistry {
    pub fn new(reuse_delay: Duration, reserved_end: u64) -> Self {
        InodeRegistry {
            inodes: DashMap::new(),
            allocator: InodeIdAllocator::new(reuse_delay, reserved_end),
        }
    }

    pub fn allocate_id(&self) -> InodeId {
        self.allocator.allocate()
    }

    pub fn insert(&self, inode: Inode) -> Arc<Inode> {
        let arc = Arc::new(inode);
        self.inodes.insert(arc.id.get(), arc.clone());
        arc
    }

    pub fn get(&self, id: InodeId) -> Option<Arc<Inode>> {
        self.inodes.get(&id.get()).map(|r| Arc::clone(&r))
    }

    /// Removes the inode from the table and returns its id to the
    /// allocator. Called once `Inode::is_expired` holds.
    pub fn drop_inode(&self, id: InodeId) -> Option<Arc<Inode>> {
        let removed = self.inodes.remove(&id.get()).map(|(_, v)| v);
        if removed.is_some() {
            self.allocator.release(id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    pub fn gc(&self, shrink_fraction: f64) {
        self.allocator.gc(shrink_fraction);
    }

    /// A snapshot of every live inode, used by the flusher to find the
    /// current dirty set without holding the table locked for the whole
    /// walk.
    pub fn snapshot(&self) -> Vec<Arc<Inode>> {
        self.inodes.iter().map(|r| Arc::clone(r.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::directory_record::ObjectType;
    use quantumfs_core::domain::newtypes::FileId;
    use quantumfs_core::domain::object_key::ObjectKey;

    fn record() -> DirectoryRecord {
        DirectoryRecord::new(
            "f".into(),
            FileId::generate(),
            ObjectType::SmallFile,
            ObjectKey::empty_block(),
        )
    }

    fn test_inode(id: u64) -> Inode {
        Inode::new(
            InodeId::new(id),
            ParentPointer::Directory(InodeId::ROOT),
            "f".into(),
            InodeKind::File(FileAccessor::empty(crate::block::BlockLimits {
                max_block_size: 64,
                max_blocks_medium_file: 4,
                max_blocks_large_file: 16,
            })),
            record(),
        )
    }

    mod allocator {
        use super::*;

        #[test]
        fn fresh_allocations_increase_monotonically() {
            let a = InodeIdAllocator::new(Duration::from_secs(30), 16);
            let first = a.allocate();
            let second = a.allocate();
            assert!(second.get() > first.get());
        }

        #[test]
        fn released_id_is_not_reused_before_delay_elapses() {
            let a = InodeIdAllocator::new(Duration::from_secs(3600), 16);
            let id = a.allocate();
            a.release(id);
            let next = a.allocate();
            assert_ne!(next, id);
        }

        #[test]
        fn released_id_is_reused_after_delay_elapses() {
            let a = InodeIdAllocator::new(Duration::from_millis(0), 16);
            let id = a.allocate();
            a.release(id);
            std::thread::sleep(Duration::from_millis(5));
            let next = a.allocate();
            assert_eq!(next, id);
        }

        #[test]
        fn gc_shrinks_high_water_mark_toward_reserved_end() {
            let a = InodeIdAllocator::new(Duration::from_millis(0), 16);
            for _ in 0..100 {
                a.allocate();
            }
            let before = a.high_water_mark();
            a.gc(0.5);
            let after = a.high_water_mark();
            assert!(after < before);
            assert!(after >= 16);
        }

        #[test]
        fn reserved_ids_are_never_released() {
            let a = InodeIdAllocator::new(Duration::from_millis(0), 16);
            a.release(InodeId::ROOT);
            // Should not appear in the reuse queue at all.
            let next = a.allocate();
            assert_ne!(next, InodeId::ROOT);
        }
    }

    mod registry {
        use super::*;

        #[test]
        fn insert_then_get_round_trips() {
            let reg = InodeRegistry::new(Duration::from_secs(30), 16);
            let inode = test_inode(100);
            reg.insert(inode);
            let got = reg.get(InodeId::new(100)).expect("inode present");
            assert_eq!(got.id, InodeId::new(100));
        }

        #[test]
        fn drop_inode_returns_id_to_allocator() {
            let reg = InodeRegistry::new(Duration::from_millis(0), 16);
            let id = reg.allocate_id();
            reg.insert(Inode::new(
                id,
                ParentPointer::Directory(InodeId::ROOT),
                "f".into(),
                InodeKind::File(FileAccessor::empty(crate::block::BlockLimits {
                    max_block_size: 64,
                    max_blocks_medium_file: 4,
                    max_blocks_large_file: 16,
                })),
                record(),
            ));
            reg.drop_inode(id);
            assert!(reg.get(id).is_none());
            std::thread::sleep(Duration::from_millis(5));
            let reused = reg.allocate_id();
            assert_eq!(reused, id);
        }

        #[test]
        fn lookup_count_and_forget_track_expiry() {
            let inode = test_inode(1);
            inode.increment_lookup();
            inode.increment_lookup();
            assert!(!inode.is_expired());
            inode.forget(1);
            assert!(!inode.is_expired());
            inode.forget(1);
            assert!(inode.is_expired());
        }

        #[test]
        fn open_handles_also_gate_expiry() {
            let inode = test_inode(1);
            inode.increment_lookup();
            inode.forget(1);
            inode.increment_open_handles();
            assert!(!inode.is_expired());
            inode.decrement_open_handles();
            assert!(inode.is_expired());
        }

        #[test]
        fn orphaning_flips_parent_pointer() {
            let inode = test_inode(1);
            assert!(!inode.is_orphan());
            *inode.parent.write().unwrap() = ParentPointer::Orphan;
            assert!(inode.is_orphan());
        }
    }
}
