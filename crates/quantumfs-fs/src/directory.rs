//! The child table: name-to-inode-id and inode-id-to-record maps layered as
//! a mutable overlay on top of an immutable, possibly-chained published
//! directory-entry block, plus the permission-check and hardlink-promotion
//! logic used by directory inode operations.

use std::collections::HashMap;

use quantumfs_core::domain::codec::{Codec, DirectoryEntryView};
use quantumfs_core::domain::directory_record::{DirectoryRecord, ObjectType};
use quantumfs_core::domain::errors::QfsError;
use quantumfs_core::domain::newtypes::InodeId;
use quantumfs_core::domain::object_key::ObjectKey;
use quantumfs_core::ports::data_store::DataStore;

use crate::hardlink::HardlinkTable;

/// How many records a single published directory-entry block carries before
/// the chain continues into a `next` block: a small, config-overridable
/// page size rather than one unbounded block.
pub const MAX_DIRECTORY_RECORDS: usize = 512;

/// name -> inode-id and inode-id -> [record] over an immutable `base` chain,
/// with mutations held in an `overlay` keyed by name (`None` is a
/// tombstone). Iteration merges `overlay` over `base`, overlay wins.
#[derive(Debug, Default)]
pub struct ChildTable {
    base: Vec<DirectoryRecord>,
    overlay: HashMap<String, Option<DirectoryRecord>>,
    children: HashMap<String, InodeId>,
    records: HashMap<InodeId, Vec<DirectoryRecord>>,
}

impl ChildTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_base(base: Vec<DirectoryRecord>) -> Self {
        ChildTable {
            base,
            overlay: HashMap::new(),
            children: HashMap::new(),
            records: HashMap::new(),
        }
    }

    /// Walks a published directory-entry chain to reconstruct a `ChildTable`
    /// with no inode ids yet assigned -- names are known, but children are
    /// instantiated lazily on first `lookup`.
    pub async fn load(
        key: ObjectKey,
        store: &dyn DataStore,
        codec: &dyn Codec,
    ) -> anyhow::Result<Self> {
        let mut base = Vec::new();
        let mut next = Some(key);
        while let Some(k) = next {
            if k == ObjectKey::empty_block() {
                break;
            }
            let bytes = store.get(&k).await?;
            let view: DirectoryEntryView = codec
                .decode_directory_entries(&bytes)
                .map_err(|e| anyhow::anyhow!(e))?;
            base.extend(view.records);
            next = view.next;
        }
        Ok(Self::from_base(base))
    }

    /// `record_by_name` consults the overlay first, then the base.
    pub fn record_by_name(&self, name: &str) -> Option<&DirectoryRecord> {
        match self.overlay.get(name) {
            Some(Some(rec)) => Some(rec),
            Some(None) => None,
            None => self.base.iter().find(|r| r.filename == name),
        }
    }

    pub fn inode_of(&self, name: &str) -> Option<InodeId> {
        self.children.get(name).copied()
    }

    /// Assigns `inode_id` to `record`, registering it in the name and
    /// record maps. Multiple legs of the same hardlink may share an
    /// `inode_id`, hence `records` holding a `Vec`.
    pub fn load_child(&mut self, record: DirectoryRecord, inode_id: InodeId) {
        let name = record.filename.clone();
        self.children.insert(name.clone(), inode_id);
        self.records.entry(inode_id).or_default().push(record.clone());
        self.overlay.insert(name, Some(record));
    }

    /// Overwrites the single existing entry for `record.filename` in place,
    /// used after republishing a child's content to update its key without
    /// disturbing any other leg sharing `inode_id`.
    pub fn update_record(&mut self, inode_id: InodeId, record: DirectoryRecord) {
        let name = record.filename.clone();
        self.overlay.insert(name.clone(), Some(record.clone()));
        let entries = self.records.entry(inode_id).or_default();
        match entries.iter_mut().find(|r| r.filename == name) {
            Some(existing) => *existing = record,
            None => entries.push(record),
        }
    }

    /// Removes `name`. If the removed record was the last leg of a
    /// hardlink, decrements the hardlink table and, when that was the sole
    /// remaining leg, returns the now-plain record for re-parenting by the
    /// caller.
    pub fn delete_child(
        &mut self,
        name: &str,
        hardlinks: &HardlinkTable,
    ) -> Option<(DirectoryRecord, Option<(DirectoryRecord, Option<InodeId>)>)> {
        let record = self.record_by_name(name)?.clone();
        let inode_id = self.children.remove(name);
        self.overlay.insert(name.to_string(), None);
        if let Some(id) = inode_id {
            if let Some(v) = self.records.get_mut(&id) {
                v.retain(|r| r.filename != name);
                if v.is_empty() {
                    self.records.remove(&id);
                }
            }
        }

        let reparented = if record.object_type == ObjectType::Hardlink {
            if hardlinks.dec(record.file_id) {
                hardlinks.remove_hardlink(record.file_id)
            } else {
                None
            }
        } else {
            None
        };
        Some((record, reparented))
    }

    /// Atomically moves `old` to `new`. If `new` already exists its record
    /// is deleted first (its inode id is returned so the caller can
    /// schedule it for removal from the registry).
    pub fn rename_child(
        &mut self,
        old: &str,
        new: &str,
        hardlinks: &HardlinkTable,
    ) -> Result<(DirectoryRecord, Option<InodeId>), QfsError> {
        let mut record = self
            .record_by_name(old)
            .cloned()
            .ok_or_else(|| QfsError::not_found(old))?;

        let displaced = if self.record_by_name(new).is_some() {
            let displaced_inode = self.inode_of(new);
            self.delete_child(new, hardlinks);
            displaced_inode
        } else {
            None
        };

        let inode_id = self.children.remove(old);
        self.overlay.insert(old.to_string(), None);
        if let Some(id) = inode_id {
            if let Some(v) = self.records.get_mut(&id) {
                v.retain(|r| r.filename != old);
            }
        }

        record.filename = new.to_string();
        if record.object_type == ObjectType::Hardlink {
            record.modification_time = record.content_time;
        }
        if let Some(id) = inode_id {
            self.load_child(record.clone(), id);
        } else {
            self.overlay.insert(new.to_string(), Some(record.clone()));
        }

        Ok((record, displaced))
    }

    /// Promotes a regular-file (or symlink/special) `record` at `inode_id`
    /// into a hardlink leg, filing the original record away in `hardlinks`
    /// and installing the returned leg record in this table in its place.
    pub fn make_hardlink(
        &mut self,
        inode_id: InodeId,
        record: DirectoryRecord,
        hardlinks: &HardlinkTable,
        now: i64,
    ) -> DirectoryRecord {
        let leg = hardlinks.new_hardlink(inode_id, record, now);
        self.load_child(leg.clone(), inode_id);
        leg
    }

    /// Names currently live (base names with no tombstone, plus overlay
    /// adds), for `readdir` and the `rmdir`-on-non-empty check.
    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.base.iter().map(|r| r.filename.clone()).collect();
        names.retain(|n| !matches!(self.overlay.get(n), Some(None)));
        for (name, value) in &self.overlay {
            if value.is_some() && !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.live_names().is_empty()
    }

    /// The live records in deterministic (sorted-by-name) order, used both
    /// for `readdir` and when re-chunking the chain at publish time.
    pub fn publishable_records(&self) -> Vec<DirectoryRecord> {
        let mut names = self.live_names();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| self.record_by_name(&n).cloned())
            .collect()
    }

    /// Writes the current live record set as a chain of directory-entry
    /// blocks of at most `MAX_DIRECTORY_RECORDS` records each, returning the
    /// head key.
    pub async fn publish(
        &self,
        store: &dyn DataStore,
        codec: &dyn Codec,
    ) -> anyhow::Result<ObjectKey> {
        let records = self.publishable_records();
        if records.is_empty() {
            return Ok(ObjectKey::empty_block());
        }

        let mut next: Option<ObjectKey> = None;
        for chunk in records.rchunks(MAX_DIRECTORY_RECORDS) {
            let view = DirectoryEntryView {
                records: chunk.to_vec(),
                next,
            };
            let bytes = codec
                .encode_directory_entries(&view)
                .map_err(|e| anyhow::anyhow!(e))?;
            next = Some(store.set(&bytes).await?);
        }
        Ok(next.unwrap())
    }
}

/// Directory write access requires both the write and execute bits; for
/// other object types, write access alone suffices. `mode` is the relevant
/// rwx triplet already selected for the caller's relationship to the
/// record (owner/group/other).
fn has_write_access(is_dir: bool, mode: u16) -> bool {
    if is_dir {
        mode & 0o3 == 0o3
    } else {
        mode & 0o2 != 0
    }
}

/// Checks whether `uid`/`gid` (plus `groups`, the caller's supplementary
/// group set) may write `record`'s directory, honoring uid 0 and the
/// workspace-root special case.
pub fn check_write_permission(
    record: &DirectoryRecord,
    is_dir: bool,
    is_workspace_root: bool,
    uid: u32,
    gid: u32,
    groups: &[u32],
) -> Result<(), QfsError> {
    if is_workspace_root || uid == 0 {
        return Ok(());
    }
    let triplet = if uid == record.owner {
        (record.permissions >> 6) & 0o7
    } else if gid == record.group || groups.contains(&record.group) {
        (record.permissions >> 3) & 0o7
    } else {
        record.permissions & 0o7
    };
    if has_write_access(is_dir, triplet) {
        Ok(())
    } else {
        Err(QfsError::permission(format!("no write access to {}", record.filename)))
    }
}

/// The sticky-bit unlink rule: only the file owner, the directory owner, or
/// root may unlink an entry from a sticky directory.
pub fn check_sticky_unlink(
    dir_record: &DirectoryRecord,
    child_record: &DirectoryRecord,
    uid: u32,
) -> Result<(), QfsError> {
    const STICKY_BIT: u16 = 0o1000;
    if uid == 0 || dir_record.permissions & STICKY_BIT == 0 {
        return Ok(());
    }
    if uid == dir_record.owner || uid == child_record.owner {
        Ok(())
    } else {
        Err(QfsError::permission(format!(
            "sticky directory forbids {} from unlinking {}",
            uid, child_record.filename
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::newtypes::FileId;
    use quantumfs_store::InMemoryDataStore;
    use quantumfs_core::domain::codec::JsonCodec;

    fn record(name: &str) -> DirectoryRecord {
        DirectoryRecord::new(
            name.into(),
            FileId::generate(),
            ObjectType::SmallFile,
            ObjectKey::empty_block(),
        )
    }

    #[test]
    fn load_child_then_record_by_name_round_trips() {
        let mut t = ChildTable::empty();
        t.load_child(record("a.txt"), InodeId::new(100));
        assert!(t.record_by_name("a.txt").is_some());
        assert_eq!(t.inode_of("a.txt"), Some(InodeId::new(100)));
        assert!(t.record_by_name("missing").is_none());
    }

    #[test]
    fn overlay_tombstone_hides_base_record() {
        let base = vec![record("a.txt")];
        let mut t = ChildTable::from_base(base);
        assert!(t.record_by_name("a.txt").is_some());
        let hardlinks = HardlinkTable::new();
        t.delete_child("a.txt", &hardlinks);
        assert!(t.record_by_name("a.txt").is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn delete_child_decrements_hardlink_and_reparents_last_leg() {
        let hardlinks = HardlinkTable::new();
        let leg = hardlinks.new_hardlink(InodeId::new(5), record("a.txt"), 0);
        let mut t = ChildTable::empty();
        t.load_child(leg, InodeId::new(5));

        let (_, reparented) = t.delete_child("a.txt", &hardlinks).unwrap();
        let (rec, inode_id) = reparented.expect("sole leg should reparent");
        assert_eq!(rec.filename, "a.txt");
        assert_eq!(inode_id, Some(InodeId::new(5)));
        assert!(hardlinks.is_empty());
    }

    #[test]
    fn rename_child_moves_entry_and_displaces_destination() {
        let hardlinks = HardlinkTable::new();
        let mut t = ChildTable::empty();
        t.load_child(record("old.txt"), InodeId::new(1));
        t.load_child(record("new.txt"), InodeId::new(2));

        let (renamed, displaced) = t.rename_child("old.txt", "new.txt", &hardlinks).unwrap();
        assert_eq!(renamed.filename, "new.txt");
        assert!(t.record_by_name("old.txt").is_none());
        assert_eq!(t.inode_of("new.txt"), Some(InodeId::new(1)));
        assert_eq!(displaced, None);
    }

    #[test]
    fn make_hardlink_installs_leg_in_place() {
        let hardlinks = HardlinkTable::new();
        let mut t = ChildTable::empty();
        let leg = t.make_hardlink(InodeId::new(9), record("a.txt"), &hardlinks, 0);
        assert_eq!(leg.object_type, ObjectType::Hardlink);
        assert_eq!(t.record_by_name("a.txt").unwrap().object_type, ObjectType::Hardlink);
    }

    #[test]
    fn write_permission_honors_owner_group_other_and_directory_exec_bit() {
        let mut rec = record("d");
        rec.owner = 10;
        rec.group = 20;
        rec.permissions = 0o640;

        // Owner, directory: needs w+x but group/other bits are 0o40, no x.
        assert!(check_write_permission(&rec, true, false, 10, 20, &[]).is_err());
        rec.permissions = 0o750;
        assert!(check_write_permission(&rec, true, false, 10, 20, &[]).is_ok());
        // Non-owner, non-group: falls through to "other" bits, which are 0.
        assert!(check_write_permission(&rec, true, false, 99, 99, &[]).is_err());
        // Root always passes.
        assert!(check_write_permission(&rec, true, false, 0, 0, &[]).is_ok());
    }

    #[test]
    fn sticky_bit_restricts_unlink_to_owners_and_root() {
        let mut dir = record("dir");
        dir.owner = 1;
        dir.permissions = 0o1777;
        let mut file = record("f");
        file.owner = 2;

        assert!(check_sticky_unlink(&dir, &file, 3).is_err());
        assert!(check_sticky_unlink(&dir, &file, 2).is_ok());
        assert!(check_sticky_unlink(&dir, &file, 1).is_ok());
        assert!(check_sticky_unlink(&dir, &file, 0).is_ok());
    }

    #[tokio::test]
    async fn publish_then_load_round_trips_records() {
        let store = InMemoryDataStore::new();
        let codec = JsonCodec;
        let mut t = ChildTable::empty();
        t.load_child(record("a.txt"), InodeId::new(1));
        t.load_child(record("b.txt"), InodeId::new(2));

        let key = t.publish(&store, &codec).await.unwrap();
        let loaded = ChildTable::load(key, &store, &codec).await.unwrap();
        let mut names = loaded.live_names();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn publish_of_empty_table_uses_empty_block_key() {
        let store = InMemoryDataStore::new();
        let codec = JsonCodec;
        let t = ChildTable::empty();
        let key = t.publish(&store, &codec).await.unwrap();
        assert_eq!(key, ObjectKey::empty_block());
    }
}
