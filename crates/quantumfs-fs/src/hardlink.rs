//! Per-workspace hardlink table: `FileId -> { publishable_record, nlink,
//! inode-id, creation_time }`.

use std::collections::HashMap;
use std::sync::RwLock;

use quantumfs_core::domain::directory_record::{DirectoryRecord, ObjectType};
use quantumfs_core::domain::newtypes::{FileId, InodeId};

#[derive(Debug, Clone)]
struct HardlinkEntry {
    record: DirectoryRecord,
    /// Leg count. Zero or negative means "dead leg, retained until the
    /// next publish filters it out" -- see the dead-leg preservation rule.
    nlink: i64,
    /// `None` until some directory's `lookup` instantiates an inode for
    /// this group -- a group loaded fresh from a published workspace root
    /// has no live inode yet.
    inode_id: Option<InodeId>,
    creation_time: i64,
}

/// The workspace-wide table backing every hardlink group. One entry per
/// FileId; directory records referencing a hardlink carry only the FileId,
/// with attributes resolved by looking the FileId up here.
#[derive(Default)]
pub struct HardlinkTable {
    entries: RwLock<HashMap<FileId, HardlinkEntry>>,
    by_inode: RwLock<HashMap<InodeId, FileId>>,
}

impl HardlinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Promotes `record` (currently an ordinary file/symlink/special
    /// record at `inode_id`) into a hardlink group: mints a fresh FileId,
    /// files the original record away at `nlink = 1`, and returns the
    /// hardlink-leg record to install in the directory in its place.
    pub fn new_hardlink(&self, inode_id: InodeId, record: DirectoryRecord, now: i64) -> DirectoryRecord {
        let file_id = FileId::generate();
        let mut leg = DirectoryRecord::new(
            record.filename.clone(),
            file_id,
            ObjectType::Hardlink,
            record.key,
        );
        leg.size = record.size;
        leg.permissions = record.permissions;
        leg.owner = record.owner;
        leg.group = record.group;
        leg.modification_time = record.modification_time;
        leg.content_time = record.content_time;
        leg.extended_attributes = record.extended_attributes;
        leg.nlink = 1;

        self.entries.write().unwrap().insert(
            file_id,
            HardlinkEntry {
                record,
                nlink: 1,
                inode_id: Some(inode_id),
                creation_time: now,
            },
        );
        self.by_inode.write().unwrap().insert(inode_id, file_id);
        leg
    }

    /// Installs a group decoded from a published workspace root, with no
    /// inode bound yet -- the inode is assigned lazily by
    /// [`Self::bind_inode`] on first `lookup` of one of its legs.
    pub fn insert_published(&self, file_id: FileId, record: DirectoryRecord, nlink: i64, creation_time: i64) {
        self.entries.write().unwrap().insert(
            file_id,
            HardlinkEntry {
                record,
                nlink,
                inode_id: None,
                creation_time,
            },
        );
    }

    /// Binds `inode_id` to a group that was loaded without one yet.
    /// Re-binding to a different inode replaces the previous reverse-map
    /// entry.
    pub fn bind_inode(&self, file_id: FileId, inode_id: InodeId) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(&file_id) {
            if let Some(old) = entry.inode_id.replace(inode_id) {
                if old != inode_id {
                    self.by_inode.write().unwrap().remove(&old);
                }
            }
        }
        drop(entries);
        self.by_inode.write().unwrap().insert(inode_id, file_id);
    }

    pub fn get_hardlink(&self, file_id: FileId) -> Option<DirectoryRecord> {
        self.entries
            .read()
            .unwrap()
            .get(&file_id)
            .map(|e| e.record.clone())
    }

    /// `(is_link, file_id)` for the given inode, if it backs a hardlink.
    pub fn check_hardlink(&self, inode_id: InodeId) -> (bool, Option<FileId>) {
        let by_inode = self.by_inode.read().unwrap();
        match by_inode.get(&inode_id) {
            Some(id) => (true, Some(*id)),
            None => (false, None),
        }
    }

    /// Current leg count for `file_id`, if the group exists.
    pub fn leg_count(&self, file_id: FileId) -> Option<i64> {
        self.entries.read().unwrap().get(&file_id).map(|e| e.nlink)
    }

    /// Adds a new leg to an existing group.
    pub fn inc(&self, file_id: FileId) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(&file_id) {
            entry.nlink += 1;
        }
    }

    /// Removes one leg. Returns `true` when exactly one leg remains --
    /// callers may then convert that sole remaining leg back to an inline
    /// record and drop the table entry via `remove_hardlink`.
    pub fn dec(&self, file_id: FileId) -> bool {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(&file_id) {
            entry.nlink -= 1;
            entry.nlink == 1
        } else {
            false
        }
    }

    /// Removes the last leg's table entry, returning the record and the
    /// bound inode id (if any) so the caller can re-parent the content
    /// back into a plain file.
    pub fn remove_hardlink(&self, file_id: FileId) -> Option<(DirectoryRecord, Option<InodeId>)> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.remove(&file_id)?;
        if let Some(id) = entry.inode_id {
            self.by_inode.write().unwrap().remove(&id);
        }
        Some((entry.record, entry.inode_id))
    }

    pub fn update_record(&self, file_id: FileId, record: DirectoryRecord) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(&file_id) {
            entry.record = record;
        }
    }

    /// The publishable set: every entry whose `nlink` is still positive.
    /// Dead legs (`nlink <= 0`) are dropped here rather than immediately on
    /// delete, so a leg removed just before a crash or a racing flush is
    /// never lost from the table prematurely.
    pub fn publishable_entries(&self) -> Vec<(FileId, DirectoryRecord, i64)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.nlink > 0)
            .map(|(id, e)| (*id, e.record.clone(), e.creation_time))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::object_key::ObjectKey;

    fn record(name: &str) -> DirectoryRecord {
        DirectoryRecord::new(
            name.into(),
            FileId::INVALID,
            ObjectType::SmallFile,
            ObjectKey::empty_block(),
        )
    }

    #[test]
    fn new_hardlink_registers_and_returns_leg() {
        let table = HardlinkTable::new();
        let leg = table.new_hardlink(InodeId::new(10), record("a.txt"), 100);
        assert_eq!(leg.object_type, ObjectType::Hardlink);
        assert!(leg.file_id.is_valid());

        let (is_link, file_id) = table.check_hardlink(InodeId::new(10));
        assert!(is_link);
        assert_eq!(file_id, Some(leg.file_id));

        let stored = table.get_hardlink(leg.file_id).unwrap();
        assert_eq!(stored.filename, "a.txt");
    }

    #[test]
    fn inc_and_dec_track_leg_count() {
        let table = HardlinkTable::new();
        let leg = table.new_hardlink(InodeId::new(1), record("a.txt"), 0);
        table.inc(leg.file_id);
        table.inc(leg.file_id);
        // Three legs now; dropping one should not yet signal "last leg".
        assert!(!table.dec(leg.file_id));
        // Two legs now; dropping one more brings it to exactly one leg.
        assert!(table.dec(leg.file_id));
    }

    #[test]
    fn remove_hardlink_clears_both_maps() {
        let table = HardlinkTable::new();
        let leg = table.new_hardlink(InodeId::new(1), record("a.txt"), 0);
        let (rec, inode_id) = table.remove_hardlink(leg.file_id).unwrap();
        assert_eq!(rec.filename, "a.txt");
        assert_eq!(inode_id, Some(InodeId::new(1)));
        assert!(table.get_hardlink(leg.file_id).is_none());
        assert!(!table.check_hardlink(InodeId::new(1)).0);
    }

    #[test]
    fn dead_legs_are_excluded_from_publishable_entries() {
        let table = HardlinkTable::new();
        let leg = table.new_hardlink(InodeId::new(1), record("a.txt"), 0);
        table.dec(leg.file_id); // nlink now 0, a dead leg
        assert!(table.publishable_entries().is_empty());
    }

    #[test]
    fn update_record_refreshes_the_canonical_entry() {
        let table = HardlinkTable::new();
        let leg = table.new_hardlink(InodeId::new(1), record("a.txt"), 0);

        let mut grown = record("a.txt");
        grown.size = 4096;
        table.update_record(leg.file_id, grown);

        let stored = table.get_hardlink(leg.file_id).unwrap();
        assert_eq!(stored.size, 4096);
    }

    #[test]
    fn published_entry_has_no_inode_until_bound() {
        let table = HardlinkTable::new();
        let file_id = FileId::generate();
        table.insert_published(file_id, record("a.txt"), 2, 0);
        assert!(table.get_hardlink(file_id).is_some());
        assert_eq!(table.leg_count(file_id), Some(2));

        table.bind_inode(file_id, InodeId::new(7));
        let (is_link, bound) = table.check_hardlink(InodeId::new(7));
        assert!(is_link);
        assert_eq!(bound, Some(file_id));
    }
}
