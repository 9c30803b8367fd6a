//! `DirectoryRecord`: the metadata entry for one name in one directory.

use serde::{Deserialize, Serialize};

use super::newtypes::FileId;
use super::object_key::ObjectKey;

/// The encoding/kind of the object a `DirectoryRecord` names. Two records
/// sharing a FileId in the same workspace are hardlink legs regardless of
/// which of these a third name uses for a different file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    Directory,
    SmallFile,
    MediumFile,
    LargeFile,
    VeryLargeFile,
    Symlink,
    Special,
    Hardlink,
}

impl ObjectType {
    pub fn is_file(&self) -> bool {
        matches!(
            self,
            ObjectType::SmallFile
                | ObjectType::MediumFile
                | ObjectType::LargeFile
                | ObjectType::VeryLargeFile
        )
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, ObjectType::Directory)
    }

    pub fn to_fuser_file_type(self) -> fuser::FileType {
        match self {
            ObjectType::Directory => fuser::FileType::Directory,
            ObjectType::Symlink => fuser::FileType::Symlink,
            ObjectType::Special => fuser::FileType::CharDevice,
            // Hardlinks always resolve to the type of their target leg's
            // file before being surfaced to the kernel; by the time a
            // record reaches FUSE it has been resolved to a concrete type.
            ObjectType::Hardlink => fuser::FileType::RegularFile,
            ObjectType::SmallFile
            | ObjectType::MediumFile
            | ObjectType::LargeFile
            | ObjectType::VeryLargeFile => fuser::FileType::RegularFile,
        }
    }
}

/// The metadata entry for one name in one directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub filename: String,
    pub file_id: FileId,
    pub object_type: ObjectType,
    pub key: ObjectKey,
    pub size: u64,
    pub permissions: u16,
    pub owner: u32,
    pub group: u32,
    /// Last modification time, seconds since epoch.
    pub modification_time: i64,
    /// Last content-change time, seconds since epoch. Distinct from
    /// `modification_time` so merges can compare "which side actually
    /// changed bytes" separately from metadata-only updates.
    pub content_time: i64,
    /// Key of this name's extended-attribute block, or the empty-block key
    /// if it has none set.
    pub extended_attributes: ObjectKey,
    /// For `ObjectType::Hardlink` records, the FileId is authoritative and
    /// this flag distinguishes "this leg IS the hardlink marker" from
    /// "this is a ordinary file that happens to share no FileId with
    /// anything else yet".
    pub nlink: u32,
}

impl DirectoryRecord {
    pub fn new(filename: String, file_id: FileId, object_type: ObjectType, key: ObjectKey) -> Self {
        DirectoryRecord {
            filename,
            file_id,
            object_type,
            key,
            size: 0,
            permissions: 0o644,
            owner: 0,
            group: 0,
            modification_time: 0,
            content_time: 0,
            extended_attributes: ObjectKey::empty_block(),
            nlink: 1,
        }
    }

    pub fn is_hardlink_leg(&self) -> bool {
        matches!(self.object_type, ObjectType::Hardlink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_has_sensible_defaults() {
        let rec = DirectoryRecord::new(
            "a".into(),
            FileId::generate(),
            ObjectType::SmallFile,
            ObjectKey::empty_block(),
        );
        assert_eq!(rec.size, 0);
        assert_eq!(rec.permissions, 0o644);
        assert_eq!(rec.nlink, 1);
        assert!(!rec.is_hardlink_leg());
    }

    #[test]
    fn hardlink_type_is_detected() {
        let rec = DirectoryRecord::new(
            "a".into(),
            FileId::generate(),
            ObjectType::Hardlink,
            ObjectKey::empty_block(),
        );
        assert!(rec.is_hardlink_leg());
    }

    #[test]
    fn object_type_maps_to_fuser_file_type() {
        assert_eq!(
            ObjectType::Directory.to_fuser_file_type(),
            fuser::FileType::Directory
        );
        assert_eq!(
            ObjectType::SmallFile.to_fuser_file_type(),
            fuser::FileType::RegularFile
        );
        assert!(ObjectType::MediumFile.is_file());
        assert!(!ObjectType::Directory.is_file());
    }
}
