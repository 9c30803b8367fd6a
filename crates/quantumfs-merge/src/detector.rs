//! Per-name three-way classification: given a name's record on the common
//! ancestor, local, and remote sides, decide what the merged tree should
//! contain at that name before any content-level merge is attempted.

use quantumfs_core::domain::directory_record::DirectoryRecord;

/// The outcome of comparing one name's three-way record triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameDecision {
    /// Absent on every side that matters, or removed relative to the
    /// ancestor on at least one side with no independent recreation.
    Deleted,
    /// Only local has ever had this name (created since the ancestor).
    TakeLocal,
    /// Only remote has ever had this name.
    TakeRemote,
    /// Present on both sides but only one side actually changed it.
    Unchanged,
    /// Both sides changed the record independently; the caller resolves
    /// further by object type (intra-file merge, type conflict, or the
    /// configured preference).
    Conflict,
}

/// Two records are equivalent for merge purposes if they'd produce the same
/// directory entry -- content and the attributes that matter to a
/// filesystem client. `modification_time`/`content_time` are excluded so
/// that an unrelated timestamp bump alone never manufactures a conflict.
fn records_equivalent(a: &DirectoryRecord, b: &DirectoryRecord) -> bool {
    a.key == b.key
        && a.object_type == b.object_type
        && a.permissions == b.permissions
        && a.owner == b.owner
        && a.group == b.group
        && a.file_id == b.file_id
}

/// Classifies one name given its record on each of the three sides.
/// `base` is `None` both for "never existed" and for "ancestor has no
/// record here" -- the merge has no way to distinguish the two, and
/// doesn't need to: both mean "nothing to compare new content against".
pub fn classify(
    base: Option<&DirectoryRecord>,
    local: Option<&DirectoryRecord>,
    remote: Option<&DirectoryRecord>,
) -> NameDecision {
    match (base, local, remote) {
        (_, None, None) => NameDecision::Deleted,
        // Deleted on one side relative to the ancestor: deletion wins
        // regardless of whether the other side still carries the old,
        // unmodified record.
        (Some(_), None, Some(_)) | (Some(_), Some(_), None) => NameDecision::Deleted,
        (None, None, Some(_)) => NameDecision::TakeRemote,
        (None, Some(_), None) => NameDecision::TakeLocal,
        (None, Some(l), Some(r)) => {
            if records_equivalent(l, r) {
                NameDecision::Unchanged
            } else {
                NameDecision::Conflict
            }
        }
        (Some(b), Some(l), Some(r)) => {
            if records_equivalent(l, r) {
                NameDecision::Unchanged
            } else if records_equivalent(b, l) {
                NameDecision::TakeRemote
            } else if records_equivalent(b, r) {
                NameDecision::TakeLocal
            } else {
                NameDecision::Conflict
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::directory_record::ObjectType;
    use quantumfs_core::domain::newtypes::FileId;
    use quantumfs_core::domain::object_key::ObjectKey;

    fn record(key_seed: &[u8]) -> DirectoryRecord {
        DirectoryRecord::new(
            "a".into(),
            FileId::generate(),
            ObjectType::SmallFile,
            ObjectKey::from_content(quantumfs_core::domain::object_key::KeyType::Data, key_seed),
        )
    }

    #[test]
    fn only_remote_has_ever_had_the_name() {
        let r = record(b"r");
        assert_eq!(classify(None, None, Some(&r)), NameDecision::TakeRemote);
    }

    #[test]
    fn deleted_locally_wins_even_if_remote_kept_the_old_copy() {
        let b = record(b"base");
        assert_eq!(classify(Some(&b), None, Some(&b)), NameDecision::Deleted);
    }

    #[test]
    fn only_remote_changed_since_the_ancestor() {
        let b = record(b"base");
        let r = record(b"changed");
        assert_eq!(classify(Some(&b), Some(&b), Some(&r)), NameDecision::TakeRemote);
    }

    #[test]
    fn both_sides_changed_independently_conflicts() {
        let b = record(b"base");
        let l = record(b"local-change");
        let r = record(b"remote-change");
        assert_eq!(classify(Some(&b), Some(&l), Some(&r)), NameDecision::Conflict);
    }

    #[test]
    fn both_sides_converge_on_the_same_change() {
        let b = record(b"base");
        let mut l = record(b"same");
        let mut r = record(b"same");
        l.file_id = FileId::from_raw(7);
        r.file_id = FileId::from_raw(7);
        assert_eq!(classify(Some(&b), Some(&l), Some(&r)), NameDecision::Unchanged);
    }
}
