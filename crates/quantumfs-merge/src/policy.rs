//! The tie-break preference applied when both sides independently recreate
//! a deleted name, or change a regular file's content in incompatible ways.

use quantumfs_core::config::MergeConfig;
use quantumfs_core::domain::directory_record::DirectoryRecord;

/// Which side wins a recreate or whole-file conflict that intra-file merge
/// cannot resolve on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateConflictPreference {
    /// Newer `content_time` wins; ties favor local.
    PreferNewer,
    PreferLocal,
    PreferRemote,
}

impl RecreateConflictPreference {
    /// Reads the already-validated `merge.recreate_conflict_preference`
    /// config string. Any value other than `"prefer_local"`/
    /// `"prefer_remote"` falls back to `PreferNewer`, matching
    /// `MergeConfig`'s own default.
    pub fn from_config(cfg: &MergeConfig) -> Self {
        match cfg.recreate_conflict_preference.as_str() {
            "prefer_local" => Self::PreferLocal,
            "prefer_remote" => Self::PreferRemote,
            _ => Self::PreferNewer,
        }
    }

    /// Picks the winning side of a conflicting pair of records.
    pub fn pick(&self, local: &DirectoryRecord, remote: &DirectoryRecord) -> Side {
        match self {
            Self::PreferLocal => Side::Local,
            Self::PreferRemote => Side::Remote,
            Self::PreferNewer => {
                if remote.content_time > local.content_time {
                    Side::Remote
                } else {
                    Side::Local
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumfs_core::domain::directory_record::ObjectType;
    use quantumfs_core::domain::newtypes::FileId;
    use quantumfs_core::domain::object_key::ObjectKey;

    fn record(content_time: i64) -> DirectoryRecord {
        let mut r = DirectoryRecord::new(
            "a".into(),
            FileId::generate(),
            ObjectType::SmallFile,
            ObjectKey::empty_block(),
        );
        r.content_time = content_time;
        r
    }

    #[test]
    fn from_config_maps_every_valid_string() {
        let mut cfg = MergeConfig::default();
        assert_eq!(
            RecreateConflictPreference::from_config(&cfg),
            RecreateConflictPreference::PreferNewer
        );
        cfg.recreate_conflict_preference = "prefer_local".into();
        assert_eq!(
            RecreateConflictPreference::from_config(&cfg),
            RecreateConflictPreference::PreferLocal
        );
        cfg.recreate_conflict_preference = "prefer_remote".into();
        assert_eq!(
            RecreateConflictPreference::from_config(&cfg),
            RecreateConflictPreference::PreferRemote
        );
    }

    #[test]
    fn prefer_newer_breaks_ties_towards_local() {
        let local = record(10);
        let remote = record(10);
        assert_eq!(
            RecreateConflictPreference::PreferNewer.pick(&local, &remote),
            Side::Local
        );
        let remote_newer = record(20);
        assert_eq!(
            RecreateConflictPreference::PreferNewer.pick(&local, &remote_newer),
            Side::Remote
        );
    }
}
