//! Configuration module for QuantumFS.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation, defaults, and a builder pattern for
//! programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration for QuantumFS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub blocks: BlockConfig,
    pub cache: CacheConfig,
    pub workspace: WorkspaceConfig,
    pub merge: MergeConfig,
    pub logging: LoggingConfig,
    pub mount: MountConfig,
}

/// Block-encoding size thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Maximum bytes per content block.
    pub max_block_size: u32,
    /// Maximum number of blocks a `MediumFile` may address directly before
    /// promotion to `LargeFile`.
    pub max_blocks_medium_file: u32,
    /// Maximum number of second-level block-list blocks a `LargeFile` may
    /// address before promotion to `VeryLargeFile`.
    pub max_blocks_large_file: u32,
    /// Maximum number of `DirectoryRecord`s in one directory block before
    /// the directory is split.
    pub max_directory_records: u32,
}

/// `DataStoreCache` sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Soft budget, in bytes, for the in-process LRU object cache.
    pub max_cache_bytes: u64,
    /// Seconds of inactivity before a freshened entry loses its extra TTL.
    pub freshen_interval_secs: u64,
}

/// Workspace flush/inode-reuse timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Milliseconds a dirty directory may remain unflushed before the
    /// background flusher publishes it regardless of further activity.
    pub flush_delay_ms: u64,
    /// Seconds an inode-id must remain quiescent (forgotten by the kernel,
    /// no open handles) before it may be reused by a new file or directory.
    pub inode_reuse_delay_secs: u64,
    /// First inode-id available for ordinary allocation; lower ids are
    /// reserved (root, the synthetic `/api` node, ...).
    pub inode_id_reserved_end: u64,
}

/// Three-way merge defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Tie-break strategy when both sides recreated a deleted name:
    /// `prefer_newer`, `prefer_local`, or `prefer_remote`.
    pub recreate_conflict_preference: String,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Path to the log file; `None` logs to stderr only.
    pub file: Option<PathBuf>,
}

/// FUSE mount settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Directory where the filesystem will be mounted.
    pub mount_point: String,
    /// Whether to allow other users to access the mount.
    pub allow_other: bool,
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/quantumfs/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("quantumfs")
            .join("config.yaml")
    }
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            max_block_size: 64 * 1024,
            max_blocks_medium_file: 16,
            max_blocks_large_file: 256,
            max_directory_records: 4096,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 256 * 1024 * 1024,
            freshen_interval_secs: 3600,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: 500,
            inode_reuse_delay_secs: 30,
            inode_id_reserved_end: 16,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            recreate_conflict_preference: "prefer_newer".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: "/mnt/quantumfs".to_string(),
            allow_other: false,
        }
    }
}

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"blocks.max_block_size"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `merge.recreate_conflict_preference`.
const VALID_RECREATE_PREFERENCES: &[&str] = &["prefer_newer", "prefer_local", "prefer_remote"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.blocks.max_block_size == 0 {
            errors.push(ValidationError {
                field: "blocks.max_block_size".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.blocks.max_blocks_medium_file == 0 {
            errors.push(ValidationError {
                field: "blocks.max_blocks_medium_file".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.blocks.max_blocks_large_file == 0 {
            errors.push(ValidationError {
                field: "blocks.max_blocks_large_file".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.blocks.max_directory_records == 0 {
            errors.push(ValidationError {
                field: "blocks.max_directory_records".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.cache.max_cache_bytes == 0 {
            errors.push(ValidationError {
                field: "cache.max_cache_bytes".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.workspace.inode_id_reserved_end == 0 {
            errors.push(ValidationError {
                field: "workspace.inode_id_reserved_end".into(),
                message: "must be greater than 0".into(),
            });
        }

        if !VALID_RECREATE_PREFERENCES.contains(&self.merge.recreate_conflict_preference.as_str())
        {
            errors.push(ValidationError {
                field: "merge.recreate_conflict_preference".into(),
                message: format!(
                    "invalid preference '{}'; valid options: {}",
                    self.merge.recreate_conflict_preference,
                    VALID_RECREATE_PREFERENCES.join(", ")
                ),
            });
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        if self.mount.mount_point.is_empty() {
            errors.push(ValidationError {
                field: "mount.mount_point".into(),
                message: "must not be empty".into(),
            });
        }

        errors
    }
}

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use quantumfs_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .blocks_max_block_size(32 * 1024)
///     .mount_point("/mnt/qfs")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn blocks_max_block_size(mut self, bytes: u32) -> Self {
        self.config.blocks.max_block_size = bytes;
        self
    }

    pub fn blocks_max_blocks_medium_file(mut self, n: u32) -> Self {
        self.config.blocks.max_blocks_medium_file = n;
        self
    }

    pub fn blocks_max_blocks_large_file(mut self, n: u32) -> Self {
        self.config.blocks.max_blocks_large_file = n;
        self
    }

    pub fn blocks_max_directory_records(mut self, n: u32) -> Self {
        self.config.blocks.max_directory_records = n;
        self
    }

    pub fn cache_max_cache_bytes(mut self, bytes: u64) -> Self {
        self.config.cache.max_cache_bytes = bytes;
        self
    }

    pub fn cache_freshen_interval_secs(mut self, secs: u64) -> Self {
        self.config.cache.freshen_interval_secs = secs;
        self
    }

    pub fn workspace_flush_delay_ms(mut self, ms: u64) -> Self {
        self.config.workspace.flush_delay_ms = ms;
        self
    }

    pub fn workspace_inode_reuse_delay_secs(mut self, secs: u64) -> Self {
        self.config.workspace.inode_reuse_delay_secs = secs;
        self
    }

    pub fn workspace_inode_id_reserved_end(mut self, id: u64) -> Self {
        self.config.workspace.inode_id_reserved_end = id;
        self
    }

    pub fn merge_recreate_conflict_preference(mut self, preference: impl Into<String>) -> Self {
        self.config.merge.recreate_conflict_preference = preference.into();
        self
    }

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_file(mut self, file: PathBuf) -> Self {
        self.config.logging.file = Some(file);
        self
    }

    pub fn mount_point(mut self, mount_point: impl Into<String>) -> Self {
        self.config.mount.mount_point = mount_point.into();
        self
    }

    pub fn mount_allow_other(mut self, allow_other: bool) -> Self {
        self.config.mount.allow_other = allow_other;
        self
    }

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    mod defaults {
        use super::*;

        #[test]
        fn default_config_has_sensible_values() {
            let cfg = Config::default();
            assert_eq!(cfg.blocks.max_block_size, 64 * 1024);
            assert_eq!(cfg.blocks.max_blocks_medium_file, 16);
            assert_eq!(cfg.blocks.max_blocks_large_file, 256);
            assert_eq!(cfg.cache.max_cache_bytes, 256 * 1024 * 1024);
            assert_eq!(cfg.workspace.flush_delay_ms, 500);
            assert_eq!(cfg.workspace.inode_id_reserved_end, 16);
            assert_eq!(cfg.merge.recreate_conflict_preference, "prefer_newer");
            assert_eq!(cfg.logging.level, "info");
            assert!(cfg.logging.file.is_none());
            assert_eq!(cfg.mount.mount_point, "/mnt/quantumfs");
            assert!(!cfg.mount.allow_other);
        }

        #[test]
        fn default_config_passes_validation() {
            let cfg = Config::default();
            assert!(cfg.validate().is_empty());
        }
    }

    mod loading {
        use super::*;

        #[test]
        fn load_from_yaml_file() {
            let yaml = r#"
blocks:
  max_block_size: 32768
  max_blocks_medium_file: 8
  max_blocks_large_file: 128
  max_directory_records: 2048
cache:
  max_cache_bytes: 1048576
  freshen_interval_secs: 60
workspace:
  flush_delay_ms: 100
  inode_reuse_delay_secs: 5
  inode_id_reserved_end: 16
merge:
  recreate_conflict_preference: prefer_local
logging:
  level: debug
  file: /tmp/quantumfs.log
mount:
  mount_point: /mnt/qfs
  allow_other: true
"#;
            let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
            tmp.write_all(yaml.as_bytes()).unwrap();
            tmp.flush().unwrap();

            let cfg = Config::load(tmp.path()).expect("load config");
            assert_eq!(cfg.blocks.max_block_size, 32768);
            assert_eq!(cfg.cache.max_cache_bytes, 1_048_576);
            assert_eq!(cfg.workspace.flush_delay_ms, 100);
            assert_eq!(cfg.merge.recreate_conflict_preference, "prefer_local");
            assert_eq!(cfg.logging.level, "debug");
            assert_eq!(cfg.logging.file, Some(PathBuf::from("/tmp/quantumfs.log")));
            assert_eq!(cfg.mount.mount_point, "/mnt/qfs");
            assert!(cfg.mount.allow_other);
        }

        #[test]
        fn load_missing_file_errors() {
            let result = Config::load(Path::new("/nonexistent/path/config.yaml"));
            assert!(result.is_err());
        }

        #[test]
        fn load_or_default_falls_back_on_missing_file() {
            let cfg = Config::load_or_default(Path::new("/nonexistent/path/config.yaml"));
            assert_eq!(cfg.mount.mount_point, "/mnt/quantumfs");
        }

        #[test]
        fn default_path_ends_in_quantumfs_config_yaml() {
            let path = Config::default_path();
            assert!(path.ends_with("quantumfs/config.yaml"));
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn zero_max_block_size_is_rejected() {
            let cfg = ConfigBuilder::new().blocks_max_block_size(0).build();
            let errors = cfg.validate();
            assert!(errors.iter().any(|e| e.field == "blocks.max_block_size"));
        }

        #[test]
        fn invalid_log_level_is_rejected() {
            let cfg = ConfigBuilder::new().logging_level("verbose").build();
            let errors = cfg.validate();
            assert!(errors.iter().any(|e| e.field == "logging.level"));
        }

        #[test]
        fn invalid_recreate_preference_is_rejected() {
            let cfg = ConfigBuilder::new()
                .merge_recreate_conflict_preference("coin_flip")
                .build();
            let errors = cfg.validate();
            assert!(errors
                .iter()
                .any(|e| e.field == "merge.recreate_conflict_preference"));
        }

        #[test]
        fn empty_mount_point_is_rejected() {
            let cfg = ConfigBuilder::new().mount_point("").build();
            let errors = cfg.validate();
            assert!(errors.iter().any(|e| e.field == "mount.mount_point"));
        }
    }

    mod builder {
        use super::*;

        #[test]
        fn builder_overrides_defaults() {
            let cfg = ConfigBuilder::new()
                .blocks_max_block_size(4096)
                .mount_point("/mnt/custom")
                .mount_allow_other(true)
                .build();
            assert_eq!(cfg.blocks.max_block_size, 4096);
            assert_eq!(cfg.mount.mount_point, "/mnt/custom");
            assert!(cfg.mount.allow_other);
        }

        #[test]
        fn build_validated_rejects_invalid_config() {
            let result = ConfigBuilder::new().logging_level("bogus").build_validated();
            assert!(result.is_err());
        }

        #[test]
        fn build_validated_accepts_valid_config() {
            let result = ConfigBuilder::new().build_validated();
            assert!(result.is_ok());
        }
    }
}
