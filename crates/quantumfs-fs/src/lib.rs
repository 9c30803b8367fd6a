//! QuantumFS FUSE layer.
//!
//! Bridges the kernel's synchronous `fuser::Filesystem` callbacks to the
//! async, content-addressed domain model in `quantumfs-core`:
//! - [`block`] - the four file-content encodings and their promotion rules.
//! - [`hardlink`] - the per-workspace hardlink table.
//! - [`inode`] - the process-wide inode registry, id allocation, and
//!   orphan handling.
//! - [`directory`] - the child table (name/inode-id/record maps over a
//!   published directory-entry chain) and directory permission checks.
//! - [`workspace_root`] - the root directory, hardlink table, and workspace
//!   identity bundle, plus the publish/advance compare-and-set cycle.
//! - [`xattr`] - real extended attributes plus the virtual `quantumfs.key`
//!   attribute.
//! - [`filesystem`] - the `fuser::Filesystem` implementation tying all of
//!   the above to one mounted workspace.

pub mod block;
pub mod directory;
pub mod filesystem;
pub mod hardlink;
pub mod inode;
pub mod workspace_root;
pub mod xattr;
