//! Workspace-level machinery that sits above a mounted [`QuantumFs`]
//! instance: the background flusher that drains dirty inodes and advances
//! the workspace root on a delay.
//!
//! [`QuantumFs`]: quantumfs_fs::filesystem::QuantumFs

pub mod flusher;

pub use flusher::Flusher;
