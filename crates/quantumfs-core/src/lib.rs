//! QuantumFS Core - domain types, ports, and configuration
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `ObjectKey`, `FileId`, `DirectoryRecord`, `Buffer`
//! - **Port definitions** - Traits for adapters: `DataStore`, `WorkspaceDB`
//! - **Configuration** - Size limits, cache budget, and flush/reuse delays
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no external backend
//! dependencies. Ports define trait interfaces that adapter crates implement;
//! `quantumfs-store` is the in-process cache and test-double adapter for
//! both ports.

pub mod config;
pub mod domain;
pub mod ports;
