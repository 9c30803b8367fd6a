//! Domain entities and business logic
//!
//! This module contains the core domain types for QuantumFS:
//! - Newtypes for type-safe identifiers (`FileId`, `InodeId`, workspace names)
//! - `ObjectKey` / `Buffer` / `Codec` for content addressing
//! - `DirectoryRecord` and the object-type taxonomy
//! - `QfsError`, the domain-wide error taxonomy

pub mod buffer;
pub mod codec;
pub mod directory_record;
pub mod errors;
pub mod newtypes;
pub mod object_key;

pub use buffer::Buffer;
pub use codec::{
    DirectoryEntryView, ExtendedAttributesView, MultiBlockFileView, VeryLargeFileView,
    WorkspaceRootView,
};
pub use directory_record::{DirectoryRecord, ObjectType};
pub use errors::QfsError;
pub use newtypes::{FileId, InodeId, NamespaceName, TypespaceName, WorkspaceName};
pub use object_key::{KeyType, ObjectKey};
