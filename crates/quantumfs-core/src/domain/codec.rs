//! Typed views over published metadata blocks.
//!
//! The wire format of a metadata block is an implementation detail the
//! core does not standardize on; it only requires that encoding round-trips
//! through the [`Codec`] trait. `JsonCodec` is the default implementation,
//! chosen because every other ambient concern in this codebase already
//! reaches for `serde`/`serde_json` rather than hand-rolling a binary
//! format.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::directory_record::DirectoryRecord;
use super::newtypes::{FileId, Nonce};
use super::object_key::ObjectKey;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode block: {0}")]
    Decode(String),
    #[error("failed to encode block: {0}")]
    Encode(String),
}

/// A chain of directory-entry blocks: up to `MaxDirectoryRecords` records
/// per block plus a `next` key continuing the chain, or `None` if this is
/// the last block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DirectoryEntryView {
    pub records: Vec<DirectoryRecord>,
    pub next: Option<ObjectKey>,
}

/// One hardlink-table entry as it appears in a published workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedHardlinkEntry {
    pub file_id: FileId,
    pub record: DirectoryRecord,
    pub nlink: u32,
}

/// The decoded contents of a workspace root block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRootView {
    pub root_directory_key: ObjectKey,
    pub hardlinks: Vec<PublishedHardlinkEntry>,
    pub nonce: Nonce,
}

/// An ordered list of data-block keys for a Medium or Large file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MultiBlockFileView {
    pub block_keys: Vec<ObjectKey>,
}

/// An ordered list of "large file" metadata-block keys for a Very Large
/// file, each covering up to `MaxBlocksLargeFile` data blocks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VeryLargeFileView {
    pub part_keys: Vec<ObjectKey>,
}

/// A decoded extended-attribute set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtendedAttributesView {
    pub entries: Vec<(String, Vec<u8>)>,
}

impl ExtendedAttributesView {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn set(&mut self, name: &str, value: Vec<u8>) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        self.entries.len() != before
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }
}

/// Encodes and decodes the typed views above to and from the raw bytes
/// carried by a `Buffer`. The core depends only on this trait; the actual
/// wire representation is an adapter concern.
pub trait Codec: Send + Sync {
    fn encode_directory_entries(&self, view: &DirectoryEntryView) -> Result<Vec<u8>, CodecError>;
    fn decode_directory_entries(&self, bytes: &[u8]) -> Result<DirectoryEntryView, CodecError>;

    fn encode_workspace_root(&self, view: &WorkspaceRootView) -> Result<Vec<u8>, CodecError>;
    fn decode_workspace_root(&self, bytes: &[u8]) -> Result<WorkspaceRootView, CodecError>;

    fn encode_multi_block_file(&self, view: &MultiBlockFileView) -> Result<Vec<u8>, CodecError>;
    fn decode_multi_block_file(&self, bytes: &[u8]) -> Result<MultiBlockFileView, CodecError>;

    fn encode_very_large_file(&self, view: &VeryLargeFileView) -> Result<Vec<u8>, CodecError>;
    fn decode_very_large_file(&self, bytes: &[u8]) -> Result<VeryLargeFileView, CodecError>;

    fn encode_extended_attributes(
        &self,
        view: &ExtendedAttributesView,
    ) -> Result<Vec<u8>, CodecError>;
    fn decode_extended_attributes(
        &self,
        bytes: &[u8],
    ) -> Result<ExtendedAttributesView, CodecError>;
}

/// The default, JSON-based codec. Not a format QuantumFS advertises
/// compatibility with; it only needs to round-trip within one process.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

macro_rules! json_round_trip {
    ($encode:ident, $decode:ident, $view:ty) => {
        fn $encode(&self, view: &$view) -> Result<Vec<u8>, CodecError> {
            serde_json::to_vec(view).map_err(|e| CodecError::Encode(e.to_string()))
        }

        fn $decode(&self, bytes: &[u8]) -> Result<$view, CodecError> {
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
        }
    };
}

impl Codec for JsonCodec {
    json_round_trip!(
        encode_directory_entries,
        decode_directory_entries,
        DirectoryEntryView
    );
    json_round_trip!(encode_workspace_root, decode_workspace_root, WorkspaceRootView);
    json_round_trip!(
        encode_multi_block_file,
        decode_multi_block_file,
        MultiBlockFileView
    );
    json_round_trip!(
        encode_very_large_file,
        decode_very_large_file,
        VeryLargeFileView
    );
    json_round_trip!(
        encode_extended_attributes,
        decode_extended_attributes,
        ExtendedAttributesView
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::directory_record::ObjectType;

    #[test]
    fn directory_entries_round_trip() {
        let codec = JsonCodec;
        let view = DirectoryEntryView {
            records: vec![DirectoryRecord::new(
                "a.txt".into(),
                FileId::generate(),
                ObjectType::SmallFile,
                ObjectKey::empty_block(),
            )],
            next: None,
        };
        let bytes = codec.encode_directory_entries(&view).unwrap();
        let back = codec.decode_directory_entries(&bytes).unwrap();
        assert_eq!(back.records.len(), 1);
        assert_eq!(back.records[0].filename, "a.txt");
    }

    #[test]
    fn extended_attributes_set_get_remove() {
        let mut attrs = ExtendedAttributesView::default();
        attrs.set("user.x", vec![1, 2, 3]);
        assert_eq!(attrs.get("user.x"), Some(&[1u8, 2, 3][..]));
        assert!(attrs.remove("user.x"));
        assert_eq!(attrs.get("user.x"), None);
        assert!(!attrs.remove("user.x"));
    }

    #[test]
    fn workspace_root_round_trips_through_codec() {
        let codec = JsonCodec;
        let view = WorkspaceRootView {
            root_directory_key: ObjectKey::empty_block(),
            hardlinks: vec![],
            nonce: Nonce::zero().next(),
        };
        let bytes = codec.encode_workspace_root(&view).unwrap();
        let back = codec.decode_workspace_root(&bytes).unwrap();
        assert_eq!(back.nonce.get(), 1);
    }
}
