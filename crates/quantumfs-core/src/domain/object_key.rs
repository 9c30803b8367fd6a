//! Content-addressed object identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The one-byte type tag carried by every `ObjectKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// A file-content data block.
    Data,
    /// A directory entry, multi-block index, workspace root, or xattr block.
    Metadata,
    /// A small value (e.g. device major/minor, symlink target) carried
    /// inline in the key itself. Never issued to the backend.
    Embedded,
    /// One of the two well-known constant keys (empty block, zero block).
    Constant,
}

impl KeyType {
    fn tag(&self) -> u8 {
        match self {
            KeyType::Data => 0,
            KeyType::Metadata => 1,
            KeyType::Embedded => 2,
            KeyType::Constant => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(KeyType::Data),
            1 => Some(KeyType::Metadata),
            2 => Some(KeyType::Embedded),
            3 => Some(KeyType::Constant),
            _ => None,
        }
    }
}

const HASH_LEN: usize = 32;

/// Opaque, fixed-length, content-addressed identifier: a type tag plus a
/// SHA-256 content hash (or, for `Embedded` keys, up to 31 bytes of inline
/// payload instead of a hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    key_type: KeyType,
    hash: [u8; HASH_LEN],
}

impl ObjectKey {
    /// The well-known key for a zero-length block.
    pub fn empty_block() -> Self {
        ObjectKey {
            key_type: KeyType::Constant,
            hash: Sha256::digest([]).into(),
        }
    }

    /// The well-known key whose decoded bytes are all zero, used to
    /// represent sparse holes without actually storing a block.
    pub fn zero_key() -> Self {
        let mut hash = [0u8; HASH_LEN];
        hash[0] = 1; // distinguish from empty_block, which hashes b""
        ObjectKey {
            key_type: KeyType::Constant,
            hash,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.key_type == KeyType::Constant
    }

    pub fn is_embedded(&self) -> bool {
        self.key_type == KeyType::Embedded
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Hashes `bytes` with SHA-256 to build a content-addressed key of the
    /// given type. Panics (a programming bug, not a runtime error) if
    /// called with `KeyType::Embedded`; use [`ObjectKey::embedded`] instead.
    pub fn from_content(key_type: KeyType, bytes: &[u8]) -> Self {
        assert_ne!(
            key_type,
            KeyType::Embedded,
            "embedded keys must be built with ObjectKey::embedded"
        );
        ObjectKey {
            key_type,
            hash: Sha256::digest(bytes).into(),
        }
    }

    /// Builds an embedded key carrying `payload` inline (at most 31 bytes,
    /// e.g. device major/minor or a short symlink target). Embedded keys
    /// are never issued to the backend.
    pub fn embedded(payload: &[u8]) -> Self {
        assert!(payload.len() < HASH_LEN, "embedded payload too large");
        let mut hash = [0u8; HASH_LEN];
        hash[0] = payload.len() as u8;
        hash[1..1 + payload.len()].copy_from_slice(payload);
        ObjectKey {
            key_type: KeyType::Embedded,
            hash,
        }
    }

    /// Recovers the inline payload of an embedded key.
    pub fn embedded_payload(&self) -> Option<&[u8]> {
        if self.key_type != KeyType::Embedded {
            return None;
        }
        let len = self.hash[0] as usize;
        Some(&self.hash[1..1 + len])
    }

    pub fn as_bytes(&self) -> [u8; HASH_LEN + 1] {
        let mut out = [0u8; HASH_LEN + 1];
        out[0] = self.key_type.tag();
        out[1..].copy_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_LEN + 1 {
            return None;
        }
        let key_type = KeyType::from_tag(bytes[0])?;
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes[1..]);
        Some(ObjectKey { key_type, hash })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:", self.key_type)?;
        for b in self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({self})")
    }
}

impl Serialize for ObjectKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.as_bytes())
    }
}

impl<'de> Deserialize<'de> for ObjectKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        ObjectKey::from_bytes(&bytes)
            .ok_or_else(|| serde::de::Error::custom("invalid ObjectKey byte length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_block_and_zero_key_differ() {
        assert_ne!(ObjectKey::empty_block(), ObjectKey::zero_key());
        assert!(ObjectKey::empty_block().is_constant());
        assert!(ObjectKey::zero_key().is_constant());
    }

    #[test]
    fn same_content_yields_same_key() {
        let a = ObjectKey::from_content(KeyType::Data, b"hello");
        let b = ObjectKey::from_content(KeyType::Data, b"hello");
        assert_eq!(a, b);
        let c = ObjectKey::from_content(KeyType::Data, b"world");
        assert_ne!(a, c);
    }

    #[test]
    fn embedded_round_trips_payload() {
        let key = ObjectKey::embedded(&[7, 3]);
        assert!(key.is_embedded());
        assert_eq!(key.embedded_payload(), Some(&[7u8, 3][..]));
    }

    #[test]
    fn bytes_round_trip() {
        let key = ObjectKey::from_content(KeyType::Metadata, b"dir block");
        let bytes = key.as_bytes();
        let back = ObjectKey::from_bytes(&bytes).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn display_includes_type_tag() {
        let key = ObjectKey::from_content(KeyType::Data, b"x");
        assert!(key.to_string().starts_with("Data:"));
    }
}
