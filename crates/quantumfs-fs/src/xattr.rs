//! Extended attributes.
//!
//! Real extended attributes live in their own metadata block referenced by
//! a `DirectoryRecord`'s `extended_attributes` key (the empty-block key for
//! "no attributes set"), encoded via `ExtendedAttributesView`. Alongside
//! those, one virtual, read-only attribute -- `quantumfs.key` -- exposes a
//! child's encoded object reference (key + object type + size) so that the
//! `/api` protocol's `insert_inode` can reconstruct a reference to content
//! that already exists in the backend without re-uploading it.

use quantumfs_core::domain::codec::{Codec, ExtendedAttributesView};
use quantumfs_core::domain::directory_record::ObjectType;
use quantumfs_core::domain::errors::QfsError;
use quantumfs_core::domain::object_key::ObjectKey;
use quantumfs_core::ports::data_store::DataStore;

/// The virtual attribute exposing a child's object reference. Read-only:
/// `setxattr`/`removexattr` on this name fail with `EPERM`.
pub const VIRTUAL_KEY_ATTR: &str = "quantumfs.key";

const OBJECT_TYPE_TAGS: [ObjectType; 8] = [
    ObjectType::Directory,
    ObjectType::SmallFile,
    ObjectType::MediumFile,
    ObjectType::LargeFile,
    ObjectType::VeryLargeFile,
    ObjectType::Symlink,
    ObjectType::Special,
    ObjectType::Hardlink,
];

fn object_type_tag(t: ObjectType) -> u8 {
    OBJECT_TYPE_TAGS.iter().position(|&x| x == t).expect("exhaustive") as u8
}

fn object_type_from_tag(tag: u8) -> Option<ObjectType> {
    OBJECT_TYPE_TAGS.get(tag as usize).copied()
}

/// The fixed-length encoding of the `quantumfs.key` virtual attribute:
/// a 33-byte `ObjectKey`, a 1-byte object-type tag, and an 8-byte
/// little-endian size.
pub fn encode_key_attr(key: ObjectKey, object_type: ObjectType, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(33 + 1 + 8);
    out.extend_from_slice(&key.as_bytes());
    out.push(object_type_tag(object_type));
    out.extend_from_slice(&size.to_le_bytes());
    out
}

pub fn decode_key_attr(bytes: &[u8]) -> Option<(ObjectKey, ObjectType, u64)> {
    if bytes.len() != 33 + 1 + 8 {
        return None;
    }
    let key = ObjectKey::from_bytes(&bytes[0..33])?;
    let object_type = object_type_from_tag(bytes[33])?;
    let size = u64::from_le_bytes(bytes[34..42].try_into().ok()?);
    Some((key, object_type, size))
}

/// Loads the extended-attribute set referenced by `attrs_key`. The
/// empty-block key decodes to an empty set without touching the backend.
pub async fn load(
    attrs_key: ObjectKey,
    store: &dyn DataStore,
    codec: &dyn Codec,
) -> anyhow::Result<ExtendedAttributesView> {
    if attrs_key == ObjectKey::empty_block() {
        return Ok(ExtendedAttributesView::default());
    }
    let bytes = store.get(&attrs_key).await?;
    codec
        .decode_extended_attributes(&bytes)
        .map_err(|e| anyhow::anyhow!(e))
}

/// Publishes `view`, returning the empty-block key for an empty set rather
/// than writing a block that would just decode back to nothing.
pub async fn publish(
    view: &ExtendedAttributesView,
    store: &dyn DataStore,
    codec: &dyn Codec,
) -> anyhow::Result<ObjectKey> {
    if view.entries.is_empty() {
        return Ok(ObjectKey::empty_block());
    }
    let bytes = codec
        .encode_extended_attributes(view)
        .map_err(|e| anyhow::anyhow!(e))?;
    store.set(&bytes).await
}

/// `getxattr`: resolves `name` against the virtual attribute first, then
/// the real attribute set.
pub async fn get(
    name: &str,
    attrs_key: ObjectKey,
    virtual_key: ObjectKey,
    virtual_type: ObjectType,
    virtual_size: u64,
    store: &dyn DataStore,
    codec: &dyn Codec,
) -> anyhow::Result<Option<Vec<u8>>> {
    if name == VIRTUAL_KEY_ATTR {
        return Ok(Some(encode_key_attr(virtual_key, virtual_type, virtual_size)));
    }
    let view = load(attrs_key, store, codec).await?;
    Ok(view.get(name).map(|v| v.to_vec()))
}

/// `listxattr`: the virtual attribute is always present, alongside whatever
/// real attributes are set.
pub async fn list(
    attrs_key: ObjectKey,
    store: &dyn DataStore,
    codec: &dyn Codec,
) -> anyhow::Result<Vec<String>> {
    let view = load(attrs_key, store, codec).await?;
    let mut names: Vec<String> = view.names().map(|n| n.to_string()).collect();
    names.push(VIRTUAL_KEY_ATTR.to_string());
    Ok(names)
}

/// `setxattr`: fails `EPERM` against the virtual attribute; otherwise
/// updates the set and publishes a new attributes block.
pub async fn set(
    name: &str,
    value: Vec<u8>,
    attrs_key: ObjectKey,
    store: &dyn DataStore,
    codec: &dyn Codec,
) -> Result<ObjectKey, QfsError> {
    if name == VIRTUAL_KEY_ATTR {
        return Err(QfsError::permission(format!("{VIRTUAL_KEY_ATTR} is read-only")));
    }
    let mut view = load(attrs_key, store, codec)
        .await
        .map_err(QfsError::Backend)?;
    view.set(name, value);
    publish(&view, store, codec).await.map_err(QfsError::Backend)
}

/// `removexattr`: fails `EPERM` against the virtual attribute, `ENOENT` (as
/// `NotFound`) if the name is not set.
pub async fn remove(
    name: &str,
    attrs_key: ObjectKey,
    store: &dyn DataStore,
    codec: &dyn Codec,
) -> Result<ObjectKey, QfsError> {
    if name == VIRTUAL_KEY_ATTR {
        return Err(QfsError::permission(format!("{VIRTUAL_KEY_ATTR} is read-only")));
    }
    let mut view = load(attrs_key, store, codec)
        .await
        .map_err(QfsError::Backend)?;
    if !view.remove(name) {
        return Err(QfsError::not_found(name));
    }
    publish(&view, store, codec).await.map_err(QfsError::Backend)
}
