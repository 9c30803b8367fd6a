//! `Buffer`: an owned, size-capped byte vector carrying a lazily-computed
//! content-addressed key.

use thiserror::Error;

use super::object_key::{KeyType, ObjectKey};

/// Errors raised by `Buffer` mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer would grow to {requested} bytes, exceeding the {limit}-byte block cap")]
    Overlarge { requested: usize, limit: usize },
}

/// Owned byte vector capped at a configured maximum block size. Mutating
/// the bytes invalidates the cached key; computing the key, if dirty,
/// hashes the current bytes and marks the buffer clean.
#[derive(Debug, Clone)]
pub struct Buffer {
    bytes: Vec<u8>,
    key_type: KeyType,
    max_block_size: usize,
    cached_key: Option<ObjectKey>,
    dirty: bool,
}

impl Buffer {
    pub fn new(key_type: KeyType, max_block_size: usize) -> Self {
        Buffer {
            bytes: Vec::new(),
            key_type,
            max_block_size,
            cached_key: None,
            dirty: true,
        }
    }

    pub fn from_bytes(key_type: KeyType, max_block_size: usize, bytes: Vec<u8>) -> Self {
        Buffer {
            bytes,
            key_type,
            max_block_size,
            cached_key: None,
            dirty: true,
        }
    }

    /// Constructs a buffer whose key is already known (e.g. freshly read
    /// from the backend), so `key()` need not re-hash before returning it.
    pub fn published(key_type: KeyType, max_block_size: usize, bytes: Vec<u8>, key: ObjectKey) -> Self {
        Buffer {
            bytes,
            key_type,
            max_block_size,
            cached_key: Some(key),
            dirty: false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes `src` starting at `offset`, extending the buffer with zeros
    /// as needed but never past `max_block_size`.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> Result<usize, BufferError> {
        let end = offset
            .checked_add(src.len())
            .ok_or(BufferError::Overlarge {
                requested: usize::MAX,
                limit: self.max_block_size,
            })?;
        if end > self.max_block_size {
            return Err(BufferError::Overlarge {
                requested: end,
                limit: self.max_block_size,
            });
        }
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[offset..end].copy_from_slice(src);
        self.dirty = true;
        self.cached_key = None;
        Ok(src.len())
    }

    /// Reads into `dst` starting at `offset`. Returns the number of bytes
    /// actually copied (0 if `offset` is at or past the end).
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= self.bytes.len() {
            return 0;
        }
        let n = dst.len().min(self.bytes.len() - offset);
        dst[..n].copy_from_slice(&self.bytes[offset..offset + n]);
        n
    }

    /// Truncates or zero-extends to exactly `n` bytes.
    pub fn set_size(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.max_block_size {
            return Err(BufferError::Overlarge {
                requested: n,
                limit: self.max_block_size,
            });
        }
        self.bytes.resize(n, 0);
        self.dirty = true;
        self.cached_key = None;
        Ok(())
    }

    /// Hashes the current bytes without publishing or caching the result.
    pub fn content_hash(&self) -> ObjectKey {
        ObjectKey::from_content(self.key_type, &self.bytes)
    }

    /// Returns the cached key if clean; otherwise hashes the current
    /// bytes, caches the result, clears the dirty flag, and returns it.
    /// Does not itself talk to the backend -- callers that need the bytes
    /// durably stored call `DataStore::set` with `as_slice()` first and
    /// pass the returned key to [`Buffer::adopt_published_key`].
    pub fn key(&mut self) -> ObjectKey {
        if let Some(key) = self.cached_key {
            if !self.dirty {
                return key;
            }
        }
        let key = self.content_hash();
        self.cached_key = Some(key);
        self.dirty = false;
        key
    }

    /// Marks the buffer clean and caches `key`, used after a successful
    /// `DataStore::set` whose returned key may differ in type tag from a
    /// locally-hashed guess (e.g. the constant store short-circuit).
    pub fn adopt_published_key(&mut self, key: ObjectKey) {
        self.cached_key = Some(key);
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> Buffer {
        Buffer::new(KeyType::Data, 64)
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut b = buf();
        b.write(0, b"TestString").unwrap();
        let mut out = [0u8; 10];
        assert_eq!(b.read(0, &mut out), 10);
        assert_eq!(&out, b"TestString");
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let mut b = buf();
        b.write(4, b"hi").unwrap();
        let mut out = [0u8; 6];
        b.read(0, &mut out);
        assert_eq!(&out, b"\0\0\0\0hi");
    }

    #[test]
    fn overlarge_write_is_rejected() {
        let mut b = buf();
        let big = vec![0u8; 100];
        assert!(matches!(
            b.write(0, &big),
            Err(BufferError::Overlarge { .. })
        ));
    }

    #[test]
    fn set_size_truncates_and_extends() {
        let mut b = buf();
        b.write(0, b"TestString").unwrap();
        b.set_size(4).unwrap();
        let mut out = [0u8; 4];
        b.read(0, &mut out);
        assert_eq!(&out, b"Test");

        b.set_size(8).unwrap();
        let mut out = [0u8; 8];
        b.read(0, &mut out);
        assert_eq!(&out, b"Test\0\0\0\0");
    }

    #[test]
    fn key_is_cached_until_dirtied() {
        let mut b = buf();
        b.write(0, b"abc").unwrap();
        let k1 = b.key();
        assert!(!b.is_dirty());
        let k2 = b.key();
        assert_eq!(k1, k2);

        b.write(0, b"xyz").unwrap();
        assert!(b.is_dirty());
        let k3 = b.key();
        assert_ne!(k1, k3);
    }
}
