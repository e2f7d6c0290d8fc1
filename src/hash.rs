use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

use crate::Error;

/// SHA-1 object id in git's native format (blob, tree and commit addresses)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// zero id (useful as sentinel)
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    /// create from raw bytes
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// parse from hex string
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidObjectId(s.to_string()))?;
        if bytes.len() != 20 {
            return Err(Error::InvalidObjectId(s.to_string()));
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// get raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// abbreviated hex form for display
    pub fn short(&self) -> String {
        self.to_hex()[..7].to_string()
    }

    /// split into path components for an on-disk object store
    /// returns (first 2 hex chars, remaining 38 hex chars)
    pub fn to_path_components(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..12])
    }
}

impl std::str::FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// compute the git blob address of raw bytes
///
/// format: sha1("blob " + decimal length + NUL + bytes)
///
/// always hash the exact bytes that are (or would be) stored remotely.
/// normalized text must never be fed through here, or local addresses stop
/// matching the addresses the remote store reports for the same file.
pub fn compute_blob_hash(content: &[u8]) -> ObjectId {
    let mut hasher = BlobHasher::new(content.len() as u64);
    hasher.update(content);
    hasher.finalize()
}

/// compute the address of a git object of any kind over its serialized body
pub fn compute_object_hash(kind: &str, body: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", kind, body.len()).as_bytes());
    hasher.update(body);
    ObjectId(hasher.finalize().into())
}

/// streaming blob hasher for content whose length is known up front
pub struct BlobHasher {
    hasher: Sha1,
}

impl BlobHasher {
    /// create new hasher, writing the object header immediately
    pub fn new(len: u64) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("blob {}\0", len).as_bytes());
        Self { hasher }
    }

    /// feed content bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// finalize and return the id
    pub fn finalize(self) -> ObjectId {
        ObjectId(self.hasher.finalize().into())
    }
}

/// pluggable content addressing
///
/// implementations must reproduce the backing store's algorithm exactly.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> ObjectId;
}

/// git blob hashing (SHA-1 object format)
#[derive(Clone, Copy, Debug, Default)]
pub struct GitBlobHasher;

impl ContentHasher for GitBlobHasher {
    fn hash(&self, bytes: &[u8]) -> ObjectId {
        compute_blob_hash(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_blob_reference_digest() {
        let h = compute_blob_hash(b"");
        assert_eq!(h.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_hello_blob_matches_git() {
        // `printf 'hello\n' | git hash-object --stdin`
        let h = compute_blob_hash(b"hello\n");
        assert_eq!(h.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn test_empty_tree_digest() {
        let h = compute_object_hash("tree", b"");
        assert_eq!(h.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn test_hash_is_over_raw_bytes() {
        // CRLF vs LF are different content addresses
        let lf = compute_blob_hash(b"<a/>\n");
        let crlf = compute_blob_hash(b"<a/>\r\n");
        assert_ne!(lf, crlf);
    }

    #[test]
    fn test_streaming_hasher() {
        let direct = compute_blob_hash(b"helloworld");

        let mut streaming = BlobHasher::new(10);
        streaming.update(b"hello");
        streaming.update(b"world");

        assert_eq!(direct, streaming.finalize());
    }

    #[test]
    fn test_content_hasher_trait() {
        let hasher: &dyn ContentHasher = &GitBlobHasher;
        assert_eq!(hasher.hash(b"abc"), compute_blob_hash(b"abc"));
    }

    #[test]
    fn test_invalid_hex() {
        assert!(ObjectId::from_hex("not valid hex").is_err());
        assert!(ObjectId::from_hex("abcd").is_err());
        assert!(ObjectId::from_hex(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_short_and_path_components() {
        let h = ObjectId::from_hex("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391").unwrap();
        assert_eq!(h.short(), "e69de29");
        let (dir, file) = h.to_path_components();
        assert_eq!(dir, "e6");
        assert_eq!(file.len(), 38);
    }

    #[test]
    fn test_object_id_serde_json() {
        let h = compute_blob_hash(b"x");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(h, parsed);
    }
}
