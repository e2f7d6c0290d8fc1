//! on-disk cache of blob contents
//!
//! blob bytes never change for a given address, so entries are never
//! invalidated. each blob is stored zstd compressed at `objects/xx/yyyy...`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{compute_blob_hash, ObjectId};

const ZSTD_LEVEL: i32 = 3;

/// content-addressed blob cache rooted at a directory
#[derive(Clone, Debug)]
pub struct BlobCache {
    root: PathBuf,
}

impl BlobCache {
    /// open (creating if needed) a cache under `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects")).with_path(&root)?;
        fs::create_dir_all(root.join("tmp")).with_path(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, address: &ObjectId) -> PathBuf {
        let (dir, file) = address.to_path_components();
        self.root.join("objects").join(dir).join(file)
    }

    /// cached bytes for `address`
    ///
    /// entries whose content no longer hashes to their address are removed and
    /// reported as a miss.
    pub fn get(&self, address: &ObjectId) -> Result<Option<Bytes>> {
        let path = self.object_path(address);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io { path, source: e }),
        };

        let content = match zstd::decode_all(&compressed[..]) {
            Ok(content) => content,
            Err(e) => {
                warn!(address = %address, error = %e, "discarding undecodable cache entry");
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
        };

        if compute_blob_hash(&content) != *address {
            warn!(address = %address, "discarding corrupt cache entry");
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        debug!(address = %address.short(), "blob cache hit");
        Ok(Some(Bytes::from(content)))
    }

    /// store `content`, returning its address
    pub fn put(&self, content: &[u8]) -> Result<ObjectId> {
        let address = compute_blob_hash(content);
        let path = self.object_path(&address);
        if path.exists() {
            return Ok(address);
        }

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join("objects"));
        fs::create_dir_all(&dir).with_path(&dir)?;

        let compressed = zstd::encode_all(content, ZSTD_LEVEL).map_err(|e| Error::Io {
            path: PathBuf::from("<zstd>"),
            source: e,
        })?;

        // atomic write: temp -> fsync -> rename
        let tmp_path = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(&compressed).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, &path).with_path(&path)?;

        Ok(address)
    }

    pub fn contains(&self, address: &ObjectId) -> bool {
        self.object_path(address).exists()
    }
}
