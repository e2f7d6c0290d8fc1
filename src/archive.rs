//! local file sets: uploaded archives in, exported archives out

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{compute_blob_hash, ObjectId};
use crate::path::{PathFilter, PathKey};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: [u8; 4] = *b"PK\x05\x06";
const USTAR_MAGIC_OFFSET: usize = 257;

/// largest single file accepted from an archive
pub const MAX_ENTRY_SIZE: u64 = 100 * 1024 * 1024;

/// container written by `export_archive`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArchiveFormat {
    #[default]
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// one file of an archive, addressed locally
#[derive(Clone, Debug)]
pub struct ArchiveFile {
    pub path: PathKey,
    pub address: ObjectId,
    pub content: Bytes,
}

/// in-memory file set parsed once from an uploaded container
///
/// it has no backing ref and is never cached; it stands in for one side of a
/// comparison.
#[derive(Clone, Debug)]
pub struct ArchiveSource {
    label: String,
    files: Vec<ArchiveFile>,
    index: HashMap<PathKey, usize>,
}

impl ArchiveSource {
    /// build from `(path, bytes)` pairs, keeping tracked files only
    pub fn from_files<I>(label: impl Into<String>, files: I, filter: &PathFilter) -> Result<Self>
    where
        I: IntoIterator<Item = (PathKey, Bytes)>,
    {
        let mut source = Self {
            label: label.into(),
            files: Vec::new(),
            index: HashMap::new(),
        };
        for (path, content) in files {
            if filter.matches(&path) {
                source.push(path, content)?;
            }
        }
        Ok(source)
    }

    /// parse a zip, tar or gzip'd tar container, detected from its leading bytes
    pub fn from_bytes(label: impl Into<String>, data: &[u8], filter: &PathFilter) -> Result<Self> {
        let label = label.into();
        if data.starts_with(&ZIP_MAGIC) || data.starts_with(&ZIP_EMPTY_MAGIC) {
            debug!(label = %label, "reading zip archive");
            Self::from_zip(label, data, filter)
        } else if data.starts_with(&GZIP_MAGIC) {
            debug!(label = %label, "reading gzip'd tar archive");
            Self::from_tar(label, GzDecoder::new(data), filter)
        } else if is_tar(data) {
            debug!(label = %label, "reading tar archive");
            Self::from_tar(label, data, filter)
        } else {
            Err(Error::ArchiveParse(format!(
                "{}: not a zip, tar or tar.gz archive",
                label
            )))
        }
    }

    /// read an archive file from disk
    pub fn from_path(path: &Path, filter: &PathFilter) -> Result<Self> {
        if path.is_dir() {
            return Self::from_dir(path, filter);
        }
        let data = fs::read(path).with_path(path)?;
        Self::from_bytes(path.display().to_string(), &data, filter)
    }

    /// collect tracked files below a local directory
    pub fn from_dir(root: &Path, filter: &PathFilter) -> Result<Self> {
        let mut source = Self {
            label: root.display().to_string(),
            files: Vec::new(),
            index: HashMap::new(),
        };

        let walker = walkdir::WalkDir::new(root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()));
        for entry in walker {
            let entry = entry.map_err(|e| Error::ArchiveParse(format!("{}: {}", root.display(), e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::ArchiveParse(e.to_string()))?;
            let rel = rel
                .to_str()
                .ok_or_else(|| Error::ArchiveParse(format!("non utf-8 path: {}", rel.display())))?;
            let path = PathKey::new(rel)?;
            if !filter.matches(&path) {
                continue;
            }
            let content = fs::read(entry.path()).with_path(entry.path())?;
            source.push(path, Bytes::from(content))?;
        }

        info!(label = %source.label, files = source.len(), "directory loaded");
        Ok(source)
    }

    fn from_tar<R: Read>(label: String, reader: R, filter: &PathFilter) -> Result<Self> {
        let mut source = Self {
            label,
            files: Vec::new(),
            index: HashMap::new(),
        };
        let parse_err = |label: &str, e: std::io::Error| Error::ArchiveParse(format!("{}: {}", label, e));

        let mut archive = tar::Archive::new(reader);
        let entries = archive.entries().map_err(|e| parse_err(&source.label, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| parse_err(&source.label, e))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let raw = {
                let raw = entry.path().map_err(|e| parse_err(&source.label, e))?;
                raw.to_str()
                    .ok_or_else(|| Error::ArchiveParse(format!("non utf-8 path: {}", raw.display())))?
                    .to_string()
            };
            let path = PathKey::new(&raw).map_err(|e| Error::ArchiveParse(e.to_string()))?;
            if !filter.matches(&path) {
                continue;
            }

            let content = read_bounded(&source.label, &path, entry.size(), &mut entry)?;
            source.push(path, Bytes::from(content))?;
        }

        info!(label = %source.label, files = source.len(), "archive loaded");
        Ok(source)
    }

    fn from_zip(label: String, data: &[u8], filter: &PathFilter) -> Result<Self> {
        let mut source = Self {
            label,
            files: Vec::new(),
            index: HashMap::new(),
        };

        let mut archive = zip::ZipArchive::new(Cursor::new(data))
            .map_err(|e| Error::ArchiveParse(format!("{}: {}", source.label, e)))?;
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| Error::ArchiveParse(format!("{}: {}", source.label, e)))?;
            if file.is_dir() {
                continue;
            }

            let path = PathKey::new(file.name()).map_err(|e| Error::ArchiveParse(e.to_string()))?;
            if !filter.matches(&path) {
                continue;
            }

            let declared = file.size();
            let content = read_bounded(&source.label, &path, declared, &mut file)?;
            source.push(path, Bytes::from(content))?;
        }

        info!(label = %source.label, files = source.len(), "archive loaded");
        Ok(source)
    }

    fn push(&mut self, path: PathKey, content: Bytes) -> Result<()> {
        if self.index.contains_key(&path) {
            return Err(Error::ArchiveParse(format!(
                "{}: duplicate path {}",
                self.label, path
            )));
        }
        self.index.insert(path.clone(), self.files.len());
        self.files.push(ArchiveFile {
            address: compute_blob_hash(&content),
            path,
            content,
        });
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// files in container order
    pub fn files(&self) -> &[ArchiveFile] {
        &self.files
    }

    pub fn get(&self, path: &PathKey) -> Option<&ArchiveFile> {
        self.index.get(path).map(|&idx| &self.files[idx])
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// read one entry, refusing anything over `MAX_ENTRY_SIZE`
///
/// the declared size comes from an untrusted header, so it only gates the read
/// and never sizes an allocation.
fn read_bounded(label: &str, path: &PathKey, declared: u64, reader: &mut impl Read) -> Result<Vec<u8>> {
    let too_large = || {
        Error::ArchiveParse(format!(
            "{}: {} exceeds the {} byte entry limit",
            label, path, MAX_ENTRY_SIZE
        ))
    };
    if declared > MAX_ENTRY_SIZE {
        return Err(too_large());
    }

    let mut content = Vec::new();
    reader
        .take(MAX_ENTRY_SIZE + 1)
        .read_to_end(&mut content)
        .map_err(|e| Error::ArchiveParse(format!("{}: {}: {}", label, path, e)))?;
    if content.len() as u64 > MAX_ENTRY_SIZE {
        return Err(too_large());
    }
    Ok(content)
}

fn is_tar(data: &[u8]) -> bool {
    data.get(USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5) == Some(&b"ustar"[..])
}

/// produce a deterministic archive of `files`
///
/// entries are sorted by path and carry fixed metadata, so the same file set
/// always produces the same bytes.
pub fn export_archive(files: &[(PathKey, Bytes)], format: ArchiveFormat) -> Result<Vec<u8>> {
    let mut sorted: Vec<&(PathKey, Bytes)> = files.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(pair) = sorted.windows(2).find(|w| w[0].0 == w[1].0) {
        return Err(Error::InvalidPath(format!("duplicate export path {}", pair[0].0)));
    }

    match format {
        ArchiveFormat::Zip => write_zip(&sorted),
        ArchiveFormat::TarGz => write_tar_gz(&sorted),
    }
}

fn write_zip(files: &[&(PathKey, Bytes)]) -> Result<Vec<u8>> {
    let zip_err = |e: zip::result::ZipError| Error::ArchiveWrite(e.to_string());
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (path, content) in files {
        writer.start_file(path.as_str(), options).map_err(zip_err)?;
        writer
            .write_all(content)
            .map_err(|e| Error::ArchiveWrite(format!("{}: {}", path, e)))?;
    }
    Ok(writer.finish().map_err(zip_err)?.into_inner())
}

fn write_tar_gz(files: &[&(PathKey, Bytes)]) -> Result<Vec<u8>> {
    let tar_err = |e: std::io::Error| Error::Io {
        path: PathBuf::from("<tar>"),
        source: e,
    };

    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        builder
            .append_data(&mut header, path.as_str(), &content[..])
            .map_err(tar_err)?;
    }
    builder.finish().map_err(tar_err)?;
    let tar_bytes = builder.into_inner().map_err(tar_err)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).map_err(tar_err)?;
    encoder.finish().map_err(tar_err)
}

/// `export_<repo>_<source>_vs_<target>.<ext>`, with path separators flattened
pub fn export_file_name(repo: &str, source: &str, target: &str, format: ArchiveFormat) -> String {
    let clean = |s: &str| s.replace(['/', '\\', ' '], "-");
    format!(
        "export_{}_{}_vs_{}.{}",
        clean(repo),
        clean(source),
        clean(target),
        format.extension()
    )
}
