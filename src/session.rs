//! last comparison persisted between command line invocations
//!
//! stored as CBOR so later `show`, `inspect`, `sync` and `export` calls act on
//! exactly the entries the user saw.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveSource;
use crate::diff::{DiffEntry, Source};
use crate::error::{Error, IoResultExt, Result};
use crate::path::PathFilter;
use crate::snapshot::{unix_now, RefState};

const SESSION_FILE: &str = "session.cbor";

/// how to rebuild the source of a stored comparison
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionSource {
    Ref(String),
    /// archive file or directory, re-read on load
    Archive(PathBuf),
}

impl SessionSource {
    pub fn label(&self) -> String {
        match self {
            SessionSource::Ref(name) => name.clone(),
            SessionSource::Archive(path) => path.display().to_string(),
        }
    }

    /// materialize the comparison source
    pub fn open(&self, filter: &PathFilter) -> Result<Source> {
        match self {
            SessionSource::Ref(name) => Ok(Source::Ref(name.clone())),
            SessionSource::Archive(path) => Ok(Source::Archive(Arc::new(ArchiveSource::from_path(
                path, filter,
            )?))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub repository: String,
    pub source: SessionSource,
    pub target: String,
    pub include_removed: bool,
    pub entries: Vec<DiffEntry>,
    /// where the target was when the entries were classified
    #[serde(default)]
    pub target_state: Option<RefState>,
    pub created_at: i64,
}

impl Session {
    pub fn new(
        repository: impl Into<String>,
        source: SessionSource,
        target: impl Into<String>,
        include_removed: bool,
        entries: Vec<DiffEntry>,
    ) -> Self {
        Self {
            repository: repository.into(),
            source,
            target: target.into(),
            include_removed,
            entries,
            target_state: None,
            created_at: unix_now(),
        }
    }

    pub fn with_target_state(mut self, state: RefState) -> Self {
        self.target_state = Some(state);
        self
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(SESSION_FILE)
    }

    /// write the session under `dir`, replacing any previous one atomically
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_path(dir)?;

        let mut data = Vec::new();
        ciborium::into_writer(self, &mut data)?;

        let path = Self::path_in(dir);
        let tmp_path = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(&data).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }
        fs::rename(&tmp_path, &path).with_path(&path)?;
        Ok(())
    }

    /// load the session stored under `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::PathNotFound(format!(
                    "{} (run `compare` first)",
                    path.display()
                )))
            }
            Err(e) => return Err(Error::Io { path, source: e }),
        };
        let session: Session = ciborium::from_reader(&data[..])?;
        Ok(session)
    }
}
