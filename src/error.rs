use std::fmt;
use std::path::PathBuf;

use crate::hash::ObjectId;

/// remote write step that failed while building a commit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStep {
    UploadBlobs,
    CreateTree,
    CreateCommit,
    UpdateRef,
    CreateRef,
}

impl fmt::Display for CommitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitStep::UploadBlobs => "upload blobs",
            CommitStep::CreateTree => "create tree",
            CommitStep::CreateCommit => "create commit",
            CommitStep::UpdateRef => "update ref",
            CommitStep::CreateRef => "create ref",
        };
        f.write_str(name)
    }
}

/// error type for treesync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("remote call timed out: {operation}")]
    Timeout { operation: String },

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("rate limited by remote{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<u64> },

    #[error("target moved: {branch} is no longer at {expected} ({message}); re-diff before retrying")]
    Conflict {
        branch: String,
        expected: String,
        message: String,
    },

    #[error("content of {path} is not text: {reason}")]
    Encoding { path: String, reason: String },

    #[error("archive parse error: {0}")]
    ArchiveParse(String),

    #[error("archive write error: {0}")]
    ArchiveWrite(String),

    #[error("remote tree listing for {0} was truncated")]
    TruncatedTree(String),

    #[error("commit failed at step '{step}'{}: {source}", partial_hint(.partial))]
    CommitStep {
        step: CommitStep,
        /// remote objects already created before the failure
        partial: Option<String>,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("no content available for {0}")]
    MissingContent(String),

    #[error("no credential supplied for {0}")]
    MissingCredential(String),

    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    }
}

fn partial_hint(partial: &Option<String>) -> String {
    match partial {
        Some(created) => format!(" (already created: {})", created),
        None => String::new(),
    }
}

impl Error {
    /// build a network error from anything displayable
    pub fn network(message: impl fmt::Display) -> Self {
        Error::Network {
            message: message.to_string(),
        }
    }

    /// wrap an error with the commit step it happened in
    pub fn at_step(self, step: CommitStep, partial: Option<String>) -> Self {
        Error::CommitStep {
            step,
            partial,
            source: Box::new(self),
        }
    }

    /// ref, object or path is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::RefNotFound(_) | Error::ObjectNotFound(_) | Error::PathNotFound(_)
        )
    }

    /// failure that may succeed when retried later with the same inputs
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network { .. } | Error::Timeout { .. } | Error::RateLimited { .. }
        )
    }

    /// ref moved underneath us, possibly nested in a commit step
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::CommitStep { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
