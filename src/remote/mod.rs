//! remote object store the engine drives
//!
//! the engine never talks HTTP directly: everything goes through [`ObjectStore`].
//! [`github::GitHubStore`] implements it over the GitHub git-data API and
//! [`memory::MemoryStore`] keeps a complete git object store in process.

pub mod github;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::path::PathKey;

/// repository identity, `owner/name`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// parse `owner/name`
    pub fn parse(full_name: &str) -> Result<Self> {
        match full_name.trim().split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(Error::InvalidRef(format!(
                "repository must be owner/name: {}",
                full_name
            ))),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// opaque credential attached to every remote call
///
/// the engine only uses it; acquiring and refreshing it is the caller's job.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// branch name and the commit it points at
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub tip: ObjectId,
}

/// git file mode of a tree entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryMode {
    Blob,
    Executable,
    Symlink,
    Tree,
    Submodule,
}

impl EntryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryMode::Blob => "100644",
            EntryMode::Executable => "100755",
            EntryMode::Symlink => "120000",
            EntryMode::Tree => "040000",
            EntryMode::Submodule => "160000",
        }
    }

    /// parse the octal form used by git and the REST api
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "100644" | "100664" => Ok(EntryMode::Blob),
            "100755" => Ok(EntryMode::Executable),
            "120000" => Ok(EntryMode::Symlink),
            "040000" | "40000" => Ok(EntryMode::Tree),
            "160000" => Ok(EntryMode::Submodule),
            other => Err(Error::InvalidPath(format!("unknown file mode {}", other))),
        }
    }

    /// entry points at blob content (file or symlink)
    pub fn is_blob(&self) -> bool {
        matches!(self, EntryMode::Blob | EntryMode::Executable | EntryMode::Symlink)
    }
}

impl fmt::Display for EntryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// one row of a (possibly recursive) tree listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTreeEntry {
    pub path: String,
    pub address: ObjectId,
    pub mode: EntryMode,
    pub size: Option<u64>,
}

/// tree listing plus whether the remote cut it short
#[derive(Clone, Debug, Default)]
pub struct TreeListing {
    pub entries: Vec<RemoteTreeEntry>,
    pub truncated: bool,
}

/// commit metadata needed to layer a new tree on top
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: ObjectId,
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
}

/// entry of a tree to create; `address: None` deletes the path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTreeEntry {
    pub path: PathKey,
    pub mode: EntryMode,
    pub address: Option<ObjectId>,
}

impl NewTreeEntry {
    pub fn is_tombstone(&self) -> bool {
        self.address.is_none()
    }
}

/// status reported by the remote compare endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Modified,
    Removed,
    Renamed,
    Other(String),
}

impl ChangeStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "added" => ChangeStatus::Added,
            "modified" | "changed" => ChangeStatus::Modified,
            "removed" => ChangeStatus::Removed,
            "renamed" => ChangeStatus::Renamed,
            other => ChangeStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeStatus::Added => write!(f, "A"),
            ChangeStatus::Modified => write!(f, "M"),
            ChangeStatus::Removed => write!(f, "D"),
            ChangeStatus::Renamed => write!(f, "R"),
            ChangeStatus::Other(s) => write!(f, "?{}", s),
        }
    }
}

/// advisory entry from `compare_refs`; never authoritative
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedPath {
    pub path: String,
    pub status: ChangeStatus,
}

/// the remote object store the engine reads snapshots from and writes commits to
///
/// a store is bound to one repository and one credential.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// repository this store talks to
    fn repository(&self) -> &RepoId;

    async fn list_branches(&self) -> Result<Vec<BranchInfo>>;

    /// commit a branch points at, `None` when the branch does not exist
    async fn get_ref(&self, branch: &str) -> Result<Option<ObjectId>>;

    async fn get_commit(&self, commit: &ObjectId) -> Result<CommitInfo>;

    /// list a tree by sha (or by ref name), optionally recursing into subtrees
    async fn get_tree(&self, tree_or_ref: &str, recursive: bool) -> Result<TreeListing>;

    async fn get_blob(&self, address: &ObjectId) -> Result<Bytes>;

    /// convenience read of one path at a ref
    async fn get_file_at(&self, path: &PathKey, reference: &str) -> Result<Bytes>;

    async fn create_blob(&self, content: Bytes) -> Result<ObjectId>;

    /// create a tree layered on `base`; tombstones delete paths from it
    async fn create_tree(&self, base: Option<&ObjectId>, entries: &[NewTreeEntry]) -> Result<ObjectId>;

    async fn create_commit(&self, message: &str, tree: &ObjectId, parents: &[ObjectId]) -> Result<ObjectId>;

    /// create a new branch; `Error::Conflict` if it already exists
    async fn create_ref(&self, branch: &str, commit: &ObjectId) -> Result<()>;

    /// move a branch; `Error::Conflict` if it is no longer at `expected`
    async fn update_ref(&self, branch: &str, commit: &ObjectId, expected: &ObjectId) -> Result<()>;

    /// changed paths between two refs, as reported by the remote
    async fn compare_refs(&self, base: &str, head: &str) -> Result<Vec<ChangedPath>>;
}

/// validate a branch name before it is sent anywhere
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef("empty branch name".to_string()));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidRef(format!(
            "branch name cannot start or end with '/': {}",
            name
        )));
    }

    if name.contains("//") || name.contains("..") {
        return Err(Error::InvalidRef(format!(
            "branch name cannot contain '//' or '..': {}",
            name
        )));
    }

    if name
        .chars()
        .any(|c| c.is_control() || c == ' ' || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(Error::InvalidRef(format!(
            "branch name contains a forbidden character: {}",
            name
        )));
    }

    if name.ends_with(".lock") || name.ends_with('.') || name == "@" {
        return Err(Error::InvalidRef(format!("reserved branch name: {}", name)));
    }

    for component in name.split('/') {
        if component.starts_with('.') {
            return Err(Error::InvalidRef(format!(
                "branch name component cannot start with '.': {}",
                name
            )));
        }
    }

    Ok(())
}
