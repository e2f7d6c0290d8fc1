//! treesync - diff and sync engine for git-hosted file trees
//!
//! compares a source (a branch, or a locally supplied archive) against a target
//! branch of a remote repository and writes selected differences to the target
//! as a single new commit.
//!
//! # Core concepts
//!
//! - **Content address**: git blob id of the exact bytes, `SHA1("blob " + len + NUL + bytes)`
//! - **Snapshot**: path -> address map of one ref, cached per `(repository, ref)`
//! - **Diff**: directed classification of source paths against the target
//!   (`Added`, `Modified`, `Same`, opt-in `Removed`, `FetchError`)
//! - **Plan**: the minimal tree update for a selection; known content is
//!   referenced by address, only unknown content is uploaded
//!
//! hashing always runs over raw bytes. normalized text is only used to decide
//! whether two files are presented as different.
//!
//! # Example usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use treesync::{CompareOptions, Config, Credential, GitHubStore, PlanOptions, RepoId, Source, SyncEngine};
//!
//! # async fn run() -> treesync::Result<()> {
//! let config = Config::default();
//! let store = GitHubStore::new(
//!     &config.api_url,
//!     RepoId::parse("acme/configs")?,
//!     Credential::new("ghp_..."),
//!     config.request_timeout(),
//!     &config.user_agent,
//! )?;
//! let engine = SyncEngine::new(Arc::new(store), config)?;
//!
//! let source = Source::Ref("feature".to_string());
//! let entries = engine.compare(&source, "main", &CompareOptions::default()).await?;
//! let selected: Vec<_> = entries.into_iter().filter(|e| e.is_change()).collect();
//! engine.commit("main", &source, &selected, "sync from feature", &PlanOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod hash;

pub mod archive;
pub mod blob_cache;
pub mod bounded;
pub mod diff;
pub mod engine;
pub mod normalize;
pub mod path;
pub mod plan;
pub mod remote;
pub mod session;
pub mod snapshot;
pub mod tree_view;

pub use archive::{export_archive, export_file_name, ArchiveFile, ArchiveFormat, ArchiveSource, MAX_ENTRY_SIZE};
pub use blob_cache::BlobCache;
pub use bounded::{map_limit, MapOptions, DEFAULT_CONCURRENCY};
pub use config::Config;
pub use diff::{
    DiffEngine, DiffEntry, DiffNote, DiffOptions, DiffStatus, FileDetail, InspectReport, Source,
};
pub use engine::{CompareOptions, ExportSide, SyncEngine};
pub use error::{CommitStep, Error, IoResultExt, Result};
pub use hash::{compute_blob_hash, compute_object_hash, BlobHasher, ContentHasher, GitBlobHasher, ObjectId};
pub use normalize::{compare_normalized, normalize, LineNormalizer, TextComparison, TextNormalizer};
pub use path::{normalize_path, PathFilter, PathKey};
pub use plan::{CommitOutcome, CommitPlan, CommitResult, PlanEntry, PlanOptions, PreparedPlan, SyncPlanner};
pub use remote::github::GitHubStore;
pub use remote::memory::MemoryStore;
pub use remote::{
    BranchInfo, ChangeStatus, ChangedPath, Credential, EntryMode, NewTreeEntry, ObjectStore, RepoId,
};
pub use session::{Session, SessionSource};
pub use snapshot::{RefState, SnapshotEntry, SnapshotStore, TreeSnapshot};
pub use tree_view::{DiffSummary, FileLeaf, FileNode};
