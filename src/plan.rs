//! turning selected diff entries into one commit on the target branch
//!
//! a plan moves references, not bytes: content whose address the remote
//! already knows (from the source or target snapshot) is referenced directly,
//! and only content with no remote address yet, such as files from an
//! uploaded archive, is uploaded as new blobs.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded::map_limit;
use crate::diff::{DiffEngine, DiffEntry, DiffStatus, Source};
use crate::error::{CommitStep, Error, Result};
use crate::hash::ObjectId;
use crate::path::PathKey;
use crate::remote::{EntryMode, NewTreeEntry};
use crate::snapshot::{RefState, SnapshotEntry};

/// one path of the new tree; `address: None` deletes the path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub path: PathKey,
    pub mode: EntryMode,
    pub address: Option<ObjectId>,
}

impl PlanEntry {
    pub fn is_tombstone(&self) -> bool {
        self.address.is_none()
    }
}

/// what a commit will write
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPlan {
    pub target_ref: String,
    /// current target commit, the new commit's parent; `None` creates the branch
    pub base_commit: Option<ObjectId>,
    pub base_tree: Option<ObjectId>,
    pub entries: Vec<PlanEntry>,
    pub message: String,
}

/// bytes that must be uploaded before the tree can be created
#[derive(Clone, Debug)]
pub struct PendingUpload {
    /// index into `CommitPlan::entries`
    pub entry: usize,
    pub address: ObjectId,
    pub content: Bytes,
}

/// a plan whose reads are done and whose writes have not started
#[derive(Clone, Debug)]
pub struct PreparedPlan {
    pub plan: CommitPlan,
    pub uploads: Vec<PendingUpload>,
    /// selected entries dropped because the target already has them
    pub skipped: usize,
    /// entries referencing content the remote already stores
    pub reused: usize,
    source_ref: Option<String>,
}

/// result of a completed commit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub commit: ObjectId,
    pub updated_ref: String,
    pub created_ref: bool,
    pub parent: Option<ObjectId>,
    pub tree: ObjectId,
    pub blobs_uploaded: usize,
    pub reused: usize,
    pub tombstones: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// every selected entry was already present in the target; nothing written
    NoOp { skipped: usize },
    Committed(CommitResult),
}

impl CommitOutcome {
    pub fn is_noop(&self) -> bool {
        matches!(self, CommitOutcome::NoOp { .. })
    }
}

#[derive(Clone, Debug)]
pub struct PlanOptions {
    /// drop entries whose texts only differ by formatting noise
    pub skip_identical_after_normalization: bool,
    /// target state the selection was compared against; a target found
    /// anywhere else is a conflict
    pub expected_target: Option<RefState>,
    pub cancel: Option<CancellationToken>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            skip_identical_after_normalization: true,
            expected_target: None,
            cancel: None,
        }
    }
}

/// builds and executes commit plans
pub struct SyncPlanner {
    diff: Arc<DiffEngine>,
}

impl SyncPlanner {
    pub fn new(diff: Arc<DiffEngine>) -> Self {
        Self { diff }
    }

    /// plan and, unless it is a no-op, execute a commit of `selected` onto `target`
    pub async fn plan(
        &self,
        target: &str,
        source: &Source,
        selected: &[DiffEntry],
        message: &str,
        options: &PlanOptions,
    ) -> Result<CommitOutcome> {
        match self.prepare(target, source, selected, message, options).await? {
            None => Ok(CommitOutcome::NoOp {
                skipped: selected.len(),
            }),
            Some(prepared) => {
                let result = self.execute(prepared, options.cancel.clone()).await?;
                Ok(CommitOutcome::Committed(result))
            }
        }
    }

    /// decide what to write, reading only; `None` when nothing would change
    ///
    /// every selected entry must still find the target content it was
    /// classified against, and the target must be at `expected_target` when
    /// one is given. anything else is a conflict: the caller re-diffs instead
    /// of overwriting work it never saw. a branch that moves after this read
    /// fails the final ref update the same way.
    pub async fn prepare(
        &self,
        target: &str,
        source: &Source,
        selected: &[DiffEntry],
        message: &str,
        options: &PlanOptions,
    ) -> Result<Option<PreparedPlan>> {
        let snapshots = self.diff.snapshots();
        let target_snap = snapshots.get_snapshot(target).await?;
        if let Some(expected) = options.expected_target {
            if target_snap.state != expected {
                return Err(Error::Conflict {
                    branch: target.to_string(),
                    expected: describe_state(&expected),
                    message: format!("now at {}", describe_state(&target_snap.state)),
                });
            }
        }
        let source_snap = match source {
            Source::Ref(name) => Some(snapshots.get_snapshot(name).await?),
            Source::Archive(_) => None,
        };
        let known_remotely = |address: &ObjectId| {
            target_snap.contains_address(address)
                || source_snap
                    .as_ref()
                    .map(|s| s.contains_address(address))
                    .unwrap_or(false)
        };

        let mut entries = Vec::new();
        let mut uploads = Vec::new();
        let mut skipped = 0;
        let mut reused = 0;

        for entry in selected {
            let current = target_snap.get(&entry.path);

            if entry.status == DiffStatus::Same
                && (options.skip_identical_after_normalization || !entry.is_identical_after_normalization())
            {
                skipped += 1;
                continue;
            }

            if entry.status == DiffStatus::Removed {
                match current {
                    Some(existing) => {
                        ensure_unchanged(target, entry, current)?;
                        entries.push(PlanEntry {
                            path: entry.path.clone(),
                            mode: existing.mode,
                            address: None,
                        })
                    }
                    None => skipped += 1,
                }
                continue;
            }

            let address = match entry.source_address {
                Some(address) => address,
                None => {
                    return Err(Error::MissingContent(format!(
                        "{} has no source content",
                        entry.path
                    )))
                }
            };

            if current.map(|c| c.address) == Some(address) {
                skipped += 1;
                continue;
            }
            ensure_unchanged(target, entry, current)?;

            let mode = current.map(|c| c.mode).unwrap_or(entry.mode);
            let index = entries.len();
            entries.push(PlanEntry {
                path: entry.path.clone(),
                mode,
                address: Some(address),
            });

            if known_remotely(&address) {
                reused += 1;
                continue;
            }

            let content = match &entry.content {
                Some(content) => content.clone(),
                None => self.diff.source_bytes(source, &entry.path, Some(address)).await?,
            };
            uploads.push(PendingUpload {
                entry: index,
                address,
                content,
            });
        }

        if entries.is_empty() {
            info!(target, skipped, "plan is a no-op");
            return Ok(None);
        }

        debug!(
            target,
            entries = entries.len(),
            uploads = uploads.len(),
            reused,
            skipped,
            "plan prepared"
        );
        Ok(Some(PreparedPlan {
            plan: CommitPlan {
                target_ref: target.to_string(),
                base_commit: target_snap.commit(),
                base_tree: target_snap.tree(),
                entries,
                message: message.to_string(),
            },
            uploads,
            skipped,
            reused,
            source_ref: source.as_ref_name().map(str::to_string),
        }))
    }

    /// write blobs, tree, commit and ref for a prepared plan
    ///
    /// blob uploads run concurrently; the remaining steps are sequential. a
    /// failure names its step and whatever was already created remotely. a
    /// ref that moved is reported as a conflict and never retried.
    pub async fn execute(&self, prepared: PreparedPlan, cancel: Option<CancellationToken>) -> Result<CommitResult> {
        let store = self.diff.snapshots().object_store().clone();
        let PreparedPlan {
            plan,
            uploads,
            reused,
            source_ref,
            ..
        } = prepared;
        let target = plan.target_ref.as_str();

        let blobs_uploaded = uploads.len();
        let options = self.diff.map_options(cancel.clone());
        let results = map_limit(uploads, self.diff.concurrency(), &options, |_, upload: PendingUpload| {
            let store = store.clone();
            async move {
                let created = store.create_blob(upload.content).await?;
                if created != upload.address {
                    return Err(Error::network(format!(
                        "remote stored {} as {}",
                        upload.address, created
                    )));
                }
                Ok(created)
            }
        })
        .await;

        let uploaded = results.iter().filter(|r| r.is_ok()).count();
        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            if matches!(err, Error::Cancelled) {
                return Err(err);
            }
            return Err(err.at_step(
                CommitStep::UploadBlobs,
                Some(format!("{} of {} blobs", uploaded, blobs_uploaded)),
            ));
        }

        if cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
            return Err(Error::Cancelled);
        }

        let tree_entries: Vec<NewTreeEntry> = plan
            .entries
            .iter()
            .map(|e| NewTreeEntry {
                path: e.path.clone(),
                mode: e.mode,
                address: e.address,
            })
            .collect();
        let tombstones = tree_entries.iter().filter(|e| e.is_tombstone()).count();

        let tree = store
            .create_tree(plan.base_tree.as_ref(), &tree_entries)
            .await
            .map_err(|e| e.at_step(CommitStep::CreateTree, None))?;

        let parents: Vec<ObjectId> = plan.base_commit.into_iter().collect();
        let commit = store
            .create_commit(&plan.message, &tree, &parents)
            .await
            .map_err(|e| e.at_step(CommitStep::CreateCommit, Some(format!("tree {}", tree))))?;

        let partial = Some(format!("tree {}, commit {}", tree, commit));
        let ref_result = match plan.base_commit {
            Some(parent) => store
                .update_ref(target, &commit, &parent)
                .await
                .map_err(|e| e.at_step(CommitStep::UpdateRef, partial)),
            None => store
                .create_ref(target, &commit)
                .await
                .map_err(|e| e.at_step(CommitStep::CreateRef, partial)),
        };

        let snapshots = self.diff.snapshots();
        if let Err(e) = ref_result {
            if e.is_conflict() {
                warn!(target, commit = %commit.short(), "target moved, commit left unreferenced");
                snapshots.invalidate(target).await;
            }
            return Err(e);
        }

        snapshots.invalidate(target).await;
        if let Some(source_ref) = &source_ref {
            snapshots.invalidate(source_ref).await;
        }

        info!(
            target,
            commit = %commit.short(),
            entries = plan.entries.len(),
            blobs_uploaded,
            reused,
            tombstones,
            "commit written"
        );

        Ok(CommitResult {
            commit,
            updated_ref: target.to_string(),
            created_ref: plan.base_commit.is_none(),
            parent: plan.base_commit,
            tree,
            blobs_uploaded,
            reused,
            tombstones,
        })
    }
}

/// the target still holds what `entry` was classified against
fn ensure_unchanged(target: &str, entry: &DiffEntry, current: Option<&SnapshotEntry>) -> Result<()> {
    let found = current.map(|c| c.address);
    if found == entry.target_address {
        return Ok(());
    }
    let show = |address: Option<ObjectId>| match address {
        Some(address) => address.short(),
        None => "absent".to_string(),
    };
    Err(Error::Conflict {
        branch: target.to_string(),
        expected: format!("{} {}", entry.path, show(entry.target_address)),
        message: format!("{} is now {}", entry.path, show(found)),
    })
}

fn describe_state(state: &RefState) -> String {
    match state {
        RefState::Present { commit, .. } => commit.short(),
        RefState::Absent => "no branch".to_string(),
    }
}
