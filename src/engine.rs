//! one entry point wiring the snapshot cache, diff engine and planner together
//!
//! comparisons are keyed by `(repository, source, target)`. starting a new one
//! for a key cancels the one still running for it, so superseded work stops
//! holding fetch slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::{export_archive, ArchiveFormat};
use crate::blob_cache::BlobCache;
use crate::bounded::map_limit;
use crate::config::Config;
use crate::diff::{DiffEngine, DiffEntry, DiffOptions, DiffStatus, FileDetail, InspectReport, Source};
use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::path::{PathFilter, PathKey};
use crate::plan::{CommitOutcome, PlanOptions, SyncPlanner};
use crate::remote::{validate_branch_name, BranchInfo, ChangedPath, ObjectStore};
use crate::snapshot::{RefState, SnapshotStore};

/// which side of a comparison an export reads from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportSide {
    Source,
    Target,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CompareOptions {
    pub diff: DiffOptions,
    /// fetch and settle every `Modified` entry right away
    pub inspect_modified: bool,
}

type WorkflowKey = (String, String, String);

pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    config: Config,
    filter: PathFilter,
    diff: Arc<DiffEngine>,
    planner: SyncPlanner,
    in_flight: DashMap<WorkflowKey, (u64, CancellationToken)>,
    generation: AtomicU64,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: Config) -> Result<Self> {
        Self::build(store, config, None)
    }

    /// like [`SyncEngine::new`], with fetched blobs cached on disk
    pub fn with_blob_cache(store: Arc<dyn ObjectStore>, config: Config, cache: BlobCache) -> Result<Self> {
        Self::build(store, config, Some(cache))
    }

    fn build(store: Arc<dyn ObjectStore>, config: Config, cache: Option<BlobCache>) -> Result<Self> {
        let filter = config.path_filter()?;
        let snapshots = Arc::new(SnapshotStore::new(store.clone(), filter.clone()));

        let mut diff = DiffEngine::new(snapshots)
            .with_concurrency(config.concurrency)
            .with_timeout(config.request_timeout());
        if let Some(cache) = cache {
            diff = diff.with_blob_cache(cache);
        }
        let diff = Arc::new(diff);

        Ok(Self {
            store,
            config,
            filter,
            planner: SyncPlanner::new(diff.clone()),
            diff,
            in_flight: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        self.diff.snapshots()
    }

    pub fn diff_engine(&self) -> &Arc<DiffEngine> {
        &self.diff
    }

    fn key(&self, source: &Source, target: &str) -> WorkflowKey {
        (
            self.store.repository().full_name(),
            source.label().to_string(),
            target.to_string(),
        )
    }

    /// register a workflow for `key`, cancelling the one it supersedes
    fn begin(&self, key: &WorkflowKey) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.in_flight.insert(key.clone(), (generation, token.clone())) {
            debug!(source = %key.1, target = %key.2, "superseding running comparison");
            previous.cancel();
        }
        (generation, token)
    }

    fn finish(&self, key: &WorkflowKey, generation: u64) {
        self.in_flight.remove_if(key, |_, (current, _)| *current == generation);
    }

    /// classify `source` against `target`
    ///
    /// returns `Error::Cancelled` if a newer comparison for the same key
    /// started before this one finished.
    pub async fn compare(&self, source: &Source, target: &str, options: &CompareOptions) -> Result<Vec<DiffEntry>> {
        let key = self.key(source, target);
        let (generation, token) = self.begin(&key);

        let work = async {
            let mut entries = self.diff.diff(source, target, &options.diff).await?;
            if options.inspect_modified {
                self.diff
                    .inspect(
                        source,
                        &mut entries,
                        |e| e.status == DiffStatus::Modified,
                        Some(token.clone()),
                    )
                    .await?;
            }
            Ok(entries)
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = work => result,
        };
        self.finish(&key, generation);
        result
    }

    /// fetch contents for selected entries; supersedes like `compare`
    pub async fn inspect<F>(
        &self,
        source: &Source,
        target: &str,
        entries: &mut [DiffEntry],
        selector: F,
    ) -> Result<InspectReport>
    where
        F: Fn(&DiffEntry) -> bool,
    {
        let key = self.key(source, target);
        let (generation, token) = self.begin(&key);
        let result = self.diff.inspect(source, entries, selector, Some(token)).await;
        self.finish(&key, generation);
        result
    }

    /// state of `target` as the comparisons of this engine see it
    ///
    /// store it next to the entries and hand it back through
    /// `PlanOptions::expected_target` when committing them later.
    pub async fn target_state(&self, target: &str) -> Result<RefState> {
        Ok(self.snapshots().get_snapshot(target).await?.state)
    }

    pub async fn detail(&self, source: &Source, target: &str, entry: &DiffEntry) -> Result<FileDetail> {
        self.diff.detail(source, target, entry).await
    }

    /// commit the selected entries onto `target`
    pub async fn commit(
        &self,
        target: &str,
        source: &Source,
        selected: &[DiffEntry],
        message: &str,
        options: &PlanOptions,
    ) -> Result<CommitOutcome> {
        self.planner.plan(target, source, selected, message, options).await
    }

    /// package one side of the selected entries as a deterministic archive
    pub async fn export(
        &self,
        side: ExportSide,
        source: &Source,
        target: &str,
        selected: &[DiffEntry],
        format: ArchiveFormat,
    ) -> Result<Vec<u8>> {
        let wanted: Vec<PathKey> = selected
            .iter()
            .filter(|e| match side {
                ExportSide::Source => e.source_address.is_some(),
                ExportSide::Target => e.target_address.is_some(),
            })
            .map(|e| e.path.clone())
            .collect();

        let options = self.diff.map_options(None);
        let results = map_limit(wanted.clone(), self.config.concurrency, &options, |_, path: PathKey| async move {
            match (side, source) {
                (ExportSide::Source, Source::Archive(_)) => self.diff.source_bytes(source, &path, None).await,
                (ExportSide::Source, Source::Ref(name)) => self.store.get_file_at(&path, name).await,
                (ExportSide::Target, _) => self.store.get_file_at(&path, target).await,
            }
        })
        .await;

        let mut files: Vec<(PathKey, Bytes)> = Vec::with_capacity(wanted.len());
        for (path, result) in wanted.into_iter().zip(results) {
            files.push((path, result?));
        }

        info!(
            side = ?side,
            format = %format,
            files = files.len(),
            skipped = selected.len() - files.len(),
            "export collected"
        );
        export_archive(&files, format)
    }

    pub async fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        self.store.list_branches().await
    }

    /// create branch `name` at the tip of `from`
    pub async fn create_branch(&self, name: &str, from: &str) -> Result<ObjectId> {
        validate_branch_name(name)?;
        let tip = self
            .store
            .get_ref(from)
            .await?
            .ok_or_else(|| Error::RefNotFound(from.to_string()))?;
        self.store.create_ref(name, &tip).await?;
        self.snapshots().invalidate(name).await;
        info!(branch = name, from, tip = %tip.short(), "branch created");
        Ok(tip)
    }

    /// tracked paths the remote reports as changed between two refs
    ///
    /// advisory only; classification always comes from snapshots.
    pub async fn changed_paths_hint(&self, base: &str, head: &str) -> Result<Vec<ChangedPath>> {
        let changes = self.store.compare_refs(base, head).await?;
        Ok(changes
            .into_iter()
            .filter(|c| {
                PathKey::new(&c.path)
                    .map(|p| self.filter.matches(&p))
                    .unwrap_or(false)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveSource;
    use crate::remote::memory::MemoryStore;
    use crate::remote::{ChangeStatus, RepoId};

    fn engine() -> (Arc<MemoryStore>, SyncEngine) {
        let memory = Arc::new(MemoryStore::new(RepoId::new("acme", "configs")));
        memory
            .seed_branch("main", &[("a.xml", b"<a/>\n"), ("b.xml", b"<b>1</b>"), ("c.txt", b"c")])
            .unwrap();
        memory
            .seed_branch("dev", &[("a.xml", b"<a/>\r\n"), ("b.xml", b"<b>2</b>"), ("n.xml", b"<n/>")])
            .unwrap();
        let engine = SyncEngine::new(memory.clone(), Config::default()).unwrap();
        (memory, engine)
    }

    #[tokio::test]
    async fn test_compare_with_inspection() {
        let (_, engine) = engine();
        let options = CompareOptions {
            inspect_modified: true,
            ..Default::default()
        };
        let entries = engine
            .compare(&Source::Ref("dev".into()), "main", &options)
            .await
            .unwrap();

        let rendered: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "= a.xml (identical after normalization)",
                "M b.xml",
                "A n.xml",
            ]
        );
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_new_workflow_supersedes_old() {
        let (_, engine) = engine();
        let key = engine.key(&Source::Ref("dev".into()), "main");

        let (first_gen, first) = engine.begin(&key);
        let (second_gen, second) = engine.begin(&key);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // finishing the superseded workflow must not unregister the newer one
        engine.finish(&key, first_gen);
        assert_eq!(engine.in_flight.len(), 1);
        engine.finish(&key, second_gen);
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_other_keys_are_independent() {
        let (_, engine) = engine();
        let (_, a) = engine.begin(&engine.key(&Source::Ref("dev".into()), "main"));
        let (_, _b) = engine.begin(&engine.key(&Source::Ref("dev".into()), "release"));
        assert!(!a.is_cancelled());
    }

    #[tokio::test]
    async fn test_commit_through_engine() {
        let (memory, engine) = engine();
        let source = Source::Ref("dev".into());
        let entries = engine
            .compare(&source, "main", &CompareOptions::default())
            .await
            .unwrap();
        let selected: Vec<DiffEntry> = entries.into_iter().filter(|e| e.path.as_str() == "n.xml").collect();

        let outcome = engine
            .commit("main", &source, &selected, "add n", &PlanOptions::default())
            .await
            .unwrap();
        assert!(!outcome.is_noop());
        assert!(memory.files_on("main").unwrap().contains_key("n.xml"));
    }

    #[tokio::test]
    async fn test_commit_from_stale_comparison_keeps_colleague_work() {
        let (memory, ours) = engine();
        let source = Source::Ref("dev".into());
        let entries = ours
            .compare(&source, "main", &CompareOptions::default())
            .await
            .unwrap();
        let compared = ours.target_state("main").await.unwrap();

        // a colleague commits to main from their own engine
        let theirs = SyncEngine::new(memory.clone(), Config::default()).unwrap();
        let colleague = ArchiveSource::from_files(
            "colleague",
            vec![(PathKey::new("b.xml").unwrap(), Bytes::from_static(b"<b>colleague</b>"))],
            theirs.filter(),
        )
        .unwrap();
        let colleague = Source::Archive(Arc::new(colleague));
        let their_entries = theirs
            .compare(&colleague, "main", &CompareOptions::default())
            .await
            .unwrap();
        theirs
            .commit("main", &colleague, &their_entries, "colleague", &PlanOptions::default())
            .await
            .unwrap();
        let colleague_tip = memory.branch_tip("main");

        // a fresh engine replays our stored selection, as a later cli run would
        let later = SyncEngine::new(memory.clone(), Config::default()).unwrap();
        let selected: Vec<DiffEntry> = entries.into_iter().filter(|e| e.is_change()).collect();

        let err = later
            .commit("main", &source, &selected, "ours", &PlanOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "{:?}", err);

        let options = PlanOptions {
            expected_target: Some(compared),
            ..Default::default()
        };
        let err = later
            .commit("main", &source, &selected, "ours", &options)
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "{:?}", err);

        assert_eq!(memory.branch_tip("main"), colleague_tip);
        assert_eq!(
            &memory.files_on("main").unwrap()["b.xml"][..],
            b"<b>colleague</b>"
        );
    }

    #[tokio::test]
    async fn test_target_state_tracks_compared_snapshot() {
        let (memory, engine) = engine();
        let state = engine.target_state("main").await.unwrap();
        assert_eq!(
            state,
            RefState::Present {
                commit: memory.branch_tip("main").unwrap(),
                tree: engine.snapshots().get_snapshot("main").await.unwrap().tree().unwrap(),
            }
        );
        assert_eq!(engine.target_state("nope").await.unwrap(), RefState::Absent);
    }

    #[tokio::test]
    async fn test_export_target_side() {
        let (_, engine) = engine();
        let source = Source::Ref("dev".into());
        let entries = engine
            .compare(&source, "main", &CompareOptions::default())
            .await
            .unwrap();

        let data = engine
            .export(ExportSide::Target, &source, "main", &entries, ArchiveFormat::Zip)
            .await
            .unwrap();
        let exported = ArchiveSource::from_bytes("out", &data, engine.filter()).unwrap();
        let paths: Vec<_> = exported.files().iter().map(|f| f.path.as_str()).collect();
        // n.xml has no target side
        assert_eq!(paths, vec!["a.xml", "b.xml"]);
        assert_eq!(
            &exported.get(&PathKey::new("a.xml").unwrap()).unwrap().content[..],
            b"<a/>\n"
        );
    }

    #[tokio::test]
    async fn test_export_archive_source() {
        let (_, engine) = engine();
        let archive = ArchiveSource::from_files(
            "upload",
            vec![(PathKey::new("x.xml").unwrap(), Bytes::from_static(b"<x/>"))],
            engine.filter(),
        )
        .unwrap();
        let source = Source::Archive(Arc::new(archive));
        let entries = engine
            .compare(&source, "main", &CompareOptions::default())
            .await
            .unwrap();

        let data = engine
            .export(ExportSide::Source, &source, "main", &entries, ArchiveFormat::TarGz)
            .await
            .unwrap();
        let exported = ArchiveSource::from_bytes("out", &data, engine.filter()).unwrap();
        assert_eq!(exported.len(), 1);
    }

    #[tokio::test]
    async fn test_create_branch() {
        let (memory, engine) = engine();
        let tip = engine.create_branch("release/1.0", "main").await.unwrap();
        assert_eq!(memory.branch_tip("release/1.0"), Some(tip));

        let err = engine.create_branch("release/1.0", "main").await.unwrap_err();
        assert!(err.is_conflict());

        let err = engine.create_branch("other", "missing").await.unwrap_err();
        assert!(err.is_not_found());

        let names: Vec<String> = engine
            .list_branches()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["dev", "main", "release/1.0"]);
    }

    #[tokio::test]
    async fn test_changed_paths_hint_is_filtered() {
        let (_, engine) = engine();
        let hint = engine.changed_paths_hint("main", "dev").await.unwrap();
        let summary: Vec<String> = hint.iter().map(|c| format!("{} {}", c.status, c.path)).collect();
        // c.txt removal is outside the tracked class
        assert_eq!(summary, vec!["M a.xml", "M b.xml", "A n.xml"]);
        assert!(hint.iter().all(|c| c.status != ChangeStatus::Removed));
    }
}
