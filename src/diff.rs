//! directed comparison of a source against a target ref
//!
//! classification is done on content addresses alone. file contents are only
//! fetched by [`DiffEngine::inspect`] and [`DiffEngine::detail`], for the
//! entries a caller actually looks at.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::ArchiveSource;
use crate::blob_cache::BlobCache;
use crate::bounded::{map_limit, MapOptions, DEFAULT_CONCURRENCY};
use crate::error::{Error, Result};
use crate::hash::{compute_blob_hash, ObjectId};
use crate::normalize::{LineNormalizer, TextComparison, TextNormalizer};
use crate::path::PathKey;
use crate::remote::EntryMode;
use crate::snapshot::SnapshotStore;

/// classification of one path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffStatus {
    /// present in source only
    Added,
    /// present on both sides with different content
    Modified,
    /// present in target only (deletion pass)
    Removed,
    /// same content on both sides
    Same,
    /// content could not be fetched; the real status is unknown
    FetchError,
}

impl fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffStatus::Added => write!(f, "A"),
            DiffStatus::Modified => write!(f, "M"),
            DiffStatus::Removed => write!(f, "D"),
            DiffStatus::Same => write!(f, "="),
            DiffStatus::FetchError => write!(f, "!"),
        }
    }
}

/// extra information attached after inspecting content
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffNote {
    /// raw bytes (and addresses) differ but normalized text is equal
    IdenticalAfterNormalization,
    /// at least one side is not UTF-8; compared on raw bytes only
    NotText,
}

impl fmt::Display for DiffNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffNote::IdenticalAfterNormalization => write!(f, "identical after normalization"),
            DiffNote::NotText => write!(f, "not text"),
        }
    }
}

/// one compared path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: PathKey,
    pub status: DiffStatus,
    pub source_address: Option<ObjectId>,
    pub target_address: Option<ObjectId>,
    pub mode: EntryMode,
    /// source bytes, attached lazily by `inspect`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<DiffNote>,
    /// fetch failure message for `FetchError` entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiffEntry {
    fn new(path: PathKey, status: DiffStatus, mode: EntryMode) -> Self {
        Self {
            path,
            status,
            source_address: None,
            target_address: None,
            mode,
            content: None,
            note: None,
            error: None,
        }
    }

    /// whether syncing this entry would change the target
    pub fn is_change(&self) -> bool {
        matches!(
            self.status,
            DiffStatus::Added | DiffStatus::Modified | DiffStatus::Removed
        )
    }

    /// `Same` only because of normalization; the stored addresses still differ
    pub fn is_identical_after_normalization(&self) -> bool {
        self.note == Some(DiffNote::IdenticalAfterNormalization)
    }

    /// status to use when (re)fetching, recovering it for failed entries
    fn fetch_status(&self) -> DiffStatus {
        match (self.status, self.source_address, self.target_address) {
            (DiffStatus::FetchError, Some(_), Some(_)) => DiffStatus::Modified,
            (DiffStatus::FetchError, Some(_), None) => DiffStatus::Added,
            (status, _, _) => status,
        }
    }
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.path)?;
        if let Some(note) = self.note {
            write!(f, " ({})", note)?;
        }
        if let Some(error) = &self.error {
            write!(f, " [{}]", error)?;
        }
        Ok(())
    }
}

/// where the source side of a comparison comes from
#[derive(Clone, Debug)]
pub enum Source {
    Ref(String),
    Archive(Arc<ArchiveSource>),
}

impl Source {
    pub fn label(&self) -> &str {
        match self {
            Source::Ref(name) => name,
            Source::Archive(archive) => archive.label(),
        }
    }

    pub fn as_ref_name(&self) -> Option<&str> {
        match self {
            Source::Ref(name) => Some(name),
            Source::Archive(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DiffOptions {
    /// also report paths that exist only in the target as `Removed`
    pub include_removed: bool,
}

/// counts from one `inspect` call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InspectReport {
    pub fetched: usize,
    pub downgraded: usize,
    pub failed: usize,
}

/// content-level view of a single entry
#[derive(Clone, Debug)]
pub struct FileDetail {
    pub path: PathKey,
    pub source_label: String,
    pub target_label: String,
    pub comparison: TextComparison,
    /// unified diff of normalized text, target -> source; `None` when the
    /// sides are equal after normalization or not text
    pub unified: Option<String>,
}

impl FileDetail {
    pub fn is_identical_after_normalization(&self) -> bool {
        self.comparison == TextComparison::EqualAfterNormalization
    }
}

/// compares sources to targets using cached snapshots
pub struct DiffEngine {
    snapshots: Arc<SnapshotStore>,
    normalizer: Arc<dyn TextNormalizer>,
    concurrency: usize,
    timeout: Option<Duration>,
    blob_cache: Option<BlobCache>,
}

impl DiffEngine {
    pub fn new(snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            snapshots,
            normalizer: Arc::new(LineNormalizer),
            concurrency: DEFAULT_CONCURRENCY,
            timeout: None,
            blob_cache: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn TextNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// upper bound for fetching one entry's contents
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_blob_cache(mut self, cache: BlobCache) -> Self {
        self.blob_cache = Some(cache);
        self
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub(crate) fn map_options(&self, cancel: Option<CancellationToken>) -> MapOptions {
        MapOptions {
            cancel,
            timeout: self.timeout,
        }
    }

    /// classify every source path against `target` by content address
    ///
    /// entries follow source enumeration order; `Removed` entries (opt-in)
    /// follow, in target order. no file contents are fetched.
    pub async fn diff(&self, source: &Source, target: &str, options: &DiffOptions) -> Result<Vec<DiffEntry>> {
        let target_snap = self.snapshots.get_snapshot(target).await?;
        let source_files = self.source_listing(source).await?;

        let mut entries = Vec::with_capacity(source_files.len());
        for (path, address, mode) in &source_files {
            let mut entry = match target_snap.get(path) {
                None => DiffEntry::new(path.clone(), DiffStatus::Added, *mode),
                Some(t) if t.address == *address => DiffEntry::new(path.clone(), DiffStatus::Same, *mode),
                Some(_) => DiffEntry::new(path.clone(), DiffStatus::Modified, *mode),
            };
            entry.source_address = Some(*address);
            entry.target_address = target_snap.address_of(path);
            entries.push(entry);
        }

        if options.include_removed {
            let in_source: std::collections::HashSet<&PathKey> =
                source_files.iter().map(|(path, _, _)| path).collect();
            for t in target_snap.entries() {
                if !in_source.contains(&t.path) {
                    let mut entry = DiffEntry::new(t.path.clone(), DiffStatus::Removed, t.mode);
                    entry.target_address = Some(t.address);
                    entries.push(entry);
                }
            }
        }

        info!(
            source = source.label(),
            target,
            total = entries.len(),
            changed = entries.iter().filter(|e| e.is_change()).count(),
            target_absent = target_snap.is_absent(),
            "diff computed"
        );
        Ok(entries)
    }

    async fn source_listing(&self, source: &Source) -> Result<Vec<(PathKey, ObjectId, EntryMode)>> {
        match source {
            Source::Ref(name) => {
                let snap = self.snapshots.get_snapshot(name).await?;
                if snap.is_absent() {
                    warn!(source = %name, "source ref is absent, nothing to compare");
                }
                Ok(snap
                    .entries()
                    .iter()
                    .map(|e| (e.path.clone(), e.address, e.mode))
                    .collect())
            }
            Source::Archive(archive) => Ok(archive
                .files()
                .iter()
                .map(|f| (f.path.clone(), f.address, EntryMode::Blob))
                .collect()),
        }
    }

    /// fetch contents for the selected entries and settle their status
    ///
    /// `Modified` entries whose texts are equal after normalization become
    /// `Same` with [`DiffNote::IdenticalAfterNormalization`]; their addresses are
    /// left untouched. an entry whose fetch fails becomes `FetchError` and keeps
    /// the error message; the others are unaffected. a previously failed entry
    /// is retried when selected again.
    pub async fn inspect<F>(
        &self,
        source: &Source,
        entries: &mut [DiffEntry],
        selector: F,
        cancel: Option<CancellationToken>,
    ) -> Result<InspectReport>
    where
        F: Fn(&DiffEntry) -> bool,
    {
        let selected: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                matches!(e.fetch_status(), DiffStatus::Added | DiffStatus::Modified) && selector(e)
            })
            .map(|(idx, _)| idx)
            .collect();

        let work: Vec<(PathKey, Option<ObjectId>, Option<ObjectId>)> = selected
            .iter()
            .map(|&idx| {
                let e = &entries[idx];
                (e.path.clone(), e.source_address, e.target_address)
            })
            .collect();

        let options = self.map_options(cancel);
        let results = map_limit(work, self.concurrency, &options, |_, (path, src, tgt)| async move {
            let source_bytes = self.source_bytes(source, &path, src).await?;
            let target_bytes = match tgt {
                Some(address) => Some(self.read_blob(&address).await?),
                None => None,
            };
            Ok((source_bytes, target_bytes))
        })
        .await;

        if results.iter().any(|r| matches!(r, Err(Error::Cancelled))) {
            return Err(Error::Cancelled);
        }

        let mut report = InspectReport::default();
        for (idx, result) in selected.into_iter().zip(results) {
            let entry = &mut entries[idx];
            match result {
                Ok((source_bytes, target_bytes)) => {
                    report.fetched += 1;
                    entry.status = entry.fetch_status();
                    entry.error = None;
                    entry.note = None;

                    if let Some(target_bytes) = target_bytes {
                        match self.normalizer.compare(&source_bytes, &target_bytes) {
                            TextComparison::Identical => entry.status = DiffStatus::Same,
                            TextComparison::EqualAfterNormalization => {
                                entry.status = DiffStatus::Same;
                                entry.note = Some(DiffNote::IdenticalAfterNormalization);
                                report.downgraded += 1;
                            }
                            TextComparison::Different => {}
                            TextComparison::BinaryDifferent => entry.note = Some(DiffNote::NotText),
                        }
                    }
                    entry.content = Some(source_bytes);
                }
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "content fetch failed");
                    report.failed += 1;
                    entry.status = DiffStatus::FetchError;
                    entry.error = Some(e.to_string());
                }
            }
        }

        debug!(?report, "inspect finished");
        Ok(report)
    }

    /// both sides of one entry, normalized and diffed line by line
    pub async fn detail(&self, source: &Source, target: &str, entry: &DiffEntry) -> Result<FileDetail> {
        let source_bytes = match (entry.source_address, &entry.content) {
            (_, Some(content)) => content.clone(),
            (Some(address), None) => self.source_bytes(source, &entry.path, Some(address)).await?,
            (None, None) => Bytes::new(),
        };
        let target_bytes = match entry.target_address {
            Some(address) => self.read_blob(&address).await?,
            None => Bytes::new(),
        };

        let comparison = self.normalizer.compare(&source_bytes, &target_bytes);
        let unified = match comparison {
            TextComparison::Different => {
                let old = self.normalizer.normalize(&String::from_utf8_lossy(&target_bytes));
                let new = self.normalizer.normalize(&String::from_utf8_lossy(&source_bytes));
                let target_label = format!("{}:{}", target, entry.path);
                let source_label = format!("{}:{}", source.label(), entry.path);
                Some(
                    TextDiff::from_lines(&old, &new)
                        .unified_diff()
                        .context_radius(3)
                        .header(&target_label, &source_label)
                        .to_string(),
                )
            }
            _ => None,
        };

        Ok(FileDetail {
            path: entry.path.clone(),
            source_label: source.label().to_string(),
            target_label: target.to_string(),
            comparison,
            unified,
        })
    }

    /// source-side bytes of a path: from the archive, or from the remote by address
    pub(crate) async fn source_bytes(
        &self,
        source: &Source,
        path: &PathKey,
        address: Option<ObjectId>,
    ) -> Result<Bytes> {
        match source {
            Source::Archive(archive) => archive
                .get(path)
                .map(|f| f.content.clone())
                .ok_or_else(|| Error::PathNotFound(format!("{} in {}", path, archive.label()))),
            Source::Ref(name) => {
                let address =
                    address.ok_or_else(|| Error::MissingContent(format!("{}@{}", path, name)))?;
                self.read_blob(&address).await
            }
        }
    }

    /// blob bytes by address, through the on-disk cache when configured
    pub(crate) async fn read_blob(&self, address: &ObjectId) -> Result<Bytes> {
        if let Some(cache) = &self.blob_cache {
            match cache.get(address) {
                Ok(Some(bytes)) => return Ok(bytes),
                Ok(None) => {}
                Err(e) => warn!(address = %address, error = %e, "blob cache read failed"),
            }
        }

        let bytes = self.snapshots.object_store().get_blob(address).await?;
        if compute_blob_hash(&bytes) != *address {
            return Err(Error::network(format!("content received for {} does not match its address", address)));
        }

        if let Some(cache) = &self.blob_cache {
            if let Err(e) = cache.put(&bytes) {
                warn!(address = %address, error = %e, "blob cache write failed");
            }
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathFilter;
    use crate::remote::memory::MemoryStore;
    use crate::remote::RepoId;

    fn setup(main: &[(&str, &[u8])], dev: &[(&str, &[u8])]) -> (Arc<MemoryStore>, DiffEngine) {
        let memory = Arc::new(MemoryStore::new(RepoId::new("acme", "configs")));
        if !main.is_empty() {
            memory.seed_branch("main", main).unwrap();
        }
        if !dev.is_empty() {
            memory.seed_branch("dev", dev).unwrap();
        }
        let snapshots = Arc::new(SnapshotStore::new(memory.clone(), PathFilter::new(["xml"])));
        (memory, DiffEngine::new(snapshots).with_concurrency(4))
    }

    fn key(path: &str) -> PathKey {
        PathKey::new(path).unwrap()
    }

    fn statuses(entries: &[DiffEntry]) -> Vec<String> {
        entries.iter().map(|e| format!("{} {}", e.status, e.path)).collect()
    }

    #[tokio::test]
    async fn test_diff_against_itself_has_no_changes() {
        let (_, engine) = setup(&[("a.xml", b"<a/>"), ("b/c.xml", b"<c/>")], &[]);
        let entries = engine
            .diff(&Source::Ref("main".into()), "main", &DiffOptions::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == DiffStatus::Same));
    }

    #[tokio::test]
    async fn test_absent_target_yields_added() {
        let (_, engine) = setup(&[("a.xml", b"<a/>")], &[]);
        let entries = engine
            .diff(&Source::Ref("main".into()), "not-yet", &DiffOptions::default())
            .await
            .unwrap();
        assert_eq!(statuses(&entries), vec!["A a.xml"]);
        assert_eq!(entries[0].target_address, None);
    }

    #[tokio::test]
    async fn test_classification_and_order() {
        let (_, engine) = setup(
            &[("a.xml", b"1"), ("b.xml", b"2"), ("only-target.xml", b"t")],
            &[("b.xml", b"changed"), ("a.xml", b"1"), ("z.xml", b"new")],
        );
        let entries = engine
            .diff(&Source::Ref("dev".into()), "main", &DiffOptions::default())
            .await
            .unwrap();
        assert_eq!(statuses(&entries), vec!["= a.xml", "M b.xml", "A z.xml"]);
    }

    #[tokio::test]
    async fn test_removed_is_opt_in() {
        let (_, engine) = setup(&[("a.xml", b"1"), ("gone.xml", b"x")], &[("a.xml", b"1")]);
        let source = Source::Ref("dev".into());

        let default = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();
        assert_eq!(statuses(&default), vec!["= a.xml"]);

        let with_removed = engine
            .diff(&source, "main", &DiffOptions { include_removed: true })
            .await
            .unwrap();
        assert_eq!(statuses(&with_removed), vec!["= a.xml", "D gone.xml"]);
        assert!(with_removed[1].is_change());
    }

    #[tokio::test]
    async fn test_normalization_downgrade_keeps_addresses() {
        let (memory, engine) = setup(&[("a.xml", b"<a>\n  <b/>\n</a>\n")], &[("a.xml", b"<a>\r\n  <b/>   \r\n\r\n</a>")]);
        let source = Source::Ref("dev".into());
        let mut entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();
        assert_eq!(entries[0].status, DiffStatus::Modified);
        assert_eq!(memory.blob_reads(), 0);

        let report = engine.inspect(&source, &mut entries, |_| true, None).await.unwrap();
        assert_eq!(report.downgraded, 1);

        let entry = &entries[0];
        assert_eq!(entry.status, DiffStatus::Same);
        assert!(entry.is_identical_after_normalization());
        assert_ne!(entry.source_address, entry.target_address);
        assert!(entry.content.is_some());
        assert!(entry.to_string().contains("identical after normalization"));
    }

    #[tokio::test]
    async fn test_real_change_stays_modified() {
        let (_, engine) = setup(&[("a.xml", b"<a>1</a>")], &[("a.xml", b"<a>2</a>")]);
        let source = Source::Ref("dev".into());
        let mut entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();
        engine.inspect(&source, &mut entries, |_| true, None).await.unwrap();
        assert_eq!(entries[0].status, DiffStatus::Modified);
        assert_eq!(entries[0].note, None);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_isolated_and_not_added() {
        let (memory, engine) = setup(
            &[("a.xml", b"1"), ("b.xml", b"2")],
            &[("a.xml", b"one"), ("b.xml", b"two")],
        );
        memory.fail_blob_reads_for(compute_blob_hash(b"one"));

        let source = Source::Ref("dev".into());
        let mut entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();
        let report = engine.inspect(&source, &mut entries, |_| true, None).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(entries[0].status, DiffStatus::FetchError);
        assert!(entries[0].error.as_deref().unwrap_or("").contains("injected"));
        assert_eq!(entries[1].status, DiffStatus::Modified);
        assert!(entries[1].content.is_some());
    }

    #[tokio::test]
    async fn test_selector_limits_fetches() {
        let (memory, engine) = setup(&[("a.xml", b"1"), ("b.xml", b"2")], &[("a.xml", b"x"), ("b.xml", b"y")]);
        let source = Source::Ref("dev".into());
        let mut entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();

        let b = key("b.xml");
        engine.inspect(&source, &mut entries, |e| e.path == b, None).await.unwrap();
        assert!(entries[0].content.is_none());
        assert!(entries[1].content.is_some());
        assert_eq!(memory.blob_reads(), 2);
    }

    #[tokio::test]
    async fn test_inspect_cancelled() {
        let (_, engine) = setup(&[("a.xml", b"1")], &[("a.xml", b"2")]);
        let source = Source::Ref("dev".into());
        let mut entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = engine
            .inspect(&source, &mut entries, |_| true, Some(token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(entries[0].status, DiffStatus::Modified);
    }

    #[tokio::test]
    async fn test_archive_source() {
        let (memory, engine) = setup(&[("a.xml", b"<a/>\n"), ("b.xml", b"<b/>")], &[]);
        let archive = ArchiveSource::from_files(
            "upload.tar",
            vec![
                (key("a.xml"), Bytes::from_static(b"<a/>\r\n")),
                (key("c.xml"), Bytes::from_static(b"<c/>")),
            ],
            &PathFilter::new(["xml"]),
        )
        .unwrap();
        let source = Source::Archive(Arc::new(archive));

        let mut entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();
        assert_eq!(statuses(&entries), vec!["M a.xml", "A c.xml"]);

        engine.inspect(&source, &mut entries, |_| true, None).await.unwrap();
        assert_eq!(entries[0].status, DiffStatus::Same);
        assert!(entries[0].is_identical_after_normalization());
        assert_eq!(&entries[1].content.as_ref().unwrap()[..], b"<c/>");
        // only the target side of a.xml was read remotely
        assert_eq!(memory.blob_reads(), 1);
    }

    #[tokio::test]
    async fn test_detail_unified_diff() {
        let (_, engine) = setup(&[("a.xml", b"<a>\n<x>1</x>\n</a>\n")], &[("a.xml", b"<a>\n<x>2</x>\n</a>\n")]);
        let source = Source::Ref("dev".into());
        let entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();

        let detail = engine.detail(&source, "main", &entries[0]).await.unwrap();
        assert_eq!(detail.comparison, TextComparison::Different);
        let unified = detail.unified.unwrap();
        assert!(unified.contains("--- main:a.xml"), "{}", unified);
        assert!(unified.contains("+++ dev:a.xml"), "{}", unified);
        assert!(unified.contains("-<x>1</x>"), "{}", unified);
        assert!(unified.contains("+<x>2</x>"), "{}", unified);
    }

    #[tokio::test]
    async fn test_detail_identical_after_normalization() {
        let (_, engine) = setup(&[("a.xml", b"<a/>\n")], &[("a.xml", b"\xef\xbb\xbf<a/>  \r\n")]);
        let source = Source::Ref("dev".into());
        let entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();
        let detail = engine.detail(&source, "main", &entries[0]).await.unwrap();
        assert!(detail.is_identical_after_normalization());
        assert!(detail.unified.is_none());
    }

    #[tokio::test]
    async fn test_blob_cache_serves_repeat_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (memory, engine) = setup(&[("a.xml", b"1")], &[("a.xml", b"2")]);
        let engine = engine.with_blob_cache(BlobCache::open(dir.path()).unwrap());
        let source = Source::Ref("dev".into());

        let mut entries = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();
        engine.inspect(&source, &mut entries, |_| true, None).await.unwrap();
        assert_eq!(memory.blob_reads(), 2);

        let mut again = engine.diff(&source, "main", &DiffOptions::default()).await.unwrap();
        engine.inspect(&source, &mut again, |_| true, None).await.unwrap();
        assert_eq!(memory.blob_reads(), 2);
    }
}
