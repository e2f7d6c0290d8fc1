//! cached path -> address snapshots of remote refs
//!
//! the cache is the only shared mutable state in the engine. each
//! `(repository, ref)` key owns an async mutex, so a fill or invalidate of one
//! key never blocks readers of another and two concurrent misses on the same
//! key fetch once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::path::{PathFilter, PathKey};
use crate::remote::{EntryMode, ObjectStore, RepoId};

/// one tracked file in a snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: PathKey,
    pub address: ObjectId,
    pub mode: EntryMode,
}

/// whether the ref existed when the snapshot was taken
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefState {
    Present { commit: ObjectId, tree: ObjectId },
    /// the branch does not exist yet; comparing against it means "create branch"
    Absent,
}

/// immutable path -> address mapping of one ref at one point in time
#[derive(Debug)]
pub struct TreeSnapshot {
    pub reference: String,
    pub state: RefState,
    /// unix seconds
    pub fetched_at: i64,
    entries: Vec<SnapshotEntry>,
    index: HashMap<PathKey, usize>,
    addresses: HashSet<ObjectId>,
}

impl TreeSnapshot {
    /// build a snapshot, keeping the first entry for a repeated path
    pub fn new(reference: impl Into<String>, state: RefState, entries: Vec<SnapshotEntry>) -> Self {
        let mut kept = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());
        let mut addresses = HashSet::with_capacity(entries.len());

        for entry in entries {
            if index.contains_key(&entry.path) {
                continue;
            }
            index.insert(entry.path.clone(), kept.len());
            addresses.insert(entry.address);
            kept.push(entry);
        }

        Self {
            reference: reference.into(),
            state,
            fetched_at: unix_now(),
            entries: kept,
            index,
            addresses,
        }
    }

    /// snapshot of a branch that does not exist
    pub fn absent(reference: impl Into<String>) -> Self {
        Self::new(reference, RefState::Absent, Vec::new())
    }

    pub fn is_absent(&self) -> bool {
        self.state == RefState::Absent
    }

    pub fn commit(&self) -> Option<ObjectId> {
        match self.state {
            RefState::Present { commit, .. } => Some(commit),
            RefState::Absent => None,
        }
    }

    pub fn tree(&self) -> Option<ObjectId> {
        match self.state {
            RefState::Present { tree, .. } => Some(tree),
            RefState::Absent => None,
        }
    }

    /// entries in enumeration order
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn get(&self, path: &PathKey) -> Option<&SnapshotEntry> {
        self.index.get(path).map(|&idx| &self.entries[idx])
    }

    pub fn address_of(&self, path: &PathKey) -> Option<ObjectId> {
        self.get(path).map(|e| e.address)
    }

    /// whether some tracked path already stores this content
    pub fn contains_address(&self, address: &ObjectId) -> bool {
        self.addresses.contains(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

type Slot = Arc<AsyncMutex<Option<Arc<TreeSnapshot>>>>;

/// snapshot cache keyed by `(repository, ref)`
pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    filter: PathFilter,
    cache: DashMap<(RepoId, String), Slot>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, filter: PathFilter) -> Self {
        Self {
            store,
            filter,
            cache: DashMap::new(),
        }
    }

    /// object store snapshots are read from
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    fn key(&self, reference: &str) -> (RepoId, String) {
        (self.store.repository().clone(), reference.to_string())
    }

    fn slot(&self, reference: &str) -> Slot {
        // clone the slot out so no dashmap shard lock is held across an await
        self.cache.entry(self.key(reference)).or_default().value().clone()
    }

    /// cached snapshot of `reference`, fetched on a miss
    ///
    /// a branch that does not exist yields a snapshot with `RefState::Absent`,
    /// not an error.
    pub async fn get_snapshot(&self, reference: &str) -> Result<Arc<TreeSnapshot>> {
        let slot = self.slot(reference);
        let mut guard = slot.lock().await;

        if let Some(snapshot) = guard.as_ref() {
            debug!(reference, "snapshot cache hit");
            return Ok(snapshot.clone());
        }

        debug!(reference, "snapshot cache miss");
        let snapshot = Arc::new(self.fetch(reference).await?);
        *guard = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// drop the cached snapshot of `reference`; the next read refetches
    ///
    /// the key itself is removed too, so refs that are compared once and then
    /// written do not accumulate empty slots.
    pub async fn invalidate(&self, reference: &str) {
        let key = self.key(reference);
        let slot = self.cache.get(&key).map(|s| s.value().clone());
        if let Some(slot) = slot {
            let mut guard = slot.lock().await;
            *guard = None;
            // a reader that replaced the slot meanwhile keeps its own
            self.cache.remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
            drop(guard);
            debug!(reference, "snapshot invalidated");
        }
    }

    /// number of keys held, filled or not
    pub fn slot_count(&self) -> usize {
        self.cache.len()
    }

    /// invalidate and fetch again
    pub async fn refresh(&self, reference: &str) -> Result<Arc<TreeSnapshot>> {
        self.invalidate(reference).await;
        self.get_snapshot(reference).await
    }

    /// refs of this repository with a snapshot currently cached
    ///
    /// slots busy being filled are not reported.
    pub fn cached_refs(&self) -> Vec<String> {
        let repo = self.store.repository();
        let mut refs: Vec<String> = self
            .cache
            .iter()
            .filter(|item| &item.key().0 == repo)
            .filter(|item| {
                item.value()
                    .try_lock()
                    .map(|guard| guard.is_some())
                    .unwrap_or(false)
            })
            .map(|item| item.key().1.clone())
            .collect();
        refs.sort();
        refs
    }

    async fn fetch(&self, reference: &str) -> Result<TreeSnapshot> {
        let commit = match self.store.get_ref(reference).await {
            Ok(Some(commit)) => commit,
            Ok(None) => {
                info!(reference, "ref is absent");
                return Ok(TreeSnapshot::absent(reference));
            }
            Err(Error::RefNotFound(_)) => return Ok(TreeSnapshot::absent(reference)),
            Err(e) => return Err(e),
        };

        let tree = self.store.get_commit(&commit).await?.tree;
        let listing = self.store.get_tree(&tree.to_hex(), true).await?;
        if listing.truncated {
            return Err(Error::TruncatedTree(reference.to_string()));
        }

        let mut entries = Vec::new();
        for item in listing.entries {
            if !item.mode.is_blob() {
                continue;
            }
            let path = match PathKey::new(&item.path) {
                Ok(path) => path,
                Err(e) => {
                    warn!(reference, path = %item.path, error = %e, "skipping unusable path");
                    continue;
                }
            };
            if !self.filter.matches(&path) {
                continue;
            }
            entries.push(SnapshotEntry {
                path,
                address: item.address,
                mode: item.mode,
            });
        }

        info!(reference, commit = %commit.short(), entries = entries.len(), "snapshot fetched");
        Ok(TreeSnapshot::new(reference, RefState::Present { commit, tree }, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::compute_blob_hash;
    use crate::remote::memory::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, SnapshotStore) {
        let memory = Arc::new(MemoryStore::new(RepoId::new("acme", "configs")));
        memory
            .seed_branch(
                "main",
                &[("a.xml", b"<a/>"), ("dir/B.XML", b"<b/>"), ("notes.txt", b"skip me")],
            )
            .unwrap();
        let snapshots = SnapshotStore::new(memory.clone(), PathFilter::new(["xml"]));
        (memory, snapshots)
    }

    #[tokio::test]
    async fn test_snapshot_filters_extension() {
        let (_, snapshots) = setup();
        let snap = snapshots.get_snapshot("main").await.unwrap();

        let paths: Vec<_> = snap.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.xml", "dir/B.XML"]);
        assert!(!snap.is_absent());
        assert_eq!(
            snap.address_of(&PathKey::new("a.xml").unwrap()),
            Some(compute_blob_hash(b"<a/>"))
        );
        assert!(snap.contains_address(&compute_blob_hash(b"<b/>")));
        assert!(!snap.contains_address(&compute_blob_hash(b"skip me")));
    }

    #[tokio::test]
    async fn test_absent_ref_is_not_an_error() {
        let (_, snapshots) = setup();
        let snap = snapshots.get_snapshot("new-branch").await.unwrap();
        assert!(snap.is_absent());
        assert!(snap.is_empty());
        assert_eq!(snap.commit(), None);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_snapshot() {
        let (memory, snapshots) = setup();
        let first = snapshots.get_snapshot("main").await.unwrap();

        memory.seed_branch("main", &[("c.xml", b"<c/>")]).unwrap();
        let second = snapshots.get_snapshot("main").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(snapshots.cached_refs(), vec!["main".to_string()]);
    }

    #[tokio::test]
    async fn test_invalidate_gives_read_your_writes() {
        let (memory, snapshots) = setup();
        let first = snapshots.get_snapshot("main").await.unwrap();
        assert_eq!(first.len(), 2);

        memory.seed_branch("main", &[("c.xml", b"<c/>")]).unwrap();
        snapshots.invalidate("main").await;
        assert!(snapshots.cached_refs().is_empty());

        let second = snapshots.get_snapshot("main").await.unwrap();
        assert_eq!(second.len(), 3);
        assert_ne!(first.commit(), second.commit());
    }

    #[tokio::test]
    async fn test_invalidate_releases_keys() {
        let (memory, snapshots) = setup();
        for i in 0..20 {
            let branch = format!("feature/{}", i);
            memory.seed_branch(&branch, &[("a.xml", b"<a/>")]).unwrap();
            snapshots.get_snapshot(&branch).await.unwrap();
            snapshots.invalidate(&branch).await;
        }
        assert_eq!(snapshots.slot_count(), 0);

        // absent refs leave nothing behind either
        snapshots.get_snapshot("gone").await.unwrap();
        assert_eq!(snapshots.slot_count(), 1);
        snapshots.invalidate("gone").await;
        assert_eq!(snapshots.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh() {
        let (memory, snapshots) = setup();
        snapshots.get_snapshot("main").await.unwrap();
        memory.seed_branch("main", &[("d.xml", b"<d/>")]).unwrap();
        let snap = snapshots.refresh("main").await.unwrap();
        assert!(snap.get(&PathKey::new("d.xml").unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_truncated_listing_is_refused() {
        let (memory, snapshots) = setup();
        memory.set_truncate_listings(true);
        let err = snapshots.get_snapshot("main").await.unwrap_err();
        assert!(matches!(err, Error::TruncatedTree(_)));

        // nothing partial was cached
        memory.set_truncate_listings(false);
        assert_eq!(snapshots.get_snapshot("main").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fill() {
        let (_, snapshots) = setup();
        let snapshots = Arc::new(snapshots);

        let a = tokio::spawn({
            let s = snapshots.clone();
            async move { s.get_snapshot("main").await }
        });
        let b = tokio::spawn({
            let s = snapshots.clone();
            async move { s.get_snapshot("main").await }
        });

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_duplicate_paths_keep_first() {
        let path = PathKey::new("a.xml").unwrap();
        let snap = TreeSnapshot::new(
            "x",
            RefState::Absent,
            vec![
                SnapshotEntry {
                    path: path.clone(),
                    address: compute_blob_hash(b"1"),
                    mode: EntryMode::Blob,
                },
                SnapshotEntry {
                    path: path.clone(),
                    address: compute_blob_hash(b"2"),
                    mode: EntryMode::Blob,
                },
            ],
        );
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.address_of(&path), Some(compute_blob_hash(b"1")));
    }
}
