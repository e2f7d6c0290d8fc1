//! in-process [`ObjectStore`] with git-exact object ids
//!
//! blobs, trees and commits are hashed exactly as git hashes them, so the
//! addresses a `MemoryStore` reports match what `compute_blob_hash` computes
//! locally. every write call is counted, which is what lets tests assert that
//! a no-op plan never touches the store.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::{compute_blob_hash, compute_object_hash, ObjectId};
use crate::path::PathKey;
use crate::remote::{
    validate_branch_name, BranchInfo, ChangeStatus, ChangedPath, CommitInfo, EntryMode,
    NewTreeEntry, ObjectStore, RemoteTreeEntry, RepoId, TreeListing,
};

#[derive(Clone, Debug)]
struct TreeItem {
    name: String,
    mode: EntryMode,
    id: ObjectId,
}

#[derive(Clone, Debug)]
struct StoredCommit {
    tree: ObjectId,
    parents: Vec<ObjectId>,
}

/// flattened tree: full path -> (mode, blob id)
type FlatTree = BTreeMap<String, (EntryMode, ObjectId)>;

#[derive(Default)]
struct Inner {
    blobs: HashMap<ObjectId, Bytes>,
    trees: HashMap<ObjectId, Vec<TreeItem>>,
    commits: HashMap<ObjectId, StoredCommit>,
    branches: BTreeMap<String, ObjectId>,
    writes: usize,
    blob_reads: usize,
    failing_blobs: HashSet<ObjectId>,
    truncate_listings: bool,
    clock: i64,
}

/// object store kept entirely in memory
pub struct MemoryStore {
    repo: RepoId,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(repo: RepoId) -> Self {
        let mut inner = Inner::default();
        // the empty tree always exists, as in git
        inner.write_tree(Vec::new());
        Self {
            repo,
            inner: Mutex::new(inner),
        }
    }

    /// commit `files` on top of `branch` (creating it if needed), bypassing write accounting
    pub fn seed_branch(&self, branch: &str, files: &[(&str, &[u8])]) -> Result<ObjectId> {
        validate_branch_name(branch)?;
        let mut inner = self.inner.lock();

        let parent = inner.branches.get(branch).copied();
        let mut flat = match parent {
            Some(commit) => {
                let tree = inner.commit(&commit)?.tree;
                inner.flatten(&tree)?
            }
            None => FlatTree::new(),
        };

        for (path, content) in files {
            let key = PathKey::new(path)?;
            let id = inner.write_blob(Bytes::copy_from_slice(content));
            flat.insert(key.as_str().to_string(), (EntryMode::Blob, id));
        }

        let tree = inner.write_flat(&flat);
        let commit = inner.write_commit(&format!("seed {}", branch), tree, parent.into_iter().collect());
        inner.branches.insert(branch.to_string(), commit);
        Ok(commit)
    }

    /// commit on `branch` as someone else would, so the next CAS update fails
    pub fn advance_ref_behind_back(&self, branch: &str) -> Result<ObjectId> {
        let mut inner = self.inner.lock();
        let tip = inner
            .branches
            .get(branch)
            .copied()
            .ok_or_else(|| Error::RefNotFound(branch.to_string()))?;
        let tree = inner.commit(&tip)?.tree;
        let commit = inner.write_commit("concurrent change", tree, vec![tip]);
        inner.branches.insert(branch.to_string(), commit);
        Ok(commit)
    }

    /// make every read of `address` fail with a network error
    pub fn fail_blob_reads_for(&self, address: ObjectId) {
        self.inner.lock().failing_blobs.insert(address);
    }

    /// report recursive listings as truncated from now on
    pub fn set_truncate_listings(&self, truncate: bool) {
        self.inner.lock().truncate_listings = truncate;
    }

    /// number of write calls (blob, tree, commit, ref) received so far
    pub fn writes(&self) -> usize {
        self.inner.lock().writes
    }

    /// number of blob reads served so far (including `get_file_at`)
    pub fn blob_reads(&self) -> usize {
        self.inner.lock().blob_reads
    }

    pub fn reset_counters(&self) {
        let mut inner = self.inner.lock();
        inner.writes = 0;
        inner.blob_reads = 0;
    }

    pub fn branch_tip(&self, branch: &str) -> Option<ObjectId> {
        self.inner.lock().branches.get(branch).copied()
    }

    /// parents of a stored commit
    pub fn parents_of(&self, commit: &ObjectId) -> Result<Vec<ObjectId>> {
        Ok(self.inner.lock().commit(commit)?.parents.clone())
    }

    /// all files on a branch, path -> bytes
    pub fn files_on(&self, branch: &str) -> Result<BTreeMap<String, Bytes>> {
        let inner = self.inner.lock();
        let tree = inner.resolve_tree(branch)?;
        let flat = inner.flatten(&tree)?;
        flat.into_iter()
            .map(|(path, (_, id))| -> Result<(String, Bytes)> {
                let bytes = inner
                    .blobs
                    .get(&id)
                    .cloned()
                    .ok_or(Error::ObjectNotFound(id))?;
                Ok((path, bytes))
            })
            .collect()
    }
}

impl Inner {
    fn write_blob(&mut self, content: Bytes) -> ObjectId {
        let id = compute_blob_hash(&content);
        self.blobs.entry(id).or_insert(content);
        id
    }

    fn write_tree(&mut self, mut items: Vec<TreeItem>) -> ObjectId {
        items.sort_by(|a, b| tree_sort_key(a).cmp(&tree_sort_key(b)));

        let mut body = Vec::new();
        for item in &items {
            body.extend_from_slice(git_mode(item.mode).as_bytes());
            body.push(b' ');
            body.extend_from_slice(item.name.as_bytes());
            body.push(0);
            body.extend_from_slice(item.id.as_bytes());
        }

        let id = compute_object_hash("tree", &body);
        self.trees.entry(id).or_insert(items);
        id
    }

    fn write_commit(&mut self, message: &str, tree: ObjectId, parents: Vec<ObjectId>) -> ObjectId {
        self.clock += 1;
        let mut body = format!("tree {}\n", tree);
        for parent in &parents {
            body.push_str(&format!("parent {}\n", parent));
        }
        let signature = format!("treesync <treesync@localhost> {} +0000", self.clock);
        body.push_str(&format!("author {}\ncommitter {}\n\n{}", signature, signature, message));
        if !message.ends_with('\n') {
            body.push('\n');
        }

        let id = compute_object_hash("commit", body.as_bytes());
        self.commits.insert(id, StoredCommit { tree, parents });
        id
    }

    /// write nested trees for a flat path map and return the root id
    fn write_flat(&mut self, flat: &FlatTree) -> ObjectId {
        let mut files = Vec::new();
        let mut dirs: BTreeMap<&str, FlatTree> = BTreeMap::new();

        for (path, (mode, id)) in flat {
            match path.split_once('/') {
                Some((dir, rest)) => {
                    dirs.entry(dir)
                        .or_default()
                        .insert(rest.to_string(), (*mode, *id));
                }
                None => files.push(TreeItem {
                    name: path.clone(),
                    mode: *mode,
                    id: *id,
                }),
            }
        }

        for (dir, children) in dirs {
            let id = self.write_flat(&children);
            files.push(TreeItem {
                name: dir.to_string(),
                mode: EntryMode::Tree,
                id,
            });
        }

        self.write_tree(files)
    }

    fn commit(&self, id: &ObjectId) -> Result<&StoredCommit> {
        self.commits.get(id).ok_or(Error::ObjectNotFound(*id))
    }

    fn tree(&self, id: &ObjectId) -> Result<&Vec<TreeItem>> {
        self.trees.get(id).ok_or(Error::ObjectNotFound(*id))
    }

    /// tree id for a branch name, commit id or tree id
    fn resolve_tree(&self, tree_or_ref: &str) -> Result<ObjectId> {
        if let Some(commit) = self.branches.get(tree_or_ref) {
            return Ok(self.commit(commit)?.tree);
        }
        if let Ok(id) = ObjectId::from_hex(tree_or_ref) {
            if self.trees.contains_key(&id) {
                return Ok(id);
            }
            if let Some(commit) = self.commits.get(&id) {
                return Ok(commit.tree);
            }
        }
        Err(Error::RefNotFound(tree_or_ref.to_string()))
    }

    fn list(&self, tree: &ObjectId, prefix: &str, recursive: bool, out: &mut Vec<RemoteTreeEntry>) -> Result<()> {
        for item in self.tree(tree)? {
            let path = if prefix.is_empty() {
                item.name.clone()
            } else {
                format!("{}/{}", prefix, item.name)
            };
            let size = self.blobs.get(&item.id).map(|b| b.len() as u64);
            out.push(RemoteTreeEntry {
                path: path.clone(),
                address: item.id,
                mode: item.mode,
                size,
            });
            if recursive && item.mode == EntryMode::Tree {
                self.list(&item.id, &path, true, out)?;
            }
        }
        Ok(())
    }

    fn flatten(&self, tree: &ObjectId) -> Result<FlatTree> {
        let mut listing = Vec::new();
        self.list(tree, "", true, &mut listing)?;
        Ok(listing
            .into_iter()
            .filter(|e| e.mode != EntryMode::Tree)
            .map(|e| (e.path, (e.mode, e.address)))
            .collect())
    }

    fn read_blob(&mut self, id: &ObjectId) -> Result<Bytes> {
        self.blob_reads += 1;
        if self.failing_blobs.contains(id) {
            return Err(Error::network(format!("injected read failure for {}", id)));
        }
        self.blobs.get(id).cloned().ok_or(Error::ObjectNotFound(*id))
    }
}

/// git orders tree entries by name, with subtrees compared as if suffixed by '/'
fn tree_sort_key(item: &TreeItem) -> Vec<u8> {
    let mut key = item.name.as_bytes().to_vec();
    if item.mode == EntryMode::Tree {
        key.push(b'/');
    }
    key
}

/// mode as written inside tree objects (no leading zero)
fn git_mode(mode: EntryMode) -> &'static str {
    match mode {
        EntryMode::Tree => "40000",
        other => other.as_str(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn repository(&self) -> &RepoId {
        &self.repo
    }

    async fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        let inner = self.inner.lock();
        Ok(inner
            .branches
            .iter()
            .map(|(name, tip)| BranchInfo {
                name: name.clone(),
                tip: *tip,
            })
            .collect())
    }

    async fn get_ref(&self, branch: &str) -> Result<Option<ObjectId>> {
        validate_branch_name(branch)?;
        Ok(self.inner.lock().branches.get(branch).copied())
    }

    async fn get_commit(&self, commit: &ObjectId) -> Result<CommitInfo> {
        let inner = self.inner.lock();
        let stored = inner.commit(commit)?;
        Ok(CommitInfo {
            id: *commit,
            tree: stored.tree,
            parents: stored.parents.clone(),
        })
    }

    async fn get_tree(&self, tree_or_ref: &str, recursive: bool) -> Result<TreeListing> {
        let inner = self.inner.lock();
        let tree = inner.resolve_tree(tree_or_ref)?;
        let mut entries = Vec::new();
        inner.list(&tree, "", recursive, &mut entries)?;
        Ok(TreeListing {
            entries,
            truncated: recursive && inner.truncate_listings,
        })
    }

    async fn get_blob(&self, address: &ObjectId) -> Result<Bytes> {
        self.inner.lock().read_blob(address)
    }

    async fn get_file_at(&self, path: &PathKey, reference: &str) -> Result<Bytes> {
        let mut inner = self.inner.lock();
        let tree = inner.resolve_tree(reference)?;
        let flat = inner.flatten(&tree)?;
        let (_, id) = flat
            .get(path.as_str())
            .copied()
            .ok_or_else(|| Error::PathNotFound(format!("{}@{}", path, reference)))?;
        inner.read_blob(&id)
    }

    async fn create_blob(&self, content: Bytes) -> Result<ObjectId> {
        let mut inner = self.inner.lock();
        inner.writes += 1;
        Ok(inner.write_blob(content))
    }

    async fn create_tree(&self, base: Option<&ObjectId>, entries: &[NewTreeEntry]) -> Result<ObjectId> {
        let mut inner = self.inner.lock();
        inner.writes += 1;

        let mut flat = match base {
            Some(tree) => inner.flatten(tree)?,
            None => FlatTree::new(),
        };

        for entry in entries {
            match entry.address {
                Some(id) => {
                    if !inner.blobs.contains_key(&id) {
                        return Err(Error::ObjectNotFound(id));
                    }
                    flat.insert(entry.path.as_str().to_string(), (entry.mode, id));
                }
                None => {
                    flat.remove(entry.path.as_str());
                }
            }
        }

        let id = inner.write_flat(&flat);
        debug!(tree = %id, entries = entries.len(), "memory store created tree");
        Ok(id)
    }

    async fn create_commit(&self, message: &str, tree: &ObjectId, parents: &[ObjectId]) -> Result<ObjectId> {
        let mut inner = self.inner.lock();
        inner.writes += 1;
        inner.tree(tree)?;
        for parent in parents {
            inner.commit(parent)?;
        }
        Ok(inner.write_commit(message, *tree, parents.to_vec()))
    }

    async fn create_ref(&self, branch: &str, commit: &ObjectId) -> Result<()> {
        validate_branch_name(branch)?;
        let mut inner = self.inner.lock();
        inner.writes += 1;
        inner.commit(commit)?;

        if inner.branches.contains_key(branch) {
            return Err(Error::Conflict {
                branch: branch.to_string(),
                expected: "no branch".to_string(),
                message: "reference already exists".to_string(),
            });
        }
        inner.branches.insert(branch.to_string(), *commit);
        Ok(())
    }

    async fn update_ref(&self, branch: &str, commit: &ObjectId, expected: &ObjectId) -> Result<()> {
        validate_branch_name(branch)?;
        let mut inner = self.inner.lock();
        inner.writes += 1;
        inner.commit(commit)?;

        match inner.branches.get(branch) {
            None => Err(Error::RefNotFound(branch.to_string())),
            Some(current) if current != expected => Err(Error::Conflict {
                branch: branch.to_string(),
                expected: expected.to_hex(),
                message: format!("branch is at {}", current.short()),
            }),
            Some(_) => {
                inner.branches.insert(branch.to_string(), *commit);
                Ok(())
            }
        }
    }

    async fn compare_refs(&self, base: &str, head: &str) -> Result<Vec<ChangedPath>> {
        let inner = self.inner.lock();
        let base = inner.flatten(&inner.resolve_tree(base)?)?;
        let head = inner.flatten(&inner.resolve_tree(head)?)?;

        let mut changes = Vec::new();
        for (path, (_, id)) in &head {
            match base.get(path) {
                None => changes.push(ChangedPath {
                    path: path.clone(),
                    status: ChangeStatus::Added,
                }),
                Some((_, old)) if old != id => changes.push(ChangedPath {
                    path: path.clone(),
                    status: ChangeStatus::Modified,
                }),
                Some(_) => {}
            }
        }
        for path in base.keys() {
            if !head.contains_key(path) {
                changes.push(ChangedPath {
                    path: path.clone(),
                    status: ChangeStatus::Removed,
                });
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(RepoId::new("acme", "configs"))
    }

    #[tokio::test]
    async fn test_blob_ids_match_git() {
        let store = store();
        let id = store.create_blob(Bytes::from_static(b"hello\n")).await.unwrap();
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_tree_ids_match_git() {
        // `mkdir t && printf 'hello\n' > t/hello.txt && git add . && git write-tree`
        let store = store();
        let blob = store.create_blob(Bytes::from_static(b"hello\n")).await.unwrap();
        let tree = store
            .create_tree(
                None,
                &[NewTreeEntry {
                    path: PathKey::new("hello.txt").unwrap(),
                    mode: EntryMode::Blob,
                    address: Some(blob),
                }],
            )
            .await
            .unwrap();
        assert_eq!(tree.to_hex(), "aaa96ced2d9a1c8e72c56b253a0e2fe78393feb7");

        let empty = store.create_tree(None, &[]).await.unwrap();
        assert_eq!(empty.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[tokio::test]
    async fn test_seed_and_read_back() {
        let store = store();
        store
            .seed_branch("main", &[("a.xml", b"<a/>"), ("dir/b.xml", b"<b/>")])
            .unwrap();
        assert_eq!(store.writes(), 0);

        let listing = store.get_tree("main", true).await.unwrap();
        let paths: Vec<_> = listing.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.xml", "dir", "dir/b.xml"]);
        assert!(!listing.truncated);

        let file = store
            .get_file_at(&PathKey::new("dir/b.xml").unwrap(), "main")
            .await
            .unwrap();
        assert_eq!(&file[..], b"<b/>");
        assert_eq!(store.blob_reads(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_removes_path() {
        let store = store();
        let tip = store
            .seed_branch("main", &[("a.xml", b"<a/>"), ("b.xml", b"<b/>")])
            .unwrap();
        let base = store.get_commit(&tip).await.unwrap().tree;

        let tree = store
            .create_tree(
                Some(&base),
                &[NewTreeEntry {
                    path: PathKey::new("a.xml").unwrap(),
                    mode: EntryMode::Blob,
                    address: None,
                }],
            )
            .await
            .unwrap();
        let listing = store.get_tree(&tree.to_hex(), true).await.unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].path, "b.xml");
    }

    #[tokio::test]
    async fn test_tree_rejects_unknown_blob() {
        let store = store();
        let err = store
            .create_tree(
                None,
                &[NewTreeEntry {
                    path: PathKey::new("a.xml").unwrap(),
                    mode: EntryMode::Blob,
                    address: Some(compute_blob_hash(b"never uploaded")),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_ref_is_compare_and_swap() {
        let store = store();
        let tip = store.seed_branch("main", &[("a.xml", b"<a/>")]).unwrap();
        let moved = store.advance_ref_behind_back("main").unwrap();
        assert_ne!(tip, moved);

        let err = store.update_ref("main", &tip, &tip).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.branch_tip("main"), Some(moved));

        store.update_ref("main", &tip, &moved).await.unwrap();
        assert_eq!(store.branch_tip("main"), Some(tip));
    }

    #[tokio::test]
    async fn test_create_ref_conflicts_when_present() {
        let store = store();
        let tip = store.seed_branch("main", &[("a.xml", b"<a/>")]).unwrap();
        store.create_ref("feature", &tip).await.unwrap();
        let err = store.create_ref("feature", &tip).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_absent_ref_is_none() {
        let store = store();
        assert_eq!(store.get_ref("nope").await.unwrap(), None);
        assert!(store.get_tree("nope", true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_blob_failure() {
        let store = store();
        store.seed_branch("main", &[("a.xml", b"<a/>")]).unwrap();
        let id = compute_blob_hash(b"<a/>");
        store.fail_blob_reads_for(id);
        assert!(store.get_blob(&id).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_compare_refs() {
        let store = store();
        store.seed_branch("main", &[("a.xml", b"1"), ("b.xml", b"2")]).unwrap();
        store.seed_branch("dev", &[("a.xml", b"1"), ("b.xml", b"2")]).unwrap();
        store.seed_branch("dev", &[("b.xml", b"3"), ("c.xml", b"4")]).unwrap();

        let changes = store.compare_refs("main", "dev").await.unwrap();
        let summary: Vec<String> = changes
            .iter()
            .map(|c| format!("{} {}", c.status, c.path))
            .collect();
        assert_eq!(summary, vec!["M b.xml", "A c.xml"]);
    }
}
