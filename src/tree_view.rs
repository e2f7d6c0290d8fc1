//! hierarchical view and counters over a flat diff
use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::diff::{DiffEntry, DiffNote, DiffStatus};
use crate::path::PathKey;

/// file leaf pointing back into the flat entry list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileLeaf {
    /// index into the entries the tree was built from
    pub entry: usize,
    pub status: DiffStatus,
    pub note: Option<DiffNote>,
}

/// a file, or a directory of named children
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileNode {
    File(FileLeaf),
    Dir(BTreeMap<String, FileNode>),
}

impl FileNode {
    /// build the tree once from a flat entry list
    pub fn build(entries: &[DiffEntry]) -> FileNode {
        let mut root = BTreeMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            let leaf = FileLeaf {
                entry: idx,
                status: entry.status,
                note: entry.note,
            };
            let parts: Vec<&str> = entry.path.components().collect();
            if !insert(&mut root, &parts, leaf) {
                warn!(path = %entry.path, "path clashes with another entry, left out of tree view");
            }
        }
        FileNode::Dir(root)
    }

    /// node at `path`
    pub fn get(&self, path: &PathKey) -> Option<&FileNode> {
        let mut node = self;
        for part in path.components() {
            match node {
                FileNode::Dir(children) => node = children.get(part)?,
                FileNode::File(_) => return None,
            }
        }
        Some(node)
    }

    pub fn file_count(&self) -> usize {
        match self {
            FileNode::File(_) => 1,
            FileNode::Dir(children) => children.values().map(FileNode::file_count).sum(),
        }
    }

    /// leaves below this node, depth first in name order
    pub fn leaves(&self) -> Vec<FileLeaf> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<FileLeaf>) {
        match self {
            FileNode::File(leaf) => out.push(*leaf),
            FileNode::Dir(children) => {
                for child in children.values() {
                    child.collect_leaves(out);
                }
            }
        }
    }

    /// indented text rendering, one node per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let FileNode::Dir(children) = self {
            render_children(children, 0, &mut out);
        }
        out
    }
}

fn insert(dir: &mut BTreeMap<String, FileNode>, parts: &[&str], leaf: FileLeaf) -> bool {
    match parts {
        [] => false,
        [name] => {
            if dir.contains_key(*name) {
                return false;
            }
            dir.insert(name.to_string(), FileNode::File(leaf));
            true
        }
        [name, rest @ ..] => {
            let child = dir
                .entry(name.to_string())
                .or_insert_with(|| FileNode::Dir(BTreeMap::new()));
            match child {
                FileNode::Dir(children) => insert(children, rest, leaf),
                FileNode::File(_) => false,
            }
        }
    }
}

fn render_children(children: &BTreeMap<String, FileNode>, depth: usize, out: &mut String) {
    for (name, node) in children {
        let indent = "  ".repeat(depth);
        match node {
            FileNode::Dir(grandchildren) => {
                out.push_str(&format!("{}{}/\n", indent, name));
                render_children(grandchildren, depth + 1, out);
            }
            FileNode::File(leaf) => {
                out.push_str(&format!("{}{} {}", indent, leaf.status, name));
                if let Some(note) = leaf.note {
                    out.push_str(&format!(" ({})", note));
                }
                out.push('\n');
            }
        }
    }
}

/// per-status counters for a comparison
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub total: usize,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub same: usize,
    pub identical_after_normalization: usize,
    pub fetch_errors: usize,
    pub selected: usize,
}

impl DiffSummary {
    pub fn from_entries<F>(entries: &[DiffEntry], is_selected: F) -> Self
    where
        F: Fn(&DiffEntry) -> bool,
    {
        let mut summary = DiffSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            match entry.status {
                DiffStatus::Added => summary.added += 1,
                DiffStatus::Modified => summary.modified += 1,
                DiffStatus::Removed => summary.removed += 1,
                DiffStatus::Same => summary.same += 1,
                DiffStatus::FetchError => summary.fetch_errors += 1,
            }
            if entry.is_identical_after_normalization() {
                summary.identical_after_normalization += 1;
            }
            if is_selected(entry) {
                summary.selected += 1;
            }
        }
        summary
    }

    pub fn changed(&self) -> usize {
        self.added + self.modified + self.removed
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} new, {} modified, {} removed, {} same",
            self.added, self.modified, self.removed, self.same
        )?;
        if self.identical_after_normalization > 0 {
            write!(
                f,
                " ({} identical after normalization)",
                self.identical_after_normalization
            )?;
        }
        if self.fetch_errors > 0 {
            write!(f, ", {} could not be fetched", self.fetch_errors)?;
        }
        if self.selected > 0 {
            write!(f, ", {} selected", self.selected)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::EntryMode;

    fn entry(path: &str, status: DiffStatus) -> DiffEntry {
        DiffEntry {
            path: PathKey::new(path).unwrap(),
            status,
            source_address: None,
            target_address: None,
            mode: EntryMode::Blob,
            content: None,
            note: None,
            error: None,
        }
    }

    #[test]
    fn test_build_nested() {
        let entries = vec![
            entry("b.xml", DiffStatus::Added),
            entry("cfg/x.xml", DiffStatus::Modified),
            entry("cfg/deep/y.xml", DiffStatus::Same),
        ];
        let tree = FileNode::build(&entries);
        assert_eq!(tree.file_count(), 3);

        let cfg = tree.get(&PathKey::new("cfg").unwrap()).unwrap();
        assert_eq!(cfg.file_count(), 2);
        assert!(matches!(
            tree.get(&PathKey::new("cfg/x.xml").unwrap()),
            Some(FileNode::File(FileLeaf { entry: 1, .. }))
        ));
        assert!(tree.get(&PathKey::new("b.xml/nope").unwrap()).is_none());
    }

    #[test]
    fn test_render() {
        let mut same = entry("cfg/y.xml", DiffStatus::Same);
        same.note = Some(DiffNote::IdenticalAfterNormalization);
        let entries = vec![entry("cfg/x.xml", DiffStatus::Modified), same, entry("a.xml", DiffStatus::Added)];

        let rendered = FileNode::build(&entries).render();
        assert_eq!(
            rendered,
            "A a.xml\ncfg/\n  M x.xml\n  = y.xml (identical after normalization)\n"
        );
    }

    #[test]
    fn test_clashing_paths_are_left_out() {
        let entries = vec![entry("a", DiffStatus::Added), entry("a/b.xml", DiffStatus::Removed)];
        let tree = FileNode::build(&entries);
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn test_leaves_order() {
        let entries = vec![entry("z.xml", DiffStatus::Added), entry("a/b.xml", DiffStatus::Added)];
        let leaves = FileNode::build(&entries).leaves();
        assert_eq!(leaves.iter().map(|l| l.entry).collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn test_summary() {
        let mut downgraded = entry("c.xml", DiffStatus::Same);
        downgraded.note = Some(DiffNote::IdenticalAfterNormalization);
        let entries = vec![
            entry("a.xml", DiffStatus::Added),
            entry("b.xml", DiffStatus::Modified),
            downgraded,
            entry("d.xml", DiffStatus::FetchError),
        ];
        let summary = DiffSummary::from_entries(&entries, |e| e.is_change());
        assert_eq!(summary.total, 4);
        assert_eq!(summary.changed(), 2);
        assert_eq!(summary.selected, 2);
        assert_eq!(
            summary.to_string(),
            "1 new, 1 modified, 0 removed, 1 same (1 identical after normalization), 1 could not be fetched, 2 selected"
        );
    }
}
