//! Working-tree snapshots
//!
//! The engine only needs two things from a snapshot service: a handle for
//! the current state of the tree, and the per-file difference between two
//! handles. [`NoSnapshot`] opts out entirely; [`MemorySnapshot`] tracks an
//! in-memory file map, which is enough for embedding and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Deleted,
    Modified,
}

/// Change to one file between two snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub file: String,
    pub before: String,
    pub after: String,
    pub additions: u32,
    pub deletions: u32,
    pub status: FileStatus,
}

impl FileDiff {
    /// Compare two versions of a file line by line
    pub fn compute(file: impl Into<String>, before: Option<&str>, after: Option<&str>) -> Self {
        let status = match (before, after) {
            (None, _) => FileStatus::Added,
            (_, None) => FileStatus::Deleted,
            _ => FileStatus::Modified,
        };
        let before = before.unwrap_or_default();
        let after = after.unwrap_or_default();
        let (mut additions, mut deletions) = (0, 0);
        for change in TextDiff::from_lines(before, after).iter_all_changes() {
            match change.tag() {
                ChangeTag::Insert => additions += 1,
                ChangeTag::Delete => deletions += 1,
                ChangeTag::Equal => {}
            }
        }
        Self {
            file: file.into(),
            before: before.to_string(),
            after: after.to_string(),
            additions,
            deletions,
            status,
        }
    }
}

#[async_trait]
pub trait Snapshot: Send + Sync {
    /// Record the current tree. `None` when snapshots are unavailable.
    async fn track(&self) -> Option<String>;

    /// Files that differ between two tracked handles
    async fn diff(&self, from: &str, to: &str) -> Vec<FileDiff>;
}

/// Snapshots disabled
pub struct NoSnapshot;

#[async_trait]
impl Snapshot for NoSnapshot {
    async fn track(&self) -> Option<String> {
        None
    }

    async fn diff(&self, _from: &str, _to: &str) -> Vec<FileDiff> {
        vec![]
    }
}

type Tree = BTreeMap<String, String>;

#[derive(Default)]
struct MemoryState {
    files: Tree,
    snapshots: HashMap<String, Tree>,
}

/// Snapshots of an in-memory file map
#[derive(Default)]
pub struct MemorySnapshot {
    state: Mutex<MemoryState>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_file(&self, path: impl Into<String>, content: impl Into<String>) {
        self.state.lock().files.insert(path.into(), content.into());
    }

    pub fn remove_file(&self, path: &str) {
        self.state.lock().files.remove(path);
    }
}

#[async_trait]
impl Snapshot for MemorySnapshot {
    async fn track(&self) -> Option<String> {
        let mut state = self.state.lock();
        let handle = format!("snap_{}", state.snapshots.len());
        let files = state.files.clone();
        state.snapshots.insert(handle.clone(), files);
        Some(handle)
    }

    async fn diff(&self, from: &str, to: &str) -> Vec<FileDiff> {
        let state = self.state.lock();
        let (Some(before), Some(after)) = (state.snapshots.get(from), state.snapshots.get(to))
        else {
            tracing::warn!(from, to, "diff of unknown snapshot");
            return vec![];
        };
        let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        paths
            .into_iter()
            .filter(|path| before.get(*path) != after.get(*path))
            .map(|path| {
                FileDiff::compute(
                    path.as_str(),
                    before.get(path).map(String::as_str),
                    after.get(path).map(String::as_str),
                )
            })
            .collect()
    }
}
