// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// What a tool did to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// One recorded file mutation.  Old/new content are carried so the loop can
/// synthesize patch parts without re-reading the disk.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
}

/// Per-session record of file mutations, written only by tools through
/// [`FileChangeTracker::record`] and drained by the loop after each
/// execution.
#[derive(Clone, Default)]
pub struct FileChangeTracker {
    inner: Arc<Mutex<Vec<FileChange>>>,
}

impl FileChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The narrow write interface for tools.
    pub fn record(&self, change: FileChange) {
        self.inner.lock().unwrap().push(change);
    }

    /// Remove and return everything recorded since the last drain.
    pub fn drain(&self) -> Vec<FileChange> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

/// Per-session todo list.  Tools replace it wholesale; the loop snapshots it.
#[derive(Clone, Default)]
pub struct TodoTracker {
    inner: Arc<Mutex<Vec<TodoItem>>>,
}

impl TodoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The narrow write interface for tools.
    pub fn replace(&self, items: Vec<TodoItem>) {
        *self.inner.lock().unwrap() = items;
    }

    pub fn snapshot(&self) -> Vec<TodoItem> {
        self.inner.lock().unwrap().clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_tracker_drain_empties_the_record() {
        let tracker = FileChangeTracker::new();
        tracker.record(FileChange {
            path: PathBuf::from("a.rs"),
            kind: ChangeKind::Created,
            old_content: None,
            new_content: Some("fn main() {}".into()),
        });
        assert!(!tracker.is_empty());
        let drained = tracker.drain();
        assert_eq!(drained.len(), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn file_tracker_clones_share_state() {
        let a = FileChangeTracker::new();
        let b = a.clone();
        b.record(FileChange {
            path: PathBuf::from("x"),
            kind: ChangeKind::Deleted,
            old_content: None,
            new_content: None,
        });
        assert_eq!(a.drain().len(), 1);
    }

    #[test]
    fn todo_tracker_replace_and_snapshot() {
        let t = TodoTracker::new();
        t.replace(vec![TodoItem {
            content: "write tests".into(),
            status: TodoStatus::InProgress,
        }]);
        let snap = t.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].status, TodoStatus::InProgress);
    }
}
