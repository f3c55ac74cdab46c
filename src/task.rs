//! Units of work and the directory walk that produces them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::Result;

/// Stable, unique identity of a task: the absolute path of its file.
///
/// Progress is always keyed by this, never by a display label, so two files
/// that happen to share a name cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey(PathBuf);

impl TaskKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Base name of the file, for compact display.
    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.to_string_lossy().into_owned())
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// One file's upload unit of work. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    key: TaskKey,
    size: u64,
    query: BTreeMap<String, String>,
}

impl Task {
    pub fn new(key: TaskKey, size: u64) -> Self {
        Self {
            key,
            size,
            query: BTreeMap::new(),
        }
    }

    /// Returns the task with an extra query parameter attached to its upload.
    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        self.key.path()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }
}

/// Walks `root` recursively and returns one task per regular file.
///
/// Keys are absolute: the root is canonicalized before the walk. Any walk
/// error aborts enumeration, since a partial file list would silently skip
/// data.
pub fn enumerate(root: &Path) -> Result<Vec<Task>> {
    let root = std::fs::canonicalize(root)?;
    let mut tasks = Vec::new();

    for entry in WalkDir::new(&root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata()?.len();
        tasks.push(Task::new(TaskKey::new(entry.into_path()), size));
    }

    tracing::debug!(root = %root.display(), files = tasks.len(), "enumerated files");
    Ok(tasks)
}

/// Sum of all task sizes, saturating.
pub fn total_bytes(tasks: &[Task]) -> u64 {
    tasks.iter().fold(0u64, |acc, t| acc.saturating_add(t.size()))
}
