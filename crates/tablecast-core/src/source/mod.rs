//! Data sources
//!
//! A [`DataSource`] is one watched table origin: its cached snapshot, the
//! origin the text is read from, and the watcher that turns change
//! notifications into debounced re-parse cycles. Sources are owned by the
//! hub; nothing else mutates them.

mod watcher;

pub use watcher::{CycleOutcome, SourceWatcher, WatchOptions};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OriginError;
use crate::table::{diff, headers_changed, DiffSet, Table};

/// Where a data source's text comes from
pub trait Origin: Send + Sync + fmt::Debug {
    /// Read the full current text (blocking)
    fn read(&self) -> Result<String, OriginError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Filesystem path to watch for change notifications, if any
    fn watch_path(&self) -> Option<&Path> {
        None
    }
}

/// A file on disk
#[derive(Debug, Clone)]
pub struct FileOrigin {
    path: PathBuf,
}

impl FileOrigin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Origin for FileOrigin {
    fn read(&self) -> Result<String, OriginError> {
        std::fs::read_to_string(&self.path)
            .map_err(|e| OriginError::from_io(e, self.path.display().to_string()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// An in-process origin whose text is set programmatically
///
/// Change notifications must be delivered by calling
/// [`SourceWatcher::signal`] after [`MemoryOrigin::set`].
#[derive(Debug, Default)]
pub struct MemoryOrigin {
    text: Mutex<Option<String>>,
}

impl MemoryOrigin {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(Some(text.into())),
        }
    }

    /// Replace the text
    pub fn set(&self, text: impl Into<String>) {
        if let Ok(mut guard) = self.text.lock() {
            *guard = Some(text.into());
        }
    }

    /// Make the origin unreadable, as if deleted
    pub fn remove(&self) {
        if let Ok(mut guard) = self.text.lock() {
            *guard = None;
        }
    }
}

impl Origin for MemoryOrigin {
    fn read(&self) -> Result<String, OriginError> {
        let guard = self.text.lock().map_err(|_| OriginError::Interrupted {
            origin: self.describe(),
        })?;
        guard.clone().ok_or_else(|| OriginError::NotFound {
            origin: self.describe(),
        })
    }

    fn describe(&self) -> String {
        "<memory>".to_string()
    }
}

/// Result of applying a fresh snapshot to a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUpdate {
    pub changes: DiffSet,
    /// New header row, when it changed
    pub headers: Option<Vec<String>>,
}

impl SourceUpdate {
    /// Whether there is anything to broadcast
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.headers.is_none()
    }
}

/// One watched table origin with its cached snapshot
pub struct DataSource {
    id: String,
    title: String,
    table: Table,
    last_modified: DateTime<Utc>,
    origin: Arc<dyn Origin>,
    watcher: Option<SourceWatcher>,
    /// Set when the last cycle found the origin gone
    origin_removed: bool,
}

impl DataSource {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        table: Table,
        origin: Arc<dyn Origin>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            table,
            last_modified: Utc::now(),
            origin,
            watcher: None,
            origin_removed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Record that the origin has disappeared
    pub fn mark_origin_removed(&mut self) {
        self.origin_removed = true;
    }

    pub fn is_origin_removed(&self) -> bool {
        self.origin_removed
    }

    /// Attach the watcher that feeds this source; replaces (and stops)
    /// any previous one
    pub fn attach_watcher(&mut self, watcher: SourceWatcher) {
        self.watcher = Some(watcher);
    }

    /// Send a "maybe changed" signal to this source's watcher
    pub fn signal(&self) -> bool {
        self.watcher.as_ref().is_some_and(SourceWatcher::signal)
    }

    /// Diff a fresh snapshot against the cached one and replace it
    pub fn apply(&mut self, next: Table) -> SourceUpdate {
        let changes = diff(&self.table, &next);
        let headers = headers_changed(&self.table, &next).then(|| next.headers().to_vec());

        self.table = next;
        self.last_modified = Utc::now();
        self.origin_removed = false;

        SourceUpdate { changes, headers }
    }

    /// Summary for listings
    pub fn summary(&self, subscribers: usize) -> SourceSummary {
        SourceSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            headers: self.table.headers().to_vec(),
            row_count: self.table.row_count(),
            last_modified: self.last_modified,
            origin: self.origin.describe(),
            subscribers,
        }
    }

    /// Full snapshot for initial sync
    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            headers: self.table.headers().to_vec(),
            rows: self.table.rows().to_vec(),
            last_modified: self.last_modified,
        }
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("rows", &self.table.row_count())
            .field("origin", &self.origin)
            .finish()
    }
}

/// Listing entry for a data source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub id: String,
    pub title: String,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub last_modified: DateTime<Utc>,
    pub origin: String,
    pub subscribers: usize,
}

/// Full table snapshot of a data source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSnapshot {
    pub id: String,
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub last_modified: DateTime<Utc>,
}
