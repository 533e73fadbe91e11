//! Debounced change watcher
//!
//! Every low-level notification is a "maybe changed" signal. Signals
//! (re)start a fixed debounce window; only when the window elapses
//! without a new signal does one re-parse cycle run, so a burst of
//! notifications from a single save costs one read, one parse and at most
//! one broadcast.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Origin;
use crate::error::{CycleError, OriginError};
use crate::table::{ParseOptions, Table, TableParser};

/// Watcher options
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Quiet period required before a cycle runs
    pub debounce: Duration,
    /// Options for re-parsing the origin
    pub parse: ParseOptions,
    /// Install a filesystem watch for origins that have a path
    pub watch_filesystem: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            parse: ParseOptions::default(),
            watch_filesystem: true,
        }
    }
}

/// Result of one re-parse cycle
#[derive(Debug)]
pub struct CycleOutcome {
    pub source_id: String,
    pub result: Result<Table, CycleError>,
}

/// Debounced watcher for one data source
///
/// Dropping the watcher stops its debounce task and filesystem watch.
pub struct SourceWatcher {
    source_id: String,
    signal_tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
    fs_watcher: Option<RecommendedWatcher>,
}

impl SourceWatcher {
    /// Start watching `origin`
    ///
    /// Each completed cycle is handed to `sink`; the watcher stops when
    /// `sink` returns false.
    pub fn spawn<F>(
        source_id: impl Into<String>,
        origin: Arc<dyn Origin>,
        options: WatchOptions,
        sink: F,
    ) -> Self
    where
        F: Fn(CycleOutcome) -> bool + Send + 'static,
    {
        let source_id = source_id.into();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let fs_watcher = match origin.watch_path() {
            Some(path) if options.watch_filesystem => {
                match create_watcher(path, signal_tx.clone()) {
                    Ok(watcher) => {
                        debug!(source = %source_id, path = %path.display(), "Watching origin");
                        Some(watcher)
                    }
                    Err(e) => {
                        warn!(
                            source = %source_id,
                            "Could not watch {}: {}. Only manual and polling refreshes will apply.",
                            path.display(),
                            e
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let task = tokio::spawn(debounce_loop(
            source_id.clone(),
            origin,
            options,
            signal_rx,
            sink,
        ));

        Self {
            source_id,
            signal_tx,
            task,
            fs_watcher,
        }
    }

    /// Deliver a "maybe changed" signal
    pub fn signal(&self) -> bool {
        self.signal_tx.send(()).is_ok()
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Whether a filesystem watch is installed
    pub fn is_watching_filesystem(&self) -> bool {
        self.fs_watcher.is_some()
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn debounce_loop<F>(
    source_id: String,
    origin: Arc<dyn Origin>,
    options: WatchOptions,
    mut signals: mpsc::UnboundedReceiver<()>,
    sink: F,
) where
    F: Fn(CycleOutcome) -> bool,
{
    let parser = TableParser::new(options.parse);

    while signals.recv().await.is_some() {
        let mut coalesced = 1usize;
        loop {
            tokio::select! {
                signal = signals.recv() => {
                    if signal.is_none() {
                        return;
                    }
                    coalesced += 1;
                }
                _ = tokio::time::sleep(options.debounce) => break,
            }
        }

        debug!(source = %source_id, signals = coalesced, "Debounce window elapsed, re-reading origin");
        let result = run_cycle(&origin, &parser).await;
        match &result {
            Ok(table) => debug!(source = %source_id, rows = table.row_count(), "Origin parsed"),
            Err(CycleError::Parse(e)) => {
                warn!(source = %source_id, "Skipping cycle, parse failed: {}", e)
            }
            Err(CycleError::Origin(e)) => {
                warn!(source = %source_id, "Skipping cycle, origin unavailable: {}", e)
            }
        }

        if !sink(CycleOutcome {
            source_id: source_id.clone(),
            result,
        }) {
            info!(source = %source_id, "Cycle receiver gone, stopping watcher");
            return;
        }
    }
}

async fn run_cycle(origin: &Arc<dyn Origin>, parser: &TableParser) -> Result<Table, CycleError> {
    let reader = Arc::clone(origin);
    let text = tokio::task::spawn_blocking(move || reader.read())
        .await
        .map_err(|_| OriginError::Interrupted {
            origin: origin.describe(),
        })??;

    Ok(parser.parse(&text)?)
}

fn create_watcher(
    path: &Path,
    tx: mpsc::UnboundedSender<()>,
) -> Result<RecommendedWatcher, notify::Error> {
    let file_name = path.file_name().map(|n| n.to_os_string());
    let target = path.to_path_buf();

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                if is_origin_event(&event, &target, file_name.as_deref()) {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("Watch error: {:?}", e),
        }
    })?;

    // Watch the directory: editors often replace the file via rename,
    // which would silently end a watch on the file itself.
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    Ok(watcher)
}

/// Whether a filesystem event concerns the watched file
fn is_origin_event(event: &Event, target: &Path, file_name: Option<&std::ffi::OsStr>) -> bool {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
            event.paths.iter().any(|p| {
                p == target || (file_name.is_some() && p.file_name() == file_name)
            })
        }
        _ => false,
    }
}
