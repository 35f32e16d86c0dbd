//! Debounced per-root file watching.
//!
//! Raw `notify` events funnel into a debounce task that coalesces repeated
//! events on the same relative path (last event wins) and flushes one batch
//! `debounce_ms` after the last event — the quiet window doubles as the
//! write-stability wait, so consumers never see a file mid-write. Paths
//! under `.minimem/`, exclude-glob matches, and non-include paths never
//! surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::GlobSet;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::WatchConfig;
use crate::error::{Error, Result};
use crate::files::build_globs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Change,
    Unlink,
}

/// One coalesced change, path relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
}

/// A change prefixed with the root that produced it (multi-root watching).
#[derive(Debug, Clone)]
pub struct RootedBatch {
    pub root: PathBuf,
    pub changes: Vec<Change>,
}

// ---------------------------------------------------------------------------
// Event mapping and filtering
// ---------------------------------------------------------------------------

fn map_event_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Add),
        EventKind::Modify(_) => Some(ChangeKind::Change),
        EventKind::Remove(_) => Some(ChangeKind::Unlink),
        _ => None,
    }
}

/// Root-relative path for an event target, or `None` when the path is
/// outside the root, under `.minimem/`, or filtered by the globs.
fn relative_watched_path(
    root: &Path,
    abs: &Path,
    include: &GlobSet,
    exclude: &GlobSet,
) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?.to_string_lossy().replace('\\', "/");
    if rel.is_empty() || rel == ".minimem" || rel.starts_with(".minimem/") {
        return None;
    }
    if !include.is_match(&rel) || exclude.is_match(&rel) {
        return None;
    }
    Some(rel)
}

/// Merge a new event into the pending map: the last event for a path wins.
fn coalesce(pending: &mut BTreeMap<String, ChangeKind>, rel: String, kind: ChangeKind) {
    pending.insert(rel, kind);
}

fn drain_batch(root: &Path, pending: &mut BTreeMap<String, ChangeKind>) -> Vec<Change> {
    std::mem::take(pending)
        .into_iter()
        .map(|(path, kind)| {
            // Re-check existence at flush time: a create+delete inside one
            // debounce window must surface as an unlink.
            let kind = if root.join(&path).exists() {
                match kind {
                    ChangeKind::Unlink => ChangeKind::Change,
                    other => other,
                }
            } else {
                ChangeKind::Unlink
            };
            Change { kind, path }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Per-root watcher
// ---------------------------------------------------------------------------

enum WatcherBackend {
    Recommended(RecommendedWatcher),
    Poll(notify::PollWatcher),
}

/// A live watch on one memory root. Dropping the handle stops the OS watch
/// and cancels the debounce task.
pub struct MemoryWatcher {
    batches: mpsc::Receiver<Vec<Change>>,
    debounce_task: tokio::task::JoinHandle<()>,
    _backend: WatcherBackend,
}

impl MemoryWatcher {
    /// Next coalesced batch; `None` after the watcher is closed.
    pub async fn next_batch(&mut self) -> Option<Vec<Change>> {
        self.batches.recv().await
    }

    pub fn close(self) {
        // Drop does the work.
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.debounce_task.abort();
    }
}

/// Start watching `root` with the given debounce/filter options.
pub fn watch(root: &Path, config: &WatchConfig) -> Result<MemoryWatcher> {
    let include = build_globs(&config.include)?;
    let exclude = build_globs(&config.exclude)?;
    let root = root.to_path_buf();

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
    let handler = move |result: std::result::Result<Event, notify::Error>| match result {
        Ok(event) => {
            let _ = raw_tx.send(event);
        }
        Err(e) => warn!(error = %e, "watch event error"),
    };

    let backend = if config.use_polling {
        let notify_config = notify::Config::default()
            .with_poll_interval(Duration::from_millis(config.poll_interval_ms.max(100)));
        let mut watcher = notify::PollWatcher::new(handler, notify_config)
            .map_err(|e| Error::Watcher(e.to_string()))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watcher(e.to_string()))?;
        WatcherBackend::Poll(watcher)
    } else {
        let mut watcher = RecommendedWatcher::new(handler, notify::Config::default())
            .map_err(|e| Error::Watcher(e.to_string()))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watcher(e.to_string()))?;
        WatcherBackend::Recommended(watcher)
    };
    debug!(root = %root.display(), polling = config.use_polling, "watching");

    let (batch_tx, batch_rx) = mpsc::channel::<Vec<Change>>(64);
    let debounce = Duration::from_millis(config.debounce_ms.max(1));

    let debounce_task = tokio::spawn(async move {
        let mut pending: BTreeMap<String, ChangeKind> = BTreeMap::new();
        loop {
            let event = if pending.is_empty() {
                match raw_rx.recv().await {
                    Some(event) => Some(event),
                    None => break,
                }
            } else {
                // Quiet-window flush: emit once no event arrives for the
                // full debounce period.
                match tokio::time::timeout(debounce, raw_rx.recv()).await {
                    Ok(Some(event)) => Some(event),
                    Ok(None) => break,
                    Err(_) => None,
                }
            };

            match event {
                Some(event) => {
                    if let Some(kind) = map_event_kind(&event.kind) {
                        for path in &event.paths {
                            if let Some(rel) =
                                relative_watched_path(&root, path, &include, &exclude)
                            {
                                coalesce(&mut pending, rel, kind);
                            }
                        }
                    }
                }
                None => {
                    let batch = drain_batch(&root, &mut pending);
                    if !batch.is_empty() && batch_tx.send(batch).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Flush whatever is pending on shutdown.
        let batch = drain_batch(&root, &mut pending);
        if !batch.is_empty() {
            let _ = batch_tx.send(batch).await;
        }
    });

    Ok(MemoryWatcher { batches: batch_rx, debounce_task, _backend: backend })
}

// ---------------------------------------------------------------------------
// Multi-root wrapper
// ---------------------------------------------------------------------------

/// Several per-root watchers merged into one stream, each batch tagged with
/// its root.
pub struct MultiWatcher {
    batches: mpsc::Receiver<RootedBatch>,
    forwarders: Vec<tokio::task::JoinHandle<()>>,
}

impl MultiWatcher {
    pub fn new(roots: &[PathBuf], config: &WatchConfig) -> Result<MultiWatcher> {
        let (tx, rx) = mpsc::channel::<RootedBatch>(64);
        let mut forwarders = Vec::with_capacity(roots.len());
        for root in roots {
            let mut watcher = watch(root, config)?;
            let tx = tx.clone();
            let root = root.clone();
            forwarders.push(tokio::spawn(async move {
                while let Some(changes) = watcher.next_batch().await {
                    if tx.send(RootedBatch { root: root.clone(), changes }).await.is_err() {
                        break;
                    }
                }
            }));
        }
        Ok(MultiWatcher { batches: rx, forwarders })
    }

    pub async fn next_batch(&mut self) -> Option<RootedBatch> {
        self.batches.recv().await
    }
}

impl Drop for MultiWatcher {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}
