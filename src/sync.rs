//! Push/pull synchronization between a memory root and the central repo.
//!
//! The conflict policy is last-write-wins, two-way: `push` overwrites remote
//! content and never deletes remote files; `pull` overwrites local content
//! only under `force` and never deletes local files. Deletions do not
//! propagate in either direction. Every file transfer is an atomic
//! copy-then-rename, per-file failures are collected without aborting the
//! operation, and each operation appends one JSONL entry to
//! `.minimem/sync.log` (best effort, bounded to the newest 1000 entries).

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::files::{atomic_write, list_syncable};
use crate::registry::{normalize_central_path, Registry};
use crate::sync_state::{classify, SyncState, SyncStatus};

const SYNC_LOG_MAX_ENTRIES: usize = 1000;

// ---------------------------------------------------------------------------
// Context and results
// ---------------------------------------------------------------------------

/// Everything one sync operation needs, resolved up front.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub root: PathBuf,
    pub central_root: PathBuf,
    /// Normalized sub-path under the central repo (trailing `/`).
    pub central_path: String,
    pub machine_id: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl SyncContext {
    /// Build a context from an engine config, enforcing the preconditions:
    /// sync enabled, central repo known, central sub-path configured.
    pub fn from_config(
        config: &EngineConfig,
        central_root: &Path,
        machine_id: &str,
    ) -> Result<SyncContext> {
        if !config.sync.enabled {
            return Err(Error::Config(format!(
                "sync is not enabled for {}",
                config.root.display()
            )));
        }
        let central_path = config
            .sync
            .central_path
            .as_deref()
            .ok_or_else(|| Error::Config("sync.centralPath is not configured".into()))?;
        Ok(SyncContext {
            root: config.root.clone(),
            central_root: central_root.to_path_buf(),
            central_path: normalize_central_path(central_path),
            machine_id: machine_id.to_string(),
            include: config.sync.include.clone(),
            exclude: config.sync.exclude.clone(),
        })
    }

    /// Directory under the central repo this root mirrors into.
    pub fn remote_dir(&self) -> PathBuf {
        if self.central_path == "/" {
            self.central_root.clone()
        } else {
            self.central_root.join(self.central_path.trim_end_matches('/'))
        }
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(".minimem").join("sync-state.json")
    }

    fn log_path(&self) -> PathBuf {
        self.root.join(".minimem").join("sync.log")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFileError {
    pub path: String,
    pub reason: String,
}

/// Aggregated result of a push, pull, or bidirectional sync.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub pushed: Vec<String>,
    pub pulled: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<SyncFileError>,
    pub dry_run: bool,
}

impl SyncOutcome {
    /// `success` when nothing failed, `failure` when nothing succeeded,
    /// `partial` otherwise.
    pub fn result_label(&self) -> &'static str {
        if self.errors.is_empty() {
            "success"
        } else if self.pushed.is_empty() && self.pulled.is_empty() {
            "failure"
        } else {
            "partial"
        }
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(mut self, other: SyncOutcome) -> SyncOutcome {
        self.pushed.extend(other.pushed);
        self.pulled.extend(other.pulled);
        self.skipped.extend(other.skipped);
        self.errors.extend(other.errors);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Pull only: overwrite locally-modified files.
    pub force: bool,
}

// ---------------------------------------------------------------------------
// Hash-state snapshot
// ---------------------------------------------------------------------------

struct FilePair {
    rel_path: String,
    local_hash: Option<String>,
    remote_hash: Option<String>,
}

fn hash_file(path: &Path) -> Result<Option<String>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some({
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::fs(path, e)),
    }
}

/// Enumerate the union of local and remote syncable paths and hash both
/// sides of each (parallel; hashing dominates the wall time on big roots).
fn snapshot(ctx: &SyncContext) -> Result<Vec<FilePair>> {
    let local = list_syncable(&ctx.root, &ctx.include, &ctx.exclude)?;
    let remote_dir = ctx.remote_dir();
    let remote = list_syncable(&remote_dir, &ctx.include, &ctx.exclude)?;

    let mut union: Vec<String> = local;
    for path in remote {
        if !union.contains(&path) {
            union.push(path);
        }
    }
    union.sort();

    union
        .into_par_iter()
        .map(|rel_path| {
            let local_hash = hash_file(&ctx.root.join(&rel_path))?;
            let remote_hash = hash_file(&remote_dir.join(&rel_path))?;
            Ok(FilePair { rel_path, local_hash, remote_hash })
        })
        .collect()
}

fn copy_file_atomic(src: &Path, dest: &Path) -> Result<()> {
    let bytes = std::fs::read(src).map_err(|e| Error::fs(src, e))?;
    atomic_write(dest, &bytes)
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Copy local-side changes to the central repo. Never deletes remotely.
pub async fn push(ctx: &SyncContext, options: SyncOptions) -> Result<SyncOutcome> {
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || push_blocking(&ctx, options)).await?
}

fn push_blocking(ctx: &SyncContext, options: SyncOptions) -> Result<SyncOutcome> {
    let mut state = SyncState::load(&ctx.state_path(), &ctx.central_path)?;
    let pairs = snapshot(ctx)?;
    let remote_dir = ctx.remote_dir();
    let timestamp = now_iso();

    let mut outcome = SyncOutcome { dry_run: options.dry_run, ..SyncOutcome::default() };
    for pair in &pairs {
        match classify(pair.local_hash.as_deref(), pair.remote_hash.as_deref()) {
            SyncStatus::Unchanged => {}
            SyncStatus::RemoteOnly => {
                // Deletions do not propagate.
                outcome.skipped.push(pair.rel_path.clone());
            }
            SyncStatus::LocalOnly | SyncStatus::LocalModified => {
                if options.dry_run {
                    outcome.pushed.push(pair.rel_path.clone());
                    continue;
                }
                let src = ctx.root.join(&pair.rel_path);
                let dest = remote_dir.join(&pair.rel_path);
                match copy_file_atomic(&src, &dest) {
                    Ok(()) => {
                        let hash = pair.local_hash.as_deref().unwrap_or_default();
                        state.record_transfer(&pair.rel_path, hash, &timestamp);
                        outcome.pushed.push(pair.rel_path.clone());
                    }
                    Err(e) => outcome
                        .errors
                        .push(SyncFileError { path: pair.rel_path.clone(), reason: e.to_string() }),
                }
            }
        }
    }

    if !options.dry_run {
        if !outcome.pushed.is_empty() {
            state.last_sync = Some(timestamp.clone());
        }
        state.save(&ctx.state_path())?;
        touch_registry(ctx, &timestamp);
        append_log(ctx, "push", &outcome);
    }
    info!(
        pushed = outcome.pushed.len(),
        skipped = outcome.skipped.len(),
        errors = outcome.errors.len(),
        dry_run = options.dry_run,
        "push complete"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

/// Copy remote-side changes into the local root. Never deletes locally;
/// locally-modified files are only overwritten under `force`.
pub async fn pull(ctx: &SyncContext, options: SyncOptions) -> Result<SyncOutcome> {
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || pull_blocking(&ctx, options)).await?
}

fn pull_blocking(ctx: &SyncContext, options: SyncOptions) -> Result<SyncOutcome> {
    let mut state = SyncState::load(&ctx.state_path(), &ctx.central_path)?;
    let pairs = snapshot(ctx)?;
    let remote_dir = ctx.remote_dir();
    let timestamp = now_iso();

    let mut outcome = SyncOutcome { dry_run: options.dry_run, ..SyncOutcome::default() };
    for pair in &pairs {
        let transfer = match classify(pair.local_hash.as_deref(), pair.remote_hash.as_deref()) {
            SyncStatus::Unchanged => continue,
            SyncStatus::LocalOnly => {
                outcome.skipped.push(pair.rel_path.clone());
                continue;
            }
            SyncStatus::RemoteOnly => true,
            SyncStatus::LocalModified => options.force,
        };
        if !transfer {
            outcome.skipped.push(pair.rel_path.clone());
            continue;
        }
        if options.dry_run {
            outcome.pulled.push(pair.rel_path.clone());
            continue;
        }
        let src = remote_dir.join(&pair.rel_path);
        let dest = ctx.root.join(&pair.rel_path);
        match copy_file_atomic(&src, &dest) {
            Ok(()) => {
                let hash = pair.remote_hash.as_deref().unwrap_or_default();
                state.record_transfer(&pair.rel_path, hash, &timestamp);
                outcome.pulled.push(pair.rel_path.clone());
            }
            Err(e) => outcome
                .errors
                .push(SyncFileError { path: pair.rel_path.clone(), reason: e.to_string() }),
        }
    }

    if !options.dry_run {
        if !outcome.pulled.is_empty() {
            state.last_sync = Some(timestamp.clone());
        }
        state.save(&ctx.state_path())?;
        touch_registry(ctx, &timestamp);
        append_log(ctx, "pull", &outcome);
    }
    info!(
        pulled = outcome.pulled.len(),
        skipped = outcome.skipped.len(),
        errors = outcome.errors.len(),
        dry_run = options.dry_run,
        "pull complete"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Bidirectional
// ---------------------------------------------------------------------------

/// Push, then pull. The aggregate succeeds iff both halves did.
pub async fn sync_bidirectional(ctx: &SyncContext, options: SyncOptions) -> Result<SyncOutcome> {
    let pushed = push(ctx, options).await?;
    let pulled = pull(ctx, options).await?;
    let outcome = pushed.merge(pulled);
    if !options.dry_run {
        let ctx = ctx.clone();
        let log_copy = outcome.clone();
        tokio::task::spawn_blocking(move || append_log(&ctx, "sync", &log_copy)).await?;
    }
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Registry bookkeeping
// ---------------------------------------------------------------------------

/// Registry last-sync refresh after a successful operation. Best effort: a
/// registry write failure never fails the sync itself.
fn touch_registry(ctx: &SyncContext, timestamp: &str) {
    let mut registry = Registry::load(&ctx.central_root);
    registry.touch_last_sync(&ctx.central_path, &ctx.machine_id, timestamp);
    if let Err(e) = registry.save(&ctx.central_root) {
        warn!(error = %e, "could not update registry last-sync");
    }
}

// ---------------------------------------------------------------------------
// Sync log (JSONL, best effort, bounded)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub timestamp: String,
    pub operation: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pushed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulled: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

fn append_log(ctx: &SyncContext, operation: &str, outcome: &SyncOutcome) {
    let entry = SyncLogEntry {
        timestamp: now_iso(),
        operation: operation.to_string(),
        result: outcome.result_label().to_string(),
        pushed: (operation != "pull").then_some(outcome.pushed.len()),
        pulled: (operation != "push").then_some(outcome.pulled.len()),
        errors: (!outcome.errors.is_empty()).then(|| {
            outcome.errors.iter().map(|e| format!("{}: {}", e.path, e.reason)).collect()
        }),
    };
    if let Err(e) = append_log_entry(&ctx.log_path(), &entry) {
        warn!(error = %e, "could not append sync log entry");
    }
}

fn append_log_entry(path: &Path, entry: &SyncLogEntry) -> Result<()> {
    let line = serde_json::to_string(entry)?;
    let existing = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(Error::fs(path, e)),
    };
    let mut lines: Vec<&str> = existing.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.push(&line);
    if lines.len() > SYNC_LOG_MAX_ENTRIES {
        let drop = lines.len() - SYNC_LOG_MAX_ENTRIES;
        lines.drain(..drop);
    }
    let mut body = lines.join("\n");
    body.push('\n');
    atomic_write(path, body.as_bytes())
}

/// Read the sync log, newest entries last. Unparseable lines are skipped.
pub fn read_log(root: &Path) -> Result<Vec<SyncLogEntry>> {
    let path = root.join(".minimem").join("sync.log");
    let body = match std::fs::read_to_string(&path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::fs(path, e)),
    };
    Ok(body.lines().filter_map(|line| serde_json::from_str(line).ok()).collect())
}

// ---------------------------------------------------------------------------
// Quarantine sidecar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineSet {
    pub timestamp: String,
    pub files: Vec<String>,
}

fn sanitize_timestamp(iso: &str) -> String {
    iso.chars().map(|c| if c == ':' || c == '.' { '-' } else { c }).collect()
}

/// Park the local and remote copies of files for manual review under
/// `.minimem/conflicts/<timestamp>/`. Purely a sidecar: quarantine never
/// blocks or alters a sync operation. Returns the quarantine directory.
pub fn quarantine_files(ctx: &SyncContext, rel_paths: &[String]) -> Result<PathBuf> {
    let timestamp = sanitize_timestamp(&now_iso());
    let dir = ctx.root.join(".minimem").join("conflicts").join(&timestamp);
    std::fs::create_dir_all(&dir).map_err(|e| Error::fs(&dir, e))?;
    let remote_dir = ctx.remote_dir();

    let mut originals = Vec::new();
    for rel_path in rel_paths {
        let flat = rel_path.replace('/', "_");
        let local_src = ctx.root.join(rel_path);
        if local_src.is_file() {
            copy_file_atomic(&local_src, &dir.join(format!("{flat}.local")))?;
        }
        let remote_src = remote_dir.join(rel_path);
        if remote_src.is_file() {
            copy_file_atomic(&remote_src, &dir.join(format!("{flat}.remote")))?;
        }
        originals.push(rel_path.clone());
    }
    // Manifest preserves the original paths exactly (the flattened names
    // cannot be inverted when paths contain underscores).
    let manifest = serde_json::to_string_pretty(&originals)?;
    atomic_write(&dir.join("files.json"), manifest.as_bytes())?;
    debug!(dir = %dir.display(), files = originals.len(), "quarantined conflict copies");
    Ok(dir)
}

/// Quarantined sets, newest first.
pub fn list_quarantine(root: &Path) -> Result<Vec<QuarantineSet>> {
    let conflicts = root.join(".minimem").join("conflicts");
    let entries = match std::fs::read_dir(&conflicts) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::fs(&conflicts, e)),
    };

    let mut sets = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::fs(&conflicts, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let timestamp = entry.file_name().to_string_lossy().to_string();
        let manifest = entry.path().join("files.json");
        let files: Vec<String> = match std::fs::read_to_string(&manifest) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => {
                // Fall back to the parked copies themselves.
                let mut names: Vec<String> = std::fs::read_dir(entry.path())
                    .map_err(|e| Error::fs(entry.path(), e))?
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .filter_map(|n| {
                        n.strip_suffix(".local")
                            .or_else(|| n.strip_suffix(".remote"))
                            .map(|s| s.to_string())
                    })
                    .collect();
                names.sort();
                names.dedup();
                names
            }
        };
        sets.push(QuarantineSet { timestamp, files });
    }
    sets.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::sha256_hex;
    use crate::config::SyncConfig;
    use tempfile::TempDir;

    fn write(base: &Path, rel: &str, contents: &str) {
        let path = base.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn context(root: &Path, central: &Path) -> SyncContext {
        let config = EngineConfig::builder(root)
            .sync(SyncConfig {
                enabled: true,
                central_path: Some("proj/".to_string()),
                autosync: false,
                ..SyncConfig::default()
            })
            .build()
            .unwrap();
        SyncContext::from_config(&config, central, "test-machine-0001").unwrap()
    }

    #[tokio::test]
    async fn push_overwrites_remote_and_records_hashes() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(local.path(), "MEMORY.md", "A");
        write(central.path(), "proj/MEMORY.md", "B");
        let ctx = context(local.path(), central.path());

        let outcome = push(&ctx, SyncOptions::default()).await.unwrap();
        assert_eq!(outcome.pushed, vec!["MEMORY.md"]);
        assert!(outcome.ok());
        assert_eq!(
            std::fs::read_to_string(central.path().join("proj/MEMORY.md")).unwrap(),
            "A"
        );

        let state = SyncState::load(&ctx.state_path(), "proj/").unwrap();
        let entry = &state.files["MEMORY.md"];
        let expected = sha256_hex("A");
        assert_eq!(entry.local_hash, expected);
        assert_eq!(entry.remote_hash, expected);
        assert!(state.last_sync.is_some());
    }

    #[tokio::test]
    async fn push_never_deletes_remote_only_files() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(central.path(), "proj/memory/ghost.md", "remote only");
        let ctx = context(local.path(), central.path());

        let outcome = push(&ctx, SyncOptions::default()).await.unwrap();
        assert_eq!(outcome.skipped, vec!["memory/ghost.md"]);
        assert!(central.path().join("proj/memory/ghost.md").exists());
    }

    #[tokio::test]
    async fn pull_fetches_remote_and_skips_local_only() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(local.path(), "memory/mine.md", "local only");
        write(central.path(), "proj/MEMORY.md", "from central");
        let ctx = context(local.path(), central.path());

        let outcome = pull(&ctx, SyncOptions::default()).await.unwrap();
        assert_eq!(outcome.pulled, vec!["MEMORY.md"]);
        assert_eq!(outcome.skipped, vec!["memory/mine.md"]);
        assert_eq!(
            std::fs::read_to_string(local.path().join("MEMORY.md")).unwrap(),
            "from central"
        );
        assert!(local.path().join("memory/mine.md").exists(), "pull must never delete locally");
    }

    #[tokio::test]
    async fn pull_respects_local_modifications_unless_forced() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(local.path(), "MEMORY.md", "local edit");
        write(central.path(), "proj/MEMORY.md", "central edit");
        let ctx = context(local.path(), central.path());

        let polite = pull(&ctx, SyncOptions::default()).await.unwrap();
        assert_eq!(polite.skipped, vec!["MEMORY.md"]);
        assert_eq!(std::fs::read_to_string(local.path().join("MEMORY.md")).unwrap(), "local edit");

        let forced = pull(&ctx, SyncOptions { force: true, ..Default::default() }).await.unwrap();
        assert_eq!(forced.pulled, vec!["MEMORY.md"]);
        assert_eq!(
            std::fs::read_to_string(local.path().join("MEMORY.md")).unwrap(),
            "central edit"
        );
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching_anything() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(local.path(), "MEMORY.md", "new");
        let ctx = context(local.path(), central.path());

        let outcome = push(&ctx, SyncOptions { dry_run: true, ..Default::default() }).await.unwrap();
        assert_eq!(outcome.pushed, vec!["MEMORY.md"]);
        assert!(outcome.dry_run);
        assert!(!central.path().join("proj/MEMORY.md").exists());
        assert!(!ctx.state_path().exists());
        assert!(!ctx.log_path().exists());
    }

    #[tokio::test]
    async fn bidirectional_runs_push_then_pull() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(local.path(), "memory/ours.md", "ours");
        write(central.path(), "proj/memory/theirs.md", "theirs");
        let ctx = context(local.path(), central.path());

        let outcome = sync_bidirectional(&ctx, SyncOptions::default()).await.unwrap();
        assert_eq!(outcome.pushed, vec!["memory/ours.md"]);
        assert_eq!(outcome.pulled, vec!["memory/theirs.md"]);
        assert!(outcome.ok());
        assert!(central.path().join("proj/memory/ours.md").exists());
        assert!(local.path().join("memory/theirs.md").exists());
    }

    #[tokio::test]
    async fn operations_append_bounded_jsonl_log() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(local.path(), "MEMORY.md", "v1");
        let ctx = context(local.path(), central.path());

        push(&ctx, SyncOptions::default()).await.unwrap();
        write(local.path(), "MEMORY.md", "v2");
        push(&ctx, SyncOptions::default()).await.unwrap();

        let log = read_log(local.path()).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e.operation == "push"));
        assert_eq!(log[0].result, "success");
        assert_eq!(log[0].pushed, Some(1));
    }

    #[test]
    fn log_is_trimmed_to_the_newest_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.log");
        for i in 0..(SYNC_LOG_MAX_ENTRIES + 25) {
            let entry = SyncLogEntry {
                timestamp: format!("t{i}"),
                operation: "push".to_string(),
                result: "success".to_string(),
                pushed: Some(1),
                pulled: None,
                errors: None,
            };
            append_log_entry(&path, &entry).unwrap();
        }
        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), SYNC_LOG_MAX_ENTRIES);
        assert!(lines[0].contains("\"t25\""));
        assert!(lines.last().unwrap().contains(&format!("t{}", SYNC_LOG_MAX_ENTRIES + 24)));
    }

    #[tokio::test]
    async fn quarantine_parks_both_sides_and_lists_newest_first() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(local.path(), "memory/hot.md", "local side");
        write(central.path(), "proj/memory/hot.md", "remote side");
        let ctx = context(local.path(), central.path());

        let dir = quarantine_files(&ctx, &["memory/hot.md".to_string()]).unwrap();
        assert!(dir.join("memory_hot.md.local").exists());
        assert!(dir.join("memory_hot.md.remote").exists());

        let sets = list_quarantine(local.path()).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].files, vec!["memory/hot.md"]);

        // Quarantine is a sidecar: sync still runs and wins by direction.
        let outcome = push(&ctx, SyncOptions::default()).await.unwrap();
        assert_eq!(outcome.pushed, vec!["memory/hot.md"]);
    }

    #[tokio::test]
    async fn push_failure_is_partial_and_continues() {
        let local = TempDir::new().unwrap();
        let central = TempDir::new().unwrap();
        write(local.path(), "MEMORY.md", "ok file");
        write(local.path(), "memory/blocked.md", "will fail");
        // Make the destination directory for blocked.md an unwritable file.
        write(central.path(), "proj/memory", "not a directory");
        let ctx = context(local.path(), central.path());

        let outcome = push(&ctx, SyncOptions::default()).await.unwrap();
        assert_eq!(outcome.pushed, vec!["MEMORY.md"]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, "memory/blocked.md");
        assert_eq!(outcome.result_label(), "partial");

        let log = read_log(local.path()).unwrap();
        assert_eq!(log.last().unwrap().result, "partial");
    }
}
