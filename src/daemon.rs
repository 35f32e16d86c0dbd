//! The sync daemon — one long-lived process per machine.
//!
//! Owns a watcher per locally-mapped root (autosync pushes on change
//! batches), polls the central repo for remote edits (dry-run pull, then a
//! real pull when something would move), and re-validates the registry on a
//! slower cadence. A pid file under `~/.minimem/` keeps the daemon singular;
//! stale pid entries from dead processes are cleaned up on start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch as watch_channel;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, RootConfig};
use crate::error::{Error, Result};
use crate::files::atomic_write;
use crate::machine::{home_state_dir, machine_id_from, GlobalConfig};
use crate::registry::{Mapping, Registry};
use crate::sync::{self, SyncContext, SyncOptions};
use crate::validate::{validate_registry, Severity};
use crate::watcher;

// ---------------------------------------------------------------------------
// Pid lock
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // EPERM still means the process exists, just owned by someone else.
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a liveness probe, treat any recorded pid as stale.
    false
}

/// Exclusive ownership of the daemon pid file. Released on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<PidLock> {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                if pid != std::process::id() && process_alive(pid) {
                    return Err(Error::Config(format!(
                        "daemon already running (pid {pid}, lock {})",
                        path.display()
                    )));
                }
            }
            debug!(path = %path.display(), "removing stale pid file");
            let _ = std::fs::remove_file(path);
        }
        atomic_write(path, std::process::id().to_string().as_bytes())?;
        Ok(PidLock { path: path.to_path_buf() })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub pid_path: PathBuf,
    pub global_config_path: PathBuf,
    pub poll_interval: Duration,
    pub validation_interval: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        DaemonOptions {
            pid_path: home_state_dir().join("daemon.pid"),
            global_config_path: GlobalConfig::path(),
            poll_interval: Duration::from_secs(30),
            validation_interval: Duration::from_secs(300),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-root plumbing
// ---------------------------------------------------------------------------

/// Build the sync context for a registry mapping from its on-disk root
/// config. Returns `None` when the root opts out (sync disabled or autosync
/// off) or its config cannot be read.
fn autosync_context(mapping: &Mapping, central_root: &Path, machine_id: &str) -> Option<(SyncContext, EngineConfig)> {
    let root = mapping.local_root();
    let file = match RootConfig::load(&root) {
        Ok(file) => file,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "unreadable root config, skipping");
            return None;
        }
    };
    let enabled = file.sync.as_ref().map(|s| s.enabled && s.autosync).unwrap_or(false);
    if !enabled {
        return None;
    }
    let mut builder = EngineConfig::builder(&root).from_root_config(&file);
    // The registry mapping is authoritative for the central sub-path.
    let mut sync_config = file.sync.clone().unwrap_or_default();
    sync_config.central_path = Some(mapping.path.clone());
    builder = builder.sync(sync_config);
    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "invalid root config, skipping");
            return None;
        }
    };
    match SyncContext::from_config(&config, central_root, machine_id) {
        Ok(ctx) => Some((ctx, config)),
        Err(e) => {
            warn!(root = %root.display(), error = %e, "cannot sync root");
            None
        }
    }
}

struct WatchedRoot {
    ctx: SyncContext,
    task: tokio::task::JoinHandle<()>,
}

/// Watch one root: log each change batch and push it to the central repo.
/// Exits cleanly when the shutdown flag flips, finishing any in-flight push.
fn spawn_root_watcher(
    ctx: SyncContext,
    config: &EngineConfig,
    mut shutdown: watch_channel::Receiver<bool>,
) -> Result<WatchedRoot> {
    let mut file_watcher = watcher::watch(&ctx.root, &config.watch)?;
    let task_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                batch = file_watcher.next_batch() => {
                    let Some(changes) = batch else { break };
                    info!(
                        root = %task_ctx.root.display(),
                        changes = changes.len(),
                        "local changes detected"
                    );
                    match sync::push(&task_ctx, SyncOptions::default()).await {
                        Ok(outcome) if !outcome.ok() => warn!(
                            root = %task_ctx.root.display(),
                            errors = outcome.errors.len(),
                            "autosync push finished with errors"
                        ),
                        Ok(outcome) => debug!(
                            root = %task_ctx.root.display(),
                            pushed = outcome.pushed.len(),
                            "autosync push"
                        ),
                        Err(e) => warn!(root = %task_ctx.root.display(), error = %e, "autosync push failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
    Ok(WatchedRoot { ctx, task })
}

// ---------------------------------------------------------------------------
// Daemon loop
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received Ctrl+C, shutting down");
    }
}

fn log_validation(central_root: &Path, machine_id: &str) {
    match validate_registry(central_root, machine_id) {
        Ok(report) => {
            info!(
                total = report.stats.total,
                active = report.stats.active,
                stale = report.stats.stale,
                collisions = report.stats.collisions,
                missing = report.stats.missing,
                valid = report.is_valid(),
                "registry validation"
            );
            for issue in &report.issues {
                match issue.severity {
                    Severity::Error => {
                        error!(path = issue.central_path.as_str(), "{}", issue.detail)
                    }
                    Severity::Warning => {
                        warn!(path = issue.central_path.as_str(), "{}", issue.detail)
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "registry validation failed"),
    }
}

/// Reconcile the watcher fleet against the current mapping set: start
/// watchers for new autosync mappings, stop watchers whose mapping is gone.
fn reconcile_watchers(
    central_root: &Path,
    machine_id: &str,
    watched: &mut HashMap<String, WatchedRoot>,
    shutdown: &watch_channel::Receiver<bool>,
) {
    let registry = Registry::load(central_root);
    let mappings = registry.local_mappings(machine_id, None);
    let live: std::collections::HashSet<String> =
        mappings.iter().map(|m| m.path.clone()).collect();

    watched.retain(|central_path, root| {
        if live.contains(central_path) {
            true
        } else {
            info!(central_path = central_path.as_str(), "mapping removed, closing watcher");
            root.task.abort();
            false
        }
    });

    for mapping in mappings {
        if watched.contains_key(&mapping.path) {
            continue;
        }
        let Some((ctx, config)) = autosync_context(mapping, central_root, machine_id) else {
            continue;
        };
        match spawn_root_watcher(ctx, &config, shutdown.clone()) {
            Ok(root) => {
                info!(
                    central_path = mapping.path.as_str(),
                    root = %root.ctx.root.display(),
                    "watching mapped root"
                );
                watched.insert(mapping.path.clone(), root);
            }
            Err(e) => warn!(central_path = mapping.path.as_str(), error = %e, "could not start watcher"),
        }
    }
}

/// Remote-edit poll: dry-run pull per watched root, real pull only when the
/// dry run says something would move.
async fn poll_pulls(watched: &HashMap<String, WatchedRoot>) {
    for root in watched.values() {
        let probe = match sync::pull(&root.ctx, SyncOptions { dry_run: true, force: false }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(root = %root.ctx.root.display(), error = %e, "pull probe failed");
                continue;
            }
        };
        if probe.pulled.is_empty() {
            continue;
        }
        match sync::pull(&root.ctx, SyncOptions::default()).await {
            Ok(outcome) => info!(
                root = %root.ctx.root.display(),
                pulled = outcome.pulled.len(),
                skipped = outcome.skipped.len(),
                "pulled remote changes"
            ),
            Err(e) => warn!(root = %root.ctx.root.display(), error = %e, "pull failed"),
        }
    }
}

/// Run the daemon until SIGTERM/SIGINT. Returns after a clean shutdown.
pub async fn run(options: DaemonOptions) -> Result<()> {
    if let Some(parent) = options.pid_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::fs(parent, e))?;
    }
    let _pid_lock = PidLock::acquire(&options.pid_path)?;

    let machine_id = machine_id_from(&options.global_config_path)?;
    let global = GlobalConfig::load_from(&options.global_config_path)?;
    let central_root = global.central_repo.clone();
    info!(machine_id = machine_id.as_str(), "daemon started");

    match &central_root {
        Some(central) => log_validation(central, &machine_id),
        None => warn!("central repo not configured; watching nothing until it is"),
    }

    let (shutdown_tx, shutdown_rx) = watch_channel::channel(false);
    let mut watched: HashMap<String, WatchedRoot> = HashMap::new();
    if let Some(central) = &central_root {
        reconcile_watchers(central, &machine_id, &mut watched, &shutdown_rx);
    }

    let mut since_validation = Duration::ZERO;
    loop {
        tokio::select! {
            _ = shutdown_signal() => break,
            _ = tokio::time::sleep(options.poll_interval) => {
                let Some(central) = &central_root else { continue };
                reconcile_watchers(central, &machine_id, &mut watched, &shutdown_rx);
                poll_pulls(&watched).await;
                since_validation += options.poll_interval;
                if since_validation >= options.validation_interval {
                    log_validation(central, &machine_id);
                    since_validation = Duration::ZERO;
                }
            }
        }
    }

    // Drain: let every watcher task finish its in-flight push before exit.
    let _ = shutdown_tx.send(true);
    for (central_path, root) in watched.drain() {
        if root.task.await.is_err() {
            warn!(central_path = central_path.as_str(), "watcher task ended abnormally");
        }
    }
    info!("daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pid_lock_writes_and_removes_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        drop(lock);
        assert!(!path.exists(), "drop must remove the pid file");
    }

    #[cfg(unix)]
    #[test]
    fn pid_lock_refuses_while_owner_is_alive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        // pid 1 always exists; the probe reports it alive even when the
        // signal is not permitted.
        std::fs::write(&path, "1").unwrap();
        let err = PidLock::acquire(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
    }

    #[cfg(unix)]
    #[test]
    fn stale_pid_entries_are_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        // Max pid on Linux is bounded well below this; the probe fails and
        // the entry is treated as stale.
        std::fs::write(&path, "999999999").unwrap();
        let _lock = PidLock::acquire(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[tokio::test]
    async fn autosync_context_requires_opt_in() {
        let central = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let mut registry = Registry::default();
        registry.add_mapping("proj/", root.path(), "m1");
        let mapping = registry.mappings[0].clone();

        // No config file: autosync defaults off.
        assert!(autosync_context(&mapping, central.path(), "m1").is_none());

        // Opted in via .minimem/config.json.
        let state_dir = root.path().join(".minimem");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(
            state_dir.join("config.json"),
            r#"{ "sync": { "enabled": true, "autosync": true } }"#,
        )
        .unwrap();
        let (ctx, config) = autosync_context(&mapping, central.path(), "m1").unwrap();
        assert_eq!(ctx.central_path, "proj/");
        assert_eq!(ctx.machine_id, "m1");
        assert!(config.sync.autosync);
    }
}
