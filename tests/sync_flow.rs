//! End-to-end multi-root sync: last-write-wins push/pull through a central
//! repo, registry ownership, and validation.

mod helpers;

use std::path::Path;

use helpers::{read, sync_context, write};
use minimem::chunker::sha256_hex;
use minimem::registry::{CollisionStatus, Registry};
use minimem::sync::{pull, push, SyncOptions};
use minimem::sync_state::SyncState;
use minimem::validate::{validate_registry_at, IssueKind};
use tempfile::TempDir;

#[tokio::test]
async fn two_machines_share_a_central_path() {
    let central = TempDir::new().unwrap();
    let l1 = TempDir::new().unwrap();
    let l2 = TempDir::new().unwrap();
    write(central.path(), "shared/MEMORY.md", "Old");

    // L1 edits and pushes: central takes the new content.
    write(l1.path(), "MEMORY.md", "New-L1");
    let ctx1 = sync_context(l1.path(), central.path(), "shared/", "machine-1");
    let outcome = push(&ctx1, SyncOptions::default()).await.unwrap();
    assert_eq!(outcome.pushed, vec!["MEMORY.md"]);
    assert_eq!(read(central.path(), "shared/MEMORY.md"), "New-L1");

    let state = SyncState::load(&l1.path().join(".minimem/sync-state.json"), "shared/").unwrap();
    let entry = &state.files["MEMORY.md"];
    assert_eq!(entry.local_hash, sha256_hex("New-L1"));
    assert_eq!(entry.remote_hash, sha256_hex("New-L1"));

    // L2 pulls on a fresh machine: it receives L1's write.
    let ctx2 = sync_context(l2.path(), central.path(), "shared/", "machine-2");
    let outcome = pull(&ctx2, SyncOptions::default()).await.unwrap();
    assert_eq!(outcome.pulled, vec!["MEMORY.md"]);
    assert_eq!(read(l2.path(), "MEMORY.md"), "New-L1");
}

#[tokio::test]
async fn push_then_pull_converges_without_deleting() {
    let central = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write(local.path(), "MEMORY.md", "mine");
    write(local.path(), "memory/private.md", "local only note");
    write(central.path(), "shared/memory/upstream.md", "remote only note");

    let ctx = sync_context(local.path(), central.path(), "shared/", "machine-1");
    let pushed = push(&ctx, SyncOptions::default()).await.unwrap();
    assert!(pushed.pushed.contains(&"MEMORY.md".to_string()));
    assert!(pushed.pushed.contains(&"memory/private.md".to_string()));
    assert_eq!(pushed.skipped, vec!["memory/upstream.md"]);

    let pulled = pull(&ctx, SyncOptions::default()).await.unwrap();
    assert_eq!(pulled.pulled, vec!["memory/upstream.md"]);
    // Nothing was deleted on either side.
    assert!(local.path().join("memory/private.md").exists());
    assert!(central.path().join("shared/memory/upstream.md").exists());
}

#[test]
fn registry_refuses_cross_machine_claims() {
    let central = TempDir::new().unwrap();
    let mut registry = Registry::load(central.path());

    assert_eq!(registry.check_collision("shared/", "machine-1"), CollisionStatus::None);
    registry.add_mapping("shared/", Path::new("/p1"), "machine-1");
    registry.save(central.path()).unwrap();

    // Machine 2 probes before registering, as sync init does.
    let registry = Registry::load(central.path());
    assert_eq!(registry.check_collision("shared/", "machine-2"), CollisionStatus::Collision);
    assert_eq!(registry.check_collision("shared/", "machine-1"), CollisionStatus::SameMachine);
}

#[test]
fn validator_reports_forced_collisions_as_errors() {
    let central = TempDir::new().unwrap();
    let mut registry = Registry::load(central.path());
    registry.add_mapping("shared/", Path::new("/p1"), "machine-1");
    // A second machine ignoring the collision check and writing anyway: the
    // validator is the backstop that surfaces it.
    registry.add_mapping("shared/", Path::new("/p2"), "machine-2");
    registry.touch_last_sync("shared/", "machine-1", "2024-01-30T00:00:00Z");
    registry.touch_last_sync("shared/", "machine-2", "2024-01-30T00:00:00Z");
    registry.save(central.path()).unwrap();

    let now = chrono::DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let report = validate_registry_at(central.path(), "machine-1", now).unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.stats.collisions, 1);
    let issue = report.issues.iter().find(|i| i.kind == IssueKind::Collision).unwrap();
    assert_eq!(issue.central_path, "shared/");
    assert!(issue.detail.contains("machine-1") && issue.detail.contains("machine-2"));
}

#[tokio::test]
async fn push_updates_registry_last_sync() {
    let central = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write(local.path(), "MEMORY.md", "content");

    let mut registry = Registry::load(central.path());
    registry.add_mapping("shared/", local.path(), "machine-1");
    registry.save(central.path()).unwrap();

    let ctx = sync_context(local.path(), central.path(), "shared/", "machine-1");
    push(&ctx, SyncOptions::default()).await.unwrap();

    let registry = Registry::load(central.path());
    let mapping = &registry.find("shared/")[0];
    assert!(mapping.last_sync.is_some(), "push must refresh the mapping's last-sync");
}

#[cfg(unix)]
#[tokio::test]
async fn failed_copy_leaves_destination_untouched() {
    use std::os::unix::fs::PermissionsExt;

    let central = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write(local.path(), "MEMORY.md", "new content");
    write(central.path(), "shared/MEMORY.md", "old content");

    // Read-only destination directory: the temp-file write fails before any
    // rename can happen.
    let shared = central.path().join("shared");
    let mut perms = std::fs::metadata(&shared).unwrap().permissions();
    perms.set_mode(0o555);
    std::fs::set_permissions(&shared, perms.clone()).unwrap();

    let ctx = sync_context(local.path(), central.path(), "shared/", "machine-1");
    let outcome = push(&ctx, SyncOptions::default()).await.unwrap();

    perms.set_mode(0o755);
    std::fs::set_permissions(&shared, perms).unwrap();

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.result_label(), "failure");
    assert_eq!(read(central.path(), "shared/MEMORY.md"), "old content");
    // No temp litter either.
    let tmp_files = std::fs::read_dir(central.path().join("shared"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(tmp_files, 0);
}

#[tokio::test]
async fn dry_run_pull_predicts_the_real_pull() {
    let central = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write(central.path(), "shared/memory/incoming.md", "from elsewhere");

    let ctx = sync_context(local.path(), central.path(), "shared/", "machine-1");
    let probe = pull(&ctx, SyncOptions { dry_run: true, force: false }).await.unwrap();
    assert_eq!(probe.pulled, vec!["memory/incoming.md"]);
    assert!(!local.path().join("memory/incoming.md").exists());

    let real = pull(&ctx, SyncOptions::default()).await.unwrap();
    assert_eq!(real.pulled, probe.pulled);
    assert!(local.path().join("memory/incoming.md").exists());

    // Converged: another probe finds nothing to do.
    let idle = pull(&ctx, SyncOptions { dry_run: true, force: false }).await.unwrap();
    assert!(idle.pulled.is_empty());
}
