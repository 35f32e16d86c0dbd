//! Central-repo registry — `.minimem-registry.json` at the central root.
//!
//! The registry binds central sub-paths to local roots on specific machines.
//! Ownership is machine-scoped: a central path registered by one machine may
//! not be claimed by another, which is what keeps two laptops from silently
//! clobbering each other's pushes. Writes are atomic (temp file + rename);
//! concurrent readers see either the old mapping set or the new one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::files::atomic_write;
use crate::machine::{compress_home, expand_home};

pub const REGISTRY_FILE: &str = ".minimem-registry.json";
pub const REGISTRY_VERSION: u32 = 1;

/// One `{central-path, local-path, machine-id, last-sync}` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// Normalized central sub-path, always ending in `/` (`"/"` is the root).
    pub path: String,
    /// Local root with `$HOME` compressed to `~`.
    pub local_path: String,
    pub machine_id: String,
    pub last_sync: Option<String>,
}

impl Mapping {
    /// The mapping's local root as an absolute path.
    pub fn local_root(&self) -> PathBuf {
        expand_home(&self.local_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub version: u32,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry { version: REGISTRY_VERSION, mappings: Vec::new() }
    }
}

/// Outcome of probing a prospective `(central-path, machine)` registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionStatus {
    /// No existing mapping for this central path.
    None,
    /// This machine already owns the central path; updating is allowed.
    SameMachine,
    /// Another machine owns the central path; the registration must be
    /// refused.
    Collision,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Canonical form for central sub-paths: trailing `/`, no leading `/`
/// (except the bare root, which is just `/`).
pub fn normalize_central_path(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// Canonical storage form for local paths: `~`-compressed.
pub fn normalize_local_path(path: &Path) -> String {
    compress_home(path)
}

/// Two stored local paths are the same root if they expand to the same
/// absolute path.
fn same_local_path(a: &str, b: &str) -> bool {
    expand_home(a) == expand_home(b)
}

// ---------------------------------------------------------------------------
// Registry operations
// ---------------------------------------------------------------------------

impl Registry {
    pub fn file_path(central_root: &Path) -> PathBuf {
        central_root.join(REGISTRY_FILE)
    }

    /// Lenient read: a missing or malformed file yields an empty registry so
    /// read paths keep working. The validator reports the malformed case via
    /// [`Registry::load_strict`].
    pub fn load(central_root: &Path) -> Registry {
        match Self::load_strict(central_root) {
            Ok(registry) => registry,
            Err(e) => {
                warn!(error = %e, "unreadable registry, treating as empty");
                Registry::default()
            }
        }
    }

    /// Strict read: missing file is an empty registry, malformed JSON is a
    /// validation error.
    pub fn load_strict(central_root: &Path) -> Result<Registry> {
        let path = Self::file_path(central_root);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Registry::default())
            }
            Err(e) => return Err(Error::fs(path, e)),
        };
        serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("malformed {}: {e}", path.display())))
    }

    /// Atomic write: temp file in the central root, then rename over the
    /// registry. Last writer wins; the validator surfaces lost updates.
    pub fn save(&self, central_root: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        atomic_write(&Self::file_path(central_root), body.as_bytes())
    }

    pub fn find(&self, central_path: &str) -> Vec<&Mapping> {
        let central_path = normalize_central_path(central_path);
        self.mappings.iter().filter(|m| m.path == central_path).collect()
    }

    pub fn check_collision(&self, central_path: &str, machine_id: &str) -> CollisionStatus {
        let existing = self.find(central_path);
        if existing.is_empty() {
            CollisionStatus::None
        } else if existing.iter().any(|m| m.machine_id != machine_id) {
            CollisionStatus::Collision
        } else {
            CollisionStatus::SameMachine
        }
    }

    /// Insert or replace the `(central-path, machine-id)` mapping, leaving
    /// every other mapping untouched.
    pub fn add_mapping(&mut self, central_path: &str, local_path: &Path, machine_id: &str) {
        let central_path = normalize_central_path(central_path);
        let local_path = normalize_local_path(local_path);
        self.mappings
            .retain(|m| !(m.path == central_path && m.machine_id == machine_id));
        self.mappings.push(Mapping {
            path: central_path,
            local_path,
            machine_id: machine_id.to_string(),
            last_sync: None,
        });
        self.mappings.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.machine_id.cmp(&b.machine_id)));
    }

    /// Remove only the specific `(central-path, machine-id)` pair.
    pub fn remove_mapping(&mut self, central_path: &str, machine_id: &str) -> bool {
        let central_path = normalize_central_path(central_path);
        let before = self.mappings.len();
        self.mappings
            .retain(|m| !(m.path == central_path && m.machine_id == machine_id));
        self.mappings.len() != before
    }

    pub fn touch_last_sync(&mut self, central_path: &str, machine_id: &str, timestamp: &str) {
        let central_path = normalize_central_path(central_path);
        for mapping in &mut self.mappings {
            if mapping.path == central_path && mapping.machine_id == machine_id {
                mapping.last_sync = Some(timestamp.to_string());
            }
        }
    }

    /// Mappings owned by a machine, optionally narrowed to one local root.
    pub fn local_mappings(&self, machine_id: &str, local_root: Option<&Path>) -> Vec<&Mapping> {
        self.mappings
            .iter()
            .filter(|m| m.machine_id == machine_id)
            .filter(|m| match local_root {
                Some(root) => same_local_path(&m.local_path, &root.display().to_string()),
                None => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn central_paths_normalize_with_trailing_slash() {
        assert_eq!(normalize_central_path("proj"), "proj/");
        assert_eq!(normalize_central_path("proj/"), "proj/");
        assert_eq!(normalize_central_path("/proj/sub"), "proj/sub/");
        assert_eq!(normalize_central_path(""), "/");
        assert_eq!(normalize_central_path("/"), "/");
    }

    #[test]
    fn missing_and_malformed_files_read_as_empty() {
        let dir = TempDir::new().unwrap();
        assert!(Registry::load(dir.path()).mappings.is_empty());
        assert!(Registry::load_strict(dir.path()).unwrap().mappings.is_empty());

        std::fs::write(Registry::file_path(dir.path()), "{ broken").unwrap();
        assert!(Registry::load(dir.path()).mappings.is_empty());
        assert!(matches!(
            Registry::load_strict(dir.path()).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn save_is_atomic_and_roundtrips() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::default();
        registry.add_mapping("proj", Path::new("/code/proj"), "laptop-a1b2");
        registry.save(dir.path()).unwrap();

        let loaded = Registry::load(dir.path());
        assert_eq!(loaded.version, REGISTRY_VERSION);
        assert_eq!(loaded.mappings.len(), 1);
        assert_eq!(loaded.mappings[0].path, "proj/");
        assert_eq!(loaded.mappings[0].machine_id, "laptop-a1b2");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn collision_states() {
        let mut registry = Registry::default();
        assert_eq!(registry.check_collision("shared/", "m1"), CollisionStatus::None);

        registry.add_mapping("shared/", Path::new("/p1"), "m1");
        assert_eq!(registry.check_collision("shared", "m1"), CollisionStatus::SameMachine);
        assert_eq!(registry.check_collision("shared/", "m2"), CollisionStatus::Collision);
        assert_eq!(registry.check_collision("other/", "m2"), CollisionStatus::None);
    }

    #[test]
    fn add_replaces_own_mapping_and_preserves_others() {
        let mut registry = Registry::default();
        registry.add_mapping("shared/", Path::new("/p1"), "m1");
        registry.add_mapping("other/", Path::new("/p2"), "m2");
        registry.touch_last_sync("shared/", "m1", "2024-01-15T10:30:00.000Z");

        registry.add_mapping("shared/", Path::new("/p1-moved"), "m1");
        assert_eq!(registry.mappings.len(), 2);
        let shared = &registry.find("shared/")[0];
        assert_eq!(shared.local_path, "/p1-moved");
        assert_eq!(shared.last_sync, None, "re-adding resets last sync");
        assert_eq!(registry.find("other/").len(), 1);
    }

    #[test]
    fn remove_targets_one_pair_only() {
        let mut registry = Registry::default();
        registry.add_mapping("a/", Path::new("/pa"), "m1");
        registry.add_mapping("b/", Path::new("/pb"), "m1");

        assert!(registry.remove_mapping("a", "m1"));
        assert!(!registry.remove_mapping("a", "m1"));
        assert!(!registry.remove_mapping("b", "m2"));
        assert_eq!(registry.mappings.len(), 1);
        assert_eq!(registry.mappings[0].path, "b/");
    }

    #[test]
    fn local_mappings_filter_by_machine() {
        let mut registry = Registry::default();
        registry.add_mapping("a/", Path::new("/pa"), "m1");
        registry.add_mapping("b/", Path::new("/pb"), "m2");
        let mine = registry.local_mappings("m1", None);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].path, "a/");
    }
}
