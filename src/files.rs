//! Memory-root file discovery and safe file access.
//!
//! The memory source is exactly `MEMORY.md` at the root plus `*.md` under
//! `memory/`. Everything else — dotfiles, `.minimem/`, non-regular files —
//! is invisible to the indexer. All writes to tracked files go through
//! copy-then-rename so a crash never leaves a half-written destination.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default document class for notes under a memory root.
pub const MEMORY_SOURCE: &str = "memory";

/// A candidate file discovered under a memory root.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    /// Root-relative path with `/` separators, e.g. `memory/2024-01-15.md`.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub mtime_ms: i64,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Membership rules
// ---------------------------------------------------------------------------

/// Whether a root-relative path belongs to the memory source.
pub fn is_memory_path(rel_path: &str) -> bool {
    rel_path == "MEMORY.md" || (rel_path.starts_with("memory/") && rel_path.ends_with(".md"))
}

/// Reject empty paths, traversal, absolute paths, and backslash separators.
pub fn validate_rel_path(rel_path: &str) -> Result<()> {
    if rel_path.is_empty() {
        return Err(Error::Validation("empty path".into()));
    }
    if rel_path.contains('\\') {
        return Err(Error::Validation(format!("path must use '/' separators: {rel_path}")));
    }
    let path = Path::new(rel_path);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(Error::Validation(format!("invalid path component in {rel_path}"))),
        }
    }
    Ok(())
}

/// Validate a relative path and resolve it inside the root. The path must
/// belong to the memory source; traversal out of the root is rejected before
/// any filesystem access.
pub fn resolve_memory_path(root: &Path, rel_path: &str) -> Result<PathBuf> {
    validate_rel_path(rel_path)?;
    if !is_memory_path(rel_path) {
        return Err(Error::Validation(format!(
            "path is not part of the memory source: {rel_path}"
        )));
    }
    Ok(root.join(rel_path))
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

fn mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// List the memory-source files under `root`, sorted by relative path.
///
/// A missing root or missing `memory/` subdirectory yields an empty (or
/// partial) list rather than an error. A root containing both `MEMORY.md`
/// and `memory.md` as distinct files is a validation error; when the two
/// names are one inode (case-insensitive filesystem) the file is listed once.
pub fn list_memory_files(root: &Path) -> Result<Vec<MemoryFile>> {
    let mut out: Vec<MemoryFile> = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }

    // Root-level MEMORY.md, with the case-collision check.
    let mut root_memory_names: Vec<String> = Vec::new();
    let entries = std::fs::read_dir(root).map_err(|e| Error::fs(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::fs(root, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.eq_ignore_ascii_case("MEMORY.md") && entry.path().is_file() {
            root_memory_names.push(name);
        }
    }
    root_memory_names.sort();

    if root_memory_names.len() > 1 && !same_inode(root, &root_memory_names)? {
        return Err(Error::Validation(format!(
            "case conflict: both {} exist as distinct files; keep exactly one",
            root_memory_names.join(" and ")
        )));
    }
    if let Some(name) = root_memory_names.first() {
        let abs = root.join(name);
        let metadata = std::fs::metadata(&abs).map_err(|e| Error::fs(&abs, e))?;
        out.push(MemoryFile {
            rel_path: "MEMORY.md".to_string(),
            abs_path: abs,
            mtime_ms: mtime_ms(&metadata),
            size: metadata.len(),
        });
    }

    // memory/**/*.md
    let memory_dir = root.join("memory");
    if memory_dir.is_dir() {
        collect_md_files(&memory_dir, &memory_dir, &mut out)?;
    }

    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(out)
}

#[cfg(unix)]
fn same_inode(root: &Path, names: &[String]) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let mut keys = Vec::new();
    for name in names {
        let path = root.join(name);
        let metadata = std::fs::metadata(&path).map_err(|e| Error::fs(&path, e))?;
        keys.push((metadata.dev(), metadata.ino()));
    }
    Ok(keys.windows(2).all(|pair| pair[0] == pair[1]))
}

#[cfg(not(unix))]
fn same_inode(_root: &Path, _names: &[String]) -> Result<bool> {
    Ok(false)
}

fn collect_md_files(base: &Path, dir: &Path, out: &mut Vec<MemoryFile>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::fs(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::fs(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::fs(&path, e))?;
        if file_type.is_dir() {
            collect_md_files(base, &path, out)?;
        } else if file_type.is_file() && name.ends_with(".md") {
            let metadata = std::fs::metadata(&path).map_err(|e| Error::fs(&path, e))?;
            let rel = path
                .strip_prefix(base.parent().unwrap_or(base))
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push(MemoryFile {
                rel_path: rel,
                abs_path: path,
                mtime_ms: mtime_ms(&metadata),
                size: metadata.len(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Write `contents` to `dest` via a same-directory temp file and rename.
/// On any failure the temp file is removed and `dest` is untouched.
pub fn atomic_write(dest: &Path, contents: &[u8]) -> Result<()> {
    let parent = dest.parent().ok_or_else(|| {
        Error::Validation(format!("destination has no parent directory: {}", dest.display()))
    })?;
    std::fs::create_dir_all(parent).map_err(|e| Error::fs(parent, e))?;

    let file_name = dest.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let tmp = parent.join(format!("{file_name}.{}.tmp", Uuid::new_v4().simple()));

    if let Err(e) = std::fs::write(&tmp, contents) {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::fs(&tmp, e));
    }
    if let Err(e) = std::fs::rename(&tmp, dest) {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::fs(dest, e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Syncable listing (shared by push/pull)
// ---------------------------------------------------------------------------

/// Compile include/exclude globs once per operation.
pub fn build_globs(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Config(format!("invalid glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| Error::Config(format!("glob set: {e}")))
}

/// Sorted relative paths under `root` matching at least one include glob and
/// no exclude glob. `.minimem/` never surfaces.
pub fn list_syncable(root: &Path, include: &[String], exclude: &[String]) -> Result<Vec<String>> {
    let include = build_globs(include)?;
    let exclude = build_globs(exclude)?;
    let mut out = Vec::new();
    if root.is_dir() {
        walk_syncable(root, root, &include, &exclude, &mut out)?;
    }
    out.sort();
    Ok(out)
}

fn walk_syncable(
    root: &Path,
    dir: &Path,
    include: &GlobSet,
    exclude: &GlobSet,
    out: &mut Vec<String>,
) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::fs(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::fs(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ".minimem" {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::fs(&path, e))?;
        if file_type.is_dir() {
            walk_syncable(root, &path, include, exclude, out)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
            if include.is_match(&rel) && !exclude.is_match(&rel) {
                out.push(rel);
            }
        }
    }
    Ok(())
}
