//! The memory engine — one instance per memory root.
//!
//! Wraps the store, indexer, and searcher behind the surface external
//! callers (CLI, tool servers) consume: `search`, `sync`, `status`, and the
//! path-validated file operations. When the embedded watcher is not running,
//! every query first runs the cheap staleness probe and re-indexes on
//! divergence, so searches always observe the current on-disk notes.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::files::{atomic_write, list_memory_files, resolve_memory_path};
use crate::indexer::{index_root, is_stale, IndexStats};
use crate::provider::EmbeddingProvider;
use crate::search::{self, SearchOptions, SearchResult};
use crate::store::Store;

/// Report returned by [`MemoryEngine::sync`]: what the pass did, plus the
/// resulting totals.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub files_processed: usize,
    pub chunks_created: usize,
    pub stale_removed: usize,
    pub file_count: usize,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub memory_dir: String,
    pub provider: String,
    pub model: String,
    /// True when retrieval is keyword-only (a `"none"` provider).
    pub bm25_only: bool,
    pub file_count: usize,
    pub chunk_count: usize,
    pub cache_count: usize,
    pub vector_available: bool,
    pub fts_available: bool,
    pub last_indexed: Option<String>,
}

pub struct MemoryEngine {
    config: EngineConfig,
    store: Store,
    provider: Arc<dyn EmbeddingProvider>,
}

impl MemoryEngine {
    /// Open (creating on first use) the engine for a memory root.
    pub async fn open(
        config: EngineConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<MemoryEngine> {
        let db_path = config.db_path();
        let store = tokio::task::spawn_blocking(move || Store::open(&db_path)).await??;
        Ok(MemoryEngine { config, store, provider })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Index the root incrementally; `force` rebuilds everything.
    pub async fn sync(&self, force: bool) -> Result<IndexReport> {
        let stats: IndexStats =
            index_root(&self.store, self.provider.as_ref(), &self.config, force).await?;
        let store = self.store.clone();
        let (file_count, chunk_count) =
            tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
                Ok((store.file_count()?, store.chunk_count()?))
            })
            .await??;
        Ok(IndexReport {
            files_processed: stats.files_processed,
            chunks_created: stats.chunks_created,
            stale_removed: stats.stale_removed,
            file_count,
            chunk_count,
        })
    }

    /// Hybrid ranked search. Without a watcher the index is first brought
    /// up to date if the on-disk files diverged.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if !self.config.watch.enabled && is_stale(&self.store, &self.config.root).await? {
            debug!("index stale, re-indexing before query");
            index_root(&self.store, self.provider.as_ref(), &self.config, false).await?;
        }
        search::search(&self.store, self.provider.as_ref(), &self.config, query, options).await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let store = self.store.clone();
        let (file_count, chunk_count, cache_count, last_indexed) =
            tokio::task::spawn_blocking(move || -> Result<(usize, usize, usize, Option<String>)> {
                Ok((
                    store.file_count()?,
                    store.chunk_count()?,
                    store.cache_count()?,
                    store.meta_get("last_indexed")?,
                ))
            })
            .await??;
        Ok(EngineStatus {
            memory_dir: self.config.root.display().to_string(),
            provider: self.provider.id().to_string(),
            model: self.provider.model().to_string(),
            bm25_only: self.provider.id() == "none",
            file_count,
            chunk_count,
            cache_count,
            vector_available: self.store.vec_available(),
            fts_available: self.store.fts_available(),
            last_indexed,
        })
    }

    // -----------------------------------------------------------------------
    // File surface (all paths validated against the memory source)
    // -----------------------------------------------------------------------

    pub async fn list_files(&self) -> Result<Vec<String>> {
        let root = self.config.root.clone();
        let files = tokio::task::spawn_blocking(move || list_memory_files(&root)).await??;
        Ok(files.into_iter().map(|f| f.rel_path).collect())
    }

    pub async fn read_file(&self, rel_path: &str) -> Result<String> {
        let path = resolve_memory_path(&self.config.root, rel_path)?;
        tokio::fs::read_to_string(&path).await.map_err(|e| Error::fs(path, e))
    }

    /// Read a 1-indexed line window. `from` defaults to 1, `lines` to the
    /// rest of the file.
    pub async fn read_lines(
        &self,
        rel_path: &str,
        from: Option<usize>,
        lines: Option<usize>,
    ) -> Result<String> {
        let contents = self.read_file(rel_path).await?;
        let from = from.unwrap_or(1).max(1);
        let window: Vec<&str> = match lines {
            Some(n) => contents.lines().skip(from - 1).take(n).collect(),
            None => contents.lines().skip(from - 1).collect(),
        };
        Ok(window.join("\n"))
    }

    pub async fn write_file(&self, rel_path: &str, contents: &str) -> Result<()> {
        let path = resolve_memory_path(&self.config.root, rel_path)?;
        let contents = contents.to_string();
        tokio::task::spawn_blocking(move || atomic_write(&path, contents.as_bytes())).await?
    }

    pub async fn append_file(&self, rel_path: &str, contents: &str) -> Result<()> {
        let path = resolve_memory_path(&self.config.root, rel_path)?;
        let addition = contents.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut body = match std::fs::read_to_string(&path) {
                Ok(existing) => existing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(Error::fs(&path, e)),
            };
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&addition);
            atomic_write(&path, body.as_bytes())
        })
        .await?
    }

    /// Append to today's daily log, creating `memory/YYYY-MM-DD.md` as
    /// needed. Returns the relative path written.
    pub async fn append_today(&self, contents: &str) -> Result<String> {
        let rel_path = format!("memory/{}.md", chrono::Local::now().format("%Y-%m-%d"));
        self.append_file(&rel_path, contents).await?;
        Ok(rel_path)
    }
}
