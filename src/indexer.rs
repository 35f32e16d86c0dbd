//! Incremental indexing — walk the memory root, diff against stored file
//! records, (re)embed what changed, and prune what disappeared.
//!
//! A configuration change (model, provider, endpoint, chunking) forces a full
//! re-chunk of every file; the embedding cache is content-addressed and keyed
//! by provider, so unchanged text re-embeds from cache even across a full
//! rebuild.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::chunker::{chunk, sha256_hex};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::files::{list_memory_files, MemoryFile, MEMORY_SOURCE};
use crate::provider::{embed_texts, provider_key, EmbeddingProvider};
use crate::store::{FileRecord, IndexMeta, Store, StoredChunk};

/// Outcome of one indexing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Files that were (re)chunked and written this pass.
    pub files_processed: usize,
    /// Chunk rows inserted this pass.
    pub chunks_created: usize,
    /// Stored files removed because they no longer exist on disk.
    pub stale_removed: usize,
}

/// A candidate file with its content read and hashed.
struct Candidate {
    file: MemoryFile,
    content: String,
    hash: String,
}

fn read_candidates(root: &Path) -> Result<Vec<Candidate>> {
    let files = list_memory_files(root)?;
    files
        .into_par_iter()
        .map(|file| {
            let content = std::fs::read_to_string(&file.abs_path)
                .map_err(|e| Error::fs(&file.abs_path, e))?;
            let hash = sha256_hex(&content);
            Ok(Candidate { file, content, hash })
        })
        .collect()
}

/// Index the memory root into the store. `force` rebuilds every file even
/// when hashes match.
pub async fn index_root(
    store: &Store,
    provider: &dyn EmbeddingProvider,
    config: &EngineConfig,
    force: bool,
) -> Result<IndexStats> {
    let key = provider_key(provider);
    let current_meta = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.index_meta()).await??
    };

    let needs_full_reindex = force
        || match &current_meta {
            None => true,
            Some(meta) => {
                meta.model != provider.model()
                    || meta.provider != provider.id()
                    || meta.provider_key != key
                    || meta.chunk_tokens != config.chunk.tokens
                    || meta.chunk_overlap != config.chunk.overlap
                    || (store.vec_available()
                        && meta.vector_dims.is_none()
                        && !provider.is_none())
            }
        };
    if needs_full_reindex {
        debug!(force, "full re-index required");
    }

    let root = config.root.clone();
    let candidates =
        tokio::task::spawn_blocking(move || read_candidates(&root)).await??;

    let stored = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.file_index(MEMORY_SOURCE)).await??
    };

    let mut stats = IndexStats::default();
    let mut vector_dims = current_meta.as_ref().and_then(|m| m.vector_dims);

    for candidate in &candidates {
        let unchanged = stored
            .get(&candidate.file.rel_path)
            .map(|record| record.hash == candidate.hash)
            .unwrap_or(false);
        if unchanged && !needs_full_reindex {
            continue;
        }

        let chunks = chunk(&candidate.content, &config.chunk);
        let embeddings = embed_chunks(store, provider, config, &chunks).await?;

        if vector_dims.is_none() {
            if let Some(dims) = embeddings.iter().find(|v| !v.is_empty()).map(|v| v.len()) {
                vector_dims = Some(dims);
                let store = store.clone();
                tokio::task::spawn_blocking(move || store.ensure_vec_table(dims)).await??;
            }
        }

        let record = FileRecord {
            path: candidate.file.rel_path.clone(),
            source: MEMORY_SOURCE.to_string(),
            hash: candidate.hash.clone(),
            mtime_ms: candidate.file.mtime_ms,
            size: candidate.file.size,
        };
        let rows: Vec<StoredChunk> = chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(ordinal, (chunk, embedding))| StoredChunk {
                id: format!(
                    "{}:{}:{}:{}",
                    MEMORY_SOURCE,
                    record.path,
                    ordinal,
                    &chunk.hash[..8]
                ),
                start_line: chunk.start_line as i64,
                end_line: chunk.end_line as i64,
                hash: chunk.hash.clone(),
                model: provider.model().to_string(),
                text: chunk.text.clone(),
                embedding,
            })
            .collect();

        let chunk_rows = rows.len();
        {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.replace_file_chunks(&record, &rows))
                .await??;
        }
        stats.files_processed += 1;
        stats.chunks_created += chunk_rows;
    }

    // Prune stored files that no longer exist on disk.
    let keep: Vec<String> = candidates.iter().map(|c| c.file.rel_path.clone()).collect();
    let removed = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.prune_files(MEMORY_SOURCE, &keep)).await??
    };
    stats.stale_removed = removed.len();

    let new_meta = IndexMeta {
        model: provider.model().to_string(),
        provider: provider.id().to_string(),
        provider_key: key,
        chunk_tokens: config.chunk.tokens,
        chunk_overlap: config.chunk.overlap,
        vector_dims,
    };
    {
        let store = store.clone();
        let max_entries = config.cache_max_entries;
        let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        tokio::task::spawn_blocking(move || -> Result<()> {
            store.set_index_meta(&new_meta)?;
            store.meta_set("last_indexed", &stamp)?;
            let evicted = store.cache_prune(max_entries)?;
            if evicted > 0 {
                debug!(evicted, "embedding cache pruned");
            }
            Ok(())
        })
        .await??;
    }

    if stats.files_processed > 0 || stats.stale_removed > 0 {
        info!(
            files = stats.files_processed,
            chunks = stats.chunks_created,
            removed = stats.stale_removed,
            "index pass complete"
        );
    }
    Ok(stats)
}

/// Resolve chunk embeddings through the content-addressed cache, embedding
/// only the misses. A `"none"` provider bypasses the cache entirely.
async fn embed_chunks(
    store: &Store,
    provider: &dyn EmbeddingProvider,
    config: &EngineConfig,
    chunks: &[crate::chunker::Chunk],
) -> Result<Vec<Vec<f32>>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    if provider.is_none() {
        return Ok(vec![Vec::new(); chunks.len()]);
    }

    let key = provider_key(provider);
    let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
    let cached = {
        let store = store.clone();
        let provider_id = provider.id().to_string();
        let model = provider.model().to_string();
        let key = key.clone();
        let hashes = hashes.clone();
        tokio::task::spawn_blocking(move || {
            store.cache_lookup(&provider_id, &model, &key, &hashes)
        })
        .await??
    };

    let mut missing_texts: Vec<String> = Vec::new();
    let mut missing_indices: Vec<usize> = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if !cached.contains_key(&chunk.hash) {
            // Identical text may repeat within one file; embed it once.
            if !missing_indices.iter().any(|&j| chunks[j].hash == chunk.hash) {
                missing_indices.push(i);
                missing_texts.push(chunk.text.clone());
            }
        }
    }

    let fresh = embed_texts(provider, &config.embed, &missing_texts).await?;
    let mut resolved = cached;
    {
        let store = store.clone();
        let provider_id = provider.id().to_string();
        let model = provider.model().to_string();
        let key = key.clone();
        let pairs: Vec<(String, Vec<f32>)> = missing_indices
            .iter()
            .zip(fresh)
            .map(|(&i, vector)| (chunks[i].hash.clone(), vector))
            .collect();
        let inserted = tokio::task::spawn_blocking(move || -> Result<Vec<(String, Vec<f32>)>> {
            for (hash, vector) in &pairs {
                store.cache_insert(&provider_id, &model, &key, hash, vector)?;
            }
            Ok(pairs)
        })
        .await??;
        for (hash, vector) in inserted {
            resolved.insert(hash, vector);
        }
    }

    Ok(chunks
        .iter()
        .map(|chunk| resolved.get(&chunk.hash).cloned().unwrap_or_default())
        .collect())
}

// ---------------------------------------------------------------------------
// Staleness probe (used at query time when no watcher runs)
// ---------------------------------------------------------------------------

/// Cheap divergence check between the on-disk root and stored file records:
/// file count, unknown paths, or any mtime drift (integer milliseconds).
pub async fn is_stale(store: &Store, root: &Path) -> Result<bool> {
    let root: PathBuf = root.to_path_buf();
    let candidates = tokio::task::spawn_blocking(move || list_memory_files(&root)).await??;
    let stored = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.file_index(MEMORY_SOURCE)).await??
    };

    if candidates.len() != stored.len() {
        return Ok(true);
    }
    for candidate in &candidates {
        match stored.get(&candidate.rel_path) {
            None => return Ok(true),
            Some(record) if record.mtime_ms != candidate.mtime_ms => return Ok(true),
            Some(_) => {}
        }
    }
    Ok(false)
}
