//! Persistent chunk store — a single SQLite database per memory root.
//!
//! Tables: `files`, `chunks`, `embedding_cache`, `meta`, plus two optional
//! virtual tables — `chunks_fts` (FTS5 keyword index) and `chunks_vec`
//! (sqlite-vec ANN index, created lazily once the vector dimensionality is
//! known). If either virtual table cannot be created the store stays fully
//! usable and only the corresponding search path degrades.
//!
//! All access goes through one `Mutex<Connection>`; async callers wrap store
//! calls in `spawn_blocking`. Per-file chunk replacement runs in a single
//! transaction so a concurrent reader sees the old chunk set or the new one,
//! never a mix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Current schema version, stamped into `meta('schema_version')`.
pub const SCHEMA_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub source: String,
    pub hash: String,
    pub mtime_ms: i64,
    pub size: u64,
}

/// A chunk row ready for insertion. `embedding` is empty for a `"none"`
/// provider; such rows never enter the vector table.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub start_line: i64,
    pub end_line: i64,
    pub hash: String,
    pub model: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// The singleton index configuration record. Any mismatch against the live
/// configuration forces a full re-chunk; the embedding cache survives because
/// it is content-addressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub model: String,
    pub provider: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    pub vector_dims: Option<usize>,
}

/// A raw keyword hit from the FTS table.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub snippet: String,
    /// Raw `bm25()` rank; more negative is better.
    pub rank: f64,
}

/// A raw nearest-neighbor hit from the vector table or brute-force scan.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    /// Cosine-similarity score in `[0, 1]`.
    pub score: f64,
}

// ---------------------------------------------------------------------------
// sqlite-vec extension registration (process-wide, once)
// ---------------------------------------------------------------------------

fn register_vec_extension() -> bool {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    static REGISTER: Once = Once::new();
    static AVAILABLE: AtomicBool = AtomicBool::new(false);

    REGISTER.call_once(|| {
        type Sqlite3AutoExtFn =
            unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;
        let rc = unsafe {
            sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
                sqlite_vec::sqlite3_vec_init as *const (),
            )))
        };
        AVAILABLE.store(rc == rusqlite::ffi::SQLITE_OK, Ordering::SeqCst);
    });
    AVAILABLE.load(Ordering::SeqCst)
}

fn embedding_to_json(embedding: &[f32]) -> String {
    serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_string())
}

fn json_to_embedding(json: &str) -> Option<Vec<f32>> {
    serde_json::from_str(json).ok()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct StoreInner {
    conn: Mutex<Connection>,
    path: PathBuf,
    fts_available: AtomicBool,
    vec_available: AtomicBool,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open (creating if needed) the store at `path`, running schema
    /// migration and virtual-table setup.
    pub fn open(path: &Path) -> Result<Store> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::fs(parent, e))?;
        }
        let vec_registered = register_vec_extension();

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;

        let store = Store {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                path: path.to_path_buf(),
                fts_available: AtomicBool::new(false),
                vec_available: AtomicBool::new(vec_registered),
            }),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Store> {
        let vec_registered = register_vec_extension();
        let conn = Connection::open_in_memory()?;
        let store = Store {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                path: PathBuf::from(":memory:"),
                fts_available: AtomicBool::new(false),
                vec_available: AtomicBool::new(vec_registered),
            }),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn fts_available(&self) -> bool {
        self.inner.fts_available.load(Ordering::SeqCst)
    }

    pub fn vec_available(&self) -> bool {
        self.inner.vec_available.load(Ordering::SeqCst)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Lock poisoning means a panic mid-write; the connection itself is
        // still transactionally consistent, so keep serving.
        self.inner.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Schema and migration
    // -----------------------------------------------------------------------

    fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |r| r.get(0))
            .optional()?;
        let stored_version = stored.and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);

        if stored_version != 0 && stored_version < SCHEMA_VERSION {
            // Older layouts rebuild from source files on the next index pass.
            // The embedding cache is content-addressed and survives.
            debug!(from = stored_version, to = SCHEMA_VERSION, "migrating store schema");
            conn.execute_batch(
                "DROP TABLE IF EXISTS files;
                 DROP TABLE IF EXISTS chunks;
                 DROP TABLE IF EXISTS chunks_fts;
                 DROP TABLE IF EXISTS chunks_vec;",
            )?;
            conn.execute("DELETE FROM meta WHERE key IN ('index_meta', 'vec_dimensions')", [])?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                hash TEXT NOT NULL,
                mtime INTEGER NOT NULL,
                size INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_files_source ON files(source);

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                source TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                hash TEXT NOT NULL,
                model TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path);
            CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);

            CREATE TABLE IF NOT EXISTS embedding_cache (
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                provider_key TEXT NOT NULL,
                hash TEXT NOT NULL,
                embedding TEXT NOT NULL,
                dims INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (provider, model, provider_key, hash)
            );
            CREATE INDEX IF NOT EXISTS idx_cache_updated ON embedding_cache(updated_at);",
        )?;

        // FTS5 may be compiled out of the linked SQLite; degrade to
        // vector-only search in that case.
        let fts = conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                text,
                id UNINDEXED,
                path UNINDEXED,
                source UNINDEXED,
                model UNINDEXED,
                start_line UNINDEXED,
                end_line UNINDEXED
            );",
        );
        match fts {
            Ok(()) => self.inner.fts_available.store(true, Ordering::SeqCst),
            Err(e) => {
                warn!(error = %e, "FTS5 unavailable, keyword search disabled");
                self.inner.fts_available.store(false, Ordering::SeqCst);
            }
        }

        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.conn();
        let value: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |r| r.get(0))
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    // -----------------------------------------------------------------------
    // Meta
    // -----------------------------------------------------------------------

    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO meta(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn index_meta(&self) -> Result<Option<IndexMeta>> {
        match self.meta_get("index_meta")? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub fn set_index_meta(&self, meta: &IndexMeta) -> Result<()> {
        self.meta_set("index_meta", &serde_json::to_string(meta)?)
    }

    // -----------------------------------------------------------------------
    // File records
    // -----------------------------------------------------------------------

    /// All stored file records for a source, keyed by relative path.
    pub fn file_index(&self, source: &str) -> Result<HashMap<String, FileRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT path, source, hash, mtime, size FROM files WHERE source = ?1")?;
        let rows = stmt.query_map(params![source], |r| {
            Ok(FileRecord {
                path: r.get(0)?,
                source: r.get(1)?,
                hash: r.get(2)?,
                mtime_ms: r.get(3)?,
                size: r.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let record = row?;
            out.insert(record.path.clone(), record);
        }
        Ok(out)
    }

    pub fn file_count(&self) -> Result<usize> {
        let conn = self.conn();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn chunk_count(&self) -> Result<usize> {
        let conn = self.conn();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // Chunk replacement
    // -----------------------------------------------------------------------

    /// Replace all chunks of one file in a single transaction: upsert the
    /// file record, delete old chunk/FTS/vector rows, insert the new set.
    pub fn replace_file_chunks(&self, file: &FileRecord, chunks: &[StoredChunk]) -> Result<()> {
        let vec_on = self.vec_available();
        let fts_on = self.fts_available();
        let now = now_ms();

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        if fts_on {
            tx.execute(
                "DELETE FROM chunks_fts WHERE path = ?1 AND source = ?2",
                params![file.path, file.source],
            )?;
        }
        if vec_on && vec_table_exists(&tx)? {
            tx.execute(
                "DELETE FROM chunks_vec WHERE id IN
                   (SELECT id FROM chunks WHERE path = ?1 AND source = ?2)",
                params![file.path, file.source],
            )?;
        }
        tx.execute(
            "DELETE FROM chunks WHERE path = ?1 AND source = ?2",
            params![file.path, file.source],
        )?;

        tx.execute(
            "INSERT INTO files(path, source, hash, mtime, size)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                source = excluded.source,
                hash = excluded.hash,
                mtime = excluded.mtime,
                size = excluded.size",
            params![file.path, file.source, file.hash, file.mtime_ms, file.size as i64],
        )?;

        for chunk in chunks {
            let embedding_json =
                if chunk.embedding.is_empty() { String::new() } else { embedding_to_json(&chunk.embedding) };
            tx.execute(
                "INSERT INTO chunks(id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    chunk.id,
                    file.path,
                    file.source,
                    chunk.start_line,
                    chunk.end_line,
                    chunk.hash,
                    chunk.model,
                    chunk.text,
                    embedding_json,
                    now
                ],
            )?;
            if fts_on {
                tx.execute(
                    "INSERT INTO chunks_fts(text, id, path, source, model, start_line, end_line)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        chunk.text,
                        chunk.id,
                        file.path,
                        file.source,
                        chunk.model,
                        chunk.start_line,
                        chunk.end_line
                    ],
                )?;
            }
            if vec_on && !chunk.embedding.is_empty() && vec_table_exists(&tx)? {
                tx.execute(
                    "INSERT OR REPLACE INTO chunks_vec(id, embedding) VALUES (?1, ?2)",
                    params![chunk.id, embedding_json],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete stored files (and their chunks) whose paths are not in `keep`.
    /// Returns the removed paths.
    pub fn prune_files(&self, source: &str, keep: &[String]) -> Result<Vec<String>> {
        let stored = self.file_index(source)?;
        let keep: std::collections::HashSet<&str> = keep.iter().map(|s| s.as_str()).collect();
        let stale: Vec<String> =
            stored.keys().filter(|p| !keep.contains(p.as_str())).cloned().collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let fts_on = self.fts_available();
        let vec_on = self.vec_available();
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        for path in &stale {
            if fts_on {
                tx.execute(
                    "DELETE FROM chunks_fts WHERE path = ?1 AND source = ?2",
                    params![path, source],
                )?;
            }
            if vec_on && vec_table_exists(&tx)? {
                tx.execute(
                    "DELETE FROM chunks_vec WHERE id IN
                       (SELECT id FROM chunks WHERE path = ?1 AND source = ?2)",
                    params![path, source],
                )?;
            }
            tx.execute(
                "DELETE FROM chunks WHERE path = ?1 AND source = ?2",
                params![path, source],
            )?;
            tx.execute(
                "DELETE FROM files WHERE path = ?1 AND source = ?2",
                params![path, source],
            )?;
        }
        tx.commit()?;
        Ok(stale)
    }

    // -----------------------------------------------------------------------
    // Vector virtual table
    // -----------------------------------------------------------------------

    /// Create (or re-create on a dims change) the `chunks_vec` table. A
    /// creation failure flips vector availability off and is not an error.
    pub fn ensure_vec_table(&self, dims: usize) -> Result<()> {
        if !self.vec_available() || dims == 0 {
            return Ok(());
        }
        let conn = self.conn();
        let current: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'vec_dimensions'", [], |r| r.get(0))
            .optional()?;
        let needs_recreate = match current {
            Some(d) => d.parse::<usize>().unwrap_or(0) != dims,
            None => true,
        };
        if !needs_recreate {
            return Ok(());
        }

        let created = conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS chunks_vec;
             CREATE VIRTUAL TABLE chunks_vec USING vec0(
                id TEXT PRIMARY KEY,
                embedding FLOAT[{dims}] distance_metric=cosine
             );"
        ));
        match created {
            Ok(()) => {
                conn.execute(
                    "INSERT INTO meta(key, value) VALUES('vec_dimensions', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![dims.to_string()],
                )?;
                debug!(dims, "vector table ready");
            }
            Err(e) => {
                warn!(error = %e, "vector table unavailable, falling back to brute-force scan");
                self.inner.vec_available.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    pub fn vec_dims(&self) -> Result<Option<usize>> {
        Ok(self.meta_get("vec_dimensions")?.and_then(|d| d.parse().ok()))
    }

    // -----------------------------------------------------------------------
    // Search primitives
    // -----------------------------------------------------------------------

    /// BM25 keyword hits for a prebuilt FTS query, best first.
    pub fn keyword_search(
        &self,
        fts_query: &str,
        model: &str,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KeywordHit>> {
        if !self.fts_available() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = "SELECT id, path, source, start_line, end_line,
                          snippet(chunks_fts, 0, '', '', '…', 16) AS snip,
                          bm25(chunks_fts) AS rank
                   FROM chunks_fts
                   WHERE chunks_fts MATCH ?1 AND model = ?2
                     AND (?3 IS NULL OR source = ?3)
                   ORDER BY rank
                   LIMIT ?4";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![fts_query, model, source, limit as i64], |r| {
            Ok(KeywordHit {
                id: r.get(0)?,
                path: r.get(1)?,
                source: r.get(2)?,
                start_line: r.get(3)?,
                end_line: r.get(4)?,
                snippet: r.get(5)?,
                rank: r.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// ANN hits via the vector table, best first. Returns `None` when the
    /// table is absent or its dims do not match the query vector.
    pub fn vec_search(
        &self,
        query: &[f32],
        model: &str,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Option<Vec<VectorHit>>> {
        if !self.vec_available() || query.is_empty() {
            return Ok(None);
        }
        match self.vec_dims()? {
            Some(dims) if dims == query.len() => {}
            _ => return Ok(None),
        }

        let conn = self.conn();
        if !vec_table_exists(&conn)? {
            return Ok(None);
        }
        let query_json = embedding_to_json(query);
        let sql = "SELECT v.id, c.path, c.source, c.start_line, c.end_line, c.text, v.distance
                   FROM chunks_vec v
                   JOIN chunks c ON c.id = v.id
                   WHERE v.embedding MATCH ?1 AND k = ?2
                     AND c.model = ?3
                     AND (?4 IS NULL OR c.source = ?4)";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![query_json, limit as i64, model, source], |r| {
            Ok(VectorHit {
                id: r.get(0)?,
                path: r.get(1)?,
                source: r.get(2)?,
                start_line: r.get(3)?,
                end_line: r.get(4)?,
                text: r.get(5)?,
                score: 1.0 - r.get::<_, f64>(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            let mut hit = row?;
            hit.score = hit.score.clamp(0.0, 1.0);
            out.push(hit);
        }
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        out.truncate(limit);
        Ok(Some(out))
    }

    /// Brute-force cosine scan over stored embeddings for the current model.
    pub fn brute_force_search(
        &self,
        query: &[f32],
        model: &str,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, path, source, start_line, end_line, text, embedding
             FROM chunks
             WHERE model = ?1 AND embedding <> ''
               AND (?2 IS NULL OR source = ?2)",
        )?;
        let rows = stmt.query_map(params![model, source], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
            ))
        })?;

        let mut out: Vec<VectorHit> = Vec::new();
        for row in rows {
            let (id, path, source, start_line, end_line, text, embedding_json) = row?;
            let Some(embedding) = json_to_embedding(&embedding_json) else { continue };
            let score = cosine_similarity(query, &embedding);
            if !score.is_finite() {
                continue;
            }
            out.push(VectorHit {
                id,
                path,
                source,
                start_line,
                end_line,
                text,
                score: score as f64,
            });
        }
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        out.truncate(limit);
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Embedding cache
    // -----------------------------------------------------------------------

    /// Look up cached vectors for a set of chunk hashes. Hits are touched so
    /// LRU eviction keeps hot entries.
    pub fn cache_lookup(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let conn = self.conn();
        let mut select = conn.prepare(
            "SELECT embedding FROM embedding_cache
             WHERE provider = ?1 AND model = ?2 AND provider_key = ?3 AND hash = ?4",
        )?;
        let mut touch = conn.prepare(
            "UPDATE embedding_cache SET updated_at = ?1
             WHERE provider = ?2 AND model = ?3 AND provider_key = ?4 AND hash = ?5",
        )?;
        let now = now_ms();
        let mut out = HashMap::new();
        for hash in hashes {
            if out.contains_key(hash) {
                continue;
            }
            let row: Option<String> = select
                .query_row(params![provider, model, provider_key, hash], |r| r.get(0))
                .optional()?;
            if let Some(embedding_json) = row {
                if let Some(embedding) = json_to_embedding(&embedding_json) {
                    touch.execute(params![now, provider, model, provider_key, hash])?;
                    out.insert(hash.clone(), embedding);
                }
            }
        }
        Ok(out)
    }

    pub fn cache_insert(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        hash: &str,
        embedding: &[f32],
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO embedding_cache(provider, model, provider_key, hash, embedding, dims, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
                embedding = excluded.embedding,
                dims = excluded.dims,
                updated_at = excluded.updated_at",
            params![
                provider,
                model,
                provider_key,
                hash,
                embedding_to_json(embedding),
                embedding.len() as i64,
                now_ms()
            ],
        )?;
        Ok(())
    }

    pub fn cache_count(&self) -> Result<usize> {
        let conn = self.conn();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Evict the oldest entries until the row count is at most `max`.
    /// Returns the number of evicted rows.
    pub fn cache_prune(&self, max: usize) -> Result<usize> {
        let count = self.cache_count()?;
        if count <= max {
            return Ok(0);
        }
        let excess = count - max;
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM embedding_cache WHERE rowid IN
               (SELECT rowid FROM embedding_cache ORDER BY updated_at ASC LIMIT ?1)",
            params![excess as i64],
        )?;
        Ok(removed)
    }
}

fn vec_table_exists(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'chunks_vec'",
        [],
        |r| r.get(0),
    )
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}
