//! Engine configuration.
//!
//! Everything an engine needs is collected into a validated [`EngineConfig`]
//! before any operation runs. The builder applies three explicit steps:
//! hardcoded defaults, then the per-root `.minimem/config.json` (if present),
//! then programmatic overrides. Deep-merging of layered config files is the
//! CLI's job, not the engine's — the engine only reads the one local file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkConfig {
    /// Approximate token budget per chunk (tokens ≈ whitespace words).
    pub tokens: usize,
    /// Approximate token overlap between consecutive chunks.
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { tokens: 400, overlap: 50 }
    }
}

// ---------------------------------------------------------------------------
// Hybrid search weights
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HybridConfig {
    /// Run BM25 keyword search alongside vector search and merge.
    pub enabled: bool,
    pub vector_weight: f64,
    pub text_weight: f64,
    /// Candidate pool per side = max_results × this (capped at 200).
    pub candidate_multiplier: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self { enabled: true, vector_weight: 0.7, text_weight: 0.3, candidate_multiplier: 4 }
    }
}

// ---------------------------------------------------------------------------
// Embedding call policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbedPolicy {
    /// Prefer the provider's batch endpoint when it advertises one.
    pub batch: bool,
    /// Attempts per chunk on the direct (non-batch) path.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for EmbedPolicy {
    fn default() -> Self {
        Self { batch: true, max_attempts: 3, backoff_base_ms: 500, backoff_cap_ms: 8_000 }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    /// Embedded watcher on/off. When off, queries fall back to the cheap
    /// staleness probe before searching.
    pub enabled: bool,
    pub debounce_ms: u64,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Poll the filesystem instead of using OS notifications (network mounts).
    pub use_polling: bool,
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 500,
            include: vec!["MEMORY.md".to_string(), "memory/**/*.md".to_string()],
            exclude: Vec::new(),
            use_polling: false,
            poll_interval_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Sub-path under the central repo this root maps to, e.g. `"proj/"`.
    pub central_path: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Push on watcher batches and pull in the daemon's poll loop.
    pub autosync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            central_path: None,
            include: vec!["MEMORY.md".to_string(), "memory/**/*.md".to_string()],
            exclude: Vec::new(),
            autosync: false,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Validated configuration for one memory root.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub chunk: ChunkConfig,
    pub hybrid: HybridConfig,
    pub embed: EmbedPolicy,
    pub watch: WatchConfig,
    pub sync: SyncConfig,
    /// Default result count when a query passes none.
    pub max_results: usize,
    /// Default score floor when a query passes none.
    pub min_score: f64,
    /// Embedding-cache row cap before LRU pruning.
    pub cache_max_entries: usize,
}

impl EngineConfig {
    pub fn builder(root: impl Into<PathBuf>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(root)
    }

    /// The `.minimem/` state directory for this root.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".minimem")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("index.db")
    }

    pub fn sync_state_path(&self) -> PathBuf {
        self.state_dir().join("sync-state.json")
    }

    pub fn sync_log_path(&self) -> PathBuf {
        self.state_dir().join("sync.log")
    }

    pub fn conflicts_dir(&self) -> PathBuf {
        self.state_dir().join("conflicts")
    }
}

// ---------------------------------------------------------------------------
// On-disk per-root config (.minimem/config.json)
// ---------------------------------------------------------------------------

/// The subset of `.minimem/config.json` the engine itself consumes. Written
/// by the CLI collaborator; unknown fields are ignored, absent fields keep
/// their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RootConfig {
    pub chunk: Option<ChunkConfig>,
    pub hybrid: Option<HybridConfig>,
    pub embed: Option<EmbedPolicy>,
    pub watch: Option<WatchConfig>,
    pub sync: Option<SyncConfig>,
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    pub cache_max_entries: Option<usize>,
}

impl RootConfig {
    /// Read `<root>/.minimem/config.json`. Missing file yields defaults;
    /// malformed JSON is a validation error (the file is operator-owned).
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(".minimem").join("config.json");
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::fs(path, e)),
        };
        serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("malformed {}: {e}", path.display())))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct EngineConfigBuilder {
    root: PathBuf,
    chunk: ChunkConfig,
    hybrid: HybridConfig,
    embed: EmbedPolicy,
    watch: WatchConfig,
    sync: SyncConfig,
    max_results: usize,
    min_score: f64,
    cache_max_entries: usize,
}

impl EngineConfigBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk: ChunkConfig::default(),
            hybrid: HybridConfig::default(),
            embed: EmbedPolicy::default(),
            watch: WatchConfig::default(),
            sync: SyncConfig::default(),
            max_results: 6,
            min_score: 0.0,
            cache_max_entries: 50_000,
        }
    }

    /// Apply the on-disk `.minimem/config.json` for the root, if present.
    pub fn from_root_config(mut self, file: &RootConfig) -> Self {
        if let Some(chunk) = file.chunk {
            self.chunk = chunk;
        }
        if let Some(hybrid) = file.hybrid {
            self.hybrid = hybrid;
        }
        if let Some(embed) = file.embed {
            self.embed = embed;
        }
        if let Some(ref watch) = file.watch {
            self.watch = watch.clone();
        }
        if let Some(ref sync) = file.sync {
            self.sync = sync.clone();
        }
        if let Some(max_results) = file.max_results {
            self.max_results = max_results;
        }
        if let Some(min_score) = file.min_score {
            self.min_score = min_score;
        }
        if let Some(cache_max_entries) = file.cache_max_entries {
            self.cache_max_entries = cache_max_entries;
        }
        self
    }

    pub fn chunk(mut self, chunk: ChunkConfig) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn hybrid(mut self, hybrid: HybridConfig) -> Self {
        self.hybrid = hybrid;
        self
    }

    pub fn embed(mut self, embed: EmbedPolicy) -> Self {
        self.embed = embed;
        self
    }

    pub fn watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }

    pub fn min_score(mut self, s: f64) -> Self {
        self.min_score = s;
        self
    }

    pub fn cache_max_entries(mut self, n: usize) -> Self {
        self.cache_max_entries = n;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::Config("memory root path is empty".into()));
        }
        if self.chunk.tokens == 0 {
            return Err(Error::Config("chunk.tokens must be positive".into()));
        }
        if self.chunk.overlap >= self.chunk.tokens {
            return Err(Error::Config(format!(
                "chunk.overlap ({}) must be smaller than chunk.tokens ({})",
                self.chunk.overlap, self.chunk.tokens
            )));
        }
        if self.hybrid.vector_weight < 0.0 || self.hybrid.text_weight < 0.0 {
            return Err(Error::Config("hybrid weights must be non-negative".into()));
        }
        if self.hybrid.vector_weight + self.hybrid.text_weight <= 0.0 {
            return Err(Error::Config("hybrid weights must not both be zero".into()));
        }
        if self.hybrid.candidate_multiplier == 0 {
            return Err(Error::Config("hybrid.candidateMultiplier must be positive".into()));
        }
        if self.max_results == 0 {
            return Err(Error::Config("maxResults must be positive".into()));
        }
        if self.sync.enabled && self.sync.central_path.is_none() {
            return Err(Error::Config("sync.enabled requires sync.centralPath".into()));
        }
        Ok(EngineConfig {
            root: self.root,
            chunk: self.chunk,
            hybrid: self.hybrid,
            embed: self.embed,
            watch: self.watch,
            sync: self.sync,
            max_results: self.max_results,
            min_score: self.min_score,
            cache_max_entries: self.cache_max_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_validate() {
        let config = EngineConfig::builder("/tmp/mem").build().unwrap();
        assert_eq!(config.chunk.tokens, 400);
        assert!((config.hybrid.vector_weight - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/mem/.minimem/index.db"));
    }

    #[test]
    fn overlap_must_be_smaller_than_tokens() {
        let err = EngineConfig::builder("/tmp/mem")
            .chunk(ChunkConfig { tokens: 50, overlap: 50 })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn sync_enabled_requires_central_path() {
        let err = EngineConfig::builder("/tmp/mem")
            .sync(SyncConfig { enabled: true, ..SyncConfig::default() })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn root_config_overrides_defaults() {
        let file = RootConfig {
            chunk: Some(ChunkConfig { tokens: 120, overlap: 20 }),
            min_score: Some(0.3),
            ..RootConfig::default()
        };
        let config =
            EngineConfig::builder("/tmp/mem").from_root_config(&file).build().unwrap();
        assert_eq!(config.chunk.tokens, 120);
        assert!((config.min_score - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.max_results, 6);
    }

    #[test]
    fn missing_config_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = RootConfig::load(dir.path()).unwrap();
        assert!(file.sync.is_none());
    }
}
