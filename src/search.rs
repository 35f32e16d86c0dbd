//! Hybrid ranked retrieval — BM25 keyword search merged with vector
//! similarity.
//!
//! Both sides produce scores in `[0, 1]`. When only one side yields results
//! the weights renormalize to that side, so a keyword-only deployment (a
//! `"none"` provider, or FTS-only stores) is not crushed by the configured
//! text weight.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::provider::{embed_query_timed, EmbeddingProvider};
use crate::store::{KeywordHit, Store, VectorHit};

/// Hard ceiling on the per-side candidate pool.
const MAX_CANDIDATES: usize = 200;

/// Vector-side display text is cut to roughly this many code points.
const SNIPPET_CHARS: usize = 700;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    /// Restrict to one document class (`"memory"`, `"skill"`, …). `None`
    /// searches all sources.
    pub source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    /// Hybrid score in `[0, 1]`.
    pub score: f64,
    pub snippet: String,
}

// ---------------------------------------------------------------------------
// Query construction
// ---------------------------------------------------------------------------

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+").unwrap())
}

/// Build a conjunctive FTS5 query: `"tok1" AND "tok2" AND …`. Returns `None`
/// when the query has no indexable tokens.
pub fn build_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = word_regex()
        .find_iter(query)
        .map(|m| format!("\"{}\"", m.as_str().replace('"', "")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" AND "))
    }
}

/// Map a raw `bm25()` rank (more negative = better) into `[0, 1]`.
fn keyword_score(rank: f64) -> f64 {
    if rank.is_finite() {
        1.0 / (1.0 + rank.abs())
    } else {
        0.0
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Run a hybrid search against an indexed store. The caller is responsible
/// for freshness (watcher or staleness probe) before calling.
pub async fn search(
    store: &Store,
    provider: &dyn EmbeddingProvider,
    config: &EngineConfig,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let max_results = options.max_results.unwrap_or(config.max_results).max(1);
    let min_score = options.min_score.unwrap_or(config.min_score);
    let candidates =
        (max_results.saturating_mul(config.hybrid.candidate_multiplier)).min(MAX_CANDIDATES).max(1);
    let source = options.source.clone();
    let model = provider.model().to_string();

    // Keyword side.
    let keyword_hits: Vec<KeywordHit> = match build_fts_query(query) {
        Some(fts_query) if config.hybrid.enabled && store.fts_available() => {
            let store = store.clone();
            let source = source.clone();
            tokio::task::spawn_blocking(move || {
                store.keyword_search(&fts_query, &model, source.as_deref(), candidates)
            })
            .await??
        }
        _ => Vec::new(),
    };

    // Vector side: embed the query under the provider's timeout, then ANN
    // with a brute-force fallback when the vector table cannot serve.
    let mut vector_hits: Vec<VectorHit> = Vec::new();
    if !provider.is_none() {
        let query_embedding = embed_query_timed(provider, query).await?;
        if query_embedding.iter().any(|x| *x != 0.0) {
            let store = store.clone();
            let source = source.clone();
            let model = provider.model().to_string();
            vector_hits = tokio::task::spawn_blocking(move || -> Result<Vec<VectorHit>> {
                match store.vec_search(&query_embedding, &model, source.as_deref(), candidates)? {
                    Some(hits) => Ok(hits),
                    None => {
                        store.brute_force_search(&query_embedding, &model, source.as_deref(), candidates)
                    }
                }
            })
            .await??;
        }
    }

    let mut results = merge(&config.hybrid, vector_hits, keyword_hits);
    results.retain(|r| r.score >= min_score);
    results.truncate(max_results);
    Ok(results)
}

struct MergedHit {
    path: String,
    source: String,
    start_line: i64,
    end_line: i64,
    vector_score: f64,
    text_score: f64,
    keyword_snippet: Option<String>,
    vector_text: Option<String>,
}

fn merge(
    hybrid: &crate::config::HybridConfig,
    vector_hits: Vec<VectorHit>,
    keyword_hits: Vec<KeywordHit>,
) -> Vec<SearchResult> {
    // Renormalize when one side is silent.
    let (vector_weight, text_weight) = match (vector_hits.is_empty(), keyword_hits.is_empty()) {
        (false, false) => (hybrid.vector_weight, hybrid.text_weight),
        (false, true) => (1.0, 0.0),
        (true, false) => (0.0, 1.0),
        (true, true) => return Vec::new(),
    };

    let mut merged: HashMap<String, MergedHit> = HashMap::new();
    for hit in vector_hits {
        merged.insert(
            hit.id.clone(),
            MergedHit {
                path: hit.path,
                source: hit.source,
                start_line: hit.start_line,
                end_line: hit.end_line,
                vector_score: hit.score,
                text_score: 0.0,
                keyword_snippet: None,
                vector_text: Some(hit.text),
            },
        );
    }
    for hit in keyword_hits {
        let score = keyword_score(hit.rank);
        match merged.get_mut(&hit.id) {
            Some(entry) => {
                entry.text_score = score;
                entry.keyword_snippet = Some(hit.snippet);
            }
            None => {
                merged.insert(
                    hit.id.clone(),
                    MergedHit {
                        path: hit.path,
                        source: hit.source,
                        start_line: hit.start_line,
                        end_line: hit.end_line,
                        vector_score: 0.0,
                        text_score: score,
                        keyword_snippet: Some(hit.snippet),
                        vector_text: None,
                    },
                );
            }
        }
    }

    let mut results: Vec<SearchResult> = merged
        .into_values()
        .map(|hit| {
            let snippet = match (hit.keyword_snippet, hit.vector_text) {
                // The FTS snippet is the contextual highlight; prefer it.
                (Some(snippet), _) if !snippet.trim().is_empty() => snippet,
                (_, Some(text)) => truncate_chars(&text, SNIPPET_CHARS),
                (Some(snippet), None) => snippet,
                (None, None) => String::new(),
            };
            SearchResult {
                path: hit.path,
                source: hit.source,
                start_line: hit.start_line,
                end_line: hit.end_line,
                score: vector_weight * hit.vector_score + text_weight * hit.text_score,
                snippet,
            }
        })
        .collect();
    results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    results
}
