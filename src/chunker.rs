//! Markdown chunking — split note text into overlapping, line-addressed
//! chunks and hash each chunk by content.
//!
//! The token budget is approximate: a token is a whitespace-delimited word.
//! Chunks are contiguous 1-indexed inclusive line ranges, consecutive chunks
//! overlap by roughly the configured token count, and every non-empty line of
//! input lands in at least one chunk. Chunk hashes depend on the chunk text
//! only, so identical text in two files shares one embedding-cache entry.

use sha2::{Digest, Sha256};

use crate::config::ChunkConfig;

/// Upper bound on code points a single "token" is assumed to span. Lines
/// beyond `tokens * CHARS_PER_TOKEN` code points are split directly by
/// character windows (minified text, long URLs).
const CHARS_PER_TOKEN: usize = 8;

/// A contiguous fragment of a file, ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
    pub text: String,
    /// 64-hex SHA-256 of `text`.
    pub hash: String,
}

/// Lowercase 64-hex SHA-256 of a UTF-8 string. Stable across platforms; no
/// line-ending normalization (CRLF hashes as-is).
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split `text` into overlapping line-range chunks.
///
/// Whitespace-only input yields no chunks. Deterministic: two calls with the
/// same input and config produce byte-identical output.
pub fn chunk(text: &str, config: &ChunkConfig) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    // split('\n') keeps any trailing '\r' inside the line so CRLF content
    // round-trips through chunk text verbatim.
    let lines: Vec<&str> = text.split('\n').collect();
    let char_budget = config.tokens * CHARS_PER_TOKEN;
    let overlap_chars = config.overlap * CHARS_PER_TOKEN;

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut last_emitted_end: Option<usize> = None;

    let mut start = 0usize;
    let mut acc_tokens = 0usize;
    let mut idx = 0usize;

    while idx < lines.len() {
        let line = lines[idx];

        if line.chars().count() > char_budget {
            // Flush whatever precedes the oversized line, then window the
            // line itself by code points; each window keeps the line number.
            if idx > start {
                emit(&mut chunks, &mut last_emitted_end, &lines, start, idx - 1);
            }
            for window in char_windows(line, char_budget, overlap_chars) {
                push_chunk(&mut chunks, idx + 1, idx + 1, window);
            }
            last_emitted_end = Some(idx);
            idx += 1;
            start = idx;
            acc_tokens = 0;
            continue;
        }

        acc_tokens += token_count(line);
        idx += 1;

        if acc_tokens >= config.tokens {
            emit(&mut chunks, &mut last_emitted_end, &lines, start, idx - 1);

            // Back up over trailing lines totalling ~overlap tokens; always
            // advance past the previous start so the pass terminates.
            let mut overlap_tokens = 0usize;
            let mut next_start = idx;
            while next_start > start && overlap_tokens < config.overlap {
                next_start -= 1;
                overlap_tokens += token_count(lines[next_start]);
            }
            start = next_start.max(start + 1).min(idx);
            acc_tokens = lines[start..idx].iter().map(|l| token_count(l)).sum();
        }
    }

    // Tail: anything not yet emitted past the last flushed chunk.
    if start < lines.len() && last_emitted_end != Some(lines.len() - 1) {
        emit(&mut chunks, &mut last_emitted_end, &lines, start, lines.len() - 1);
    }

    chunks
}

fn token_count(line: &str) -> usize {
    line.split_whitespace().count()
}

fn emit(
    chunks: &mut Vec<Chunk>,
    last_emitted_end: &mut Option<usize>,
    lines: &[&str],
    start: usize,
    end: usize,
) {
    let text = lines[start..=end].join("\n");
    if text.trim().is_empty() {
        return;
    }
    push_chunk(chunks, start + 1, end + 1, text);
    *last_emitted_end = Some(end);
}

fn push_chunk(chunks: &mut Vec<Chunk>, start_line: usize, end_line: usize, text: String) {
    if text.trim().is_empty() {
        return;
    }
    let hash = sha256_hex(&text);
    chunks.push(Chunk { start_line, end_line, text, hash });
}

/// Code-point windows of `cap` chars with `overlap` chars of carry-over.
fn char_windows(line: &str, cap: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let cap = cap.max(1);
    let step = cap.saturating_sub(overlap).max(1);
    let mut windows = Vec::new();
    let mut pos = 0usize;
    while pos < chars.len() {
        let end = (pos + cap).min(chars.len());
        windows.push(chars[pos..end].iter().collect());
        if end == chars.len() {
            break;
        }
        pos += step;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(tokens: usize, overlap: usize) -> ChunkConfig {
        ChunkConfig { tokens, overlap }
    }

    #[test]
    fn empty_and_whitespace_input_yield_nothing() {
        assert!(chunk("", &cfg(100, 10)).is_empty());
        assert!(chunk("   \n\t\n  ", &cfg(100, 10)).is_empty());
    }

    #[test]
    fn small_input_is_one_chunk() {
        let chunks = chunk("# Title\n\nhello world", &cfg(100, 10));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[0].text, "# Title\n\nhello world");
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = (0..50).map(|i| format!("line number {i} with several words"))
            .collect::<Vec<_>>()
            .join("\n");
        let a = chunk(&text, &cfg(30, 8));
        let b = chunk(&text, &cfg(30, 8));
        assert_eq!(a, b);
        assert!(a.len() > 1);
    }

    #[test]
    fn every_nonempty_line_appears_in_some_chunk() {
        let text = (0..40).map(|i| format!("word{i} a b c d")).collect::<Vec<_>>().join("\n");
        let chunks = chunk(&text, &cfg(20, 5));
        for (i, line) in text.split('\n').enumerate() {
            let line_no = i + 1;
            let covered = chunks.iter().any(|c| c.start_line <= line_no && line_no <= c.end_line);
            assert!(covered, "line {line_no} ({line}) not covered");
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = (0..60).map(|i| format!("token{i} alpha beta")).collect::<Vec<_>>().join("\n");
        let chunks = chunk(&text, &cfg(15, 6));
        assert!(chunks.len() >= 2);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].start_line <= pair[0].end_line,
                "chunks {}..{} and {}..{} do not overlap",
                pair[0].start_line,
                pair[0].end_line,
                pair[1].start_line,
                pair[1].end_line
            );
        }
    }

    #[test]
    fn hash_depends_only_on_text() {
        let a = chunk("same words here", &cfg(100, 10));
        let b = chunk("same words here", &cfg(50, 5));
        assert_eq!(a[0].hash, b[0].hash);
        assert_eq!(a[0].hash.len(), 64);
    }

    #[test]
    fn sha256_is_the_known_vector() {
        // printf 'hello' | sha256sum
        assert_eq!(
            sha256_hex("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn crlf_is_preserved_inside_chunk_text() {
        let chunks = chunk("alpha\r\nbeta", &cfg(100, 10));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "alpha\r\nbeta");
        assert_ne!(chunks[0].hash, sha256_hex("alpha\nbeta"));
    }

    #[test]
    fn single_long_line_splits_into_line_one_chunks() {
        let long = "x".repeat(10_000);
        let chunks = chunk(&long, &cfg(50, 10));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(c.start_line, 1);
            assert_eq!(c.end_line, 1);
        }
    }

    #[test]
    fn unicode_long_line_splits_on_code_points() {
        let long = "🦀é漢".repeat(2_000);
        let chunks = chunk(&long, &cfg(40, 5));
        assert!(chunks.len() > 1);
        let mut merged = String::new();
        for c in &chunks {
            merged.push_str(&c.text);
        }
        // Windows overlap, so merged is a superset; every window must itself
        // be valid UTF-8 slices of the original alphabet.
        for c in &chunks {
            assert!(c.text.chars().all(|ch| "🦀é漢".contains(ch)));
        }
        assert!(merged.chars().count() >= long.chars().count());
    }

    #[test]
    fn oversized_line_between_normal_lines_keeps_its_line_number() {
        let text = format!("first\n{}\nlast", "y".repeat(5_000));
        let chunks = chunk(&text, &cfg(50, 10));
        assert!(chunks.iter().any(|c| c.text == "first"));
        assert!(chunks.iter().any(|c| c.start_line == 2 && c.end_line == 2));
        assert!(chunks.iter().any(|c| c.text.contains("last") && c.end_line == 3));
    }
}
