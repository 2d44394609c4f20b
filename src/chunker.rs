//! Markdown chunker
//!
//! Splits UTF-8 Markdown into overlapping line-aligned chunks of roughly
//! `chunk_tokens` estimated tokens. The estimator is UTF-8 bytes / 4, the
//! same unit the embedding batcher packs with, so the two stay consistent.
//! The split is deterministic: the same input and settings always reproduce
//! the same chunks, which keeps chunk ids stable across syncs.

/// One indexable chunk with line-range provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// 1-based, inclusive.
    pub start_line: u32,
    /// 1-based, inclusive.
    pub end_line: u32,
    /// Content hash of `text`.
    pub hash: String,
}

/// Translates rendered-transcript line numbers back to source lines.
///
/// Session transcripts are chunked from a plain-text rendering; entry `i`
/// holds the 1-based source line that produced rendered line `i + 1`.
#[derive(Debug, Clone, Default)]
pub struct LineMap(Vec<u32>);

impl LineMap {
    pub fn new(lines: Vec<u32>) -> Self {
        LineMap(lines)
    }

    /// Source line for a 1-based rendered line. Out-of-range lines clamp to
    /// the nearest mapped line.
    pub fn source_line(&self, rendered_line: u32) -> u32 {
        if self.0.is_empty() {
            return rendered_line;
        }
        let idx = (rendered_line.max(1) as usize - 1).min(self.0.len() - 1);
        self.0[idx]
    }

    pub fn push(&mut self, source_line: u32) {
        self.0.push(source_line);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Estimated token count: UTF-8 bytes / 4, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Blake3 content hash, hex.
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Split Markdown text into overlapping chunks.
///
/// Lines are never split (except by [`clip_chunks`]); a chunk closes once it
/// reaches `chunk_tokens`, and the next chunk re-opens far enough back to
/// carry roughly `overlap` tokens of trailing context. Whitespace-only
/// chunks are dropped.
pub fn chunk_markdown(text: &str, chunk_tokens: usize, overlap: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = text.split('\n').collect();
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chunk_tokens = chunk_tokens.max(1);
    // Overlap must leave room to make progress.
    let overlap = overlap.min(chunk_tokens.saturating_sub(1));

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let mut end = start;
        let mut tokens = 0usize;
        while end < lines.len() {
            let line_tokens = estimate_tokens(lines[end]);
            if end > start && tokens + line_tokens > chunk_tokens {
                break;
            }
            tokens += line_tokens;
            end += 1;
        }

        let body = lines[start..end].join("\n");
        if !body.trim().is_empty() {
            chunks.push(Chunk {
                hash: content_hash(&body),
                text: body,
                start_line: start as u32 + 1,
                end_line: end as u32,
            });
        }

        if end >= lines.len() {
            break;
        }

        // Walk back from the break point until the carried tail reaches the
        // overlap budget, but always advance past the previous start.
        let mut next = end;
        let mut carried = 0usize;
        while next > start + 1 {
            let line_tokens = estimate_tokens(lines[next - 1]);
            if carried + line_tokens > overlap {
                break;
            }
            carried += line_tokens;
            next -= 1;
        }
        start = next;
    }

    chunks
}

/// Re-map chunk line ranges through a rendered-transcript line map.
pub fn apply_line_map(chunks: &mut [Chunk], map: &LineMap) {
    if map.is_empty() {
        return;
    }
    for chunk in chunks {
        chunk.start_line = map.source_line(chunk.start_line);
        chunk.end_line = map.source_line(chunk.end_line);
    }
}

/// Clip chunks that exceed the provider's per-input token limit.
///
/// Truncation lands on a char boundary; the hash is recomputed so cache keys
/// and chunk ids always describe the text that was actually embedded.
pub fn clip_chunks(chunks: &mut [Chunk], max_input_tokens: usize) {
    if max_input_tokens == 0 {
        return;
    }
    let max_bytes = max_input_tokens.saturating_mul(4);
    for chunk in chunks {
        if chunk.text.len() <= max_bytes {
            continue;
        }
        let mut cut = max_bytes;
        while cut > 0 && !chunk.text.is_char_boundary(cut) {
            cut -= 1;
        }
        chunk.text.truncate(cut);
        chunk.hash = content_hash(&chunk.text);
        tracing::debug!(
            start_line = chunk.start_line,
            end_line = chunk.end_line,
            max_input_tokens,
            "Clipped oversized chunk to provider input limit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_no_chunks() {
        assert!(chunk_markdown("", 128, 16).is_empty());
        assert!(chunk_markdown("   \n\n  \t\n", 128, 16).is_empty());
    }

    #[test]
    fn test_single_small_file_single_chunk() {
        let chunks = chunk_markdown("# Title\n\nalpha beta\n", 128, 16);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 4);
        assert!(chunks[0].text.contains("alpha beta"));
        assert_eq!(chunks[0].hash, content_hash(&chunks[0].text));
    }

    #[test]
    fn test_deterministic_split() {
        let text: String = (0..200)
            .map(|i| format!("line {i} with some additional words\n"))
            .collect();
        let a = chunk_markdown(&text, 64, 16);
        let b = chunk_markdown(&text, 64, 16);
        assert!(a.len() > 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunks_overlap_and_cover() {
        let text: String = (0..100).map(|i| format!("row number {i}\n")).collect();
        let chunks = chunk_markdown(&text, 32, 8);
        assert!(chunks.len() > 1);

        // Coverage: first chunk starts at line 1, last chunk reaches the end.
        assert_eq!(chunks[0].start_line, 1);
        assert!(chunks.last().unwrap().text.contains("row number 99"));

        // Consecutive chunks overlap (or at worst touch) on line ranges.
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line <= pair[0].end_line + 1);
            assert!(pair[1].start_line > pair[0].start_line, "must make progress");
        }
    }

    #[test]
    fn test_long_single_line_is_its_own_chunk() {
        let long = "x".repeat(4096);
        let text = format!("short\n{long}\nshort again\n");
        let chunks = chunk_markdown(&text, 64, 8);
        assert!(chunks.iter().any(|c| c.text.contains(&long)));
    }

    #[test]
    fn test_clip_oversized_chunk() {
        let mut chunks = vec![Chunk {
            text: "héllo ".repeat(1000),
            start_line: 1,
            end_line: 1,
            hash: String::new(),
        }];
        chunks[0].hash = content_hash(&chunks[0].text);
        let before_hash = chunks[0].hash.clone();

        clip_chunks(&mut chunks, 100);
        assert!(chunks[0].text.len() <= 400);
        assert!(chunks[0].text.is_char_boundary(chunks[0].text.len()));
        assert_ne!(chunks[0].hash, before_hash);
        assert_eq!(chunks[0].hash, content_hash(&chunks[0].text));
    }

    #[test]
    fn test_clip_leaves_small_chunks_alone() {
        let mut chunks = chunk_markdown("a small note\n", 128, 16);
        let before = chunks.clone();
        clip_chunks(&mut chunks, 8192);
        assert_eq!(chunks, before);
    }

    #[test]
    fn test_line_map_translation() {
        let map = LineMap::new(vec![3, 3, 7, 9]);
        assert_eq!(map.source_line(1), 3);
        assert_eq!(map.source_line(2), 3);
        assert_eq!(map.source_line(3), 7);
        assert_eq!(map.source_line(4), 9);
        // Clamped out-of-range access.
        assert_eq!(map.source_line(40), 9);

        let mut chunks = vec![Chunk {
            text: "hello".into(),
            start_line: 2,
            end_line: 4,
            hash: content_hash("hello"),
        }];
        apply_line_map(&mut chunks, &map);
        assert_eq!(chunks[0].start_line, 3);
        assert_eq!(chunks[0].end_line, 9);
    }

    #[test]
    fn test_same_config_reproduces_hashes() {
        let text = "alpha\nbeta\ngamma\ndelta\n";
        let a = chunk_markdown(text, 4, 1);
        let b = chunk_markdown(text, 4, 1);
        let ah: Vec<_> = a.iter().map(|c| c.hash.clone()).collect();
        let bh: Vec<_> = b.iter().map(|c| c.hash.clone()).collect();
        assert_eq!(ah, bh);
    }
}
