//! Store helper types and embedding conversion functions

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MemorySource;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt index metadata: {0}")]
    Meta(String),
}

/// Index identity, rewritten after each successful full reindex. A mismatch
/// between this record and the live configuration forces a full rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub model: String,
    pub provider: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_dims: Option<usize>,
}

/// One tracked source file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRow {
    pub path: String,
    pub source: MemorySource,
    pub hash: String,
    /// Modification time in milliseconds since the epoch.
    pub mtime: i64,
    pub size: i64,
}

/// A chunk ready for insertion, with its embedding.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub path: String,
    pub source: MemorySource,
    pub start_line: u32,
    pub end_line: u32,
    pub hash: String,
    pub model: String,
    pub text: String,
    /// Empty when the provider returned nothing for this chunk; such chunks
    /// get no vector row.
    pub embedding: Vec<f32>,
}

/// A keyword (FTS) hit, rank 0 = best BM25 match.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub id: String,
    pub path: String,
    pub source: MemorySource,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    pub rank: usize,
}

/// A vector-scan hit with raw cosine similarity in [-1, 1].
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub path: String,
    pub source: MemorySource,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    pub similarity: f32,
}

/// Aggregate index statistics.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub files: u64,
    pub chunks: u64,
    pub cache_entries: u64,
    pub db_size_bytes: u64,
}

/// One embedding-cache entry keyed by chunk content hash.
pub type CachedEmbeddings = HashMap<String, Vec<f32>>;

/// Deterministic chunk id: pure function of the chunk's identifying tuple,
/// so re-deriving from identical file content reproduces the same id.
pub fn chunk_id(
    source: MemorySource,
    path: &str,
    start_line: u32,
    end_line: u32,
    chunk_hash: &str,
    model: &str,
) -> String {
    let key = format!("{source}:{path}:{start_line}:{end_line}:{chunk_hash}:{model}");
    blake3::hash(key.as_bytes()).to_hex()[..32].to_string()
}

/// Pack an f32 vector into little-endian bytes for vector-row storage.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Unpack a packed f32 vector. Returns `None` for truncated blobs.
pub fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        tracing::warn!(
            len = bytes.len(),
            "Embedding blob length is not a multiple of 4 (possible corruption)"
        );
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunks_exact gives 4 bytes")))
            .collect(),
    )
}

/// Cosine similarity over arbitrary (not necessarily normalized) vectors.
/// Uses SIMD dot products when available, with a scalar fallback.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    use simsimd::SpatialSimilarity;
    let dot = f32::dot(a, b).unwrap_or_else(|| scalar_dot(a, b));
    let norm_a = f32::dot(a, a).unwrap_or_else(|| scalar_dot(a, a));
    let norm_b = f32::dot(b, b).unwrap_or_else(|| scalar_dot(b, b));
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    let score = (dot / denom) as f32;
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

fn scalar_dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x as f64) * (y as f64))
        .sum::<f64>()
}

/// Whether a query embedding carries any signal at all.
pub fn is_all_zero(embedding: &[f32]) -> bool {
    embedding.iter().all(|&v| v == 0.0)
}
