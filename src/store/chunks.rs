//! File and chunk CRUD, keyword scan, vector scan

use sqlx::Row;

use super::helpers::{
    bytes_to_embedding, cosine_similarity, embedding_to_bytes, ChunkRecord, FileRow, KeywordHit,
    StoreError, VectorHit,
};
use super::Store;
use crate::config::MemorySource;

/// Turn free text into an FTS5 MATCH expression: quoted terms OR-ed together.
/// Returns `None` when nothing searchable remains.
pub fn sanitize_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn source_placeholders(sources: &[MemorySource], first_index: usize) -> String {
    (0..sources.len())
        .map(|i| format!("?{}", first_index + i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_source(raw: &str) -> MemorySource {
    raw.parse().unwrap_or_else(|_| {
        tracing::warn!(stored_value = %raw, "Unknown source in store row, defaulting to memory");
        MemorySource::Memory
    })
}

impl Store {
    /// Look up one tracked file.
    pub async fn get_file(
        &self,
        source: MemorySource,
        path: &str,
    ) -> Result<Option<FileRow>, StoreError> {
        let row = sqlx::query(
            "SELECT path, source, hash, mtime, size FROM files WHERE source = ?1 AND path = ?2",
        )
        .bind(source.to_string())
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| FileRow {
            path: r.get("path"),
            source: parse_source(&r.get::<String, _>("source")),
            hash: r.get("hash"),
            mtime: r.get("mtime"),
            size: r.get("size"),
        }))
    }

    /// All tracked files for a source.
    pub async fn list_files(&self, source: MemorySource) -> Result<Vec<FileRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT path, source, hash, mtime, size FROM files WHERE source = ?1 ORDER BY path",
        )
        .bind(source.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| FileRow {
                path: r.get("path"),
                source: parse_source(&r.get::<String, _>("source")),
                hash: r.get("hash"),
                mtime: r.get("mtime"),
                size: r.get("size"),
            })
            .collect())
    }

    /// Replace a file's chunks and upsert its `files` row, atomically.
    ///
    /// Existing chunk, vector, and FTS rows for `(path, source)` are deleted
    /// first, then the new rows go in. Vector rows are only written when
    /// `vector_enabled` and the chunk has a non-empty embedding; FTS rows only
    /// when `fts_enabled`.
    pub async fn replace_file_chunks(
        &self,
        file: &FileRow,
        chunks: &[ChunkRecord],
        fts_enabled: bool,
        vector_enabled: bool,
    ) -> Result<usize, StoreError> {
        let source = file.source.to_string();
        let mut tx = self.pool.begin().await?;

        if vector_enabled {
            sqlx::query(
                "DELETE FROM chunks_vec WHERE id IN
                 (SELECT id FROM chunks WHERE path = ?1 AND source = ?2)",
            )
            .bind(&file.path)
            .bind(&source)
            .execute(&mut *tx)
            .await?;
        }
        if fts_enabled {
            sqlx::query("DELETE FROM chunks_fts WHERE path = ?1 AND source = ?2")
                .bind(&file.path)
                .bind(&source)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE path = ?1 AND source = ?2")
            .bind(&file.path)
            .bind(&source)
            .execute(&mut *tx)
            .await?;

        let now = chrono::Utc::now().to_rfc3339();
        for chunk in chunks {
            let embedding_json = serde_json::to_string(&chunk.embedding)
                .map_err(|e| StoreError::Meta(format!("failed to encode embedding: {e}")))?;
            sqlx::query(
                "INSERT OR REPLACE INTO chunks
                 (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(&chunk.id)
            .bind(&chunk.path)
            .bind(chunk.source.to_string())
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .bind(&chunk.hash)
            .bind(&chunk.model)
            .bind(&chunk.text)
            .bind(embedding_json)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            if vector_enabled && !chunk.embedding.is_empty() {
                sqlx::query("INSERT OR REPLACE INTO chunks_vec (id, embedding) VALUES (?1, ?2)")
                    .bind(&chunk.id)
                    .bind(embedding_to_bytes(&chunk.embedding))
                    .execute(&mut *tx)
                    .await?;
            }

            if fts_enabled {
                sqlx::query(
                    "INSERT INTO chunks_fts (id, text, path, source, model, start_line, end_line)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(&chunk.id)
                .bind(&chunk.text)
                .bind(&chunk.path)
                .bind(chunk.source.to_string())
                .bind(&chunk.model)
                .bind(chunk.start_line as i64)
                .bind(chunk.end_line as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            "INSERT INTO files (path, source, hash, mtime, size) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path, source) DO UPDATE SET
               hash = excluded.hash, mtime = excluded.mtime, size = excluded.size",
        )
        .bind(&file.path)
        .bind(&source)
        .bind(&file.hash)
        .bind(file.mtime)
        .bind(file.size)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(chunks.len())
    }

    /// Remove a file and all of its rows across every table.
    pub async fn delete_file(
        &self,
        source: MemorySource,
        path: &str,
        fts_enabled: bool,
        vector_enabled: bool,
    ) -> Result<(), StoreError> {
        let source = source.to_string();
        let mut tx = self.pool.begin().await?;
        if vector_enabled {
            sqlx::query(
                "DELETE FROM chunks_vec WHERE id IN
                 (SELECT id FROM chunks WHERE path = ?1 AND source = ?2)",
            )
            .bind(path)
            .bind(&source)
            .execute(&mut *tx)
            .await?;
        }
        if fts_enabled {
            sqlx::query("DELETE FROM chunks_fts WHERE path = ?1 AND source = ?2")
                .bind(path)
                .bind(&source)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE path = ?1 AND source = ?2")
            .bind(path)
            .bind(&source)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE path = ?1 AND source = ?2")
            .bind(path)
            .bind(&source)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stored chunks for one file, embeddings decoded from the JSON backup.
    pub async fn chunks_for_file(
        &self,
        source: MemorySource,
        path: &str,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, path, source, start_line, end_line, hash, model, text, embedding
             FROM chunks WHERE source = ?1 AND path = ?2 ORDER BY start_line",
        )
        .bind(source.to_string())
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChunkRecord {
                id: r.get("id"),
                path: r.get("path"),
                source: parse_source(&r.get::<String, _>("source")),
                start_line: r.get::<i64, _>("start_line") as u32,
                end_line: r.get::<i64, _>("end_line") as u32,
                hash: r.get("hash"),
                model: r.get("model"),
                text: r.get("text"),
                embedding: r
                    .get::<Option<String>, _>("embedding")
                    .and_then(|json| serde_json::from_str(&json).ok())
                    .unwrap_or_default(),
            })
            .collect())
    }

    /// Keyword scan: BM25-ordered FTS5 matches, filtered to the given sources
    /// and the active model. Rank 0 is the best match.
    pub async fn keyword_search(
        &self,
        query: &str,
        sources: &[MemorySource],
        model: &str,
        limit: usize,
    ) -> Result<Vec<KeywordHit>, StoreError> {
        let Some(match_expr) = sanitize_fts_query(query) else {
            return Ok(Vec::new());
        };
        if sources.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT id, path, source, start_line, end_line, text
             FROM chunks_fts
             WHERE chunks_fts MATCH ?1 AND model = ?2 AND source IN ({})
             ORDER BY bm25(chunks_fts) LIMIT ?{}",
            source_placeholders(sources, 3),
            3 + sources.len(),
        );

        let mut q = sqlx::query(&sql).bind(match_expr).bind(model);
        for source in sources {
            q = q.bind(source.to_string());
        }
        let rows = q.bind(limit as i64).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(rank, r)| KeywordHit {
                id: r.get("id"),
                path: r.get("path"),
                source: parse_source(&r.get::<String, _>("source")),
                start_line: r.get::<i64, _>("start_line") as u32,
                end_line: r.get::<i64, _>("end_line") as u32,
                text: r.get("text"),
                rank,
            })
            .collect())
    }

    /// Vector scan: cosine similarity between the query and every stored
    /// vector in the given sources, best first.
    pub async fn vector_search(
        &self,
        query: &[f32],
        sources: &[MemorySource],
        limit: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        if sources.is_empty() || limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT cv.id AS id, cv.embedding AS embedding, c.path AS path, c.source AS source,
                    c.start_line AS start_line, c.end_line AS end_line, c.text AS text
             FROM chunks_vec cv JOIN chunks c ON c.id = cv.id
             WHERE c.source IN ({})",
            source_placeholders(sources, 1),
        );
        let mut q = sqlx::query(&sql);
        for source in sources {
            q = q.bind(source.to_string());
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut scored: Vec<VectorHit> = rows
            .into_iter()
            .filter_map(|r| {
                let bytes: Vec<u8> = r.get("embedding");
                let embedding = bytes_to_embedding(&bytes)?;
                if embedding.len() != query.len() {
                    tracing::warn!(
                        id = %r.get::<String, _>("id"),
                        stored_dims = embedding.len(),
                        query_dims = query.len(),
                        "Skipping vector row with mismatched dimensionality"
                    );
                    return None;
                }
                Some(VectorHit {
                    id: r.get("id"),
                    path: r.get("path"),
                    source: parse_source(&r.get::<String, _>("source")),
                    start_line: r.get::<i64, _>("start_line") as u32,
                    end_line: r.get::<i64, _>("end_line") as u32,
                    text: r.get("text"),
                    similarity: cosine_similarity(query, &embedding),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    pub async fn count_chunks(&self) -> Result<u64, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    pub async fn count_vector_rows(&self) -> Result<u64, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks_vec")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Distinct model strings present in `chunks` (reindex invariant checks).
    pub async fn chunk_models(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT model FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(m,)| m).collect())
    }
}
