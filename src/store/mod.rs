//! SQLite storage for the memory index (sqlx async)
//!
//! One database per agent+workspace, holding tracked files, chunks, the
//! persistent embedding cache, and the index identity in `meta`. The keyword
//! side is an FTS5 virtual table; the vector side is a packed-f32 rows table
//! scanned with SIMD cosine similarity. Both are optional at runtime: if
//! FTS5 is unavailable or vector setup fails, the owning manager marks the
//! feature degraded and search falls back to whatever is left.
//!
//! ## Module structure
//!
//! - `helpers` - row types, embedding packing, similarity math
//! - `chunks`  - file/chunk CRUD and the keyword/vector scans
//! - `cache`   - embedding-cache lookup, upsert, seeding, LRU pruning

mod cache;
mod chunks;
pub(crate) mod helpers;

use std::path::{Path, PathBuf};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub use helpers::{
    bytes_to_embedding, chunk_id, cosine_similarity, embedding_to_bytes, is_all_zero,
    CachedEmbeddings, ChunkRecord, FileRow, IndexMeta, IndexStats, KeywordHit, StoreError,
    VectorHit,
};

/// Schema version stored in `meta`; bumped on incompatible layout changes.
pub const SCHEMA_VERSION: i32 = 1;

const META_SCHEMA_KEY: &str = "schema_version";
const META_INDEX_KEY: &str = "index";

/// Async SQLite store. All methods take `&self`; SQLite is single-writer, so
/// writes serialize on the WAL behind the pool's busy timeout.
pub struct Store {
    pub(crate) pool: SqlitePool,
    path: PathBuf,
}

/// Sidecar path for SQLite's `-wal` / `-shm` files (plain suffix append, the
/// way SQLite itself derives them).
pub fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{suffix}", path.display()))
}

impl Store {
    /// Open (creating if needed) the database at `path` and install the base
    /// schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Forward slashes for URL compatibility (Windows backslashes don't work).
        let path_str = path.to_string_lossy().replace('\\', "/");
        let db_url = format!("sqlite://{path_str}?mode=rwc");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // WAL mode: concurrent reads, single writer.
                    sqlx::query("PRAGMA journal_mode = WAL")
                        .execute(&mut *conn)
                        .await?;
                    // 5000ms busy timeout before SQLITE_BUSY.
                    sqlx::query("PRAGMA busy_timeout = 5000")
                        .execute(&mut *conn)
                        .await?;
                    // NORMAL sync: fsync on WAL checkpoint only (safe with WAL).
                    sqlx::query("PRAGMA synchronous = NORMAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA temp_store = MEMORY")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&db_url)
            .await?;

        let store = Self {
            pool,
            path: path.to_path_buf(),
        };
        store.init_schema().await?;

        // Memory content is personal; keep the files user-only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let restrictive = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(path, restrictive.clone());
            let _ = std::fs::set_permissions(sidecar_path(path, "-wal"), restrictive.clone());
            let _ = std::fs::set_permissions(sidecar_path(path, "-shm"), restrictive);
        }

        tracing::debug!(path = %path.display(), "Memory index database connected");
        Ok(store)
    }

    /// The database file path this store was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the connection pool, checkpointing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let schema = include_str!("../schema.sql");
        for statement in schema.split(';') {
            let stmt: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        let stored: Option<(String,)> =
            sqlx::query_as("SELECT value FROM meta WHERE key = ?1")
                .bind(META_SCHEMA_KEY)
                .fetch_optional(&self.pool)
                .await?;
        match stored.and_then(|(v,)| v.parse::<i32>().ok()) {
            Some(version) if version > SCHEMA_VERSION => {
                return Err(StoreError::Meta(format!(
                    "index schema v{version} is newer than supported v{SCHEMA_VERSION}"
                )));
            }
            Some(_) => {}
            None => {
                sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)")
                    .bind(META_SCHEMA_KEY)
                    .bind(SCHEMA_VERSION.to_string())
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Create the FTS5 virtual table. Errors are surfaced so the manager can
    /// mark keyword search unavailable instead of failing the whole index.
    pub async fn init_fts(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                id UNINDEXED, text, path, source UNINDEXED, model UNINDEXED,
                start_line UNINDEXED, end_line UNINDEXED
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create the vector rows table. Called lazily once the first non-empty
    /// embedding's dimensionality is known.
    pub async fn init_vector_table(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks_vec (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether the vector rows table exists in this store.
    pub async fn has_vector_table(&self) -> Result<bool, StoreError> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'chunks_vec'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n > 0)
    }

    /// The index identity written by the last successful full reindex.
    pub async fn read_meta(&self) -> Result<Option<IndexMeta>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = ?1")
            .bind(META_INDEX_KEY)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some((json,)) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Meta(format!("invalid index meta: {e}"))),
        }
    }

    pub async fn write_meta(&self, meta: &IndexMeta) -> Result<(), StoreError> {
        let json = serde_json::to_string(meta)
            .map_err(|e| StoreError::Meta(format!("failed to encode index meta: {e}")))?;
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)")
            .bind(META_INDEX_KEY)
            .bind(json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Aggregate statistics for status surfaces.
    pub async fn stats(&self) -> Result<IndexStats, StoreError> {
        let (files,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let (chunks,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let (cache_entries,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        let db_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(IndexStats {
            files: files as u64,
            chunks: chunks as u64,
            cache_entries: cache_entries as u64,
            db_size_bytes,
        })
    }
}
