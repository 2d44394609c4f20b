//! Persistent embedding cache
//!
//! Keyed by `(provider, model, provider_key, chunk_hash)`. Entries are
//! written after successful online embeds and survive full reindexes by being
//! seeded into the replacement store. Eviction is LRU on `updated_at` once
//! the row count exceeds the configured cap.

use std::collections::HashMap;

use sqlx::Row;

use super::helpers::{bytes_to_embedding, embedding_to_bytes, CachedEmbeddings, StoreError};
use super::Store;

/// Cache lookups are chunked to bound prepared-statement parameter count.
const CACHE_LOOKUP_GROUP: usize = 400;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Store {
    /// Fetch cached embeddings for the given chunk hashes. Hashes are looked
    /// up in groups of 400 to stay under SQLite's bind-parameter limit.
    pub async fn cached_embeddings(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        hashes: &[String],
    ) -> Result<CachedEmbeddings, StoreError> {
        let mut found = HashMap::new();
        for group in hashes.chunks(CACHE_LOOKUP_GROUP) {
            let placeholders = (0..group.len())
                .map(|i| format!("?{}", 4 + i))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT hash, embedding FROM embedding_cache
                 WHERE provider = ?1 AND model = ?2 AND provider_key = ?3 AND hash IN ({placeholders})",
            );
            let mut q = sqlx::query(&sql).bind(provider).bind(model).bind(provider_key);
            for hash in group {
                q = q.bind(hash);
            }
            for row in q.fetch_all(&self.pool).await? {
                let bytes: Vec<u8> = row.get("embedding");
                if let Some(embedding) = bytes_to_embedding(&bytes) {
                    found.insert(row.get::<String, _>("hash"), embedding);
                }
            }
        }
        Ok(found)
    }

    /// Upsert freshly computed embeddings, all under one transaction.
    pub async fn put_cached_embeddings(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        entries: &[(String, Vec<f32>)],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        for (hash, embedding) in entries {
            sqlx::query(
                "INSERT INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
                   embedding = excluded.embedding, dims = excluded.dims, updated_at = excluded.updated_at",
            )
            .bind(provider)
            .bind(model)
            .bind(provider_key)
            .bind(hash)
            .bind(embedding_to_bytes(embedding))
            .bind(embedding.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn cache_count(&self) -> Result<u64, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Evict least-recently-written entries beyond `max_entries`. Returns the
    /// number of rows removed.
    pub async fn prune_embedding_cache(&self, max_entries: u64) -> Result<u64, StoreError> {
        let count = self.cache_count().await?;
        if count <= max_entries {
            return Ok(0);
        }
        let excess = (count - max_entries) as i64;
        let result = sqlx::query(
            "DELETE FROM embedding_cache WHERE rowid IN
             (SELECT rowid FROM embedding_cache ORDER BY updated_at ASC, rowid ASC LIMIT ?1)",
        )
        .bind(excess)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Copy every cache row into another store (reindex seeding), preserving
    /// timestamps so LRU ordering carries over. One transaction on the
    /// destination.
    pub async fn copy_cache_into(&self, dest: &Store) -> Result<u64, StoreError> {
        let rows = sqlx::query(
            "SELECT provider, model, provider_key, hash, embedding, dims, updated_at
             FROM embedding_cache",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut copied = 0u64;
        let mut tx = dest.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
                   embedding = excluded.embedding, dims = excluded.dims, updated_at = excluded.updated_at",
            )
            .bind(row.get::<String, _>("provider"))
            .bind(row.get::<String, _>("model"))
            .bind(row.get::<String, _>("provider_key"))
            .bind(row.get::<String, _>("hash"))
            .bind(row.get::<Vec<u8>, _>("embedding"))
            .bind(row.get::<i64, _>("dims"))
            .bind(row.get::<i64, _>("updated_at"))
            .execute(&mut *tx)
            .await?;
            copied += 1;
        }
        tx.commit().await?;
        Ok(copied)
    }

    /// Test-only hook: backdate an entry's `updated_at` to exercise LRU order.
    #[doc(hidden)]
    pub async fn set_cache_entry_age(
        &self,
        hash: &str,
        updated_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE embedding_cache SET updated_at = ?1 WHERE hash = ?2")
            .bind(updated_at)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
