//! Embedding manager: caching, batching, retries, timeouts, fallback
//!
//! Wraps the active [`EmbeddingProvider`] and owns everything between "here
//! are chunks" and "here are vectors": the persistent cache lookup, remote
//! batch jobs with their poll loop, online sub-batching under a byte-estimate
//! cap, exponential backoff on transient failures, per-call timeouts, and the
//! once-per-lifetime switch to the configured fallback provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::RngExt;
use tokio::sync::Mutex;

use crate::chunker::{estimate_tokens, Chunk};
use crate::config::{MemorySource, ProviderSettings};
use crate::manager::{MemoryContext, MemoryError};
use crate::provider::{
    provider_key, BatchPoll, BatchRequest, EmbedError, EmbeddingProvider, ProviderConfig,
    ProviderFactory, ProviderId, RemoteBatchAdapter,
};
use crate::store::{FileRow, Store};

/// Retry policy for online embedding calls.
const EMBED_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 8_000;
const BACKOFF_JITTER: f64 = 0.2;

/// Cumulative estimated-token cap for one online sub-batch.
const EMBEDDING_BATCH_MAX_TOKENS: usize = 100_000;

/// Consecutive remote-batch failures before batch mode is disabled for this
/// manager's lifetime.
const BATCH_FAILURE_LIMIT: u32 = 2;

const BATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-call budgets. Local inference gets a wider window than remote APIs.
const QUERY_TIMEOUT_REMOTE: Duration = Duration::from_secs(60);
const QUERY_TIMEOUT_LOCAL: Duration = Duration::from_secs(300);

/// Indexing concurrency when remote batch mode is off.
const DEFAULT_INDEX_CONCURRENCY: usize = 4;

/// Snapshot of the manager's state for status surfaces.
#[derive(Debug, Clone)]
pub struct EmbeddingStatus {
    pub provider: ProviderId,
    pub model: String,
    pub batch_enabled: bool,
    pub fallback_activated: bool,
}

pub struct EmbeddingManager {
    ctx: Arc<MemoryContext>,
    settings: ProviderSettings,
    factory: ProviderFactory,
    provider: RwLock<Arc<dyn EmbeddingProvider>>,
    config: RwLock<ProviderConfig>,
    key: RwLock<String>,
    /// Live toggle for remote batch mode; starts from settings, may be
    /// disabled for the rest of this manager's lifetime.
    batch_enabled: AtomicBool,
    /// Failure counter guarded by a lock so the enable->disable transition at
    /// the threshold happens exactly once.
    batch_failures: Mutex<u32>,
    fallback_activated: AtomicBool,
}

impl EmbeddingManager {
    pub(crate) fn new(
        ctx: Arc<MemoryContext>,
        settings: ProviderSettings,
        factory: ProviderFactory,
    ) -> Result<Self, EmbedError> {
        let config = settings.provider_config();
        let provider = (factory)(&config)?;
        let key = provider_key(&config);
        let batch_enabled = settings.remote_batch.enabled;
        Ok(EmbeddingManager {
            ctx,
            settings,
            factory,
            provider: RwLock::new(provider),
            config: RwLock::new(config),
            key: RwLock::new(key),
            batch_enabled: AtomicBool::new(batch_enabled),
            batch_failures: Mutex::new(0),
            fallback_activated: AtomicBool::new(false),
        })
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.provider.read().expect("provider lock poisoned").clone()
    }

    /// Stable identity hash of the current provider configuration.
    pub fn provider_key(&self) -> String {
        self.key.read().expect("provider key lock poisoned").clone()
    }

    pub fn model(&self) -> String {
        self.provider().model().to_string()
    }

    /// How many files may index concurrently: the remote batch concurrency
    /// while batch mode is active, a fixed pool width otherwise.
    pub fn index_concurrency(&self) -> usize {
        if self.batch_active() {
            self.settings.remote_batch.concurrency.max(1)
        } else {
            DEFAULT_INDEX_CONCURRENCY
        }
    }

    pub fn status(&self) -> EmbeddingStatus {
        let provider = self.provider();
        EmbeddingStatus {
            provider: provider.id(),
            model: provider.model().to_string(),
            batch_enabled: self.batch_active(),
            fallback_activated: self.fallback_activated.load(Ordering::SeqCst),
        }
    }

    fn batch_active(&self) -> bool {
        self.settings.remote_batch.enabled && self.batch_enabled.load(Ordering::SeqCst)
    }

    fn query_budget(&self, id: ProviderId) -> Duration {
        if id.is_remote() {
            QUERY_TIMEOUT_REMOTE
        } else {
            QUERY_TIMEOUT_LOCAL
        }
    }

    /// Embed a single query under the per-call timeout.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let provider = self.provider();
        let budget = self.query_budget(provider.id());
        match tokio::time::timeout(budget, provider.embed_query(text)).await {
            Ok(result) => result,
            Err(_) => Err(EmbedError::Timeout(budget)),
        }
    }

    /// Embed a one-word probe to check whether the provider is reachable.
    pub async fn probe_availability(&self) -> Result<(), EmbedError> {
        self.embed_query("ping").await.map(|_| ())
    }

    /// Embed chunks, aligned by index with the input slice.
    ///
    /// Cached vectors are returned directly. Misses go through a remote batch
    /// job when batch mode is active and `(file, source)` identify the work,
    /// otherwise through online sub-batches. Newly computed vectors are
    /// upserted into the cache in a single transaction.
    pub async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        file: Option<&FileRow>,
        source: Option<MemorySource>,
    ) -> Result<Vec<Vec<f32>>, MemoryError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let provider = self.provider();
        let provider_id = provider.id().to_string();
        let model = provider.model().to_string();
        let key = self.provider_key();
        let db = self.ctx.db();

        let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
        let cached = db
            .cached_embeddings(&provider_id, &model, &key, &hashes)
            .await?;

        let mut vectors: Vec<Option<Vec<f32>>> = chunks
            .iter()
            .map(|c| cached.get(&c.hash).cloned())
            .collect();
        let misses: Vec<usize> = vectors
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| i)
            .collect();

        if misses.is_empty() {
            return Ok(vectors.into_iter().map(Option::unwrap_or_default).collect());
        }

        let mut resolved: Option<HashMap<usize, Vec<f32>>> = None;
        if self.batch_active() {
            if let (Some(adapter), Some(file), Some(source)) =
                (provider.batch_adapter(), file, source)
            {
                match self
                    .embed_via_remote_batch(adapter, chunks, &misses, file, source)
                    .await
                {
                    Ok(map) => {
                        self.reset_batch_failures().await;
                        resolved = Some(map);
                    }
                    Err(EmbedError::BatchUnavailable(message)) => {
                        tracing::warn!(%message, "Remote batch unavailable, disabling batch mode");
                        self.batch_enabled.store(false, Ordering::SeqCst);
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, path = %file.path, "Remote batch failed, falling back to online embedding");
                        self.record_batch_failure().await;
                    }
                }
            }
        }

        let fresh = match resolved {
            Some(map) => map,
            None => self.embed_online(&provider, chunks, &misses).await?,
        };

        let entries: Vec<(String, Vec<f32>)> = misses
            .iter()
            .filter_map(|&i| fresh.get(&i).map(|v| (chunks[i].hash.clone(), v.clone())))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        db.put_cached_embeddings(&provider_id, &model, &key, &entries)
            .await?;

        for i in misses {
            vectors[i] = fresh.get(&i).cloned();
        }
        Ok(vectors.into_iter().map(Option::unwrap_or_default).collect())
    }

    /// Online path: greedy sub-batches under the byte-estimate cap, each sent
    /// with retry. An oversized chunk forms its own singleton batch.
    async fn embed_online(
        &self,
        provider: &Arc<dyn EmbeddingProvider>,
        chunks: &[Chunk],
        misses: &[usize],
    ) -> Result<HashMap<usize, Vec<f32>>, EmbedError> {
        let mut out = HashMap::new();
        for batch in pack_batches(chunks, misses, EMBEDDING_BATCH_MAX_TOKENS) {
            let texts: Vec<String> = batch.iter().map(|&i| chunks[i].text.clone()).collect();
            let embedded = self.embed_batch_with_retry(provider, &texts).await?;
            if embedded.len() != texts.len() {
                return Err(EmbedError::Provider(format!(
                    "provider returned {} embeddings for {} inputs",
                    embedded.len(),
                    texts.len()
                )));
            }
            for (&i, vector) in batch.iter().zip(embedded) {
                out.insert(i, vector);
            }
        }
        Ok(out)
    }

    async fn embed_batch_with_retry(
        &self,
        provider: &Arc<dyn EmbeddingProvider>,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let budget = self.query_budget(provider.id());
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match tokio::time::timeout(budget, provider.embed_batch(texts)).await {
                Ok(Ok(vectors)) => return Ok(vectors),
                Ok(Err(error)) => error,
                Err(_) => return Err(EmbedError::Timeout(budget)),
            };
            if attempt >= EMBED_MAX_ATTEMPTS || !error.is_retryable() {
                return Err(error);
            }
            let delay = backoff_delay(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying embedding batch");
            tokio::time::sleep(delay).await;
        }
    }

    /// Remote batch path: one provider-side job per file, polled to
    /// completion. A poll-budget timeout retries the whole job once.
    async fn embed_via_remote_batch(
        &self,
        adapter: &dyn RemoteBatchAdapter,
        chunks: &[Chunk],
        misses: &[usize],
        file: &FileRow,
        source: MemorySource,
    ) -> Result<HashMap<usize, Vec<f32>>, EmbedError> {
        let requests: Vec<BatchRequest> = misses
            .iter()
            .map(|&i| {
                let chunk = &chunks[i];
                BatchRequest {
                    custom_id: batch_custom_id(source, &file.path, chunk, i),
                    text: chunk.text.clone(),
                }
            })
            .collect();

        let budget = Duration::from_secs(self.settings.remote_batch.timeout_minutes.max(1) * 60);
        match self.run_batch_job(adapter, &requests, budget).await {
            Err(EmbedError::Timeout(_)) => {
                tracing::warn!(path = %file.path, "Remote batch timed out, retrying once");
                self.run_batch_job(adapter, &requests, budget).await
            }
            other => other,
        }
        .map(|by_custom_id| {
            misses
                .iter()
                .filter_map(|&i| {
                    let chunk = &chunks[i];
                    by_custom_id
                        .get(&batch_custom_id(source, &file.path, chunk, i))
                        .map(|v| (i, v.clone()))
                })
                .collect()
        })
    }

    async fn run_batch_job(
        &self,
        adapter: &dyn RemoteBatchAdapter,
        requests: &[BatchRequest],
        budget: Duration,
    ) -> Result<HashMap<String, Vec<f32>>, EmbedError> {
        let job_id = adapter.create_batch(requests).await?;
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match adapter.poll_batch(&job_id).await? {
                BatchPoll::Completed(results) => {
                    if let Some(missing) = requests
                        .iter()
                        .find(|r| !results.contains_key(&r.custom_id))
                    {
                        return Err(EmbedError::Provider(format!(
                            "batch job {job_id} is missing result for {}",
                            missing.custom_id
                        )));
                    }
                    return Ok(results);
                }
                BatchPoll::Failed(error) => return Err(error),
                BatchPoll::Pending => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EmbedError::Timeout(budget));
            }
            tokio::time::sleep(BATCH_POLL_INTERVAL).await;
        }
    }

    async fn record_batch_failure(&self) {
        let mut failures = self.batch_failures.lock().await;
        *failures += 1;
        if *failures >= BATCH_FAILURE_LIMIT && self.batch_enabled.swap(false, Ordering::SeqCst) {
            tracing::warn!(
                failures = *failures,
                "Disabling remote batch embedding for this manager's lifetime"
            );
        }
    }

    async fn reset_batch_failures(&self) {
        *self.batch_failures.lock().await = 0;
    }

    /// Switch to the configured fallback provider. At most one activation per
    /// manager lifetime; refused when no fallback is configured or it names
    /// the current provider family.
    pub fn activate_fallback(&self, reason: &str) -> bool {
        let Some(fallback) = self.settings.fallback_config() else {
            return false;
        };
        if fallback.id == self.provider().id() {
            return false;
        }
        if self.fallback_activated.swap(true, Ordering::SeqCst) {
            return false;
        }

        match (self.factory)(&fallback) {
            Ok(provider) => {
                let new_key = provider_key(&fallback);
                tracing::warn!(
                    from = %self.provider().id(),
                    to = %fallback.id,
                    reason,
                    "Activating fallback embedding provider"
                );
                *self.provider.write().expect("provider lock poisoned") = provider;
                *self.config.write().expect("provider config lock poisoned") = fallback;
                *self.key.write().expect("provider key lock poisoned") = new_key;
                true
            }
            Err(error) => {
                tracing::warn!(error = %error, to = %fallback.id, "Fallback provider construction failed");
                false
            }
        }
    }

    /// Copy the current store's embedding cache into another store.
    pub async fn seed_embedding_cache(&self, dest: &Store) -> Result<u64, MemoryError> {
        Ok(self.ctx.db().copy_cache_into(dest).await?)
    }

    /// Evict cache rows beyond the configured cap.
    pub async fn prune_embedding_cache_if_needed(&self) -> Result<u64, MemoryError> {
        let max = self.ctx.settings.cache.max_entries;
        Ok(self.ctx.db().prune_embedding_cache(max).await?)
    }
}

/// Stable per-chunk id inside a remote batch job.
fn batch_custom_id(source: MemorySource, path: &str, chunk: &Chunk, index: usize) -> String {
    let key = format!(
        "{source}:{path}:{}:{}:{}:{index}",
        chunk.start_line, chunk.end_line, chunk.hash
    );
    blake3::hash(key.as_bytes()).to_hex()[..16].to_string()
}

/// Greedily pack miss indices into sub-batches bounded by a cumulative
/// estimated-token cap. A single chunk above the cap gets its own batch.
fn pack_batches(chunks: &[Chunk], misses: &[usize], cap: usize) -> Vec<Vec<usize>> {
    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0usize;

    for &i in misses {
        let tokens = estimate_tokens(&chunks[i].text);
        if tokens > cap {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            batches.push(vec![i]);
            continue;
        }
        if current_tokens + tokens > cap && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(i);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Exponential backoff with jitter: 500ms base, doubling per attempt, capped
/// at 8s, +/-20% random.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(BACKOFF_CAP_MS) as f64;
    let jitter = rand::rng().random_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    Duration::from_millis((capped * (1.0 + jitter)).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::content_hash;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            hash: content_hash(text),
            text: text.to_string(),
            start_line: 1,
            end_line: 1,
        }
    }

    #[test]
    fn test_pack_batches_respects_cap() {
        // Each chunk is 100 bytes -> 25 estimated tokens.
        let chunks: Vec<Chunk> = (0..10).map(|_| chunk(&"x".repeat(100))).collect();
        let misses: Vec<usize> = (0..10).collect();
        let batches = pack_batches(&chunks, &misses, 60);
        // 25 + 25 fits in 60, a third does not: batches of two.
        assert!(batches.iter().all(|b| b.len() <= 2));
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_pack_batches_oversized_singleton() {
        let chunks = vec![chunk("small"), chunk(&"y".repeat(4000)), chunk("tiny")];
        let batches = pack_batches(&chunks, &[0, 1, 2], 100);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1], vec![1]);
    }

    #[test]
    fn test_pack_batches_preserves_order() {
        let chunks: Vec<Chunk> = (0..5).map(|i| chunk(&format!("chunk {i}"))).collect();
        let batches = pack_batches(&chunks, &[0, 2, 4], 1_000_000);
        assert_eq!(batches, vec![vec![0, 2, 4]]);
    }

    #[test]
    fn test_backoff_delay_bounds() {
        for attempt in 1..=6 {
            let delay = backoff_delay(attempt).as_millis() as u64;
            // Never below 80% of base, never above 120% of the cap.
            assert!(delay >= 400, "attempt {attempt} delay {delay}");
            assert!(delay <= 9_600, "attempt {attempt} delay {delay}");
        }
    }

    #[test]
    fn test_batch_custom_id_stable_per_tuple() {
        let c = chunk("alpha");
        let a = batch_custom_id(MemorySource::Memory, "/w/a.md", &c, 0);
        let b = batch_custom_id(MemorySource::Memory, "/w/a.md", &c, 0);
        assert_eq!(a, b);
        assert_ne!(a, batch_custom_id(MemorySource::Memory, "/w/a.md", &c, 1));
        assert_ne!(a, batch_custom_id(MemorySource::Sessions, "/w/a.md", &c, 0));
    }
}
