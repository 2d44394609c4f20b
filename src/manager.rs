//! Memory index manager
//!
//! The façade that owns the store handle and coordinates the chunker,
//! embedding manager, and syncer. Hosts obtain managers through the
//! process-wide cache ([`MemoryIndexManager::get`]) keyed by agent,
//! workspace, and settings hash; `close()` removes the entry synchronously
//! before releasing the store.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{expand_user_path, MemorySettings, MemorySource};
use crate::embedding::{EmbeddingManager, EmbeddingStatus};
use crate::provider::{EmbedError, ProviderFactory, ProviderId};
use crate::search::{bm25_rank_to_score, candidate_limit, merge_hybrid, normalize_cosine};
use crate::session::resolve_session_transcripts_dir_for_agent;
use crate::store::{is_all_zero, sidecar_path, IndexMeta, Store, StoreError};
use crate::sync::{SyncOptions, SyncReason, SyncReport, Syncer};

/// One-shot vector table setup gets this long before being marked failed.
const VECTOR_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Top-level error for the memory index surfaces.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Embed(#[from] EmbedError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Index swap failed: {0}")]
    Swap(String),
    #[error("Sync failed: {0}")]
    Sync(String),
    #[error("{0}")]
    Config(String),
    #[error("Memory index is closed")]
    Closed,
}

/// Who this index belongs to and where its inputs live.
#[derive(Debug, Clone)]
pub struct MemoryScope {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    /// Root of the host's per-agent state tree (transcripts live below it).
    pub state_dir: PathBuf,
}

impl MemoryScope {
    pub fn session_transcripts_dir(&self) -> PathBuf {
        resolve_session_transcripts_dir_for_agent(&self.state_dir, &self.agent_id)
    }
}

#[derive(Clone, Copy)]
struct VectorLoad {
    ok: bool,
    dims: usize,
}

/// Capability handle shared with the syncer and embedding manager: the live
/// store (redirected during reindex), index meta, and the FTS/vector
/// availability flags. The manager outlives both sub-components.
pub(crate) struct MemoryContext {
    pub settings: MemorySettings,
    pub scope: MemoryScope,
    db: StdRwLock<Arc<Store>>,
    fts_available: AtomicBool,
    fts_error: StdMutex<Option<String>>,
    /// Memoized one-shot vector setup; `None` means not yet attempted.
    vector_state: AsyncMutex<Option<VectorLoad>>,
    vector_failed: AtomicBool,
    vector_error: StdMutex<Option<String>>,
    closed: AtomicBool,
}

impl MemoryContext {
    fn new(settings: MemorySettings, scope: MemoryScope, db: Arc<Store>) -> Self {
        MemoryContext {
            settings,
            scope,
            db: StdRwLock::new(db),
            fts_available: AtomicBool::new(false),
            fts_error: StdMutex::new(None),
            vector_state: AsyncMutex::new(None),
            vector_failed: AtomicBool::new(false),
            vector_error: StdMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The current store handle. During a full reindex this points at the
    /// replacement store, so all writes land there.
    pub(crate) fn db(&self) -> Arc<Store> {
        self.db.read().expect("db lock poisoned").clone()
    }

    fn set_db(&self, store: Arc<Store>) {
        *self.db.write().expect("db lock poisoned") = store;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true on the first call only.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn fts_enabled(&self) -> bool {
        self.fts_available.load(Ordering::SeqCst)
    }

    /// Whether vector setup has not (yet) failed. Full-reindex detection uses
    /// this: a loadable vector side with no recorded dims forces a rebuild.
    pub(crate) fn vector_loadable(&self) -> bool {
        !self.vector_failed.load(Ordering::SeqCst)
    }

    pub(crate) async fn vector_table_ready(&self) -> bool {
        self.vector_state
            .lock()
            .await
            .map(|load| load.ok)
            .unwrap_or(false)
    }

    pub(crate) async fn vector_dims(&self) -> Option<usize> {
        self.vector_state
            .lock()
            .await
            .filter(|load| load.ok)
            .map(|load| load.dims)
    }

    /// One-shot vector setup for the given dimensionality, memoized until the
    /// next reindex swap. Returns whether vector rows may be written.
    pub(crate) async fn ensure_vector_ready(&self, dims: usize) -> bool {
        let mut slot = self.vector_state.lock().await;
        if let Some(load) = *slot {
            if load.ok && load.dims != dims {
                tracing::warn!(
                    have = load.dims,
                    want = dims,
                    "Vector table dimensionality mismatch, skipping vector rows"
                );
                return false;
            }
            return load.ok;
        }

        let ok = match tokio::time::timeout(VECTOR_LOAD_TIMEOUT, self.db().init_vector_table())
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "Vector table setup failed, vector search disabled");
                *self.vector_error.lock().expect("vector error lock poisoned") =
                    Some(error.to_string());
                false
            }
            Err(_) => {
                tracing::warn!("Vector table setup timed out, vector search disabled");
                *self.vector_error.lock().expect("vector error lock poisoned") =
                    Some("vector setup timed out".to_string());
                false
            }
        };
        if !ok {
            self.vector_failed.store(true, Ordering::SeqCst);
        }
        *slot = Some(VectorLoad { ok, dims });
        ok
    }

    async fn reset_vector_state(&self) {
        *self.vector_state.lock().await = None;
        self.vector_failed.store(false, Ordering::SeqCst);
        *self.vector_error.lock().expect("vector error lock poisoned") = None;
    }

    /// (Re)try FTS setup against the current store and record availability.
    async fn refresh_fts(&self) {
        match self.db().init_fts().await {
            Ok(()) => {
                self.fts_available.store(true, Ordering::SeqCst);
                *self.fts_error.lock().expect("fts error lock poisoned") = None;
            }
            Err(error) => {
                tracing::warn!(error = %error, "FTS5 unavailable, keyword search disabled");
                self.fts_available.store(false, Ordering::SeqCst);
                *self.fts_error.lock().expect("fts error lock poisoned") =
                    Some(error.to_string());
            }
        }
    }

    pub(crate) async fn read_meta(&self) -> Result<Option<IndexMeta>, MemoryError> {
        Ok(self.db().read_meta().await?)
    }

    /// Full, crash-safe reindex: rebuild into a scratch store and swap it in
    /// atomically.
    ///
    /// The callback runs the sync passes against the redirected store. On any
    /// failure before the swap, the scratch files are deleted and the prior
    /// store handle is restored untouched. A failed swap restores the backup
    /// before surfacing the error.
    pub(crate) async fn reindex<T, M, F, Fut>(&self, meta_fn: M, cb: F) -> Result<T, MemoryError>
    where
        M: FnOnce(Option<usize>) -> IndexMeta,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MemoryError>>,
    {
        let live = self.db();
        let db_path = live.path().to_path_buf();
        let temp_path = PathBuf::from(format!(
            "{}.tmp-{}",
            db_path.display(),
            uuid::Uuid::new_v4()
        ));
        tracing::info!(temp = %temp_path.display(), "Starting full reindex");

        let temp = Arc::new(Store::open(&temp_path).await?);

        // Seed the replacement store's embedding cache from the live one so
        // the rebuild embeds nothing it already knows.
        if let Err(error) = live.copy_cache_into(&temp).await {
            return self.abort_reindex(live, temp, &temp_path, error.into()).await;
        }

        self.set_db(Arc::clone(&temp));
        self.refresh_fts().await;
        self.reset_vector_state().await;

        let value = match cb().await {
            Ok(value) => value,
            Err(error) => return self.abort_reindex(live, temp, &temp_path, error).await,
        };

        let meta = meta_fn(self.vector_dims().await);
        if let Err(error) = temp.write_meta(&meta).await {
            return self.abort_reindex(live, temp, &temp_path, error.into()).await;
        }
        if let Err(error) = temp
            .prune_embedding_cache(self.settings.cache.max_entries)
            .await
        {
            return self.abort_reindex(live, temp, &temp_path, error.into()).await;
        }

        temp.close().await;
        live.close().await;

        let backup_path = PathBuf::from(format!(
            "{}.backup-{}",
            db_path.display(),
            uuid::Uuid::new_v4()
        ));
        if let Err(error) = swap_store_files(&db_path, &temp_path, &backup_path) {
            match Store::open(&db_path).await {
                Ok(store) => {
                    self.set_db(Arc::new(store));
                    self.refresh_fts().await;
                    self.reset_vector_state().await;
                }
                Err(reopen) => {
                    tracing::error!(error = %reopen, "Failed to reopen store after aborted swap");
                }
            }
            return Err(MemoryError::Swap(error.to_string()));
        }

        let reopened = Arc::new(Store::open(&db_path).await?);
        self.set_db(reopened);
        self.refresh_fts().await;
        self.reset_vector_state().await;
        tracing::info!("Full reindex complete");
        Ok(value)
    }

    async fn abort_reindex<T>(
        &self,
        live: Arc<Store>,
        temp: Arc<Store>,
        temp_path: &Path,
        error: MemoryError,
    ) -> Result<T, MemoryError> {
        tracing::warn!(error = %error, "Reindex aborted, restoring previous store");
        temp.close().await;
        for suffix in STORE_SUFFIXES {
            let _ = std::fs::remove_file(sidecar_path(temp_path, suffix));
        }
        self.set_db(live);
        self.refresh_fts().await;
        self.reset_vector_state().await;
        Err(error)
    }
}

const STORE_SUFFIXES: [&str; 3] = ["", "-wal", "-shm"];

/// Three-step swap covering the database and its WAL side files: live goes to
/// backup, scratch becomes live. A failed second step restores the backup.
fn swap_store_files(live: &Path, temp: &Path, backup: &Path) -> std::io::Result<()> {
    for suffix in STORE_SUFFIXES {
        let from = sidecar_path(live, suffix);
        if from.exists() {
            std::fs::rename(&from, sidecar_path(backup, suffix))?;
        }
    }

    let mut swap_error = None;
    for suffix in STORE_SUFFIXES {
        let from = sidecar_path(temp, suffix);
        if from.exists() {
            if let Err(error) = std::fs::rename(&from, sidecar_path(live, suffix)) {
                swap_error = Some(error);
                break;
            }
        }
    }

    if let Some(error) = swap_error {
        // Roll back: clear whatever landed, then restore the backup.
        for suffix in STORE_SUFFIXES {
            let _ = std::fs::remove_file(sidecar_path(live, suffix));
        }
        for suffix in STORE_SUFFIXES {
            let from = sidecar_path(backup, suffix);
            if from.exists() {
                let _ = std::fs::rename(&from, sidecar_path(live, suffix));
            }
        }
        return Err(error);
    }

    for suffix in STORE_SUFFIXES {
        let _ = std::fs::remove_file(sidecar_path(backup, suffix));
    }
    Ok(())
}

/// Search options.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
    pub min_score: f32,
    /// When set, warms the session once per key (if enabled in settings).
    pub session_key: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            max_results: 8,
            min_score: 0.0,
            session_key: None,
        }
    }
}

/// One search hit.
#[derive(Debug, Clone)]
pub struct MemorySearchResult {
    pub id: String,
    pub path: String,
    pub source: MemorySource,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    /// Combined score in [0, 1].
    pub score: f32,
}

/// Status snapshot for host surfaces.
#[derive(Debug, Clone)]
pub struct MemoryIndexStatus {
    pub dirty: bool,
    pub files: u64,
    pub chunks: u64,
    pub cache_entries: u64,
    pub db_size_bytes: u64,
    pub provider: ProviderId,
    pub model: String,
    pub fts_available: bool,
    pub vector_available: bool,
    pub embedding: EmbeddingStatus,
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
}

type CacheKey = (String, String, String);

/// Process-wide manager cache: populated on first `get`, evicted on `close`.
static INDEX_CACHE: Lazy<StdMutex<HashMap<CacheKey, Arc<MemoryIndexManager>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

pub struct MemoryIndexManager {
    ctx: Arc<MemoryContext>,
    embedder: Arc<EmbeddingManager>,
    syncer: Arc<Syncer>,
    cache_key: CacheKey,
}

impl MemoryIndexManager {
    fn cache_key(scope: &MemoryScope, settings: &MemorySettings) -> CacheKey {
        (
            scope.agent_id.clone(),
            scope.workspace_dir.to_string_lossy().replace('\\', "/"),
            settings.settings_hash(),
        )
    }

    /// Get or create the manager for `(agent, workspace, settings)`.
    /// Re-entry returns the same instance until `close()` evicts it.
    pub async fn get(
        scope: MemoryScope,
        settings: MemorySettings,
        factory: ProviderFactory,
    ) -> Result<Arc<Self>, MemoryError> {
        let key = Self::cache_key(&scope, &settings);
        if let Some(existing) = INDEX_CACHE
            .lock()
            .expect("index cache lock poisoned")
            .get(&key)
        {
            return Ok(Arc::clone(existing));
        }

        let manager = Self::open(scope, settings, factory).await?;
        let mut cache = INDEX_CACHE.lock().expect("index cache lock poisoned");
        if let Some(existing) = cache.get(&key) {
            // Lost a construction race; keep the winner, tear ours down.
            let winner = Arc::clone(existing);
            drop(cache);
            manager.teardown().await;
            return Ok(winner);
        }
        cache.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    /// Construct a manager without registering it in the process cache.
    pub async fn open(
        scope: MemoryScope,
        settings: MemorySettings,
        factory: ProviderFactory,
    ) -> Result<Arc<Self>, MemoryError> {
        let db_path = settings.store_path();
        let store = Arc::new(Store::open(&db_path).await?);
        let cache_key = Self::cache_key(&scope, &settings);
        let provider_settings = settings.provider.clone();

        let ctx = Arc::new(MemoryContext::new(settings, scope, store));
        ctx.refresh_fts().await;

        let embedder = Arc::new(EmbeddingManager::new(
            Arc::clone(&ctx),
            provider_settings,
            factory,
        )?);
        let syncer = Syncer::start(Arc::clone(&ctx), Arc::clone(&embedder));

        Ok(Arc::new(MemoryIndexManager {
            ctx,
            embedder,
            syncer,
            cache_key,
        }))
    }

    pub fn embeddings(&self) -> &EmbeddingManager {
        &self.embedder
    }

    /// Run (or join) a sync pass.
    pub async fn sync(&self, opts: SyncOptions) -> Result<SyncReport, MemoryError> {
        self.syncer.sync(opts).await
    }

    /// Eagerly sync once per session key, when enabled in settings.
    pub fn warm_session(&self, session_key: &str) {
        self.syncer.maybe_warm_session(session_key);
    }

    /// Hybrid search. Never fails: degraded legs contribute empty results.
    pub async fn search(&self, query: &str, opts: SearchOptions) -> Vec<MemorySearchResult> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        if let Some(session_key) = &opts.session_key {
            self.syncer.maybe_warm_session(session_key);
        }
        if self.ctx.settings.sync.on_search && self.syncer.is_dirty() {
            self.syncer.spawn_sync(SyncReason::Search);
        }

        let hybrid = self.ctx.settings.query.hybrid;
        let max_results = opts.max_results.max(1);
        let candidates = candidate_limit(max_results, hybrid.candidate_multiplier);
        let sources = self.ctx.settings.sources.clone();
        let model = self.embedder.model();
        let db = self.ctx.db();

        let keyword_leg = async {
            if !hybrid.enabled || !self.ctx.fts_enabled() {
                return Vec::new();
            }
            match db.keyword_search(query, &sources, &model, candidates).await {
                Ok(hits) => hits,
                Err(error) => {
                    tracing::warn!(error = %error, "Keyword search failed");
                    Vec::new()
                }
            }
        };
        let vector_leg = async {
            let embedded = match self.embedder.embed_query(query).await {
                Ok(embedded) => embedded,
                Err(error) => {
                    tracing::warn!(error = %error, "Query embedding failed");
                    return Vec::new();
                }
            };
            if is_all_zero(&embedded) {
                return Vec::new();
            }
            match db.vector_search(&embedded, &sources, candidates).await {
                Ok(hits) => hits,
                Err(error) => {
                    tracing::warn!(error = %error, "Vector search failed");
                    Vec::new()
                }
            }
        };
        let (keyword_hits, vector_hits) = tokio::join!(keyword_leg, vector_leg);

        // Row details for whichever leg surfaced each id.
        let mut details: HashMap<String, (String, MemorySource, u32, u32, String)> =
            HashMap::new();
        for hit in &vector_hits {
            details.entry(hit.id.clone()).or_insert_with(|| {
                (
                    hit.path.clone(),
                    hit.source,
                    hit.start_line,
                    hit.end_line,
                    hit.text.clone(),
                )
            });
        }
        for hit in &keyword_hits {
            details.entry(hit.id.clone()).or_insert_with(|| {
                (
                    hit.path.clone(),
                    hit.source,
                    hit.start_line,
                    hit.end_line,
                    hit.text.clone(),
                )
            });
        }

        let vector_scored: Vec<(String, f32)> = vector_hits
            .iter()
            .map(|hit| (hit.id.clone(), normalize_cosine(hit.similarity)))
            .collect();

        let merged: Vec<(String, f32)> = if hybrid.enabled {
            let keyword_scored: Vec<(String, f32)> = keyword_hits
                .iter()
                .map(|hit| (hit.id.clone(), bm25_rank_to_score(hit.rank)))
                .collect();
            merge_hybrid(
                &vector_scored,
                &keyword_scored,
                hybrid.vector_weight,
                hybrid.text_weight,
            )
        } else {
            vector_scored
        };

        merged
            .into_iter()
            .filter(|(_, score)| *score >= opts.min_score)
            .take(max_results)
            .filter_map(|(id, score)| {
                details
                    .get(&id)
                    .map(|(path, source, start_line, end_line, text)| MemorySearchResult {
                        id,
                        path: path.clone(),
                        source: *source,
                        start_line: *start_line,
                        end_line: *end_line,
                        text: text.clone(),
                        score,
                    })
            })
            .collect()
    }

    /// Read a memory file by path for the read surface. Only files inside the
    /// workspace memory layout or the configured extra paths are served.
    pub async fn read_file(&self, path: &str) -> Result<String, MemoryError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(MemoryError::Config("path required".to_string()));
        }
        let expanded = expand_user_path(Path::new(trimmed));
        let abs = if expanded.is_absolute() {
            expanded
        } else {
            self.ctx.scope.workspace_dir.join(expanded)
        };
        if !self.is_memory_path(&abs) {
            return Err(MemoryError::Config(format!(
                "not a memory file: {}",
                abs.display()
            )));
        }
        Ok(tokio::fs::read_to_string(&abs).await?)
    }

    fn is_memory_path(&self, abs: &Path) -> bool {
        let workspace = &self.ctx.scope.workspace_dir;
        if abs == workspace.join("MEMORY.md") || abs == workspace.join("memory.md") {
            return true;
        }
        if abs.starts_with(workspace.join("memory")) {
            return true;
        }
        self.ctx.settings.extra_paths.iter().any(|extra| {
            let extra = expand_user_path(extra);
            abs == extra || abs.starts_with(&extra)
        })
    }

    pub async fn status(&self) -> Result<MemoryIndexStatus, MemoryError> {
        let db = self.ctx.db();
        let stats = db.stats().await?;
        let embedding = self.embedder.status();
        // The write-side flag resets on every reindex swap; an existing table
        // still serves vector reads.
        let vector_available = self.ctx.vector_table_ready().await
            || db.has_vector_table().await.unwrap_or(false);
        Ok(MemoryIndexStatus {
            dirty: self.syncer.is_dirty(),
            files: stats.files,
            chunks: stats.chunks,
            cache_entries: stats.cache_entries,
            db_size_bytes: stats.db_size_bytes,
            provider: embedding.provider,
            model: embedding.model.clone(),
            fts_available: self.ctx.fts_enabled(),
            vector_available,
            embedding,
            last_sync_at: self.syncer.last_sync_at(),
        })
    }

    /// Idempotent shutdown: evict from the process cache, stop all triggers,
    /// close the store.
    pub async fn close(&self) {
        INDEX_CACHE
            .lock()
            .expect("index cache lock poisoned")
            .remove(&self.cache_key);
        self.teardown().await;
    }

    async fn teardown(&self) {
        if self.ctx.mark_closed() {
            self.syncer.close();
            self.ctx.db().close().await;
        }
    }

    // Test hooks; not part of the public API.

    #[doc(hidden)]
    pub fn mark_dirty(&self) {
        self.syncer.mark_dirty();
    }

    #[doc(hidden)]
    pub fn mark_session_dirty(&self, path: &Path) {
        self.syncer.mark_session_dirty(path);
    }

    #[doc(hidden)]
    pub async fn check_session_delta(&self, path: &Path) -> Result<bool, MemoryError> {
        self.syncer.check_session_delta(path).await
    }

    #[doc(hidden)]
    pub fn session_delta_state(&self, path: &Path) -> (i64, i64, i64) {
        self.syncer.session_delta_state(path)
    }
}
