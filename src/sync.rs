//! Sync scheduling and execution
//!
//! The syncer decides *when* indexing happens and *what* gets indexed. Three
//! optional triggers feed it: a filesystem watcher over the memory files, the
//! process-wide session-transcript event bus, and a periodic timer. All of
//! them funnel into `sync()`, which dedups concurrent callers onto one
//! in-flight pass and decides between an incremental pass and a full,
//! crash-safe reindex.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chunker::{apply_line_map, chunk_markdown, clip_chunks, content_hash};
use crate::config::MemorySource;
use crate::embedding::EmbeddingManager;
use crate::manager::{MemoryContext, MemoryError};
use crate::session::{render_transcript, subscribe_session_transcript_updates};
use crate::store::{chunk_id, ChunkRecord, FileRow, IndexMeta};

/// Coalescing window for session-transcript notifications.
const SESSION_DEBOUNCE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a written file to settle.
const SETTLE_POLL: Duration = Duration::from_millis(100);

/// Hard cap on settle polling, so a constantly-growing file cannot stall the
/// watcher pipeline forever.
const SETTLE_MAX_POLLS: u32 = 600;

/// Byte-range newline counting reads the file in slabs of this size.
const DELTA_SLAB: usize = 64 * 1024;

/// Why a sync was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncReason {
    #[default]
    Manual,
    Watch,
    Interval,
    SessionDelta,
    SessionStart,
    Search,
}

impl std::fmt::Display for SyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncReason::Manual => "manual",
            SyncReason::Watch => "watch",
            SyncReason::Interval => "interval",
            SyncReason::SessionDelta => "session-delta",
            SyncReason::SessionStart => "session-start",
            SyncReason::Search => "search",
        };
        write!(f, "{s}")
    }
}

/// Progress update handed to the optional sync callback.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub completed: usize,
    pub total: usize,
    pub label: String,
}

pub type ProgressFn = Arc<dyn Fn(SyncProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SyncOptions {
    pub reason: SyncReason,
    pub force: bool,
    pub progress: Option<ProgressFn>,
}

/// What one sync pass did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub chunks_indexed: usize,
    pub errors: usize,
    pub full_reindex: bool,
}

/// Accumulated append state for one session transcript.
#[derive(Debug, Clone, Copy, Default)]
struct SessionDelta {
    last_size: i64,
    pending_bytes: i64,
    pending_messages: i64,
}

#[derive(Default)]
struct SyncFlags {
    dirty: bool,
    sessions_dirty: bool,
    sessions_dirty_files: HashSet<PathBuf>,
    warmed_sessions: HashSet<String>,
    last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One enumerated source file, content already read and hashed.
struct FileEntry {
    path: String,
    abs: PathBuf,
    hash: String,
    size: i64,
    mtime: i64,
    content: String,
}

type SharedOutcome = Option<Result<SyncReport, String>>;

/// At most one pending timer per channel; rescheduling cancels the previous
/// timer, as does `cancel()` on close.
struct Debouncer {
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    fn new() -> Self {
        Debouncer {
            handle: StdMutex::new(None),
        }
    }

    fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.handle.lock().expect("debouncer lock poisoned");
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
    }

    fn cancel(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .expect("debouncer lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

static EMBEDDING_FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)embedding|embeddings|batch").expect("pattern is valid"));

pub(crate) struct Syncer {
    ctx: Arc<MemoryContext>,
    embedder: Arc<EmbeddingManager>,
    flags: StdMutex<SyncFlags>,
    session_deltas: StdMutex<HashMap<PathBuf, SessionDelta>>,
    pending_watch_paths: StdMutex<HashSet<PathBuf>>,
    pending_session_files: StdMutex<HashSet<PathBuf>>,
    in_flight: StdMutex<Option<watch::Receiver<SharedOutcome>>>,
    watch_debounce: Debouncer,
    session_debounce: Debouncer,
    watcher: StdMutex<Option<RecommendedWatcher>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Syncer {
    /// Construct the syncer and start whichever triggers the settings enable.
    pub(crate) fn start(
        ctx: Arc<MemoryContext>,
        embedder: Arc<EmbeddingManager>,
    ) -> Arc<Self> {
        let syncer = Arc::new(Syncer {
            ctx,
            embedder,
            flags: StdMutex::new(SyncFlags::default()),
            session_deltas: StdMutex::new(HashMap::new()),
            pending_watch_paths: StdMutex::new(HashSet::new()),
            pending_session_files: StdMutex::new(HashSet::new()),
            in_flight: StdMutex::new(None),
            watch_debounce: Debouncer::new(),
            session_debounce: Debouncer::new(),
            watcher: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        });

        let settings = &syncer.ctx.settings;
        if settings.source_enabled(MemorySource::Memory) && settings.sync.watch {
            if let Err(error) = syncer.start_watcher() {
                tracing::warn!(error = %error, "Memory file watcher failed to start");
            }
        }
        if settings.source_enabled(MemorySource::Sessions) {
            syncer.start_session_listener();
        }
        if settings.sync.interval_minutes > 0 {
            syncer.start_interval();
        }
        syncer
    }

    /// Stop all triggers. Scheduled callbacks observe the closed flag and
    /// return without doing work.
    pub(crate) fn close(&self) {
        self.watch_debounce.cancel();
        self.session_debounce.cancel();
        for task in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
            task.abort();
        }
        *self.watcher.lock().expect("watcher lock poisoned") = None;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        let flags = self.flags.lock().expect("flags lock poisoned");
        flags.dirty || (flags.sessions_dirty && !flags.sessions_dirty_files.is_empty())
    }

    pub(crate) fn last_sync_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.flags.lock().expect("flags lock poisoned").last_sync_at
    }

    /// Mark the memory source dirty (watcher and tests).
    pub(crate) fn mark_dirty(&self) {
        self.flags.lock().expect("flags lock poisoned").dirty = true;
    }

    /// Queue one session file for the next incremental session pass.
    pub(crate) fn mark_session_dirty(&self, path: &Path) {
        let mut flags = self.flags.lock().expect("flags lock poisoned");
        flags.sessions_dirty = true;
        flags.sessions_dirty_files.insert(path.to_path_buf());
    }

    /// Eagerly sync once per session key, when enabled.
    pub(crate) fn maybe_warm_session(self: &Arc<Self>, session_key: &str) {
        if !self.ctx.settings.sync.on_session_start {
            return;
        }
        {
            let mut flags = self.flags.lock().expect("flags lock poisoned");
            if !flags.warmed_sessions.insert(session_key.to_string()) {
                return;
            }
        }
        self.spawn_sync(SyncReason::SessionStart);
    }

    /// Fire-and-forget a sync; errors are logged, not surfaced.
    pub(crate) fn spawn_sync(self: &Arc<Self>, reason: SyncReason) {
        let syncer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if syncer.ctx.is_closed() {
                return;
            }
            if let Err(error) = syncer
                .sync(SyncOptions {
                    reason,
                    ..Default::default()
                })
                .await
            {
                tracing::warn!(reason = %reason, error = %error, "Background sync failed");
            }
        });
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    // ---- triggers -------------------------------------------------------

    fn watch_roots(&self) -> Vec<PathBuf> {
        let workspace = &self.ctx.scope.workspace_dir;
        let mut roots = vec![
            workspace.join("MEMORY.md"),
            workspace.join("memory.md"),
            workspace.join("memory"),
        ];
        for extra in &self.ctx.settings.extra_paths {
            let expanded = crate::config::expand_user_path(extra);
            // Symlinked extras are skipped: watching through links invites
            // cycles and double notification.
            if expanded
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                continue;
            }
            roots.push(expanded);
        }
        roots
    }

    fn start_watcher(self: &Arc<Self>) -> Result<(), notify::Error> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            })?;

        for root in self.watch_roots() {
            if root.exists() {
                watcher.watch(&root, RecursiveMode::Recursive)?;
            }
        }
        *self.watcher.lock().expect("watcher lock poisoned") = Some(watcher);

        let syncer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                if syncer.ctx.is_closed() {
                    break;
                }
                let event = match result {
                    Ok(event) => event,
                    Err(error) => {
                        tracing::warn!(error = %error, "Watch error");
                        continue;
                    }
                };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                let relevant: Vec<PathBuf> = event
                    .paths
                    .iter()
                    .filter(|p| is_markdown(p) || p.file_name().is_some_and(|n| n == "MEMORY.md" || n == "memory.md"))
                    .cloned()
                    .collect();
                if relevant.is_empty() {
                    continue;
                }

                syncer.mark_dirty();
                syncer
                    .pending_watch_paths
                    .lock()
                    .expect("watch paths lock poisoned")
                    .extend(relevant);

                let debounce = Duration::from_millis(syncer.ctx.settings.sync.watch_debounce_ms);
                let inner = Arc::clone(&syncer);
                syncer.watch_debounce.schedule(debounce, async move {
                    if inner.ctx.is_closed() {
                        return;
                    }
                    inner.await_write_settle().await;
                    if let Err(error) = inner
                        .sync(SyncOptions {
                            reason: SyncReason::Watch,
                            ..Default::default()
                        })
                        .await
                    {
                        tracing::warn!(error = %error, "Watch-triggered sync failed");
                    }
                });
            }
        });
        self.tasks.lock().expect("tasks lock poisoned").push(handle);
        Ok(())
    }

    /// Wait until every pending changed file has stopped growing: size and
    /// mtime must hold still for the stability threshold, polled at 100ms.
    async fn await_write_settle(&self) {
        let paths: Vec<PathBuf> = self
            .pending_watch_paths
            .lock()
            .expect("watch paths lock poisoned")
            .drain()
            .collect();
        let threshold = Duration::from_millis(self.ctx.settings.sync.watch_debounce_ms);

        for path in paths {
            let mut last: Option<(u64, Option<std::time::SystemTime>)> = None;
            let mut stable_since = tokio::time::Instant::now();
            let mut polls = 0u32;
            loop {
                let observed = match tokio::fs::metadata(&path).await {
                    Ok(meta) => Some((meta.len(), meta.modified().ok())),
                    Err(_) => None, // deleted mid-settle
                };
                let Some(observed) = observed else { break };

                if last.as_ref() == Some(&observed) {
                    if stable_since.elapsed() >= threshold {
                        break;
                    }
                } else {
                    last = Some(observed);
                    stable_since = tokio::time::Instant::now();
                }

                polls += 1;
                if polls >= SETTLE_MAX_POLLS || self.ctx.is_closed() {
                    break;
                }
                tokio::time::sleep(SETTLE_POLL).await;
            }
        }
    }

    fn start_session_listener(self: &Arc<Self>) {
        let syncer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut rx = subscribe_session_transcript_updates();
            let session_dir = syncer.ctx.scope.session_transcripts_dir();
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Session event listener lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if syncer.ctx.is_closed() {
                    break;
                }
                // Only this agent's transcripts are ours to index.
                if !event.session_file.starts_with(&session_dir) {
                    continue;
                }
                syncer
                    .pending_session_files
                    .lock()
                    .expect("session files lock poisoned")
                    .insert(event.session_file.clone());

                let inner = Arc::clone(&syncer);
                syncer.session_debounce.schedule(SESSION_DEBOUNCE, async move {
                    if inner.ctx.is_closed() {
                        return;
                    }
                    inner.process_session_batch().await;
                });
            }
        });
        self.tasks.lock().expect("tasks lock poisoned").push(handle);
    }

    fn start_interval(self: &Arc<Self>) {
        let syncer = Arc::clone(self);
        let period = Duration::from_secs(self.ctx.settings.sync.interval_minutes * 60);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if syncer.ctx.is_closed() {
                    break;
                }
                if let Err(error) = syncer
                    .sync(SyncOptions {
                        reason: SyncReason::Interval,
                        ..Default::default()
                    })
                    .await
                {
                    tracing::warn!(error = %error, "Interval sync failed");
                }
            }
        });
        self.tasks.lock().expect("tasks lock poisoned").push(handle);
    }

    /// Evaluate accumulated deltas for the coalesced batch of notified
    /// session files, then schedule a sync if any crossed a threshold.
    async fn process_session_batch(self: &Arc<Self>) {
        let batch: Vec<PathBuf> = self
            .pending_session_files
            .lock()
            .expect("session files lock poisoned")
            .drain()
            .collect();

        let mut triggered = false;
        for path in batch {
            match self.check_session_delta(&path).await {
                Ok(true) => {
                    let mut flags = self.flags.lock().expect("flags lock poisoned");
                    flags.sessions_dirty = true;
                    flags.sessions_dirty_files.insert(path);
                    triggered = true;
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "Session delta check failed");
                }
            }
        }

        if triggered {
            if let Err(error) = self
                .sync(SyncOptions {
                    reason: SyncReason::SessionDelta,
                    ..Default::default()
                })
                .await
            {
                tracing::warn!(error = %error, "Session-delta sync failed");
            }
        }
    }

    /// Update append-state for one transcript; returns whether it should be
    /// re-indexed now.
    pub(crate) async fn check_session_delta(&self, path: &Path) -> Result<bool, MemoryError> {
        let size = tokio::fs::metadata(path).await?.len() as i64;
        let previous = self
            .session_deltas
            .lock()
            .expect("session deltas lock poisoned")
            .get(path)
            .copied()
            .unwrap_or_default();

        let mut delta = previous;
        if size < previous.last_size {
            // Rotation: the whole new file counts as fresh content.
            delta.pending_bytes += size;
            delta.pending_messages += count_newlines_in_range(path, 0, size).await?;
        } else if size > previous.last_size {
            delta.pending_bytes += size - previous.last_size;
            delta.pending_messages +=
                count_newlines_in_range(path, previous.last_size, size).await?;
        }
        delta.last_size = size;

        let thresholds = self.ctx.settings.sync.session_delta;
        let bytes_hit = if thresholds.delta_bytes <= 0 {
            delta.pending_bytes > 0
        } else {
            delta.pending_bytes >= thresholds.delta_bytes
        };
        let messages_hit =
            thresholds.delta_messages > 0 && delta.pending_messages >= thresholds.delta_messages;
        let indexable = bytes_hit || messages_hit;

        if indexable {
            delta.pending_bytes = (delta.pending_bytes - thresholds.delta_bytes.max(0)).max(0);
            delta.pending_messages =
                (delta.pending_messages - thresholds.delta_messages.max(0)).max(0);
        }

        self.session_deltas
            .lock()
            .expect("session deltas lock poisoned")
            .insert(path.to_path_buf(), delta);
        Ok(indexable)
    }

    /// Pending delta for a session file (status and tests).
    pub(crate) fn session_delta_state(&self, path: &Path) -> (i64, i64, i64) {
        let deltas = self.session_deltas.lock().expect("session deltas lock poisoned");
        let d = deltas.get(path).copied().unwrap_or_default();
        (d.last_size, d.pending_bytes, d.pending_messages)
    }

    // ---- sync entry point ----------------------------------------------

    /// Run a sync, or join the one already in flight.
    pub(crate) async fn sync(&self, opts: SyncOptions) -> Result<SyncReport, MemoryError> {
        enum Role {
            Leader(watch::Sender<SharedOutcome>),
            Follower(watch::Receiver<SharedOutcome>),
        }

        let role = {
            let mut slot = self.in_flight.lock().expect("in-flight lock poisoned");
            if let Some(rx) = slot.as_ref() {
                Role::Follower(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                *slot = Some(rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => {
                let guard = rx
                    .wait_for(|value| value.is_some())
                    .await
                    .map_err(|_| MemoryError::Sync("in-flight sync was dropped".to_string()))?;
                let outcome = (*guard).clone().expect("waited for Some");
                outcome.map_err(MemoryError::Sync)
            }
            Role::Leader(tx) => {
                let outcome = self.run_sync(&opts, false).await;
                *self.in_flight.lock().expect("in-flight lock poisoned") = None;
                let shared = match &outcome {
                    Ok(report) => Ok(report.clone()),
                    Err(error) => Err(error.to_string()),
                };
                let _ = tx.send(Some(shared));
                outcome
            }
        }
    }

    /// One sync attempt, with a single fallback-and-restart on embedding
    /// failures when a fallback provider is configured.
    async fn run_sync(
        &self,
        opts: &SyncOptions,
        retried: bool,
    ) -> Result<SyncReport, MemoryError> {
        if self.ctx.is_closed() {
            return Err(MemoryError::Closed);
        }

        let outcome = self.run_sync_inner(opts).await;
        let error = match outcome {
            Ok(report) => {
                self.flags
                    .lock()
                    .expect("flags lock poisoned")
                    .last_sync_at = Some(chrono::Utc::now());
                return Ok(report);
            }
            Err(error) => error,
        };

        let embedding_related = matches!(error, MemoryError::Embed(_))
            || EMBEDDING_FAILURE.is_match(&error.to_string());
        if retried || !embedding_related {
            return Err(error);
        }
        if !self.embedder.activate_fallback(&error.to_string()) {
            return Err(error);
        }

        tracing::warn!(error = %error, "Sync failed on embeddings; restarting as full reindex on fallback provider");
        let forced = SyncOptions {
            force: true,
            ..opts.clone()
        };
        Box::pin(self.run_sync(&forced, true)).await
    }

    async fn run_sync_inner(&self, opts: &SyncOptions) -> Result<SyncReport, MemoryError> {
        let settings = &self.ctx.settings;
        let meta = self.ctx.read_meta().await?;
        let needs_full = opts.force || self.needs_full_reindex(meta.as_ref()).await;

        let dirty = self.flags.lock().expect("flags lock poisoned").dirty;
        let sync_memory = settings.source_enabled(MemorySource::Memory)
            && (opts.force || needs_full || dirty);

        let sessions_pending = {
            let flags = self.flags.lock().expect("flags lock poisoned");
            flags.sessions_dirty && !flags.sessions_dirty_files.is_empty()
        };
        let sessions_blocked = matches!(
            opts.reason,
            SyncReason::SessionStart | SyncReason::Watch
        );
        let sync_sessions = settings.source_enabled(MemorySource::Sessions)
            && !sessions_blocked
            && (opts.force || needs_full || sessions_pending);

        tracing::debug!(
            reason = %opts.reason,
            needs_full,
            sync_memory,
            sync_sessions,
            "Starting sync pass"
        );

        if needs_full {
            let embedder = Arc::clone(&self.embedder);
            let settings_chunking = settings.chunking;
            let meta_fn = move |dims: Option<usize>| {
                let provider = embedder.provider();
                IndexMeta {
                    model: provider.model().to_string(),
                    provider: provider.id().to_string(),
                    provider_key: embedder.provider_key(),
                    chunk_tokens: settings_chunking.tokens,
                    chunk_overlap: settings_chunking.overlap,
                    vector_dims: dims.or(provider.dimensions()),
                }
            };
            let mut report = self
                .ctx
                .reindex(meta_fn, || {
                    self.run_passes(true, sync_memory, sync_sessions, opts)
                })
                .await?;
            report.full_reindex = true;
            Ok(report)
        } else {
            let report = self
                .run_passes(false, sync_memory, sync_sessions, opts)
                .await?;
            self.embedder.prune_embedding_cache_if_needed().await?;
            Ok(report)
        }
    }

    /// Whether the stored index identity disagrees with the live
    /// configuration.
    async fn needs_full_reindex(&self, meta: Option<&IndexMeta>) -> bool {
        let Some(meta) = meta else { return true };
        let provider = self.embedder.provider();
        let chunking = self.ctx.settings.chunking;
        meta.model != provider.model()
            || meta.provider != provider.id().to_string()
            || meta.provider_key != self.embedder.provider_key()
            || meta.chunk_tokens != chunking.tokens
            || meta.chunk_overlap != chunking.overlap
            || (self.ctx.vector_loadable() && meta.vector_dims.is_none())
    }

    // ---- passes ---------------------------------------------------------

    async fn run_passes(
        &self,
        full: bool,
        sync_memory: bool,
        sync_sessions: bool,
        opts: &SyncOptions,
    ) -> Result<SyncReport, MemoryError> {
        if sync_memory {
            // Events arriving during the pass re-mark dirty for the next one.
            self.flags.lock().expect("flags lock poisoned").dirty = false;
        }

        let memory_files = if sync_memory {
            self.enumerate_memory_files().await
        } else {
            Vec::new()
        };

        let all_sessions = if sync_sessions {
            self.enumerate_session_files().await
        } else {
            Vec::new()
        };
        let dirty_files: HashSet<PathBuf> = {
            let flags = self.flags.lock().expect("flags lock poisoned");
            flags.sessions_dirty_files.clone()
        };
        // Incremental session passes only touch the files whose deltas fired;
        // a full reindex re-reads everything.
        let session_targets: Vec<&FileEntry> = if !full && !dirty_files.is_empty() {
            all_sessions
                .iter()
                .filter(|e| dirty_files.contains(&e.abs))
                .collect()
        } else {
            all_sessions.iter().collect()
        };

        let total = memory_files.len() + session_targets.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let report = Arc::new(StdMutex::new(SyncReport::default()));

        self.index_source_pass(
            MemorySource::Memory,
            memory_files.iter().collect(),
            full,
            opts,
            total,
            &completed,
            &report,
        )
        .await?;
        if sync_memory {
            self.prune_stale(MemorySource::Memory, &memory_files, &report)
                .await?;
        }

        self.index_source_pass(
            MemorySource::Sessions,
            session_targets,
            full,
            opts,
            total,
            &completed,
            &report,
        )
        .await?;
        if sync_sessions {
            self.prune_stale(MemorySource::Sessions, &all_sessions, &report)
                .await?;
            let mut flags = self.flags.lock().expect("flags lock poisoned");
            flags.sessions_dirty_files.clear();
            flags.sessions_dirty = false;
        }

        let report = report.lock().expect("report lock poisoned").clone();
        tracing::info!(
            files_indexed = report.files_indexed,
            files_unchanged = report.files_unchanged,
            files_removed = report.files_removed,
            chunks = report.chunks_indexed,
            errors = report.errors,
            "Sync pass complete"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn index_source_pass(
        &self,
        source: MemorySource,
        files: Vec<&FileEntry>,
        full: bool,
        opts: &SyncOptions,
        total: usize,
        completed: &Arc<AtomicUsize>,
        report: &Arc<StdMutex<SyncReport>>,
    ) -> Result<(), MemoryError> {
        if files.is_empty() {
            return Ok(());
        }
        let concurrency = self.embedder.index_concurrency().max(1);

        // An embedding failure aborts the pass (it would fail for every file);
        // anything else is logged and the pass keeps going.
        let failure: Arc<StdMutex<Option<MemoryError>>> = Arc::new(StdMutex::new(None));

        stream::iter(files)
            .for_each_concurrent(concurrency, |entry| {
                let completed = Arc::clone(completed);
                let report = Arc::clone(report);
                let failure = Arc::clone(&failure);
                async move {
                    if failure.lock().expect("failure lock poisoned").is_some() {
                        return;
                    }
                    match self.index_file(source, entry, full).await {
                        Ok(Some(chunks)) => {
                            let mut r = report.lock().expect("report lock poisoned");
                            r.files_indexed += 1;
                            r.chunks_indexed += chunks;
                        }
                        Ok(None) => {
                            report.lock().expect("report lock poisoned").files_unchanged += 1;
                        }
                        Err(error @ MemoryError::Embed(_)) => {
                            *failure.lock().expect("failure lock poisoned") = Some(error);
                        }
                        Err(error) => {
                            tracing::warn!(path = %entry.path, error = %error, "Failed to index file");
                            report.lock().expect("report lock poisoned").errors += 1;
                        }
                    }
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(progress) = &opts.progress {
                        progress(SyncProgress {
                            completed: done,
                            total,
                            label: entry.path.clone(),
                        });
                    }
                }
            })
            .await;

        if let Some(error) = failure.lock().expect("failure lock poisoned").take() {
            return Err(error);
        }
        Ok(())
    }

    /// Index one file if its content hash changed (or a full reindex is in
    /// progress). Returns the chunk count when the file was (re)indexed.
    async fn index_file(
        &self,
        source: MemorySource,
        entry: &FileEntry,
        full: bool,
    ) -> Result<Option<usize>, MemoryError> {
        let db = self.ctx.db();
        if !full {
            if let Some(existing) = db.get_file(source, &entry.path).await? {
                if existing.hash == entry.hash {
                    return Ok(None);
                }
            }
        }

        let chunking = self.ctx.settings.chunking;
        let mut chunks = match source {
            MemorySource::Memory => {
                chunk_markdown(&entry.content, chunking.tokens, chunking.overlap)
            }
            MemorySource::Sessions => {
                let rendered = render_transcript(&entry.content);
                let mut chunks =
                    chunk_markdown(&rendered.text, chunking.tokens, chunking.overlap);
                apply_line_map(&mut chunks, &rendered.line_map);
                chunks
            }
        };

        let provider = self.embedder.provider();
        clip_chunks(&mut chunks, provider.input_token_limit());
        let model = provider.model().to_string();

        let file_row = FileRow {
            path: entry.path.clone(),
            source,
            hash: entry.hash.clone(),
            mtime: entry.mtime,
            size: entry.size,
        };

        let embeddings = self
            .embedder
            .embed_chunks(&chunks, Some(&file_row), Some(source))
            .await?;

        let dims = embeddings.iter().find(|e| !e.is_empty()).map(|e| e.len());
        let vector_ready = match dims {
            Some(dims) => self.ctx.ensure_vector_ready(dims).await,
            // No vectors to write, but stale rows still need clearing if the
            // table is already there.
            None => {
                self.ctx.vector_table_ready().await
                    || db.has_vector_table().await.unwrap_or(false)
            }
        };

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| ChunkRecord {
                id: chunk_id(
                    source,
                    &entry.path,
                    chunk.start_line,
                    chunk.end_line,
                    &chunk.hash,
                    &model,
                ),
                path: entry.path.clone(),
                source,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                hash: chunk.hash.clone(),
                model: model.clone(),
                text: chunk.text.clone(),
                embedding,
            })
            .collect();

        let count = db
            .replace_file_chunks(&file_row, &records, self.ctx.fts_enabled(), vector_ready)
            .await?;

        if source == MemorySource::Sessions {
            self.session_deltas
                .lock()
                .expect("session deltas lock poisoned")
                .insert(
                    entry.abs.clone(),
                    SessionDelta {
                        last_size: entry.size,
                        pending_bytes: 0,
                        pending_messages: 0,
                    },
                );
        }

        Ok(Some(count))
    }

    /// Delete rows for files that left the active set.
    async fn prune_stale(
        &self,
        source: MemorySource,
        active: &[FileEntry],
        report: &Arc<StdMutex<SyncReport>>,
    ) -> Result<(), MemoryError> {
        let db = self.ctx.db();
        let active_paths: HashSet<&str> = active.iter().map(|e| e.path.as_str()).collect();
        let fts = self.ctx.fts_enabled();
        let vector = self.ctx.vector_table_ready().await
            || db.has_vector_table().await.unwrap_or(false);

        for file in db.list_files(source).await? {
            if !active_paths.contains(file.path.as_str()) {
                tracing::debug!(path = %file.path, %source, "Removing stale file from index");
                db.delete_file(source, &file.path, fts, vector).await?;
                report.lock().expect("report lock poisoned").files_removed += 1;
            }
        }
        Ok(())
    }

    // ---- enumeration ----------------------------------------------------

    async fn enumerate_memory_files(&self) -> Vec<FileEntry> {
        let workspace = &self.ctx.scope.workspace_dir;
        let mut candidates: Vec<PathBuf> = vec![
            workspace.join("MEMORY.md"),
            workspace.join("memory.md"),
        ];
        candidates.extend(collect_markdown_tree(&workspace.join("memory")));

        for extra in &self.ctx.settings.extra_paths {
            let expanded = crate::config::expand_user_path(extra);
            match expanded.symlink_metadata() {
                Ok(meta) if meta.file_type().is_symlink() => continue,
                Ok(meta) if meta.is_dir() => candidates.extend(collect_markdown_tree(&expanded)),
                Ok(_) => candidates.push(expanded),
                Err(_) => continue,
            }
        }

        self.read_entries(candidates).await
    }

    async fn enumerate_session_files(&self) -> Vec<FileEntry> {
        let dir = self.ctx.scope.session_transcripts_dir();
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let is_symlink = entry
                    .file_type()
                    .await
                    .map(|t| t.is_symlink())
                    .unwrap_or(true);
                if is_symlink {
                    continue;
                }
                if path.extension().is_some_and(|e| e == "jsonl") {
                    candidates.push(path);
                }
            }
        }
        candidates.sort();
        self.read_entries(candidates).await
    }

    async fn read_entries(&self, candidates: Vec<PathBuf>) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        for path in candidates {
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "Failed to read source file");
                    continue;
                }
            };
            let content = String::from_utf8_lossy(&bytes).into_owned();
            let key = normalize_path(&path);
            if !seen.insert(key.clone()) {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            entries.push(FileEntry {
                path: key,
                abs: path,
                hash: content_hash(&content),
                size: meta.len() as i64,
                mtime,
                content,
            });
        }
        entries
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e == "md" || e == "markdown")
}

/// Forward-slash normalized absolute path string, the key stored in `files`.
fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// All markdown files under a directory, symlinks skipped.
fn collect_markdown_tree(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .flatten()
    {
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        if is_markdown(entry.path()) {
            found.push(entry.path().to_path_buf());
        }
    }
    found
}

/// Count newline bytes in `[start, end)` of a file, reading 64 KiB slabs.
async fn count_newlines_in_range(
    path: &Path,
    start: i64,
    end: i64,
) -> Result<i64, std::io::Error> {
    if end <= start {
        return Ok(0);
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start.max(0) as u64))
        .await?;

    let mut remaining = (end - start.max(0)) as u64;
    let mut buf = vec![0u8; DELTA_SLAB];
    let mut newlines = 0i64;
    while remaining > 0 {
        let want = remaining.min(DELTA_SLAB as u64) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        newlines += buf[..read].iter().filter(|&&b| b == 0x0A).count() as i64;
        remaining -= read as u64;
    }
    Ok(newlines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_count_newlines_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, b"one\ntwo\nthree\n").unwrap();

        assert_eq!(count_newlines_in_range(&path, 0, 14).await.unwrap(), 3);
        // Range [4, 8) covers "two\n".
        assert_eq!(count_newlines_in_range(&path, 4, 8).await.unwrap(), 1);
        assert_eq!(count_newlines_in_range(&path, 8, 8).await.unwrap(), 0);
        assert_eq!(count_newlines_in_range(&path, 10, 4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_count_newlines_large_range_spans_slabs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.jsonl");
        // 3 slabs worth of 100-byte lines.
        let line = format!("{}\n", "x".repeat(99));
        let content = line.repeat(2000);
        std::fs::write(&path, &content).unwrap();

        let total = count_newlines_in_range(&path, 0, content.len() as i64)
            .await
            .unwrap();
        assert_eq!(total, 2000);
    }

    #[test]
    fn test_is_markdown() {
        assert!(is_markdown(Path::new("/a/b.md")));
        assert!(is_markdown(Path::new("notes.markdown")));
        assert!(!is_markdown(Path::new("notes.txt")));
        assert!(!is_markdown(Path::new("MEMORY")));
    }

    #[test]
    fn test_sync_reason_display() {
        assert_eq!(SyncReason::SessionDelta.to_string(), "session-delta");
        assert_eq!(SyncReason::SessionStart.to_string(), "session-start");
        assert_eq!(SyncReason::Watch.to_string(), "watch");
    }
}
