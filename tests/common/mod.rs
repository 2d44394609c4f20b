//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::TestWorkspace;
//! ```
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use recall::{
    EmbedError, EmbeddingProvider, MemoryIndexManager, MemoryScope, MemorySettings,
    ProviderConfig, ProviderFactory, ProviderId,
};
use tempfile::TempDir;

/// Topics the mock embedder can tell apart. One dimension per keyword plus a
/// constant bias dimension so no embedding is ever all-zero.
pub const KEYWORDS: [&str; 8] = [
    "rust", "python", "database", "memory", "search", "network", "cooking", "music",
];

pub const MOCK_DIMS: usize = KEYWORDS.len() + 1;

/// Bag-of-keywords embedding: lets vector search distinguish topics in tests
/// while staying fully deterministic.
pub fn keyword_embedding(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v: Vec<f32> = KEYWORDS
        .iter()
        .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
        .collect();
    v.push(0.05);
    v
}

/// Shared knobs for the mock providers a factory hands out.
#[derive(Default)]
pub struct ProviderState {
    /// Every text embedded (query or chunk) bumps this.
    pub embed_calls: AtomicUsize,
    /// When set, embeds fail with a retryable rate-limit error.
    pub fail: AtomicBool,
    /// Provider families that always fail regardless of `fail`.
    pub broken_families: std::sync::Mutex<Vec<ProviderId>>,
}

impl ProviderState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn break_family(&self, id: ProviderId) {
        self.broken_families
            .lock()
            .expect("broken families lock")
            .push(id);
    }

    fn family_broken(&self, id: ProviderId) -> bool {
        self.broken_families
            .lock()
            .expect("broken families lock")
            .contains(&id)
    }
}

pub struct MockProvider {
    id: ProviderId,
    model: String,
    state: Arc<ProviderState>,
}

impl MockProvider {
    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if self.state.fail.load(Ordering::SeqCst) || self.state.family_broken(self.id) {
            return Err(EmbedError::RateLimited("mock rate limit".to_string()));
        }
        self.state.embed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(keyword_embedding(text))
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> Option<usize> {
        Some(MOCK_DIMS)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_one(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }
}

/// Factory producing [`MockProvider`]s that share one [`ProviderState`].
pub fn mock_factory(state: Arc<ProviderState>) -> ProviderFactory {
    Arc::new(move |config: &ProviderConfig| {
        Ok(Arc::new(MockProvider {
            id: config.id,
            model: config.resolved_model().to_string(),
            state: Arc::clone(&state),
        }) as Arc<dyn EmbeddingProvider>)
    })
}

/// How the mock remote-batch adapter behaves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum BatchBehavior {
    /// Jobs complete on the first poll.
    Complete,
    /// Job creation fails with a generic provider error.
    FailCreate,
    /// Job creation reports the batch API as permanently unavailable.
    Unavailable,
}

pub struct BatchState {
    pub create_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub behavior: std::sync::Mutex<BatchBehavior>,
}

impl BatchState {
    pub fn new(behavior: BatchBehavior) -> Arc<Self> {
        Arc::new(BatchState {
            create_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            behavior: std::sync::Mutex::new(behavior),
        })
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn set_behavior(&self, behavior: BatchBehavior) {
        *self.behavior.lock().expect("behavior lock") = behavior;
    }
}

pub struct MockBatchAdapter {
    state: Arc<BatchState>,
    jobs: std::sync::Mutex<
        std::collections::HashMap<String, std::collections::HashMap<String, Vec<f32>>>,
    >,
}

#[async_trait]
impl recall::RemoteBatchAdapter for MockBatchAdapter {
    async fn create_batch(
        &self,
        requests: &[recall::BatchRequest],
    ) -> Result<String, EmbedError> {
        self.state.create_calls.fetch_add(1, Ordering::SeqCst);
        match *self.state.behavior.lock().expect("behavior lock") {
            BatchBehavior::FailCreate => {
                Err(EmbedError::Provider("batch backend rejected the job".into()))
            }
            BatchBehavior::Unavailable => {
                Err(EmbedError::BatchUnavailable("no batch api on this plan".into()))
            }
            BatchBehavior::Complete => {
                let results = requests
                    .iter()
                    .map(|r| (r.custom_id.clone(), keyword_embedding(&r.text)))
                    .collect();
                let job_id = format!("job-{}", self.state.creates());
                self.jobs
                    .lock()
                    .expect("jobs lock")
                    .insert(job_id.clone(), results);
                Ok(job_id)
            }
        }
    }

    async fn poll_batch(&self, job_id: &str) -> Result<recall::BatchPoll, EmbedError> {
        self.state.poll_calls.fetch_add(1, Ordering::SeqCst);
        match self.jobs.lock().expect("jobs lock").get(job_id) {
            Some(results) => Ok(recall::BatchPoll::Completed(results.clone())),
            None => Err(EmbedError::Provider(format!("unknown batch job {job_id}"))),
        }
    }
}

/// A mock provider that also exposes a remote batch adapter.
pub struct MockBatchProvider {
    inner: MockProvider,
    adapter: MockBatchAdapter,
}

#[async_trait]
impl EmbeddingProvider for MockBatchProvider {
    fn id(&self) -> ProviderId {
        self.inner.id
    }

    fn model(&self) -> &str {
        &self.inner.model
    }

    fn dimensions(&self) -> Option<usize> {
        Some(MOCK_DIMS)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.inner.embed_one(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts.iter().map(|t| self.inner.embed_one(t)).collect()
    }

    fn batch_adapter(&self) -> Option<&dyn recall::RemoteBatchAdapter> {
        Some(&self.adapter)
    }
}

/// Factory for batch-capable providers sharing a [`ProviderState`] for the
/// online path and a [`BatchState`] for the batch path.
pub fn batch_factory(state: Arc<ProviderState>, batch: Arc<BatchState>) -> ProviderFactory {
    Arc::new(move |config: &ProviderConfig| {
        Ok(Arc::new(MockBatchProvider {
            inner: MockProvider {
                id: config.id,
                model: config.resolved_model().to_string(),
                state: Arc::clone(&state),
            },
            adapter: MockBatchAdapter {
                state: Arc::clone(&batch),
                jobs: std::sync::Mutex::new(std::collections::HashMap::new()),
            },
        }) as Arc<dyn EmbeddingProvider>)
    })
}

/// A workspace + agent-state tree in a temp directory, with settings wired to
/// an index database inside it. Triggers are off by default so tests control
/// when syncs happen.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub scope: MemoryScope,
    pub settings: MemorySettings,
    pub state: Arc<ProviderState>,
}

/// Opt-in test logging: `RECALL_TEST_LOG=debug cargo test -- --nocapture`.
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("RECALL_TEST_LOG"))
            .try_init();
    });
}

impl TestWorkspace {
    pub fn new(agent_id: &str) -> Self {
        init_test_logging();
        let dir = TempDir::new().expect("create temp dir");
        let workspace_dir = dir.path().join("workspace");
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(workspace_dir.join("memory")).expect("create memory dir");
        std::fs::create_dir_all(state_dir.join("agents").join(agent_id).join("sessions"))
            .expect("create sessions dir");

        let mut settings = MemorySettings::default();
        settings.store.path = dir.path().join("index.db");
        settings.sync.watch = false;
        settings.sync.on_search = false;
        settings.sync.on_session_start = false;

        TestWorkspace {
            scope: MemoryScope {
                agent_id: agent_id.to_string(),
                workspace_dir,
                state_dir,
            },
            settings,
            state: ProviderState::new(),
            dir,
        }
    }

    pub async fn manager(&self) -> Arc<MemoryIndexManager> {
        MemoryIndexManager::open(
            self.scope.clone(),
            self.settings.clone(),
            mock_factory(Arc::clone(&self.state)),
        )
        .await
        .expect("open manager")
    }

    pub fn memory_path(&self, name: &str) -> PathBuf {
        self.scope.workspace_dir.join("memory").join(name)
    }

    pub fn write_memory(&self, name: &str, content: &str) -> PathBuf {
        let path = self.memory_path(name);
        std::fs::write(&path, content).expect("write memory file");
        path
    }

    pub fn session_path(&self, name: &str) -> PathBuf {
        self.scope.session_transcripts_dir().join(name)
    }

    pub fn write_session(&self, name: &str, content: &str) -> PathBuf {
        let path = self.session_path(name);
        std::fs::write(&path, content).expect("write session file");
        path
    }

    pub fn append_session(&self, name: &str, content: &str) -> PathBuf {
        use std::io::Write;
        let path = self.session_path(name);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .expect("open session file");
        file.write_all(content.as_bytes()).expect("append session");
        path
    }

    /// Independent store handle onto the same database for inspection.
    pub async fn inspect_store(&self) -> recall::Store {
        recall::Store::open(&self.settings.store.path)
            .await
            .expect("open inspection store")
    }

    /// Stored-path key for a file (forward-slash absolute path).
    pub fn stored_path(&self, path: &PathBuf) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    /// Leftover reindex scratch files, if any.
    pub fn scratch_files(&self) -> Vec<String> {
        std::fs::read_dir(self.dir.path())
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|name| name.contains(".tmp-") || name.contains(".backup-"))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A JSONL transcript with `lines` one-line user messages about `topic`.
pub fn transcript(topic: &str, lines: usize) -> String {
    (0..lines)
        .map(|i| {
            format!(
                "{{\"role\":\"user\",\"content\":\"note {i} about {topic}\"}}\n"
            )
        })
        .collect()
}
