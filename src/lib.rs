//! # recall - per-agent memory search
//!
//! A semantic + lexical search engine over two streams of Markdown-shaped
//! content: long-lived memory files (`MEMORY.md`, the `memory/` tree, extra
//! paths) and append-only session transcripts. Files are split into
//! overlapping chunks, embedded through a pluggable provider, and served by
//! hybrid queries that fuse cosine-similarity vector search with BM25
//! keyword search over SQLite.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use recall::{MemoryIndexManager, MemoryScope, MemorySettings, SearchOptions, SyncOptions};
//!
//! # async fn run(factory: recall::ProviderFactory) -> anyhow::Result<()> {
//! let scope = MemoryScope {
//!     agent_id: "main".into(),
//!     workspace_dir: "/home/me/project".into(),
//!     state_dir: "/home/me/.agent".into(),
//! };
//! let manager = MemoryIndexManager::get(scope, MemorySettings::default(), factory).await?;
//!
//! manager.sync(SyncOptions { force: true, ..Default::default() }).await?;
//! let hits = manager.search("how did we configure retries?", SearchOptions::default()).await;
//! for hit in hits {
//!     println!("{:.2} {}:{}-{}", hit.score, hit.path, hit.start_line, hit.end_line);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Indexing is incremental (content-hash change detection) and scheduled by a
//! syncer that watches the filesystem, listens for transcript appends, and
//! optionally ticks on an interval. Changing the provider, model, or chunking
//! settings triggers a full reindex into a scratch database that is swapped
//! in atomically.

pub mod chunker;
pub mod config;
pub mod embedding;
pub mod provider;
pub mod search;
pub mod session;
pub mod store;

pub(crate) mod manager;
pub(crate) mod sync;

pub use chunker::{chunk_markdown, Chunk, LineMap};
pub use config::{
    CacheSettings, ChunkSettings, FallbackProvider, HybridSettings, MemorySettings, MemorySource,
    ProviderSettings, QuerySettings, RemoteBatchSettings, SessionDeltaSettings, StoreSettings,
    SyncSettings,
};
pub use embedding::{EmbeddingManager, EmbeddingStatus};
pub use manager::{
    MemoryError, MemoryIndexManager, MemoryIndexStatus, MemoryScope, MemorySearchResult,
    SearchOptions,
};
pub use provider::{
    provider_key, BatchPoll, BatchRequest, EmbedError, EmbeddingProvider, ProviderConfig,
    ProviderFactory, ProviderId, RemoteBatchAdapter,
};
pub use session::{
    emit_session_transcript_update, resolve_session_transcripts_dir_for_agent,
    subscribe_session_transcript_updates, SessionTranscriptEvent,
};
pub use store::{IndexMeta, IndexStats, Store};
pub use sync::{ProgressFn, SyncOptions, SyncProgress, SyncReason, SyncReport};
