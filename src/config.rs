//! Resolved memory-index settings
//!
//! The host application owns configuration *loading* (files, env, CLI). This
//! crate consumes a fully resolved [`MemorySettings`] value. The structs here
//! are serde-friendly so hosts can deserialize them straight out of a TOML or
//! JSON config section.
//!
//! ```toml
//! [memory]
//! sources = ["memory", "sessions"]
//!
//! [memory.store]
//! path = "~/.recall/index.db"
//!
//! [memory.chunking]
//! tokens = 512
//! overlap = 64
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::provider::{ProviderConfig, ProviderId};

/// Which content streams feed the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    /// Long-lived memory files (MEMORY.md, memory/ tree, extra paths).
    Memory,
    /// Append-only session transcripts.
    Sessions,
}

impl fmt::Display for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySource::Memory => write!(f, "memory"),
            MemorySource::Sessions => write!(f, "sessions"),
        }
    }
}

impl FromStr for MemorySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(MemorySource::Memory),
            "sessions" => Ok(MemorySource::Sessions),
            other => Err(format!("unknown memory source '{other}'")),
        }
    }
}

/// Store location settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Index database path. `~` is expanded by the crate.
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            path: PathBuf::from("~/.recall/index.db"),
        }
    }
}

/// Chunking parameters. The token unit is the byte estimate used across the
/// crate (UTF-8 bytes / 4); chunker and batcher share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    /// Approximate chunk size in estimated tokens.
    pub tokens: usize,
    /// Approximate overlap between consecutive chunks, same unit.
    pub overlap: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        ChunkSettings {
            tokens: 512,
            overlap: 64,
        }
    }
}

/// Session-delta thresholds: how much appended transcript content must
/// accumulate before a session file is re-indexed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDeltaSettings {
    /// Pending appended bytes that trigger a re-index. `<= 0` means any
    /// non-zero pending amount triggers.
    pub delta_bytes: i64,
    /// Pending appended newline count that triggers a re-index.
    pub delta_messages: i64,
}

impl Default for SessionDeltaSettings {
    fn default() -> Self {
        SessionDeltaSettings {
            delta_bytes: 8192,
            delta_messages: 10,
        }
    }
}

/// Sync scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Watch memory files and mark the index dirty on changes.
    pub watch: bool,
    /// Watcher debounce window; also the write-settle stability threshold.
    pub watch_debounce_ms: u64,
    /// Periodic sync interval. 0 disables the timer.
    pub interval_minutes: u64,
    /// Eagerly sync once per session key when a session starts.
    pub on_session_start: bool,
    /// Fire-and-forget a sync when a search observes a dirty index.
    pub on_search: bool,
    pub session_delta: SessionDeltaSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            watch: true,
            watch_debounce_ms: 1500,
            interval_minutes: 0,
            on_session_start: false,
            on_search: true,
            session_delta: SessionDeltaSettings::default(),
        }
    }
}

/// Remote batch submission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBatchSettings {
    pub enabled: bool,
    /// Per-file indexing concurrency while batch mode is active.
    pub concurrency: usize,
    /// Budget for a single remote batch job.
    pub timeout_minutes: u64,
}

impl Default for RemoteBatchSettings {
    fn default() -> Self {
        RemoteBatchSettings {
            enabled: false,
            concurrency: 2,
            timeout_minutes: 60,
        }
    }
}

/// Fallback provider selection: a provider family, or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackProvider {
    #[default]
    None,
    OpenAi,
    Gemini,
    Voyage,
    Local,
}

impl FallbackProvider {
    /// The provider family this fallback names, if any.
    pub fn provider_id(&self) -> Option<ProviderId> {
        match self {
            FallbackProvider::None => None,
            FallbackProvider::OpenAi => Some(ProviderId::OpenAi),
            FallbackProvider::Gemini => Some(ProviderId::Gemini),
            FallbackProvider::Voyage => Some(ProviderId::Voyage),
            FallbackProvider::Local => Some(ProviderId::Local),
        }
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub id: ProviderId,
    /// Model override; each provider family has a default.
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Non-secret connection headers. Only header *names* enter the provider
    /// key hash.
    pub headers: std::collections::BTreeMap<String, String>,
    pub fallback: FallbackProvider,
    pub remote_batch: RemoteBatchSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            id: ProviderId::Local,
            model: None,
            base_url: None,
            headers: Default::default(),
            fallback: FallbackProvider::None,
            remote_batch: RemoteBatchSettings::default(),
        }
    }
}

impl ProviderSettings {
    /// The provider config for the currently selected primary provider.
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            id: self.id,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            headers: self.headers.clone(),
        }
    }

    /// The provider config the fallback would use: same connection headers,
    /// fallback family, family-default model.
    pub fn fallback_config(&self) -> Option<ProviderConfig> {
        let id = self.fallback.provider_id()?;
        Some(ProviderConfig {
            id,
            model: None,
            base_url: None,
            headers: self.headers.clone(),
        })
    }
}

/// Hybrid ranking settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSettings {
    pub enabled: bool,
    pub vector_weight: f32,
    pub text_weight: f32,
    /// Candidate pool size per leg, as a multiple of `max_results`.
    pub candidate_multiplier: f32,
}

impl Default for HybridSettings {
    fn default() -> Self {
        HybridSettings {
            enabled: true,
            vector_weight: 0.7,
            text_weight: 0.3,
            candidate_multiplier: 4.0,
        }
    }
}

/// Query-path settings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub hybrid: HybridSettings,
}

/// Embedding-cache settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Row cap for the persistent embedding cache; LRU eviction above it.
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            max_entries: 50_000,
        }
    }
}

/// Fully resolved settings for one memory index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub sources: Vec<MemorySource>,
    pub store: StoreSettings,
    pub chunking: ChunkSettings,
    pub sync: SyncSettings,
    pub provider: ProviderSettings,
    pub query: QuerySettings,
    pub cache: CacheSettings,
    /// Additional memory files or directories outside the workspace layout.
    pub extra_paths: Vec<PathBuf>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        MemorySettings {
            sources: vec![MemorySource::Memory, MemorySource::Sessions],
            store: StoreSettings::default(),
            chunking: ChunkSettings::default(),
            sync: SyncSettings::default(),
            provider: ProviderSettings::default(),
            query: QuerySettings::default(),
            cache: CacheSettings::default(),
            extra_paths: Vec::new(),
        }
    }
}

impl MemorySettings {
    /// Whether a source is enabled.
    pub fn source_enabled(&self, source: MemorySource) -> bool {
        self.sources.contains(&source)
    }

    /// Stable hash over the resolved settings; part of the process-wide
    /// manager cache key so distinct configurations get distinct managers.
    pub fn settings_hash(&self) -> String {
        // Struct serialization order is declaration order, so the JSON
        // encoding is canonical for hashing purposes.
        let encoded = serde_json::to_string(self).unwrap_or_default();
        blake3::hash(encoded.as_bytes()).to_hex()[..16].to_string()
    }

    /// The index database path with `~` expanded.
    pub fn store_path(&self) -> PathBuf {
        expand_user_path(&self.store.path)
    }
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_user_path(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = MemorySettings::default();
        assert!(settings.source_enabled(MemorySource::Memory));
        assert!(settings.source_enabled(MemorySource::Sessions));
        assert_eq!(settings.chunking.tokens, 512);
        assert_eq!(settings.chunking.overlap, 64);
        assert!(settings.sync.watch);
        assert_eq!(settings.sync.watch_debounce_ms, 1500);
        assert_eq!(settings.cache.max_entries, 50_000);
    }

    #[test]
    fn test_settings_hash_stable() {
        let a = MemorySettings::default();
        let b = MemorySettings::default();
        assert_eq!(a.settings_hash(), b.settings_hash());

        let mut c = MemorySettings::default();
        c.chunking.tokens = 256;
        assert_ne!(a.settings_hash(), c.settings_hash());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let settings: MemorySettings = toml::from_str(
            r#"
sources = ["memory"]

[chunking]
tokens = 256

[provider]
id = "openai"
fallback = "gemini"
"#,
        )
        .unwrap();
        assert_eq!(settings.sources, vec![MemorySource::Memory]);
        assert_eq!(settings.chunking.tokens, 256);
        assert_eq!(settings.chunking.overlap, 64);
        assert_eq!(settings.provider.id, ProviderId::OpenAi);
        assert_eq!(
            settings.provider.fallback.provider_id(),
            Some(ProviderId::Gemini)
        );
    }

    #[test]
    fn test_fallback_config_uses_family_default_model() {
        let mut provider = ProviderSettings {
            id: ProviderId::OpenAi,
            model: Some("text-embedding-3-large".into()),
            fallback: FallbackProvider::Gemini,
            ..Default::default()
        };
        provider.headers.insert("x-team".into(), "agents".into());

        let fb = provider.fallback_config().unwrap();
        assert_eq!(fb.id, ProviderId::Gemini);
        assert_eq!(fb.model, None);
        assert!(fb.headers.contains_key("x-team"));
        assert!(ProviderSettings::default().fallback_config().is_none());
    }

    #[test]
    fn test_expand_user_path() {
        let expanded = expand_user_path(Path::new("~/x/index.db"));
        assert!(!expanded.starts_with("~"));
        let untouched = expand_user_path(Path::new("/abs/index.db"));
        assert_eq!(untouched, PathBuf::from("/abs/index.db"));
    }
}
