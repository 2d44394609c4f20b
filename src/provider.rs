//! Embedding provider interface
//!
//! Transport lives in the host: this crate only sees the [`EmbeddingProvider`]
//! object trait and the [`ProviderFactory`] used to construct providers (and
//! to reconstruct them when fallback activates). Errors carry a structured
//! kind so retryability does not depend on string matching; the message
//! classifier remains as a last resort for providers that only surface text.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider families understood by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Gemini,
    Voyage,
    #[default]
    Local,
}

impl ProviderId {
    /// Default embedding model for the family.
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "text-embedding-3-small",
            ProviderId::Gemini => "gemini-embedding-001",
            ProviderId::Voyage => "voyage-3.5-lite",
            ProviderId::Local => "nomic-embed-text-v1.5",
        }
    }

    /// Remote providers get tighter per-call budgets than local inference.
    pub fn is_remote(&self) -> bool {
        !matches!(self, ProviderId::Local)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Gemini => "gemini",
            ProviderId::Voyage => "voyage",
            ProviderId::Local => "local",
        };
        write!(f, "{s}")
    }
}

/// Connection parameters for constructing one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub id: ProviderId,
    /// Model override; `None` selects the family default.
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub fn resolved_model(&self) -> &str {
        self.model.as_deref().unwrap_or(self.id.default_model())
    }
}

/// Stable, non-secret identity hash for a provider configuration.
///
/// Covers the provider family, model, base URL, and the *names* of connection
/// headers. Header values never enter the hash: authorization material must
/// not leak into the index metadata.
pub fn provider_key(config: &ProviderConfig) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(config.id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(config.resolved_model().as_bytes());
    hasher.update(b"|");
    hasher.update(config.base_url.as_deref().unwrap_or("").as_bytes());
    for name in config.headers.keys() {
        hasher.update(b"|");
        hasher.update(name.as_bytes());
    }
    hasher.finalize().to_hex()[..16].to_string()
}

/// Embedding failure, classified by kind.
#[derive(Error, Debug, Clone)]
pub enum EmbedError {
    #[error("embedding rate limited: {0}")]
    RateLimited(String),
    #[error("embedding server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
    #[error("batch embeddings not available: {0}")]
    BatchUnavailable(String),
    #[error("invalid embedding request: {0}")]
    InvalidRequest(String),
    #[error("embedding provider error: {0}")]
    Provider(String),
}

/// Message-level retryability classifier, kept as the fallback for providers
/// that only surface opaque error text.
static RETRYABLE_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)rate.?limit|too many requests|\b429\b|\b5\d{2}\b|resource has been exhausted|cloudflare|overloaded",
    )
    .expect("retryable pattern is valid")
});

impl EmbedError {
    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbedError::RateLimited(_) => true,
            EmbedError::Server { status, .. } => (500..600).contains(status),
            EmbedError::Timeout(_) => false,
            EmbedError::BatchUnavailable(_) => false,
            EmbedError::InvalidRequest(_) => false,
            EmbedError::Provider(message) => RETRYABLE_MESSAGE.is_match(message),
        }
    }
}

/// One request inside a remote batch job.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Stable id the adapter echoes back with each result vector.
    pub custom_id: String,
    pub text: String,
}

/// Poll result for a remote batch job.
#[derive(Debug, Clone)]
pub enum BatchPoll {
    Pending,
    Completed(HashMap<String, Vec<f32>>),
    Failed(EmbedError),
}

/// Remote batch adapter: submit many embedding requests as one provider-side
/// job and poll it to completion. The embedding manager owns the poll loop
/// and its timeout.
#[async_trait]
pub trait RemoteBatchAdapter: Send + Sync {
    async fn create_batch(&self, requests: &[BatchRequest]) -> Result<String, EmbedError>;
    async fn poll_batch(&self, job_id: &str) -> Result<BatchPoll, EmbedError>;
}

/// An embedding provider instance.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn id(&self) -> ProviderId;
    fn model(&self) -> &str;

    /// Embedding dimensionality, when the provider knows it up front.
    fn dimensions(&self) -> Option<usize> {
        None
    }

    /// Per-input token cap; chunks beyond it are clipped before embedding.
    fn input_token_limit(&self) -> usize {
        8192
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Embed many texts; result vectors are aligned with the input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Remote batch adapter, when the provider supports asynchronous jobs.
    fn batch_adapter(&self) -> Option<&dyn RemoteBatchAdapter> {
        None
    }
}

/// Host-supplied provider constructor. Invoked once at manager construction
/// and again if fallback activates.
pub type ProviderFactory =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> + Send + Sync>;
