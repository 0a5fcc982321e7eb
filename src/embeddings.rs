//! Embedding boundary
//!
//! Text is embedded through an external service; the result is always fitted
//! to the configured dimension before anything downstream sees it. Silent
//! dimension mismatches are a likely source of subtle bugs, so the fit rule
//! is deterministic and applied in exactly one place: truncate when longer,
//! zero-pad when shorter.
//!
//! Includes an LRU cache for query embeddings to reduce latency.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Embedding capability consumed by the cache index and both loops.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a piece of text into a float vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Fit a vector to `dim`: truncate if longer, zero-pad if shorter.
pub fn fit_dimension(mut v: Vec<f32>, dim: usize) -> Vec<f32> {
    v.truncate(dim);
    v.resize(dim, 0.0);
    v
}

/// Calculate cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Embedding client configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings endpoint
    pub base_url: String,
    /// Bearer token, if required
    pub api_key: Option<String>,
    /// Embedding model name
    pub model: String,
    /// Dimension every returned vector is fitted to
    pub dimension: usize,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.jina.ai/v1".to_string(),
            api_key: None,
            model: "jina-embeddings-v3".to_string(),
            dimension: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Embeddings API response (the subset we read).
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// HTTP embedding client with an LRU cache in front.
pub struct HttpEmbedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
    /// LRU cache for embeddings (max 1000 entries, 1 hour TTL)
    cache: Cache<String, Vec<f32>>,
}

impl HttpEmbedder {
    /// Create a new embedding client.
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::internal(format!("failed to build HTTP client: {e}")))?;

        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Ok(Self {
            config,
            client,
            cache,
        })
    }

    async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.config.base_url);

        let mut request = self.client.post(&url).json(&serde_json::json!({
            "model": self.config.model,
            "input": [text],
        }));

        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Oracle(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AgentError::Oracle(format!(
                "embedding request failed with status {}",
                response.status()
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Oracle(format!("malformed embedding response: {e}")))?;

        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AgentError::Oracle("embedding response had no data".to_string()))?;

        Ok(fit_dimension(embedding, self.config.dimension))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cache_key = text.trim().to_string();

        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let embedding = self.embed_uncached(text).await?;
        debug!("embedded {} chars", text.len());
        self.cache.insert(cache_key, embedding.clone()).await;

        Ok(embedding)
    }
}
