//! Configuration management

use anyhow::Result;
use std::time::Duration;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the chat-completions oracle
    pub oracle_url: String,

    /// API key for the oracle (optional for local backends)
    pub oracle_api_key: Option<String>,

    /// Oracle model name
    pub oracle_model: String,

    /// Oracle request timeout
    pub oracle_timeout: Duration,

    /// Base URL of the embedding service
    pub embed_url: String,

    /// API key for the embedding service
    pub embed_api_key: Option<String>,

    /// Embedding model name
    pub embed_model: String,

    /// Embedding dimension the cache index is configured for
    pub embedding_dim: usize,

    /// Base URL of the document-partitioning service
    pub partitioner_url: String,

    /// API key for the partitioning service
    pub partitioner_api_key: Option<String>,

    /// Base URL of the web-search service
    pub search_url: String,

    /// API key for the web-search service
    pub search_api_key: Option<String>,

    /// Pending-buffer size that triggers a cache flush
    pub cache_batch_size: usize,

    /// Absolute distance cutoff for cache search results
    pub cache_cutoff: f32,

    /// Cosine-similarity threshold for cache hits and utility-query dedup
    pub similarity_threshold: f32,

    /// Step budget for one retrieval-reasoning invocation
    pub max_steps: usize,

    /// Patch attempts before code reflection gives up
    pub reflexion_limit: usize,

    /// SELECT iterations before the supervisor gives up on a query
    pub max_select_steps: usize,

    /// Pages pulled into the document index per query
    pub top_k: usize,

    /// Refinement iterations when synthesizing a tool
    pub synth_iterations: usize,

    /// Idle time before a session is evicted
    pub session_idle_timeout: Duration,

    /// Listen address for the HTTP surface
    pub bind_addr: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            oracle_url: env_or("RAGPILOT_ORACLE_URL", "https://api.groq.com/openai/v1"),
            oracle_api_key: std::env::var("RAGPILOT_ORACLE_API_KEY").ok(),
            oracle_model: env_or("RAGPILOT_ORACLE_MODEL", "llama-3.3-70b-versatile"),
            oracle_timeout: Duration::from_secs(env_parse("RAGPILOT_ORACLE_TIMEOUT", 60)),
            embed_url: env_or("RAGPILOT_EMBED_URL", "https://api.jina.ai/v1"),
            embed_api_key: std::env::var("RAGPILOT_EMBED_API_KEY").ok(),
            embed_model: env_or("RAGPILOT_EMBED_MODEL", "jina-embeddings-v3"),
            embedding_dim: env_parse("RAGPILOT_EMBEDDING_DIM", 1024),
            partitioner_url: env_or("RAGPILOT_PARTITIONER_URL", "http://localhost:8000"),
            partitioner_api_key: std::env::var("RAGPILOT_PARTITIONER_API_KEY").ok(),
            search_url: env_or("RAGPILOT_SEARCH_URL", "https://api.tavily.com"),
            search_api_key: std::env::var("RAGPILOT_SEARCH_API_KEY").ok(),
            cache_batch_size: env_parse("RAGPILOT_CACHE_BATCH_SIZE", 16),
            cache_cutoff: env_parse("RAGPILOT_CACHE_CUTOFF", 0.8),
            similarity_threshold: env_parse("RAGPILOT_SIMILARITY_THRESHOLD", 0.8),
            max_steps: env_parse("RAGPILOT_MAX_STEPS", 10),
            reflexion_limit: env_parse("RAGPILOT_REFLEXION_LIMIT", 3),
            max_select_steps: env_parse("RAGPILOT_MAX_SELECT_STEPS", 16),
            top_k: env_parse("RAGPILOT_TOP_K", 5),
            synth_iterations: env_parse("RAGPILOT_SYNTH_ITERATIONS", 1),
            session_idle_timeout: Duration::from_secs(env_parse(
                "RAGPILOT_SESSION_IDLE_SECS",
                1800,
            )),
            bind_addr: env_or("RAGPILOT_BIND_ADDR", "0.0.0.0:5000"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.cache_batch_size, 16);
        assert_eq!(config.reflexion_limit, 3);
        assert!(config.embedding_dim > 0);
    }
}
