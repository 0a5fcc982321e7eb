//! Web-search boundary

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Web-search capability: ordered result texts for a query.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>>;
}

/// Search API response (the subset we read).
#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    content: String,
}

/// HTTP web-search client.
pub struct HttpSearch {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSearch {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AgentError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.to_string(),
            api_key: api_key.map(String::from),
            client,
        })
    }
}

#[async_trait]
impl WebSearch for HttpSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>> {
        let url = format!("{}/search", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": max_results,
            }))
            .send()
            .await
            .map_err(|e| AgentError::capability("web_search", e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::capability(
                "web_search",
                format!("search request failed with status {}", response.status()),
            ));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| AgentError::capability("web_search", format!("malformed response: {e}")))?;

        debug!("web search returned {} results", body.results.len());
        Ok(body
            .results
            .into_iter()
            .take(max_results)
            .map(|r| r.content)
            .collect())
    }
}
