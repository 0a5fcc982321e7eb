//! Utility query generation
//!
//! Derives 1-2 extra questions from a freshly retrieved chunk so that future
//! semantically related sub-queries hit the cache even when worded
//! differently. Candidates are deduplicated against already cached queries
//! and against each other by embedding cosine similarity.

use crate::embeddings::{cosine_similarity, Embedder};
use crate::oracle::Oracle;
use crate::prompts;
use crate::tools::extract_json_object;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Generates, filters and deduplicates utility queries.
pub struct UtilityQueryGenerator {
    oracle: Arc<dyn Oracle>,
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f32,
}

impl UtilityQueryGenerator {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        embedder: Arc<dyn Embedder>,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            oracle,
            embedder,
            similarity_threshold,
        }
    }

    /// Generate up to `max_queries` queries answerable from `chunk`,
    /// dropping any candidate too similar to `existing` or to an earlier
    /// accepted candidate. Generation is best-effort: any failure yields an
    /// empty list.
    pub async fn generate(
        &self,
        chunk: &str,
        max_queries: usize,
        existing: &[String],
    ) -> Vec<String> {
        let truncated: String = chunk.chars().take(1000).collect();

        let raw = match self
            .oracle
            .invoke(&prompts::utility_query_prompt(max_queries, &truncated))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("utility query generation failed: {e}");
                return Vec::new();
            }
        };

        let candidates = parse_queries(&raw, max_queries);
        if candidates.is_empty() {
            debug!("utility query response had no usable queries");
            return Vec::new();
        }

        self.filter(candidates, existing).await
    }

    async fn filter(&self, candidates: Vec<String>, existing: &[String]) -> Vec<String> {
        let mut accepted: Vec<String> = Vec::new();

        'candidates: for candidate in candidates {
            if candidate.is_empty() {
                continue;
            }
            for other in existing.iter().chain(accepted.iter()) {
                if self.similarity(&candidate, other).await > self.similarity_threshold {
                    continue 'candidates;
                }
            }
            accepted.push(candidate);
        }

        accepted
    }

    async fn similarity(&self, a: &str, b: &str) -> f32 {
        let Ok(emb_a) = self.embedder.embed(a).await else {
            return 0.0;
        };
        let Ok(emb_b) = self.embedder.embed(b).await else {
            return 0.0;
        };
        cosine_similarity(&emb_a, &emb_b)
    }
}

/// Parse the strict `{"query_1": ..}` shape, tolerating surrounding prose.
fn parse_queries(raw: &str, max_queries: usize) -> Vec<String> {
    let object: Option<Value> = serde_json::from_str(raw)
        .ok()
        .or_else(|| extract_json_object(raw).and_then(|s| serde_json::from_str(s).ok()));

    let Some(Value::Object(map)) = object else {
        return Vec::new();
    };

    (1..=max_queries)
        .filter_map(|i| {
            map.get(&format!("query_{i}"))
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .collect()
}
