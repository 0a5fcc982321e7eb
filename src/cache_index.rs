//! Semantic result cache
//!
//! Batched-insert approximate-nearest-neighbor index mapping embedded text
//! chunks to their metadata. Additions are buffered and flushed into the
//! graph in batches; `search` flushes the pending buffer first, so an entry
//! added just before a search is always visible to it. A flush is
//! all-or-nothing: a single vector of the wrong dimension fails the whole
//! batch and leaves the buffer untouched, and the following search degrades
//! to empty results instead of silently omitting recent entries.

use crate::embeddings::{cosine_similarity, fit_dimension, Embedder};
use crate::error::{AgentError, Result};
use hnsw::{Hnsw, Searcher};
use rand::seq::SliceRandom;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use space::{Metric, Neighbor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Candidate pool handed to the graph per query.
const EF_SEARCH: usize = 24;

/// Cosine distance over fixed-length vectors, mapped monotonically to bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineDistance;

impl Metric<Vec<f32>> for CosineDistance {
    type Unit = u32;

    fn distance(&self, a: &Vec<f32>, b: &Vec<f32>) -> u32 {
        // 1 - cos is non-negative, so the bit pattern preserves ordering.
        let d = (1.0 - cosine_similarity(a, b)).max(0.0);
        d.to_bits()
    }
}

type ChunkGraph = Hnsw<CosineDistance, Vec<f32>, Pcg64, 12, 24>;

/// Metadata stored alongside every indexed chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// The query that produced this chunk
    pub query: String,
    /// Kind of query: "retrieval", "utility", "conversation", ...
    pub query_type: String,
    /// The query that triggered the retrieval, for derived entries
    pub original_query: String,
    /// The raw text chunk
    pub chunk: String,
    /// RFC 3339 insertion timestamp
    pub timestamp: String,
    /// Free-form extras (chunk index, summaries, ...)
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
}

impl CacheMetadata {
    /// Create metadata for a (query, chunk) pair.
    pub fn new(query: &str, chunk: &str, query_type: &str) -> Self {
        Self {
            query: query.to_string(),
            query_type: query_type.to_string(),
            original_query: query.to_string(),
            chunk: chunk.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            extra: serde_json::Map::new(),
        }
    }

    /// Override the originating query (for utility entries).
    pub fn with_original_query(mut self, original: &str) -> Self {
        self.original_query = original.to_string();
        self
    }

    /// Attach a free-form extra.
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: u64,
    pub distance: f32,
    pub metadata: CacheMetadata,
}

/// Vectors artifact written next to the metadata artifact.
#[derive(Serialize, Deserialize)]
struct PersistedVectors {
    dim: usize,
    vectors: Vec<Vec<f32>>,
}

/// Batched-insert ANN index with a metadata side table.
pub struct CacheIndex {
    dim: usize,
    batch_size: usize,
    cutoff: f32,
    embedder: Arc<dyn Embedder>,
    graph: ChunkGraph,
    /// Indexed vectors in insertion order; position doubles as the id.
    vectors: Vec<Vec<f32>>,
    metadata: HashMap<u64, CacheMetadata>,
    pending: Vec<(Vec<f32>, CacheMetadata)>,
}

impl CacheIndex {
    /// Create an empty index.
    pub fn new(dim: usize, batch_size: usize, cutoff: f32, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            dim,
            batch_size: batch_size.max(1),
            cutoff,
            embedder,
            graph: Hnsw::new(CosineDistance),
            vectors: Vec::new(),
            metadata: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Number of searchable entries (pending entries excluded).
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Number of buffered entries not yet searchable.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    /// Embed a chunk, buffer it, and return the id it will get when flushed.
    ///
    /// Returns `None` for empty chunks or when embedding fails; the caller
    /// treats a missed cache write as a non-event.
    pub async fn add(&mut self, chunk: &str, metadata: CacheMetadata) -> Option<u64> {
        if chunk.trim().is_empty() {
            return None;
        }

        let embedding = match self.embedder.embed(chunk).await {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping cache add, embedding failed: {e}");
                return None;
            }
        };

        Some(self.add_vector(embedding, metadata))
    }

    /// Buffer a pre-computed vector, fitting it to the configured dimension.
    pub fn add_vector(&mut self, vector: Vec<f32>, metadata: CacheMetadata) -> u64 {
        let vector = fit_dimension(vector, self.dim);
        let id = (self.vectors.len() + self.pending.len()) as u64;
        self.pending.push((vector, metadata));

        if self.pending.len() >= self.batch_size {
            if let Err(e) = self.flush() {
                warn!("batch flush failed, buffer preserved: {e}");
            }
        }

        id
    }

    /// Flush the pending buffer into the graph. All-or-nothing: the whole
    /// batch is validated before any entry is inserted, and on failure the
    /// buffer is left exactly as it was.
    pub fn flush(&mut self) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }

        for (vector, _) in &self.pending {
            if vector.len() != self.dim {
                return Err(AgentError::StaleCacheDimension {
                    expected: self.dim,
                    got: vector.len(),
                });
            }
        }

        let mut searcher = Searcher::default();
        let flushed = self.pending.len();
        for (vector, metadata) in self.pending.drain(..) {
            let id = self.vectors.len() as u64;
            self.graph.insert(vector.clone(), &mut searcher);
            self.vectors.push(vector);
            self.metadata.insert(id, metadata);
        }

        debug_assert_eq!(self.vectors.len(), self.metadata.len());
        debug!("flushed {flushed} entries, index size {}", self.vectors.len());
        Ok(true)
    }

    /// K-nearest search, best match first.
    ///
    /// The pending buffer is flushed first; if that flush fails, the search
    /// returns no results rather than answering from a stale index. Results
    /// are in ascending distance order, include only entries below the
    /// cutoff, and `k` is clamped to the number of indexed entries.
    pub fn search(&mut self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if query.len() != self.dim {
            return Vec::new();
        }

        if !self.pending.is_empty() {
            if let Err(e) = self.flush() {
                warn!("flush failed before search, returning no results: {e}");
                return Vec::new();
            }
        }

        let k = k.min(self.vectors.len());
        if k == 0 {
            return Vec::new();
        }

        let query = query.to_vec();
        let mut searcher = Searcher::default();
        let mut neighbors = vec![
            Neighbor {
                index: !0,
                distance: !0u32,
            };
            k
        ];
        let found = self
            .graph
            .nearest(&query, EF_SEARCH.max(k), &mut searcher, &mut neighbors);

        let mut hits: Vec<SearchHit> = found
            .iter()
            .filter(|n| n.index != !0)
            .filter_map(|n| {
                let id = n.index as u64;
                let distance = f32::from_bits(n.distance);
                if distance >= self.cutoff {
                    return None;
                }
                self.metadata.get(&id).map(|m| SearchHit {
                    id,
                    distance,
                    metadata: m.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        hits
    }

    /// All query strings currently indexed.
    pub fn queries(&self) -> Vec<String> {
        self.metadata
            .values()
            .filter(|m| !m.query.is_empty())
            .map(|m| m.query.clone())
            .collect()
    }

    /// Random sample of indexed queries, for follow-up suggestions.
    pub fn suggestions(&self, n: usize) -> Vec<String> {
        let queries = self.queries();
        let mut rng = rand::thread_rng();
        queries
            .choose_multiple(&mut rng, n.min(queries.len()))
            .cloned()
            .collect()
    }

    /// Iterate over indexed metadata.
    pub fn entries(&self) -> impl Iterator<Item = (&u64, &CacheMetadata)> {
        self.metadata.iter()
    }

    fn artifact_paths(stem: &Path) -> (PathBuf, PathBuf) {
        (
            stem.with_extension("vectors.json"),
            stem.with_extension("meta.json"),
        )
    }

    /// Serialize the indexed state as a pair of artifacts next to `stem`.
    pub fn save(&mut self, stem: &Path) -> Result<()> {
        self.flush()?;

        let (vectors_path, meta_path) = Self::artifact_paths(stem);

        let vectors = serde_json::to_string(&PersistedVectors {
            dim: self.dim,
            vectors: self.vectors.clone(),
        })
        .map_err(|e| AgentError::internal(format!("failed to encode vectors: {e}")))?;

        let metadata: HashMap<String, &CacheMetadata> = self
            .metadata
            .iter()
            .map(|(id, m)| (id.to_string(), m))
            .collect();
        let metadata = serde_json::to_string(&metadata)
            .map_err(|e| AgentError::internal(format!("failed to encode metadata: {e}")))?;

        std::fs::write(&vectors_path, vectors)
            .map_err(|e| AgentError::internal(format!("failed to write {vectors_path:?}: {e}")))?;
        std::fs::write(&meta_path, metadata)
            .map_err(|e| AgentError::internal(format!("failed to write {meta_path:?}: {e}")))?;

        debug!("saved {} entries to {stem:?}", self.vectors.len());
        Ok(())
    }

    /// Load a previously saved pair of artifacts, replacing in-memory state
    /// atomically: everything is parsed and validated into a staging area
    /// before any field is touched.
    pub fn load(&mut self, stem: &Path) -> Result<()> {
        let (vectors_path, meta_path) = Self::artifact_paths(stem);

        let vectors_raw = std::fs::read_to_string(&vectors_path)
            .map_err(|e| AgentError::internal(format!("failed to read {vectors_path:?}: {e}")))?;
        let meta_raw = std::fs::read_to_string(&meta_path)
            .map_err(|e| AgentError::internal(format!("failed to read {meta_path:?}: {e}")))?;

        let persisted: PersistedVectors = serde_json::from_str(&vectors_raw)
            .map_err(|e| AgentError::internal(format!("malformed vectors artifact: {e}")))?;
        let metadata_raw: HashMap<String, CacheMetadata> = serde_json::from_str(&meta_raw)
            .map_err(|e| AgentError::internal(format!("malformed metadata artifact: {e}")))?;

        if persisted.dim != self.dim {
            return Err(AgentError::internal(format!(
                "persisted dimension {} does not match configured dimension {}",
                persisted.dim, self.dim
            )));
        }
        if persisted.vectors.len() != metadata_raw.len() {
            return Err(AgentError::internal(format!(
                "artifact size mismatch: {} vectors, {} metadata entries",
                persisted.vectors.len(),
                metadata_raw.len()
            )));
        }
        for vector in &persisted.vectors {
            if vector.len() != self.dim {
                return Err(AgentError::internal(
                    "persisted vector has wrong dimension".to_string(),
                ));
            }
        }

        let mut metadata = HashMap::with_capacity(metadata_raw.len());
        for (key, value) in metadata_raw {
            let id: u64 = key
                .parse()
                .map_err(|_| AgentError::internal(format!("malformed metadata id '{key}'")))?;
            if id as usize >= persisted.vectors.len() {
                return Err(AgentError::internal(format!(
                    "metadata id {id} out of range"
                )));
            }
            metadata.insert(id, value);
        }

        let mut graph: ChunkGraph = Hnsw::new(CosineDistance);
        let mut searcher = Searcher::default();
        for vector in &persisted.vectors {
            graph.insert(vector.clone(), &mut searcher);
        }

        self.graph = graph;
        self.vectors = persisted.vectors;
        self.metadata = metadata;
        self.pending.clear();

        debug!("loaded {} entries from {stem:?}", self.vectors.len());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_pending_unchecked(&mut self, vector: Vec<f32>, metadata: CacheMetadata) {
        self.pending.push((vector, metadata));
    }
}
