//! Document retrieval boundary
//!
//! The partitioning service and the embedding/oracle clients are external;
//! this module owns the glue: selecting the pages worth partitioning,
//! folding typed elements into page text (tables are summarized first),
//! chunking, and serving similarity lookups over the chunks.

use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::{AgentError, Result};
use crate::oracle::Oracle;
use crate::prompts;
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A retrieved piece of document text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub page: Option<u32>,
}

/// Element kinds produced by the partitioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Title,
    Table,
    Body,
}

/// One typed element with its page number.
#[derive(Debug, Clone)]
pub struct DocElement {
    pub kind: ElementKind,
    pub text: String,
    /// HTML representation, present for tables
    pub html: Option<String>,
    pub page: u32,
}

/// An uploaded document bound to a session.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    pub url: String,
    pub bytes: Vec<u8>,
    pub fingerprint: String,
    pub title: String,
}

impl DocumentHandle {
    /// Content fingerprint used for document change detection.
    pub fn fingerprint_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(&hasher.finalize()[..16])
    }
}

/// Retrieval capability consumed by the retrieval-reasoning loop.
#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    /// Return the chunks most relevant to a sub-query.
    async fn retrieve(&self, subquery: &str) -> Result<Vec<Chunk>>;

    /// Answer or summarize a piece of text against the indexed document.
    async fn query(&self, text: &str) -> Result<String>;

    /// Ingest additional pages relevant to a query into the index.
    async fn extend(&self, query: &str, top_k: usize) -> Result<()>;
}

/// Partitioning capability: raw bytes restricted to a page subset in, typed
/// elements out. An empty page subset means the whole document.
#[async_trait]
pub trait DocumentPartitioner: Send + Sync {
    async fn partition(&self, bytes: &[u8], pages: &[u32]) -> Result<Vec<DocElement>>;
}

/// Object-storage boundary: fetch raw document bytes by URL.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Plain HTTP fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AgentError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::capability("document_fetch", e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::capability(
                "document_fetch",
                format!("fetch failed with status {}", response.status()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::capability("document_fetch", e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Fold typed elements into per-page text. Tables are replaced by a
/// retrieval-optimized summary obtained from the oracle, titles get their own
/// lines, body text is appended inline.
pub async fn fold_elements(
    oracle: &dyn Oracle,
    elements: &[DocElement],
) -> Result<Vec<(u32, String)>> {
    let mut pages: BTreeMap<u32, String> = BTreeMap::new();

    for element in elements {
        let target = pages.entry(element.page).or_default();
        match element.kind {
            ElementKind::Table => {
                let html = element.html.as_deref().unwrap_or(&element.text);
                let summary = oracle.invoke(&prompts::table_summary_prompt(html)).await?;
                target.push_str(&format!(" \n{summary}\n"));
            }
            ElementKind::Title => {
                target.push_str(&format!("\n{}\n", element.text));
            }
            ElementKind::Body => {
                target.push_str(&format!("  {}", element.text));
            }
        }
    }

    Ok(pages.into_iter().collect())
}

/// Split text into word-bounded chunks of roughly `chunk_size` characters
/// with `overlap` characters carried between consecutive chunks.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < words.len() {
        let mut end = start;
        let mut size = 0usize;
        while end < words.len() && size + words[end].len() + 1 <= chunk_size {
            size += words[end].len() + 1;
            end += 1;
        }
        if end == start {
            end = start + 1;
        }
        chunks.push(words[start..end].join(" "));
        if end >= words.len() {
            break;
        }

        // walk back far enough to carry the overlap into the next chunk
        let mut back = end;
        let mut carried = 0usize;
        while back > start + 1 && carried < overlap {
            back -= 1;
            carried += words[back].len() + 1;
        }
        start = back.max(start + 1);
    }

    chunks
}

struct RetrieverState {
    /// Coarse per-page text used for page selection
    page_texts: Vec<(u32, String)>,
    page_embeddings: Vec<Vec<f32>>,
    ingested_pages: HashSet<u32>,
    chunks: Vec<Chunk>,
    chunk_embeddings: Vec<Vec<f32>>,
}

/// Default retriever over a partitioned document.
///
/// Build-time flow: embed every page's coarse text, pick the pages closest
/// to the query, partition those pages with table summarization, chunk the
/// folded text, and index the chunks by embedding. `extend` repeats the page
/// selection for a new query and appends.
pub struct IndexedRetriever {
    oracle: Arc<dyn Oracle>,
    embedder: Arc<dyn Embedder>,
    partitioner: Arc<dyn DocumentPartitioner>,
    bytes: Vec<u8>,
    similarity_top_k: usize,
    state: RwLock<RetrieverState>,
}

impl IndexedRetriever {
    /// Partition and index the pages most relevant to the opening query.
    pub async fn build(
        oracle: Arc<dyn Oracle>,
        embedder: Arc<dyn Embedder>,
        partitioner: Arc<dyn DocumentPartitioner>,
        bytes: Vec<u8>,
        query: &str,
        top_k: usize,
    ) -> Result<Self> {
        // coarse pass over the whole document, no table summarization
        let elements = partitioner.partition(&bytes, &[]).await?;
        let mut page_texts: Vec<(u32, String)> = {
            let mut pages: BTreeMap<u32, String> = BTreeMap::new();
            for element in &elements {
                let target = pages.entry(element.page).or_default();
                target.push_str(&element.text);
                target.push(' ');
            }
            pages.into_iter().collect()
        };
        page_texts.retain(|(_, text)| !text.trim().is_empty());

        let mut page_embeddings = Vec::with_capacity(page_texts.len());
        for (_, text) in &page_texts {
            page_embeddings.push(embedder.embed(text).await?);
        }

        let retriever = Self {
            oracle,
            embedder,
            partitioner,
            bytes,
            similarity_top_k: 2,
            state: RwLock::new(RetrieverState {
                page_texts,
                page_embeddings,
                ingested_pages: HashSet::new(),
                chunks: Vec::new(),
                chunk_embeddings: Vec::new(),
            }),
        };

        retriever.extend(query, top_k).await?;
        Ok(retriever)
    }

    async fn select_pages(&self, query: &str, top_k: usize) -> Result<Vec<u32>> {
        let query_embedding = self.embedder.embed(query).await?;
        let state = self.state.read().await;

        let mut scored: Vec<(u32, f32)> = state
            .page_texts
            .iter()
            .zip(state.page_embeddings.iter())
            .map(|((page, _), embedding)| (*page, cosine_similarity(&query_embedding, embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(page, _)| page)
            .filter(|page| !state.ingested_pages.contains(page))
            .collect())
    }
}

#[async_trait]
impl DocumentRetriever for IndexedRetriever {
    async fn retrieve(&self, subquery: &str) -> Result<Vec<Chunk>> {
        let query_embedding = self.embedder.embed(subquery).await?;
        let state = self.state.read().await;

        let mut scored: Vec<(usize, f32)> = state
            .chunk_embeddings
            .iter()
            .enumerate()
            .map(|(i, embedding)| (i, cosine_similarity(&query_embedding, embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(self.similarity_top_k)
            .map(|(i, _)| state.chunks[i].clone())
            .collect())
    }

    async fn query(&self, text: &str) -> Result<String> {
        let context = self
            .retrieve(text)
            .await?
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("\n\n");
        self.oracle
            .invoke(&prompts::context_answer_prompt(text, &context))
            .await
    }

    async fn extend(&self, query: &str, top_k: usize) -> Result<()> {
        let pages = self.select_pages(query, top_k).await?;
        if pages.is_empty() {
            debug!("no new pages to ingest for query");
            return Ok(());
        }

        let elements = self.partitioner.partition(&self.bytes, &pages).await?;
        let folded = fold_elements(self.oracle.as_ref(), &elements).await?;

        let mut state = self.state.write().await;
        for (page, text) in folded {
            for piece in split_text(&text, 900, 200) {
                let embedding = match self.embedder.embed(&piece).await {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("skipping chunk on page {page}, embedding failed: {e}");
                        continue;
                    }
                };
                state.chunks.push(Chunk {
                    text: piece,
                    page: Some(page),
                });
                state.chunk_embeddings.push(embedding);
            }
            state.ingested_pages.insert(page);
        }

        info!(
            "ingested {} pages, {} chunks indexed",
            pages.len(),
            state.chunks.len()
        );
        Ok(())
    }
}

/// Partitioning API response element (the subset we read).
#[derive(Debug, Deserialize)]
struct WireElement {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    metadata: WireMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct WireMetadata {
    #[serde(default)]
    page_number: u32,
    text_as_html: Option<String>,
}

/// HTTP client for the document-partitioning service.
pub struct HttpPartitioner {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpPartitioner {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
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
impl DocumentPartitioner for HttpPartitioner {
    async fn partition(&self, bytes: &[u8], pages: &[u32]) -> Result<Vec<DocElement>> {
        let url = format!("{}/general/v0/general", self.base_url);

        let mut form = reqwest::multipart::Form::new().part(
            "files",
            reqwest::multipart::Part::bytes(bytes.to_vec()).file_name("document.pdf"),
        );
        if !pages.is_empty() {
            let ranges = pages
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",");
            form = form.text("pages", ranges);
        }

        let mut request = self.client.post(&url).multipart(form);
        if let Some(ref key) = self.api_key {
            request = request.header("unstructured-api-key", key.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::capability("partitioner", e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::capability(
                "partitioner",
                format!("partition request failed with status {}", response.status()),
            ));
        }

        let elements: Vec<WireElement> = response
            .json()
            .await
            .map_err(|e| AgentError::capability("partitioner", format!("malformed response: {e}")))?;

        Ok(elements
            .into_iter()
            .map(|e| {
                let kind = match e.kind.as_str() {
                    "Title" => ElementKind::Title,
                    "Table" => ElementKind::Table,
                    _ => ElementKind::Body,
                };
                DocElement {
                    kind,
                    text: e.text,
                    html: e.metadata.text_as_html,
                    page: e.metadata.page_number,
                }
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stub retrieval collaborators used by tests across the crate.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns canned chunks per sub-query and counts calls per query text.
    pub struct StubRetriever {
        chunks: HashMap<String, Vec<Chunk>>,
        pub calls: Mutex<HashMap<String, usize>>,
        pub extend_calls: AtomicUsize,
        /// When set, `retrieve` panics if the same text is asked this often.
        pub panic_on_repeat: Option<usize>,
    }

    impl StubRetriever {
        pub fn new() -> Self {
            Self {
                chunks: HashMap::new(),
                calls: Mutex::new(HashMap::new()),
                extend_calls: AtomicUsize::new(0),
                panic_on_repeat: None,
            }
        }

        pub fn with(mut self, subquery: &str, texts: Vec<&str>) -> Self {
            self.chunks.insert(
                subquery.to_string(),
                texts
                    .into_iter()
                    .map(|t| Chunk {
                        text: t.to_string(),
                        page: None,
                    })
                    .collect(),
            );
            self
        }

        pub fn panic_on_repeat(mut self, n: usize) -> Self {
            self.panic_on_repeat = Some(n);
            self
        }

        pub fn call_count(&self, subquery: &str) -> usize {
            *self.calls.lock().unwrap().get(subquery).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl DocumentRetriever for StubRetriever {
        async fn retrieve(&self, subquery: &str) -> Result<Vec<Chunk>> {
            let count = {
                let mut calls = self.calls.lock().unwrap();
                let entry = calls.entry(subquery.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            if let Some(limit) = self.panic_on_repeat {
                assert!(
                    count < limit,
                    "retrieval invoked {count} times for '{subquery}'"
                );
            }
            Ok(self.chunks.get(subquery).cloned().unwrap_or_default())
        }

        async fn query(&self, text: &str) -> Result<String> {
            Ok(format!("summary of: {text}"))
        }

        async fn extend(&self, _query: &str, _top_k: usize) -> Result<()> {
            self.extend_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Serves canned bytes for every URL.
    pub struct StubFetcher {
        pub bytes: Vec<u8>,
    }

    #[async_trait]
    impl DocumentFetcher for StubFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.bytes.clone())
        }
    }

    /// Serves canned elements regardless of the requested pages.
    pub struct StubPartitioner {
        pub elements: Vec<DocElement>,
    }

    #[async_trait]
    impl DocumentPartitioner for StubPartitioner {
        async fn partition(&self, _bytes: &[u8], pages: &[u32]) -> Result<Vec<DocElement>> {
            if pages.is_empty() {
                return Ok(self.elements.clone());
            }
            Ok(self
                .elements
                .iter()
                .filter(|e| pages.contains(&e.page))
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::RoutedOracle;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = DocumentHandle::fingerprint_bytes(b"same bytes");
        let b = DocumentHandle::fingerprint_bytes(b"same bytes");
        let c = DocumentHandle::fingerprint_bytes(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_split_text_respects_size_and_overlap() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = split_text(text, 24, 8);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 24);
        }
        // overlap: the last word of each chunk reappears in the next one
        for pair in chunks.windows(2) {
            let last = pair[0].split_whitespace().last().unwrap();
            assert!(pair[1].contains(last));
        }
        // nothing lost
        let joined = chunks.join(" ");
        for word in text.split_whitespace() {
            assert!(joined.contains(word));
        }
    }

    #[test]
    fn test_split_text_empty() {
        assert!(split_text("   ", 100, 10).is_empty());
    }

    #[tokio::test]
    async fn test_fold_elements_summarizes_tables() {
        let oracle = RoutedOracle::new(
            vec![("summarizing tables", "TABLE SUMMARY")],
            "unexpected prompt",
        );
        let elements = vec![
            DocElement {
                kind: ElementKind::Title,
                text: "Results".to_string(),
                html: None,
                page: 1,
            },
            DocElement {
                kind: ElementKind::Table,
                text: "raw table".to_string(),
                html: Some("<table><tr><td>42</td></tr></table>".to_string()),
                page: 1,
            },
            DocElement {
                kind: ElementKind::Body,
                text: "Revenue grew.".to_string(),
                html: None,
                page: 2,
            },
        ];

        let pages = fold_elements(&oracle, &elements).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].0, 1);
        assert!(pages[0].1.contains("Results"));
        assert!(pages[0].1.contains("TABLE SUMMARY"));
        assert!(!pages[0].1.contains("raw table"));
        assert!(pages[1].1.contains("Revenue grew."));
    }
}
