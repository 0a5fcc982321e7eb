//! Retrieval-reasoning loop
//!
//! Bounded iterative agent that alternates document retrieval with step-wise
//! reasoning. Every decision point goes through the oracle; every retrieved
//! chunk is summarized and written into the semantic cache together with
//! derived utility queries, so later sub-queries can be answered without
//! touching the retriever again. An exact-text repeat counter breaks
//! retrieval oscillation by forcing a reasoning step from existing context.

pub mod utility;

pub use utility::UtilityQueryGenerator;

use crate::cache_index::{CacheIndex, CacheMetadata};
use crate::embeddings::{cosine_similarity, fit_dimension, Embedder};
use crate::error::{AgentError, Result};
use crate::oracle::Oracle;
use crate::prompts;
use crate::retrieval::DocumentRetriever;
use crate::tools::extract_json_array;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

static RETRIEVAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"RETRIEVAL THOUGHT[:\s]*(.*)").expect("static regex"));
static REASONING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"REASONING THOUGHT[:\s]*(.*)").expect("static regex"));

/// Marker the loop looks for to detect a terminal reasoning step.
const FINAL_ANSWER_MARKER: &str = "FINAL ANSWER";

/// Configuration for one retrieval-reasoning agent.
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Embedding dimension of the cache index
    pub dim: usize,
    /// Hard step budget per invocation
    pub max_steps: usize,
    /// Pending-buffer size of the cache index
    pub cache_batch_size: usize,
    /// Absolute distance cutoff of the cache index
    pub cache_cutoff: f32,
    /// Distance threshold for treating a cached entry as a hit
    pub similarity_threshold: f32,
    /// Tighter ceiling applied to in-loop cache consults
    pub distance_ceiling: f32,
    /// Utility queries derived per retrieved chunk
    pub utility_max: usize,
    /// Cosine similarity above which two questions are the same question
    pub equivalence_threshold: f32,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            dim: 1024,
            max_steps: 10,
            cache_batch_size: 16,
            cache_cutoff: 0.8,
            similarity_threshold: 0.8,
            distance_ceiling: 0.3,
            utility_max: 2,
            equivalence_threshold: 0.95,
        }
    }
}

/// Outcome of consulting the cache for a sub-query.
enum CacheConsult {
    /// The same sub-query was asked more than twice; reason from context.
    ForceReasoning,
    Hit(String),
    Miss,
}

/// Next move classified by the thought oracle.
enum Thought {
    Retrieval(String),
    Reasoning,
    Final(String),
    Unusable,
}

/// The retrieval-reasoning agent. Owns its thought chain and the shared
/// cache index; holds the document retriever by reference.
pub struct RagAgent {
    oracle: Arc<dyn Oracle>,
    embedder: Arc<dyn Embedder>,
    retriever: Option<Arc<dyn DocumentRetriever>>,
    pub cache: CacheIndex,
    utility: UtilityQueryGenerator,
    config: RagConfig,

    transcript: Vec<String>,
    step_n: usize,
    finished: bool,
    answer: Option<String>,
    question: String,
    query_repeat_counts: HashMap<String, u32>,
    jargons: Vec<String>,

    clarification: String,
    feedback: String,
    reevaluate: bool,
    doc_fingerprint: Option<String>,
}

impl RagAgent {
    pub fn new(oracle: Arc<dyn Oracle>, embedder: Arc<dyn Embedder>, config: RagConfig) -> Self {
        let cache = CacheIndex::new(
            config.dim,
            config.cache_batch_size,
            config.cache_cutoff,
            Arc::clone(&embedder),
        );
        let utility = UtilityQueryGenerator::new(
            Arc::clone(&oracle),
            Arc::clone(&embedder),
            config.similarity_threshold,
        );

        Self {
            oracle,
            embedder,
            retriever: None,
            cache,
            utility,
            config,
            transcript: Vec::new(),
            step_n: 1,
            finished: false,
            answer: None,
            question: String::new(),
            query_repeat_counts: HashMap::new(),
            jargons: Vec::new(),
            clarification: String::new(),
            feedback: String::new(),
            reevaluate: false,
            doc_fingerprint: None,
        }
    }

    pub fn set_retriever(&mut self, retriever: Arc<dyn DocumentRetriever>) {
        self.retriever = Some(retriever);
    }

    /// Point the agent at a document. Cached chunks are not valid across
    /// documents, so a fingerprint change discards the cache and the repeat
    /// counters.
    pub fn bind_document(&mut self, fingerprint: &str) {
        if self.doc_fingerprint.as_deref() == Some(fingerprint) {
            return;
        }
        if self.doc_fingerprint.is_some() {
            info!("document changed, rebuilding cache index");
        }
        self.cache = CacheIndex::new(
            self.config.dim,
            self.config.cache_batch_size,
            self.config.cache_cutoff,
            Arc::clone(&self.embedder),
        );
        self.query_repeat_counts.clear();
        self.doc_fingerprint = Some(fingerprint.to_string());
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Queue a clarification for the next invocation, which will re-enter
    /// the thought chain instead of starting fresh.
    pub fn set_clarification(&mut self, clarification: &str, feedback: &str) {
        self.clarification = clarification.to_string();
        self.feedback = feedback.to_string();
        self.reevaluate = true;
    }

    fn reset(&mut self) {
        self.step_n = 1;
        self.answer = None;
        self.finished = false;
        self.transcript.clear();
        self.query_repeat_counts.clear();
        self.jargons.clear();
    }

    fn transcript_text(&self) -> String {
        self.transcript.join("\n")
    }

    /// Run the loop to completion for one question.
    ///
    /// Returns the answer (always present unless an error propagated) and
    /// any jargon detected in the question; non-empty jargon means the
    /// caller should route the answer through a clarification cycle before
    /// treating it as final.
    pub async fn run(&mut self, question: &str) -> Result<(Option<String>, Vec<String>)> {
        if self.reevaluate {
            self.reevaluate = false;
            self.step_n = 1;
            self.finished = false;
            self.answer = None;

            // discard the stale final answer before resuming
            let keep = self.transcript.len().saturating_sub(2);
            self.transcript.truncate(keep);

            let enhanced = self
                .oracle
                .invoke(&prompts::rephrase_prompt(&self.question, &self.clarification))
                .await?;
            self.question = if self.feedback.trim().is_empty() {
                enhanced
            } else {
                format!("{enhanced} Feedback :- {}", self.feedback)
            };

            // pull fresh supporting pages for the clarified question
            if let Some(retriever) = self.retriever.clone() {
                retriever.extend(&self.question, 2).await?;
            }
        } else {
            self.reset();
            self.question = question.to_string();
        }

        while !self.finished && self.step_n < self.config.max_steps {
            self.step().await?;
        }

        if !self.finished {
            // step budget exhausted: one last reasoning step that must
            // produce an answer
            debug!("step budget reached, forcing a close-out answer");
            self.force_final_answer().await?;
        }

        let answer = self
            .answer
            .clone()
            .map(|a| a.replace("FINAL ANSWER:", "").trim().to_string());

        let new_jargon = if answer.is_some() {
            self.jargon_scan().await
        } else {
            Vec::new()
        };
        self.jargons.extend(new_jargon.iter().cloned());

        Ok((answer, new_jargon))
    }

    async fn step(&mut self) -> Result<()> {
        match self.think().await? {
            Thought::Retrieval(subquery) => match self.consult_cache(&subquery).await {
                CacheConsult::ForceReasoning => {
                    debug!("sub-query repeated more than twice, forcing reasoning");
                    self.force_final_answer().await?;
                    return Ok(());
                }
                CacheConsult::Hit(chunk) => {
                    debug!("cache hit for sub-query");
                    self.transcript.push(format!("OBSERVATION: {chunk}"));
                }
                CacheConsult::Miss => {
                    self.retrieve_and_observe(&subquery).await?;
                }
            },
            Thought::Reasoning => {
                let reasoning = self.reason(false).await?;
                self.transcript.push(reasoning.clone());
                if reasoning.contains(FINAL_ANSWER_MARKER) {
                    self.finished = true;
                    self.answer = Some(reasoning);
                }
            }
            Thought::Final(text) => {
                self.transcript.push(text.clone());
                self.finished = true;
                self.answer = Some(text);
            }
            Thought::Unusable => {
                warn!("thought oracle output matched no expected shape, skipping step");
            }
        }

        self.step_n += 1;
        Ok(())
    }

    async fn think(&mut self) -> Result<Thought> {
        let response = self
            .oracle
            .invoke(&prompts::thought_prompt(&self.question, &self.transcript_text()))
            .await?;

        if response.contains(FINAL_ANSWER_MARKER) {
            return Ok(Thought::Final(response.trim().to_string()));
        }
        if let Some(captures) = RETRIEVAL_RE.captures(&response) {
            let subquery = captures
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            self.transcript
                .push(format!("RETRIEVAL THOUGHT: {subquery}"));
            return Ok(Thought::Retrieval(subquery));
        }
        if let Some(captures) = REASONING_RE.captures(&response) {
            let thought = captures
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            self.transcript.push(format!("REASONING THOUGHT: {thought}"));
            return Ok(Thought::Reasoning);
        }
        Ok(Thought::Unusable)
    }

    async fn reason(&mut self, force_completion: bool) -> Result<String> {
        let response = self
            .oracle
            .invoke(&prompts::reasoning_prompt(
                &self.question,
                &self.transcript_text(),
                force_completion,
            ))
            .await?;
        let response = response.trim().to_string();

        if force_completion && !response.contains(FINAL_ANSWER_MARKER) {
            return Ok(format!("FINAL ANSWER: {response}"));
        }
        Ok(response)
    }

    async fn force_final_answer(&mut self) -> Result<()> {
        let answer = self.reason(true).await?;
        self.transcript.push(answer.clone());
        self.finished = true;
        self.answer = Some(answer);
        Ok(())
    }

    /// Check the cache before issuing a retrieval. Tracks exact-text
    /// repeats: the third ask of the same sub-query forces a reasoning step
    /// instead of retrieving again.
    async fn consult_cache(&mut self, subquery: &str) -> CacheConsult {
        if subquery.is_empty() {
            return CacheConsult::Miss;
        }

        let count = self
            .query_repeat_counts
            .entry(subquery.to_string())
            .or_insert(0);
        *count += 1;
        if *count > 2 {
            return CacheConsult::ForceReasoning;
        }

        let Ok(embedding) = self.embedder.embed(subquery).await else {
            return CacheConsult::Miss;
        };
        let embedding = fit_dimension(embedding, self.config.dim);

        let ceiling = self
            .config
            .similarity_threshold
            .min(self.config.distance_ceiling);
        let best = self
            .cache
            .search(&embedding, 5)
            .into_iter()
            .find(|hit| hit.distance < ceiling && !hit.metadata.chunk.is_empty());

        match best {
            Some(hit) => CacheConsult::Hit(hit.metadata.chunk),
            None => CacheConsult::Miss,
        }
    }

    /// Genuine retrieval miss: call the retriever, summarize and cache every
    /// chunk, derive utility queries, and append the observations.
    async fn retrieve_and_observe(&mut self, subquery: &str) -> Result<()> {
        let retriever = self
            .retriever
            .clone()
            .ok_or_else(|| AgentError::internal("no document retriever bound"))?;

        let chunks = retriever.retrieve(subquery).await?;
        if chunks.is_empty() {
            debug!("retriever returned no chunks for sub-query");
            return Ok(());
        }

        let mut existing = self.cache.queries();
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.text.is_empty() {
                continue;
            }
            let summary = retriever.query(&chunk.text).await?;

            let metadata = CacheMetadata::new(subquery, &chunk.text, "retrieval")
                .with_extra("chunk_index", Value::from(i + 1))
                .with_extra("summarized_chunk_text", Value::from(summary.clone()));
            self.cache.add(&chunk.text, metadata).await;

            let utilities = self
                .utility
                .generate(&summary, self.config.utility_max, &existing)
                .await;
            for utility_query in utilities {
                if utility_query.is_empty() || utility_query == subquery {
                    continue;
                }
                let metadata = CacheMetadata::new(&utility_query, &summary, "utility")
                    .with_original_query(subquery);
                self.cache.add(&summary, metadata).await;
                existing.push(utility_query);
            }

            self.transcript.push(format!("OBSERVATION: {summary}"));
        }

        let direct = retriever.query(subquery).await?;
        self.transcript.push(format!("OBSERVATION: {direct}"));
        Ok(())
    }

    /// Scan the question for jargon. Best-effort: failures mean no jargon.
    async fn jargon_scan(&mut self) -> Vec<String> {
        let response = match self
            .oracle
            .invoke(&prompts::jargon_prompt(&self.question, &self.jargons))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("jargon scan failed: {e}");
                return Vec::new();
            }
        };

        let trimmed = response.trim();
        if trimmed.eq_ignore_ascii_case("none") {
            return Vec::new();
        }

        extract_json_array(trimmed)
            .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
            .unwrap_or_else(|| {
                warn!("jargon scan output was unparseable");
                Vec::new()
            })
    }

    /// Score how well the transcript supports an answer.
    pub async fn confidence(&self, answer: &str) -> Result<String> {
        let score = self
            .oracle
            .invoke(&prompts::confidence_prompt(&self.transcript_text(), answer))
            .await?;
        Ok(score.trim().to_string())
    }

    /// Whether an equivalent question is already cached, at high confidence.
    pub async fn has_equivalent_query(&self, query: &str) -> bool {
        let Ok(query_embedding) = self.embedder.embed(query).await else {
            return false;
        };

        for (_, metadata) in self.cache.entries() {
            if metadata.query.is_empty() {
                continue;
            }
            let Ok(cached_embedding) = self.embedder.embed(&metadata.query).await else {
                continue;
            };
            if cosine_similarity(&query_embedding, &cached_embedding)
                >= self.config.equivalence_threshold
            {
                return true;
            }
        }
        false
    }

    /// Best cached chunk for a query, without the in-loop distance ceiling.
    pub async fn best_cached_chunk(&mut self, query: &str) -> Option<String> {
        let embedding = fit_dimension(self.embedder.embed(query).await.ok()?, self.config.dim);
        let threshold = self.config.similarity_threshold;
        self.cache
            .search(&embedding, 5)
            .into_iter()
            .find(|hit| hit.distance < threshold && !hit.metadata.chunk.is_empty())
            .map(|hit| hit.metadata.chunk)
    }

    /// Follow-up question suggestions sampled from the cache.
    pub fn suggestions(&self) -> Vec<String> {
        self.cache.suggestions(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::StubEmbedder;
    use crate::oracle::testing::ScriptedOracle;
    use crate::retrieval::testing::StubRetriever;

    const DIM: usize = 4;

    fn agent(oracle: ScriptedOracle, embedder: StubEmbedder) -> RagAgent {
        let config = RagConfig {
            dim: DIM,
            max_steps: 8,
            ..Default::default()
        };
        RagAgent::new(Arc::new(oracle), Arc::new(embedder), config)
    }

    #[tokio::test]
    async fn test_reasoning_final_answer_ends_the_loop() {
        let oracle = ScriptedOracle::new(vec![
            "REASONING THOUGHT the observations suffice",
            "FINAL ANSWER: the margin was 46%",
            "None", // jargon scan
        ]);
        let mut agent = agent(oracle, StubEmbedder::new(vec![0.0; DIM]));

        let (answer, jargon) = agent.run("what was the margin?").await.unwrap();
        assert_eq!(answer.unwrap(), "the margin was 46%");
        assert!(jargon.is_empty());
    }

    #[tokio::test]
    async fn test_third_identical_subquery_forces_reasoning() {
        let subquery = "what is the revenue";
        let oracle = ScriptedOracle::new(vec![
            "RETRIEVAL THOUGHT what is the revenue",
            "not json",                               // utility generation
            "RETRIEVAL THOUGHT what is the revenue",  // second ask: cache hit
            "RETRIEVAL THOUGHT what is the revenue",  // third ask: forced close-out
            "The revenue is 10",                      // forced reasoning
            "None",                                   // jargon scan
        ]);
        let embedder = StubEmbedder::new(vec![0.0; DIM])
            .with(subquery, vec![1.0, 0.0, 0.0, 0.0])
            .with("Revenue was 10", vec![1.0, 0.0, 0.0, 0.0]);
        let mut agent = agent(oracle, embedder);

        let retriever = Arc::new(
            StubRetriever::new()
                .with(subquery, vec!["Revenue was 10"])
                .panic_on_repeat(3),
        );
        agent.set_retriever(retriever.clone());
        agent.bind_document("doc-1");

        let (answer, _) = agent.run("what is the revenue?").await.unwrap();
        assert_eq!(answer.unwrap(), "The revenue is 10");
        // first ask retrieved, second hit the cache, third was cut off
        assert_eq!(retriever.call_count(subquery), 1);
    }

    #[tokio::test]
    async fn test_retrieval_populates_cache_and_transcript() {
        let subquery = "gross margin";
        let oracle = ScriptedOracle::new(vec![
            "RETRIEVAL THOUGHT gross margin",
            r#"{"query_1": "What drove margin growth?"}"#, // utility
            "FINAL ANSWER: 46%",
            "None",
        ]);
        let embedder = StubEmbedder::new(vec![0.5; DIM]);
        let mut agent = agent(oracle, embedder);
        agent.set_retriever(Arc::new(
            StubRetriever::new().with(subquery, vec!["Margin was 46% in FY22"]),
        ));
        agent.bind_document("doc-1");

        let (answer, _) = agent.run("what was the gross margin?").await.unwrap();
        assert_eq!(answer.unwrap(), "46%");

        // retrieval entry plus the derived utility entry
        let _ = agent.cache.flush();
        let queries = agent.cache.queries();
        assert!(queries.contains(&subquery.to_string()));
        assert!(queries.contains(&"What drove margin growth?".to_string()));

        let transcript = agent.transcript_text();
        assert!(transcript.contains("OBSERVATION: summary of: Margin was 46% in FY22"));
    }

    #[tokio::test]
    async fn test_step_budget_forces_close_out() {
        // every step is an inconclusive reasoning step
        let oracle = ScriptedOracle::new(vec![
            "REASONING THOUGHT still thinking",
            "REASONING still unsure",
            "REASONING THOUGHT still thinking",
            "REASONING still unsure",
            "best guess is 42", // forced close-out
            "None",
        ]);
        let config = RagConfig {
            dim: DIM,
            max_steps: 3,
            ..Default::default()
        };
        let mut agent = RagAgent::new(
            Arc::new(oracle),
            Arc::new(StubEmbedder::new(vec![0.0; DIM])),
            config,
        );

        let (answer, _) = agent.run("hard question").await.unwrap();
        assert_eq!(answer.unwrap(), "best guess is 42");
    }

    #[tokio::test]
    async fn test_jargon_detected_and_remembered() {
        let oracle = ScriptedOracle::new(vec![
            "FINAL ANSWER: the EBITDA grew",
            r#"["EBITDA"]"#,
        ]);
        let mut agent = agent(oracle, StubEmbedder::new(vec![0.0; DIM]));

        let (answer, jargon) = agent.run("how did EBITDA develop?").await.unwrap();
        assert!(answer.is_some());
        assert_eq!(jargon, vec!["EBITDA"]);
        assert_eq!(agent.jargons, vec!["EBITDA"]);
    }

    #[tokio::test]
    async fn test_clarification_reentry_rephrases_and_extends() {
        let oracle = ScriptedOracle::new(vec![
            "FINAL ANSWER: something stale",
            r#"["QoQ"]"#,
            // clarified pass
            "how did revenue develop quarter over quarter?", // rephrase
            "FINAL ANSWER: it grew 5% each quarter",
            "None",
        ]);
        let mut agent = agent(oracle, StubEmbedder::new(vec![0.0; DIM]));
        let retriever = Arc::new(StubRetriever::new());
        agent.set_retriever(retriever.clone());
        agent.bind_document("doc-1");

        let (_, jargon) = agent.run("how did revenue develop QoQ?").await.unwrap();
        assert_eq!(jargon, vec!["QoQ"]);

        agent.set_clarification("QoQ means quarter over quarter", "focus on revenue");
        let (answer, jargon) = agent.run("ignored on re-entry").await.unwrap();

        assert_eq!(answer.unwrap(), "it grew 5% each quarter");
        assert!(jargon.is_empty());
        assert!(agent.question.contains("quarter over quarter"));
        assert!(agent.question.contains("Feedback :- focus on revenue"));
        // fresh pages were pulled for the clarified question
        assert_eq!(
            retriever
                .extend_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        // the stale final answer was discarded before resuming
        assert!(!agent.transcript_text().contains("something stale"));
    }

    #[tokio::test]
    async fn test_document_change_discards_cache() {
        let oracle = ScriptedOracle::new(vec![]);
        let mut agent = agent(oracle, StubEmbedder::new(vec![0.5; DIM]));
        agent.bind_document("doc-1");
        agent
            .cache
            .add_vector(vec![1.0, 0.0, 0.0, 0.0], CacheMetadata::new("q", "c", "retrieval"));
        let _ = agent.cache.flush();
        assert_eq!(agent.cache.len(), 1);

        agent.bind_document("doc-1");
        assert_eq!(agent.cache.len(), 1);

        agent.bind_document("doc-2");
        assert_eq!(agent.cache.len(), 0);
    }

    #[tokio::test]
    async fn test_equivalent_query_detection() {
        let embedder = StubEmbedder::new(vec![0.0, 0.0, 0.0, 1.0])
            .with("what is revenue?", vec![1.0, 0.0, 0.0, 0.0])
            .with("what is the revenue?", vec![0.99, 0.1, 0.0, 0.0]);
        let oracle = ScriptedOracle::new(vec![]);
        let mut agent = agent(oracle, embedder);
        agent
            .cache
            .add_vector(vec![1.0, 0.0, 0.0, 0.0], CacheMetadata::new("what is revenue?", "chunk", "retrieval"));
        let _ = agent.cache.flush();

        assert!(agent.has_equivalent_query("what is the revenue?").await);
        assert!(!agent.has_equivalent_query("unrelated question").await);
    }
}
