//! Session store
//!
//! Explicit per-session lifecycle: a session is created on its first query,
//! serialized behind its own lock (one query is processed start-to-finish
//! before the next is accepted), and evicted by a background sweep after an
//! idle timeout. Sessions share no mutable state with each other.

use crate::agent::{plugin_tool, CodeRunner, PromptRefiner, RunOutcome, Supervisor, SupervisorConfig};
use crate::config::Config;
use crate::embeddings::Embedder;
use crate::error::{AgentError, Result};
use crate::oracle::Oracle;
use crate::prompts;
use crate::rag::{RagAgent, RagConfig};
use crate::retrieval::{
    DocumentFetcher, DocumentHandle, DocumentPartitioner, IndexedRetriever,
};
use crate::search::WebSearch;
use crate::tools::base_registry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// External collaborators a session is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub oracle: Arc<dyn Oracle>,
    pub embedder: Arc<dyn Embedder>,
    pub partitioner: Arc<dyn DocumentPartitioner>,
    pub fetcher: Arc<dyn DocumentFetcher>,
    pub search: Arc<dyn WebSearch>,
    pub runner: Arc<dyn CodeRunner>,
}

/// Session store knobs plus the per-session engine configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub rag: RagConfig,
    pub supervisor: SupervisorConfig,
    /// Pages pulled into the document index per query
    pub top_k: usize,
    /// Refinement iterations when synthesizing a tool
    pub synth_iterations: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
            rag: RagConfig::default(),
            supervisor: SupervisorConfig::default(),
            top_k: 5,
            synth_iterations: 1,
        }
    }
}

impl SessionConfig {
    /// Build from server configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.session_idle_timeout,
            sweep_interval: Duration::from_secs(60),
            rag: RagConfig {
                dim: config.embedding_dim,
                max_steps: config.max_steps,
                cache_batch_size: config.cache_batch_size,
                cache_cutoff: config.cache_cutoff,
                similarity_threshold: config.similarity_threshold,
                ..Default::default()
            },
            supervisor: SupervisorConfig {
                reflexion_limit: config.reflexion_limit,
                max_select_steps: config.max_select_steps,
                ..Default::default()
            },
            top_k: config.top_k,
            synth_iterations: config.synth_iterations,
        }
    }
}

/// Listing entry for the session history endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub title: String,
    pub url: String,
}

struct DocMeta {
    url: String,
    title: String,
}

struct SessionEntry {
    supervisor: Mutex<Supervisor>,
    doc: std::sync::RwLock<DocMeta>,
    last_activity: AtomicI64,
}

impl SessionEntry {
    fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn idle_seconds(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.last_activity.load(Ordering::Relaxed)
    }
}

/// Map of live sessions with create-on-first-query and idle eviction.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    collaborators: Collaborators,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(collaborators: Collaborators, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            collaborators,
            config,
        })
    }

    /// Mint an id for a fresh session.
    pub fn mint_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Resolve a query within a session, creating the session on first use.
    ///
    /// The first query of a session must carry a document URL; later
    /// queries are treated as follow-ups. Supplying a different URL later
    /// rebinds the session to the new document.
    pub async fn run_query(
        &self,
        session_id: &str,
        query: &str,
        document_url: Option<&str>,
    ) -> Result<RunOutcome> {
        let existing = self.sessions.read().await.get(session_id).cloned();

        let (entry, follow_up) = match existing {
            Some(entry) => (entry, true),
            None => {
                let url = document_url.ok_or_else(|| {
                    AgentError::BadRequest(
                        "a document_url is required for the first query of a session".to_string(),
                    )
                })?;
                (self.create_session(session_id, url, query).await?, false)
            }
        };

        entry.touch();
        let mut supervisor = entry.supervisor.lock().await;

        if follow_up {
            if let Some(url) = document_url {
                let current = entry.doc.read().expect("doc meta lock").url.clone();
                if current != url {
                    let handle = self.bind_document(&mut supervisor, url, query).await?;
                    *entry.doc.write().expect("doc meta lock") = DocMeta {
                        url: handle.url,
                        title: handle.title,
                    };
                }
            }
        }

        let outcome = supervisor.run_query(query, follow_up).await;
        drop(supervisor);
        entry.touch();
        outcome
    }

    async fn create_session(
        &self,
        session_id: &str,
        url: &str,
        query: &str,
    ) -> Result<Arc<SessionEntry>> {
        info!("creating session {session_id}");

        let rag = RagAgent::new(
            Arc::clone(&self.collaborators.oracle),
            Arc::clone(&self.collaborators.embedder),
            self.config.rag.clone(),
        );
        let base = base_registry(
            Arc::clone(&self.collaborators.oracle),
            Arc::clone(&self.collaborators.search),
        );
        let mut supervisor = Supervisor::new(
            Arc::clone(&self.collaborators.oracle),
            Arc::clone(&self.collaborators.embedder),
            base,
            rag,
            self.config.supervisor.clone(),
        );

        let handle = self.bind_document(&mut supervisor, url, query).await?;

        let entry = Arc::new(SessionEntry {
            supervisor: Mutex::new(supervisor),
            doc: std::sync::RwLock::new(DocMeta {
                url: handle.url,
                title: handle.title,
            }),
            last_activity: AtomicI64::new(chrono::Utc::now().timestamp()),
        });

        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| entry)
            .clone();
        Ok(entry)
    }

    /// Fetch, fingerprint, title and index a document, then bind it.
    async fn bind_document(
        &self,
        supervisor: &mut Supervisor,
        url: &str,
        query: &str,
    ) -> Result<DocumentHandle> {
        let bytes = self.collaborators.fetcher.fetch(url).await?;
        let fingerprint = DocumentHandle::fingerprint_bytes(&bytes);
        let title = self.document_title(&bytes).await;
        info!("bound document '{title}' ({} bytes)", bytes.len());

        let retriever = IndexedRetriever::build(
            Arc::clone(&self.collaborators.oracle),
            Arc::clone(&self.collaborators.embedder),
            Arc::clone(&self.collaborators.partitioner),
            bytes.clone(),
            query,
            self.config.top_k,
        )
        .await?;

        supervisor.bind_document(Arc::new(retriever), &fingerprint);

        Ok(DocumentHandle {
            url: url.to_string(),
            bytes,
            fingerprint,
            title,
        })
    }

    /// Display title from the opening pages. Best-effort.
    async fn document_title(&self, bytes: &[u8]) -> String {
        const FALLBACK: &str = "Untitled document";

        let elements = match self
            .collaborators
            .partitioner
            .partition(bytes, &[1, 2])
            .await
        {
            Ok(elements) => elements,
            Err(e) => {
                warn!("title extraction failed: {e}");
                return FALLBACK.to_string();
            }
        };

        let opening: String = elements
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(2000)
            .collect();
        if opening.trim().is_empty() {
            return FALLBACK.to_string();
        }

        match self
            .collaborators
            .oracle
            .invoke(&prompts::title_prompt(&opening))
            .await
        {
            Ok(title) => title.trim().to_string(),
            Err(e) => {
                warn!("title generation failed: {e}");
                FALLBACK.to_string()
            }
        }
    }

    async fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::BadRequest(format!("unknown session '{session_id}'")))
    }

    /// Resolve a pending clarification for a paused session.
    pub async fn provide_clarification(
        &self,
        session_id: &str,
        definitions: &str,
        feedback: &str,
        re_evaluate: bool,
    ) -> Result<RunOutcome> {
        let entry = self.entry(session_id).await?;
        entry.touch();
        let mut supervisor = entry.supervisor.lock().await;
        let outcome = supervisor
            .provide_clarification(definitions, feedback, re_evaluate)
            .await;
        drop(supervisor);
        entry.touch();
        outcome
    }

    /// Every answered (query, answer) pair of a session, oldest first.
    pub async fn conversation_log(&self, session_id: &str) -> Result<Vec<(String, String)>> {
        let entry = self.entry(session_id).await?;
        let supervisor = entry.supervisor.lock().await;
        Ok(supervisor.conversation_log().to_vec())
    }

    /// Register an operator-supplied script as a session tool.
    pub async fn register_plugin_tool(
        &self,
        session_id: &str,
        name: &str,
        description: &str,
        code: &str,
    ) -> Result<()> {
        let tool = plugin_tool(
            name,
            description,
            code,
            Arc::clone(&self.collaborators.runner),
        )?;
        let entry = self.entry(session_id).await?;
        let mut supervisor = entry.supervisor.lock().await;
        supervisor.register_tool(tool)?;
        entry.touch();
        Ok(())
    }

    /// Synthesize a tool from a task description and register it.
    pub async fn synthesize_tool(
        &self,
        session_id: &str,
        name: &str,
        description: &str,
    ) -> Result<()> {
        let entry = self.entry(session_id).await?;
        {
            // fail fast on a taken name before paying for refinement
            let supervisor = entry.supervisor.lock().await;
            if supervisor.has_tool(name) {
                return Err(AgentError::InvalidTool(format!(
                    "tool name '{name}' is already registered"
                )));
            }
        }

        let refiner = PromptRefiner::new(
            Arc::clone(&self.collaborators.oracle),
            Arc::clone(&self.collaborators.runner),
            self.config.synth_iterations,
        );
        let tool = refiner.synthesize(name, description).await?;

        let mut supervisor = entry.supervisor.lock().await;
        supervisor.register_tool(tool)?;
        entry.touch();
        Ok(())
    }

    /// All live sessions.
    pub async fn history(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| {
                let doc = entry.doc.read().expect("doc meta lock");
                SessionInfo {
                    session_id: id.clone(),
                    title: doc.title.clone(),
                    url: doc.url.clone(),
                }
            })
            .collect()
    }

    /// Drop sessions idle past the timeout. Sessions mid-query are skipped.
    pub async fn evict_idle(&self) -> usize {
        let timeout = self.config.idle_timeout.as_secs() as i64;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|id, entry| {
            if entry.idle_seconds() < timeout {
                return true;
            }
            if entry.supervisor.try_lock().is_err() {
                debug!("session {id} is idle but busy, skipping eviction");
                return true;
            }
            info!("evicting idle session {id}");
            false
        });

        before - sessions.len()
    }

    /// Background eviction sweep.
    pub fn spawn_eviction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = store.evict_idle().await;
                if evicted > 0 {
                    debug!("evicted {evicted} idle sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::synth::testing::StubRunner;
    use crate::embeddings::testing::StubEmbedder;
    use crate::oracle::testing::RoutedOracle;
    use crate::retrieval::testing::{StubFetcher, StubPartitioner};
    use crate::retrieval::{DocElement, ElementKind};
    use crate::search::testing::StubSearch;

    fn collaborators(oracle: RoutedOracle) -> Collaborators {
        Collaborators {
            oracle: Arc::new(oracle),
            embedder: Arc::new(StubEmbedder::new(vec![0.5; 4])),
            partitioner: Arc::new(StubPartitioner {
                elements: vec![
                    DocElement {
                        kind: ElementKind::Title,
                        text: "Annual Report".to_string(),
                        html: None,
                        page: 1,
                    },
                    DocElement {
                        kind: ElementKind::Body,
                        text: "Revenue was 10 units.".to_string(),
                        html: None,
                        page: 2,
                    },
                ],
            }),
            fetcher: Arc::new(StubFetcher {
                bytes: b"pdf bytes".to_vec(),
            }),
            search: Arc::new(StubSearch { results: vec![] }),
            runner: Arc::new(StubRunner {
                fail: false,
                stdout: "ran".to_string(),
            }),
        }
    }

    fn finish_only_oracle() -> RoutedOracle {
        RoutedOracle::new(
            vec![
                ("function calling agent", r#"["finish", ["end"], "done"]"#),
                ("final response generator", "the final answer"),
                ("short display title", "Annual Report 2026"),
            ],
            "unused",
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            rag: RagConfig {
                dim: 4,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_on_first_query_then_follow_up() {
        let store = SessionStore::new(collaborators(finish_only_oracle()), config());

        let missing = store.run_query("s1", "q1", None).await;
        assert!(matches!(missing, Err(AgentError::BadRequest(_))));

        let outcome = store
            .run_query("s1", "q1", Some("http://docs/report.pdf"))
            .await
            .unwrap();
        assert_eq!(outcome.answer.as_deref(), Some("the final answer"));

        // second query on the same session is a follow-up, no url needed
        let outcome = store.run_query("s1", "q2", None).await.unwrap();
        assert!(outcome.answer.is_some());

        let log = store.conversation_log("s1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "q1");

        let history = store.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].title, "Annual Report 2026");
    }

    #[tokio::test]
    async fn test_unknown_session_operations_are_rejected() {
        let store = SessionStore::new(collaborators(finish_only_oracle()), config());

        assert!(matches!(
            store.conversation_log("nope").await,
            Err(AgentError::BadRequest(_))
        ));
        assert!(matches!(
            store.provide_clarification("nope", "d", "f", true).await,
            Err(AgentError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let mut config = config();
        config.idle_timeout = Duration::from_secs(0);
        let store = SessionStore::new(collaborators(finish_only_oracle()), config);

        store
            .run_query("s1", "q", Some("http://docs/report.pdf"))
            .await
            .unwrap();
        assert_eq!(store.history().await.len(), 1);

        assert_eq!(store.evict_idle().await, 1);
        assert!(store.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_plugin_tool_registration_and_duplicate_rejection() {
        let store = SessionStore::new(collaborators(finish_only_oracle()), config());
        store
            .run_query("s1", "q", Some("http://docs/report.pdf"))
            .await
            .unwrap();

        store
            .register_plugin_tool("s1", "greeter", "greets people", "print('hi')")
            .await
            .unwrap();

        let duplicate = store
            .register_plugin_tool("s1", "greeter", "greets again", "print('hi')")
            .await;
        assert!(matches!(duplicate, Err(AgentError::InvalidTool(_))));

        let empty_desc = store
            .register_plugin_tool("s1", "other", "  ", "print('hi')")
            .await;
        assert!(matches!(empty_desc, Err(AgentError::InvalidTool(_))));
    }
}
