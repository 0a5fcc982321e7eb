//! Supervisor control loop
//!
//! State machine that resolves one user query at a time: ask the oracle for
//! the next tool call, critique the arguments, execute, critique the
//! response, and record the exchange. Failures are routed to the reflection
//! strategies; the retrieval tool is dispatched specially and may pause the
//! whole loop when the question needs clarification. Identical consecutive
//! calls are not deduplicated here; loop prevention lives in the oracle
//! prompt and in the retrieval loop's repeat counter, the layers where
//! repetition actually occurs.

use crate::agent::critic::Critic;
use crate::cache_index::{CacheIndex, CacheMetadata};
use crate::embeddings::{fit_dimension, Embedder};
use crate::error::{AgentError, Result};
use crate::oracle::Oracle;
use crate::prompts;
use crate::rag::RagAgent;
use crate::retrieval::DocumentRetriever;
use crate::tools::{
    parse_directive, Directive, Tool, ToolCall, ToolRegistry, RETRIEVAL_TOOL, SENTINEL_RESPONSE,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Supervisor knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Patch attempts before code reflection gives up
    pub reflexion_limit: usize,
    /// SELECT iterations before the query is declared unanswerable
    pub max_select_steps: usize,
    /// Prior answers recalled into a follow-up query
    pub memory_top_k: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reflexion_limit: 3,
            max_select_steps: 16,
            memory_top_k: 2,
        }
    }
}

/// Result shape returned to the caller for every query-level operation.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// The answer; `None` means the query could not be answered
    pub answer: Option<String>,
    /// Whether the query paused for clarification
    pub paused: bool,
    /// Jargon terms awaiting definitions when paused
    pub pending_jargon: Vec<String>,
    /// Follow-up question suggestions
    pub suggestions: Vec<String>,
}

impl RunOutcome {
    fn answered(answer: String, suggestions: Vec<String>) -> Self {
        Self {
            answer: Some(answer),
            paused: false,
            pending_jargon: Vec::new(),
            suggestions,
        }
    }

    fn paused(pending_jargon: Vec<String>) -> Self {
        Self {
            answer: None,
            paused: true,
            pending_jargon,
            suggestions: Vec::new(),
        }
    }

    fn no_answer() -> Self {
        Self {
            answer: None,
            paused: false,
            pending_jargon: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}

/// A retrieval that stopped for clarification; resumption re-enters at the
/// post-execution critique with the clarified (or accepted) result.
#[derive(Debug, Clone)]
pub(super) struct PausedRetrieval {
    pub(super) call: ToolCall,
    pub(super) answer: String,
    pub(super) jargon: Vec<String>,
}

/// What one supervisor step did.
pub(super) enum StepOutcome {
    /// Keep looping (an entry may or may not have been recorded)
    Continue,
    Paused(PausedRetrieval),
    /// All recovery paths are spent for this query
    NoAnswer,
}

/// Result of executing a tool.
pub(super) enum Execution {
    Response(String),
    Paused { answer: String, jargon: Vec<String> },
}

/// The per-session orchestrator. Owns the scratchpad and the working tool
/// registry; the base registry only grows, and the working copy is reset
/// from it at the start of every top-level query.
pub struct Supervisor {
    pub(super) oracle: Arc<dyn Oracle>,
    pub(super) embedder: Arc<dyn Embedder>,
    pub(super) critic: Critic,
    pub(super) base: ToolRegistry,
    pub(super) working: ToolRegistry,
    pub(super) rag: RagAgent,
    /// Long-term conversation memory: final answers, searchable by query
    pub(super) memory: CacheIndex,
    pub(super) scratchpad: Vec<(String, String)>,
    pub(super) responses: Vec<String>,
    pub(super) query: String,
    pub(super) logs: Vec<(String, String)>,
    pub(super) config: SupervisorConfig,
    pub(super) paused: Option<PausedRetrieval>,
}

impl Supervisor {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        embedder: Arc<dyn Embedder>,
        base: ToolRegistry,
        rag: RagAgent,
        config: SupervisorConfig,
    ) -> Self {
        let memory = CacheIndex::new(
            rag.config().dim,
            16,
            // conversation recall is unconditional top-k, so no real cutoff
            2.0,
            Arc::clone(&embedder),
        );
        let working = base.clone();

        Self {
            critic: Critic::new(Arc::clone(&oracle)),
            oracle,
            embedder,
            base,
            working,
            rag,
            memory,
            scratchpad: Vec::new(),
            responses: Vec::new(),
            query: String::new(),
            logs: Vec::new(),
            config,
            paused: None,
        }
    }

    /// Bind the session's document: the retriever serves it, and a changed
    /// fingerprint discards the retrieval cache.
    pub fn bind_document(&mut self, retriever: Arc<dyn DocumentRetriever>, fingerprint: &str) {
        self.rag.set_retriever(retriever);
        self.rag.bind_document(fingerprint);
    }

    /// The conversation log: every answered (query, answer) pair.
    pub fn conversation_log(&self) -> &[(String, String)] {
        &self.logs
    }

    /// Register a new tool into both the base and working registries, so it
    /// persists for the remainder of the session.
    pub fn register_tool(&mut self, tool: Tool) -> Result<()> {
        self.base.register(tool.clone())?;
        self.working.register(tool)?;
        Ok(())
    }

    /// Whether a tool name exists in the base registry.
    pub fn has_tool(&self, name: &str) -> bool {
        self.base.contains(name)
    }

    #[cfg(test)]
    pub(crate) fn working_names(&self) -> Vec<String> {
        self.working.names().iter().map(|s| s.to_string()).collect()
    }

    /// Resolve one top-level query.
    ///
    /// Follow-up queries are seeded with the most similar prior answers from
    /// conversation memory. Returns a pause status instead of looping when
    /// the retrieval tool flags jargon.
    pub async fn run_query(&mut self, query: &str, follow_up: bool) -> Result<RunOutcome> {
        if self.paused.is_some() {
            return Err(AgentError::BadRequest(
                "a clarification is pending for this session".to_string(),
            ));
        }

        self.query = query.to_string();
        self.scratchpad.clear();
        self.responses.clear();
        // the working registry is rebuilt from the base set for every query
        self.working = self.base.clone();

        if follow_up {
            for fact in self.recall(query).await {
                self.scratchpad.push(("recalled_context".to_string(), fact.clone()));
                self.responses.push(fact);
            }
        }

        self.drive().await
    }

    /// The SELECT loop. Runs until the sentinel response is recorded, a
    /// pause is surfaced, or every recovery path is spent.
    pub(super) async fn drive(&mut self) -> Result<RunOutcome> {
        let mut selects = 0usize;

        while self
            .responses
            .last()
            .map(|r| r != SENTINEL_RESPONSE)
            .unwrap_or(true)
        {
            selects += 1;
            if selects > self.config.max_select_steps {
                warn!(
                    "select budget of {} exhausted, giving up on query",
                    self.config.max_select_steps
                );
                return Ok(self.give_up());
            }

            match self.step().await? {
                StepOutcome::Continue => {}
                StepOutcome::Paused(paused) => {
                    let jargon = paused.jargon.clone();
                    info!("retrieval paused for clarification of {jargon:?}");
                    self.paused = Some(paused);
                    return Ok(RunOutcome::paused(jargon));
                }
                StepOutcome::NoAnswer => return Ok(self.give_up()),
            }
        }

        self.finalize().await
    }

    /// One SELECT / validate / execute / critique round.
    async fn step(&mut self) -> Result<StepOutcome> {
        let raw = match self
            .oracle
            .invoke(&prompts::select_prompt(
                &self.query,
                &self.working.render_for_prompt(),
                &self.scratchpad_text(),
                &self.responses,
            ))
            .await
        {
            Ok(raw) => raw,
            Err(err) => return self.recover(None, err).await,
        };

        let directive = match parse_directive(&raw) {
            Ok(directive) => directive,
            Err(err) => return self.recover(None, err).await,
        };

        match directive {
            Directive::Finish => {
                self.record(&ToolCall::sentinel(), SENTINEL_RESPONSE);
                Ok(StepOutcome::Continue)
            }
            Directive::NoTool => self.capability_reflection(None).await,
            Directive::Call(call) => self.try_call(call).await,
        }
    }

    /// CRITIC_PRE, EXECUTE and CRITIC_POST for one selected call.
    async fn try_call(&mut self, mut call: ToolCall) -> Result<StepOutcome> {
        let Some(description) = self.working.get(&call.name).map(|t| t.description.clone())
        else {
            let name = call.name.clone();
            return self
                .recover(Some(call), AgentError::UnknownTool(name))
                .await;
        };

        let verdict = self
            .critic
            .review_call(&self.query, &call, &description, &self.scratchpad_text())
            .await;
        if verdict.rejected {
            debug!("critic rejected arguments: {}", verdict.reasoning);
            call = self.silent_reflection(&call, &verdict.reasoning).await;
        }

        match self.execute(&call).await {
            Ok(Execution::Response(response)) => self.post_check(call, response).await,
            Ok(Execution::Paused { answer, jargon }) => Ok(StepOutcome::Paused(PausedRetrieval {
                call,
                answer,
                jargon,
            })),
            Err(err) => self.recover(Some(call), err).await,
        }
    }

    /// Invoke the selected capability. The retrieval tool is special-cased:
    /// cache short-circuit first, full loop otherwise, and a jargon signal
    /// becomes a pause instead of a response.
    pub(super) async fn execute(&mut self, call: &ToolCall) -> Result<Execution> {
        if call.name == RETRIEVAL_TOOL {
            return self.run_retrieval(call).await;
        }

        let tool = self
            .working
            .get(&call.name)
            .ok_or_else(|| AgentError::UnknownTool(call.name.clone()))?
            .clone();
        let response = tool.execute(call.arguments.clone()).await?;
        Ok(Execution::Response(response))
    }

    async fn run_retrieval(&mut self, call: &ToolCall) -> Result<Execution> {
        let question = call.first_arg_text();
        if question.is_empty() {
            return Err(AgentError::capability(
                RETRIEVAL_TOOL,
                "retrieval needs a question argument",
            ));
        }

        // make recent additions searchable before the equivalence check
        if let Err(e) = self.rag.cache.flush() {
            warn!("cache flush before retrieval failed: {e}");
        }

        if self.rag.has_equivalent_query(&question).await {
            if let Some(chunk) = self.rag.best_cached_chunk(&question).await {
                debug!("equivalent question cached, answering without the loop");
                let summarized = self
                    .oracle
                    .invoke(&prompts::memory_hit_prompt(&question, &chunk))
                    .await?;
                if summarized.trim() != "INSUFFICIENT_CONTEXT" {
                    return Ok(Execution::Response(summarized));
                }
            }
        }

        let (answer, jargon) = self.rag.run(&question).await?;
        let Some(answer) = answer else {
            return Err(AgentError::capability(
                RETRIEVAL_TOOL,
                "retrieval produced no answer",
            ));
        };

        let score = self
            .rag
            .confidence(&answer)
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        let answer = format!("{answer}, Confidence Score : {score}");

        if !jargon.is_empty() {
            return Ok(Execution::Paused { answer, jargon });
        }
        Ok(Execution::Response(answer))
    }

    /// CRITIC_POST: a rejected response removes the tool from the working
    /// registry and restarts SELECT without recording anything.
    pub(super) async fn post_check(
        &mut self,
        call: ToolCall,
        response: String,
    ) -> Result<StepOutcome> {
        let description = self
            .working
            .get(&call.name)
            .map(|t| t.description.clone())
            .unwrap_or_default();

        let verdict = self
            .critic
            .review_response(&self.query, &call, &description, &response)
            .await;
        if verdict.rejected {
            info!(
                "critic rejected response, removing tool '{}' for this query: {}",
                call.name, verdict.reasoning
            );
            self.working.remove(&call.name);
            return Ok(StepOutcome::Continue);
        }

        self.record(&call, &response);
        Ok(StepOutcome::Continue)
    }

    pub(super) fn record(&mut self, call: &ToolCall, response: &str) {
        self.responses.push(response.to_string());
        self.scratchpad.push((call.render(), response.to_string()));
    }

    pub(super) fn scratchpad_text(&self) -> String {
        self.scratchpad
            .iter()
            .map(|(call, response)| format!("Tool Call : {call}, Response : {response}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// DONE: compose the final answer from the full scratchpad, persist it
    /// to conversation memory, and reset per-query state.
    async fn finalize(&mut self) -> Result<RunOutcome> {
        let final_answer = match self
            .oracle
            .invoke(&prompts::final_response_prompt(
                &self.query,
                &self.scratchpad_text(),
                &self.responses,
            ))
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!("final answer composition failed: {e}");
                return Ok(self.give_up());
            }
        };

        let metadata = CacheMetadata::new(&self.query, &final_answer, "conversation");
        self.memory.add(&final_answer, metadata).await;
        if let Err(e) = self.memory.flush() {
            warn!("conversation memory flush failed: {e}");
        }

        self.logs.push((self.query.clone(), final_answer.clone()));
        let suggestions = self.rag.suggestions();

        self.scratchpad.clear();
        self.responses.clear();
        Ok(RunOutcome::answered(final_answer, suggestions))
    }

    /// Total failure to answer: a clear status, never a crash. The session
    /// remains usable.
    pub(super) fn give_up(&mut self) -> RunOutcome {
        self.scratchpad.clear();
        self.responses.clear();
        RunOutcome::no_answer()
    }

    /// Top prior answers semantically close to a follow-up query.
    async fn recall(&mut self, query: &str) -> Vec<String> {
        let Ok(embedding) = self.embedder.embed(query).await else {
            return Vec::new();
        };
        let embedding = fit_dimension(embedding, self.rag.config().dim);
        self.memory
            .search(&embedding, self.config.memory_top_k)
            .into_iter()
            .map(|hit| hit.metadata.chunk)
            .collect()
    }

    /// Resume a paused retrieval once the caller supplies clarification.
    ///
    /// With `re_evaluate` the loop re-runs from the rephrased question; a
    /// still-jargony result pauses again. Without it, the stale answer is
    /// accepted as the tool response. Either way the flow re-enters at the
    /// post-execution critique and the SELECT loop continues from there.
    pub async fn provide_clarification(
        &mut self,
        definitions: &str,
        feedback: &str,
        re_evaluate: bool,
    ) -> Result<RunOutcome> {
        let Some(paused) = self.paused.take() else {
            return Err(AgentError::BadRequest(
                "no clarification is pending".to_string(),
            ));
        };

        let response = if re_evaluate {
            self.rag.set_clarification(definitions, feedback);
            let question = self.rag.question().to_string();
            match self.rag.run(&question).await {
                Ok((Some(answer), jargon)) => {
                    let score = self
                        .rag
                        .confidence(&answer)
                        .await
                        .unwrap_or_else(|_| "unknown".to_string());
                    let answer = format!("{answer}, Confidence Score : {score}");
                    if !jargon.is_empty() {
                        let paused = PausedRetrieval {
                            call: paused.call,
                            answer,
                            jargon: jargon.clone(),
                        };
                        self.paused = Some(paused);
                        return Ok(RunOutcome::paused(jargon));
                    }
                    answer
                }
                Ok((None, _)) => {
                    return match self
                        .recover(
                            Some(paused.call),
                            AgentError::capability(RETRIEVAL_TOOL, "retrieval produced no answer"),
                        )
                        .await?
                    {
                        StepOutcome::Continue => self.drive().await,
                        StepOutcome::Paused(p) => {
                            let jargon = p.jargon.clone();
                            self.paused = Some(p);
                            Ok(RunOutcome::paused(jargon))
                        }
                        StepOutcome::NoAnswer => Ok(self.give_up()),
                    };
                }
                Err(err) => {
                    return match self.recover(Some(paused.call), err).await? {
                        StepOutcome::Continue => self.drive().await,
                        StepOutcome::Paused(p) => {
                            let jargon = p.jargon.clone();
                            self.paused = Some(p);
                            Ok(RunOutcome::paused(jargon))
                        }
                        StepOutcome::NoAnswer => Ok(self.give_up()),
                    };
                }
            }
        } else {
            paused.answer.clone()
        };

        match self.post_check(paused.call, response).await? {
            StepOutcome::Continue => self.drive().await,
            StepOutcome::Paused(p) => {
                let jargon = p.jargon.clone();
                self.paused = Some(p);
                Ok(RunOutcome::paused(jargon))
            }
            StepOutcome::NoAnswer => Ok(self.give_up()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::StubEmbedder;
    use crate::oracle::testing::ScriptedOracle;
    use crate::rag::RagConfig;
    use crate::tools::SENTINEL_TOOL;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Wraps a scripted oracle and records every prompt it was asked.
    struct RecordingOracle {
        inner: ScriptedOracle,
        prompts: Mutex<Vec<String>>,
    }

    impl RecordingOracle {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                inner: ScriptedOracle::new(responses),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Oracle for RecordingOracle {
        async fn invoke(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.inner.invoke(prompt).await
        }
    }

    fn finish_tool() -> Tool {
        Tool::new(
            crate::tools::SENTINEL_TOOL,
            "Ends the process. Argument MUST be \"end\".",
            |_| async { Ok(SENTINEL_RESPONSE.to_string()) },
        )
    }

    fn retrieval_stub_tool() -> Tool {
        Tool::new(
            RETRIEVAL_TOOL,
            "Answers a question from the uploaded document. Takes 1 argument: [question].",
            |_| async { Err(AgentError::internal("dispatched by the supervisor")) },
        )
    }

    fn supervisor_with(oracle: Arc<dyn Oracle>, extra: Vec<Tool>) -> Supervisor {
        let embedder = Arc::new(StubEmbedder::new(vec![0.0; 4]));
        let rag = RagAgent::new(
            Arc::clone(&oracle),
            embedder.clone(),
            RagConfig {
                dim: 4,
                ..Default::default()
            },
        );

        let mut base = ToolRegistry::new();
        base.register(retrieval_stub_tool()).unwrap();
        for tool in extra {
            base.register(tool).unwrap();
        }
        base.register(finish_tool()).unwrap();

        Supervisor::new(oracle, embedder, base, rag, SupervisorConfig::default())
    }

    #[tokio::test]
    async fn test_retrieval_query_answered_end_to_end() {
        // registry holds only the retrieval tool and the sentinel; retrieval
        // resolves to "4" inside the loop
        let oracle = Arc::new(ScriptedOracle::new(vec![
            r#"["document_qa", ["What is 2+2?"], "it may be in the document"]"#,
            r#"{"score": 0}"#,        // critic pre
            "FINAL ANSWER: 4",        // rag thought
            "None",                   // jargon scan
            "1.0",                    // confidence
            r#"{"score": 0}"#,        // critic post
            r#"["finish", ["end"], "answered"]"#,
            "The answer is 4.",       // final response
        ]));
        let mut supervisor = supervisor_with(oracle.clone(), vec![]);

        let outcome = supervisor.run_query("What is 2+2?", false).await.unwrap();
        assert!(outcome.answer.unwrap().contains("4"));
        assert!(!outcome.paused);
        assert_eq!(oracle.call_count(), 8);
    }

    #[tokio::test]
    async fn test_recovered_call_recorded_exactly_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let lookup = Tool::new("lookup", "looks up a key, takes 1 argument", move |_| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::capability("lookup", "key 'k' not found"))
                } else {
                    Ok("v".to_string())
                }
            }
        });

        let oracle = Arc::new(RecordingOracle::new(vec![
            r#"["lookup", ["k"], "look it up"]"#,
            r#"{"score": 0}"#,
            r#"["lookup", ["key"], "patched"]"#,
            r#"{"score": 0}"#,
            r#"{"score": 0}"#,
            r#"["finish", ["end"], "done"]"#,
            "The value is v.",
        ]));
        let mut supervisor = supervisor_with(oracle.clone(), vec![lookup]);

        let outcome = supervisor.run_query("what is the value?", false).await.unwrap();
        assert!(outcome.answer.is_some());

        // the failing call was not recorded; only the patched call made it
        // into the history the final answer was composed from
        let prompts = oracle.prompts();
        let final_prompt = prompts
            .iter()
            .find(|p| p.contains("final response generator"))
            .unwrap();
        assert_eq!(final_prompt.matches("lookup").count(), 1);
        assert!(!final_prompt.contains(r#"["k"]"#));
    }

    #[tokio::test]
    async fn test_removed_tool_stays_out_for_the_query_and_returns_after() {
        let gadget = Tool::new("gadget", "does gadget things, takes 1 argument", |_| async {
            Ok("nonsense".to_string())
        });

        let oracle = Arc::new(RecordingOracle::new(vec![
            // query 1: the gadget response fails the post-critique
            r#"["gadget", ["x"], "try the gadget"]"#,
            r#"{"score": 0}"#,
            r#"{"score": 1, "reasoning": "response does not address the query"}"#,
            r#"["finish", ["end"], "give up on the gadget"]"#,
            "Nothing useful came back.",
            // query 2: the working registry was rebuilt from the base set
            r#"["finish", ["end"], "done"]"#,
            "Done.",
        ]));
        let mut supervisor = supervisor_with(oracle.clone(), vec![gadget]);

        supervisor.run_query("first question", false).await.unwrap();
        assert!(!supervisor.working_names().contains(&"gadget".to_string()));

        supervisor.run_query("second question", false).await.unwrap();
        assert!(supervisor.working_names().contains(&"gadget".to_string()));

        // the SELECT after removal no longer offered the tool; the next
        // query's SELECT did again
        let prompts = oracle.prompts();
        let selects: Vec<&String> = prompts
            .iter()
            .filter(|p| p.contains("function calling agent"))
            .collect();
        assert_eq!(selects.len(), 3);
        assert!(selects[0].contains("- gadget:"));
        assert!(!selects[1].contains("- gadget:"));
        assert!(selects[2].contains("- gadget:"));
    }

    #[tokio::test]
    async fn test_jargon_pauses_and_clarification_resumes() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            r#"["document_qa", ["what is the EBITDA trend?"], "in the report"]"#,
            r#"{"score": 0}"#,                 // critic pre
            "FINAL ANSWER: it grew",           // rag thought
            r#"["EBITDA"]"#,                   // jargon scan
            "0.5",                             // confidence
            // clarified re-run
            "what is the earnings trend?",     // rephrase
            "FINAL ANSWER: earnings grew 5%",  // rag thought
            "None",                            // jargon scan
            "0.9",                             // confidence
            r#"{"score": 0}"#,                 // critic post on resume
            r#"["finish", ["end"], "done"]"#,
            "Earnings grew 5 percent.",
        ]));
        let mut supervisor = supervisor_with(oracle.clone(), vec![]);

        let outcome = supervisor
            .run_query("what is the EBITDA trend?", false)
            .await
            .unwrap();
        assert!(outcome.paused);
        assert_eq!(outcome.pending_jargon, vec!["EBITDA"]);
        assert!(outcome.answer.is_none());

        // a new query is refused while the clarification is pending
        let blocked = supervisor.run_query("another question", false).await;
        assert!(matches!(blocked, Err(AgentError::BadRequest(_))));

        let outcome = supervisor
            .provide_clarification("EBITDA means earnings before interest...", "", true)
            .await
            .unwrap();
        assert!(!outcome.paused);
        assert_eq!(outcome.answer.unwrap(), "Earnings grew 5 percent.");
    }

    #[tokio::test]
    async fn test_clarification_accepting_stale_answer() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            r#"["document_qa", ["what is the QoQ growth?"], "in the report"]"#,
            r#"{"score": 0}"#,
            "FINAL ANSWER: around 5%",
            r#"["QoQ"]"#,
            "0.7",
            // user accepts the answer as-is
            r#"{"score": 0}"#,                 // critic post on resume
            r#"["finish", ["end"], "done"]"#,
            "Growth was around 5%.",
        ]));
        let mut supervisor = supervisor_with(oracle.clone(), vec![]);

        let outcome = supervisor
            .run_query("what is the QoQ growth?", false)
            .await
            .unwrap();
        assert!(outcome.paused);

        let outcome = supervisor
            .provide_clarification("", "", false)
            .await
            .unwrap();
        assert_eq!(outcome.answer.unwrap(), "Growth was around 5%.");
        assert_eq!(oracle.call_count(), 8);
    }

    #[tokio::test]
    async fn test_follow_up_recalls_conversation_memory() {
        let oracle = Arc::new(RecordingOracle::new(vec![
            // query 1
            r#"["finish", ["end"], "trivial"]"#,
            "Paris is the capital of France.",
            // query 2, follow-up
            r#"["finish", ["end"], "already known"]"#,
            "As established, Paris.",
        ]));
        let mut supervisor = supervisor_with(oracle.clone(), vec![]);

        supervisor
            .run_query("capital of France?", false)
            .await
            .unwrap();
        let outcome = supervisor.run_query("and its capital?", true).await.unwrap();
        assert!(outcome.answer.is_some());

        // the recalled prior answer was visible to the follow-up SELECT
        let prompts = oracle.prompts();
        let second_select = prompts
            .iter()
            .filter(|p| p.contains("function calling agent"))
            .nth(1)
            .unwrap();
        assert!(second_select.contains("Paris is the capital of France."));

        assert_eq!(supervisor.conversation_log().len(), 2);
    }

    #[tokio::test]
    async fn test_select_budget_bounds_the_loop() {
        // the oracle keeps selecting the same tool and never finishes, so
        // the loop must stop at the select budget
        let chatter = Tool::new("chatter", "says things, takes 1 argument", |_| async {
            Ok("blah".to_string())
        });

        let mut script = Vec::new();
        for _ in 0..20 {
            script.push(r#"["chatter", ["x"], "keep trying"]"#);
            script.push(r#"{"score": 0}"#);
            script.push(r#"{"score": 0}"#);
        }
        let oracle = Arc::new(ScriptedOracle::new(script));

        let embedder = Arc::new(StubEmbedder::new(vec![0.0; 4]));
        let rag = RagAgent::new(
            oracle.clone(),
            embedder.clone(),
            RagConfig {
                dim: 4,
                ..Default::default()
            },
        );
        let mut base = ToolRegistry::new();
        base.register(chatter).unwrap();
        let mut supervisor = Supervisor::new(
            oracle.clone(),
            embedder,
            base,
            rag,
            SupervisorConfig {
                max_select_steps: 4,
                ..Default::default()
            },
        );

        let outcome = supervisor.run_query("hopeless", false).await.unwrap();
        assert!(outcome.answer.is_none());
        assert!(!outcome.paused);
    }

    #[tokio::test]
    async fn test_sentinel_never_removed_from_base() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            r#"["finish", ["end"], "done"]"#,
            "ok",
        ]));
        let mut supervisor = supervisor_with(oracle, vec![]);
        supervisor.run_query("q", false).await.unwrap();
        assert!(supervisor.working_names().contains(&SENTINEL_TOOL.to_string()));
    }
}
