//! Reflection strategies
//!
//! Three recovery procedures invoked by the supervisor:
//! - code reflection: bounded patch loop for a failing call, with a binary
//!   failure-classification oracle deciding after each failed attempt
//!   whether to keep retrying locally or escalate
//! - silent reflection: single-shot argument repair when the critic rejects
//!   a call pre-execution but accepts the tool choice
//! - capability reflection: drop a wrong-but-real tool and re-select; with
//!   nothing to remove and no operator input available, the query fails with
//!   a clear status instead of blocking

use crate::agent::supervisor::{Execution, PausedRetrieval, StepOutcome, Supervisor};
use crate::error::{AgentError, Result};
use crate::prompts;
use crate::tools::{parse_directive, Directive, ToolCall, SENTINEL_RESPONSE};
use tracing::{debug, info, warn};

/// Outcome of a reflection strategy.
#[derive(Debug)]
pub(super) enum Reflection {
    /// A patched call executed and its response passed the critic
    Recovered { call: ToolCall, response: String },
    /// The patched call was the retrieval tool and it needs clarification
    Paused {
        call: ToolCall,
        answer: String,
        jargon: Vec<String>,
    },
    /// A tool was removed; re-enter SELECT
    Rebuild,
    /// This path is done; hand over to capability reflection
    Escalate { last_call: Option<ToolCall> },
    /// The reflexion limit is spent; the query cannot be answered
    Exhausted,
}

/// Failure classes distinguished by the classification oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FailureClass {
    /// External API or network fault; local retries will not help
    Upstream,
    /// The named tool does not exist
    MissingTool,
    /// Ordinary argument or logic error; worth another local attempt
    Logic,
}

impl FailureClass {
    fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower.contains("upstream") || lower.contains("api") {
            Self::Upstream
        } else if lower.contains("missing") || lower.contains("absent") {
            Self::MissingTool
        } else {
            Self::Logic
        }
    }
}

/// What one patch attempt produced.
enum AttemptOutcome {
    NoTool,
    Recovered(ToolCall, String),
    Paused(ToolCall, String, Vec<String>),
    Rebuild,
}

impl Supervisor {
    /// Central recovery dispatch for a failed step.
    pub(super) async fn recover(
        &mut self,
        call: Option<ToolCall>,
        err: AgentError,
    ) -> Result<StepOutcome> {
        warn!("step failed, entering recovery: {err}");

        if matches!(err, AgentError::UnknownTool(_)) {
            return self.capability_reflection(call).await;
        }

        match self.code_reflection(call.clone(), &err).await? {
            Reflection::Recovered { call, response } => {
                self.record(&call, &response);
                Ok(StepOutcome::Continue)
            }
            Reflection::Paused {
                call,
                answer,
                jargon,
            } => Ok(StepOutcome::Paused(PausedRetrieval {
                call,
                answer,
                jargon,
            })),
            Reflection::Rebuild => Ok(StepOutcome::Continue),
            Reflection::Escalate { last_call } => {
                self.capability_reflection(last_call.or(call)).await
            }
            Reflection::Exhausted => Ok(StepOutcome::NoAnswer),
        }
    }

    /// Bounded patch loop for a failing call.
    ///
    /// Each iteration asks the oracle for a corrected call, validates it
    /// like a fresh selection (pre-critique, silent repair, execution,
    /// post-critique), and on failure asks the classification oracle whether
    /// to retry locally or escalate. Exactly `reflexion_limit` patch
    /// attempts are made before giving up.
    pub(super) async fn code_reflection(
        &mut self,
        failing: Option<ToolCall>,
        error: &AgentError,
    ) -> Result<Reflection> {
        let mut last_call_text = failing
            .as_ref()
            .map(|c| c.render())
            .unwrap_or_else(|| "no parseable call".to_string());
        let mut error_text = error.to_string();
        let mut attempts = 0usize;

        while attempts < self.config.reflexion_limit {
            attempts += 1;
            debug!("code reflection attempt {attempts}");

            let raw = match self
                .oracle
                .invoke(&prompts::code_reflection_prompt(
                    &self.query,
                    &error_text,
                    &self.working.render_for_prompt(),
                    &last_call_text,
                ))
                .await
            {
                Ok(raw) => raw,
                Err(e) => {
                    match self.classify_failure(&last_call_text, &e.to_string()).await {
                        FailureClass::Upstream | FailureClass::MissingTool => {
                            return Ok(Reflection::Escalate { last_call: failing })
                        }
                        FailureClass::Logic => {
                            error_text = e.to_string();
                            continue;
                        }
                    }
                }
            };

            match self.attempt_patched(&raw).await {
                Ok(AttemptOutcome::NoTool) => {
                    return Ok(Reflection::Escalate { last_call: failing })
                }
                Ok(AttemptOutcome::Recovered(call, response)) => {
                    return Ok(Reflection::Recovered { call, response })
                }
                Ok(AttemptOutcome::Paused(call, answer, jargon)) => {
                    return Ok(Reflection::Paused {
                        call,
                        answer,
                        jargon,
                    })
                }
                Ok(AttemptOutcome::Rebuild) => return Ok(Reflection::Rebuild),
                Err(e) => match self.classify_failure(raw.trim(), &e.to_string()).await {
                    FailureClass::Upstream | FailureClass::MissingTool => {
                        return Ok(Reflection::Escalate { last_call: failing })
                    }
                    FailureClass::Logic => {
                        last_call_text = raw.trim().to_string();
                        error_text = e.to_string();
                    }
                },
            }
        }

        info!(
            "code reflection spent its {} attempts",
            self.config.reflexion_limit
        );
        Ok(Reflection::Exhausted)
    }

    /// Validate and execute one patched call.
    async fn attempt_patched(&mut self, raw: &str) -> Result<AttemptOutcome> {
        let directive = parse_directive(raw)?;

        let mut call = match directive {
            Directive::NoTool => return Ok(AttemptOutcome::NoTool),
            Directive::Finish => {
                return Ok(AttemptOutcome::Recovered(
                    ToolCall::sentinel(),
                    SENTINEL_RESPONSE.to_string(),
                ))
            }
            Directive::Call(call) => call,
        };

        let Some(description) = self.working.get(&call.name).map(|t| t.description.clone())
        else {
            return Err(AgentError::UnknownTool(call.name.clone()));
        };

        let verdict = self
            .critic
            .review_call(&self.query, &call, &description, &self.scratchpad_text())
            .await;
        if verdict.rejected {
            call = self.silent_reflection(&call, &verdict.reasoning).await;
        }

        match self.execute(&call).await? {
            Execution::Paused { answer, jargon } => Ok(AttemptOutcome::Paused(call, answer, jargon)),
            Execution::Response(response) => {
                let verdict = self
                    .critic
                    .review_response(&self.query, &call, &description, &response)
                    .await;
                if verdict.rejected {
                    info!(
                        "critic rejected patched response, removing tool '{}'",
                        call.name
                    );
                    self.working.remove(&call.name);
                    return Ok(AttemptOutcome::Rebuild);
                }
                Ok(AttemptOutcome::Recovered(call, response))
            }
        }
    }

    /// Single-shot argument repair. Keeps the tool, patches the arguments;
    /// an unusable patch keeps the original call.
    pub(super) async fn silent_reflection(&self, call: &ToolCall, reason: &str) -> ToolCall {
        let raw = match self
            .oracle
            .invoke(&prompts::silent_reflection_prompt(
                &call.render(),
                &self.query,
                &self.scratchpad_text(),
                reason,
            ))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("silent reflection failed, keeping original call: {e}");
                return call.clone();
            }
        };

        match parse_directive(&raw) {
            Ok(Directive::Call(patched)) => patched,
            _ => {
                warn!("silent reflection produced no usable call, keeping original");
                call.clone()
            }
        }
    }

    /// No tool fits. The remove sub-path drops a real-but-wrong tool and
    /// retries SELECT; a hallucinated name just retries SELECT. Creating a
    /// tool needs operator input (the explicit registration API), so with
    /// nothing to remove the query fails with a clear status instead of
    /// blocking a server process on input.
    pub(super) async fn capability_reflection(
        &mut self,
        last_call: Option<ToolCall>,
    ) -> Result<StepOutcome> {
        if let Some(call) = last_call {
            if self.working.contains(&call.name) {
                info!("capability reflection removed tool '{}'", call.name);
                self.working.remove(&call.name);
                return Ok(StepOutcome::Continue);
            }
            debug!(
                "capability reflection: '{}' is not a registered tool, re-selecting",
                call.name
            );
            return Ok(StepOutcome::Continue);
        }

        warn!("no suitable tool for this query and none can be created without operator input");
        Ok(StepOutcome::NoAnswer)
    }

    /// Ask the classification oracle what kind of failure this was. A
    /// failing classifier reads as upstream: local retries are pointless
    /// when even classification cannot run.
    pub(super) async fn classify_failure(&self, call: &str, error: &str) -> FailureClass {
        match self
            .oracle
            .invoke(&prompts::failure_class_prompt(
                call,
                error,
                &self.working.render_for_prompt(),
            ))
            .await
        {
            Ok(raw) => FailureClass::parse(&raw),
            Err(_) => FailureClass::Upstream,
        }
    }
}
