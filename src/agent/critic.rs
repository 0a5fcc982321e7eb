//! Critic
//!
//! A secondary oracle invocation that scores a tool call (pre-execution) or
//! a tool response (post-execution) as acceptable or not. A critic rejection
//! is control flow, never a hard failure: unparseable critic output and
//! oracle errors both resolve to "acceptable".

use crate::error::Result;
use crate::oracle::Oracle;
use crate::prompts;
use crate::tools::{extract_json_object, ToolCall};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

/// Critic decision.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub rejected: bool,
    pub reasoning: String,
}

impl Verdict {
    fn accept() -> Self {
        Self {
            rejected: false,
            reasoning: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireVerdict {
    score: i64,
    #[serde(default)]
    reasoning: String,
}

/// Scores calls and responses through the oracle.
#[derive(Clone)]
pub struct Critic {
    oracle: Arc<dyn Oracle>,
}

impl Critic {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self { oracle }
    }

    /// Are the call's arguments sensible given its rationale and history?
    pub async fn review_call(
        &self,
        query: &str,
        call: &ToolCall,
        description: &str,
        scratchpad: &str,
    ) -> Verdict {
        let prompt = prompts::critic_call_prompt(query, &call.render(), description, scratchpad);
        self.judge(&prompt).await
    }

    /// Is the response plausible for what was asked?
    pub async fn review_response(
        &self,
        query: &str,
        call: &ToolCall,
        description: &str,
        response: &str,
    ) -> Verdict {
        let prompt =
            prompts::critic_response_prompt(query, &call.render(), description, response);
        self.judge(&prompt).await
    }

    async fn judge(&self, prompt: &str) -> Verdict {
        let raw = match self.oracle.invoke(prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("critic oracle failed, accepting: {e}");
                return Verdict::accept();
            }
        };
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Verdict {
        let parsed: Result<WireVerdict, _> = match extract_json_object(raw) {
            Some(json) => serde_json::from_str(json),
            None => serde_json::from_str(raw),
        };

        match parsed {
            Ok(verdict) => Verdict {
                rejected: verdict.score != 0,
                reasoning: verdict.reasoning,
            },
            Err(_) => {
                warn!("critic output was unparseable, accepting");
                Verdict::accept()
            }
        }
    }
}
