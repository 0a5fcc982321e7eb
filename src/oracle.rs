//! Oracle boundary
//!
//! The language-model invocation is treated as untrusted, retryable external
//! input: it can fail with a transient transport error, and it can return
//! text that does not match whatever grammar the caller expected. Both are
//! first-class error conditions handled by the reflection paths, never
//! crashes.

use crate::config::Config;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Text-completion boundary consumed by every decision point in the core.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Send a prompt, get completion text back.
    async fn invoke(&self, prompt: &str) -> Result<String>;
}

/// Configuration for the HTTP oracle client.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Base URL of an OpenAI-compatible chat-completions endpoint
    pub base_url: String,
    /// Bearer token, if the backend requires one
    pub api_key: Option<String>,
    /// Model name
    pub model: String,
    /// Request timeout
    pub timeout: Duration,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: None,
            model: "llama-3.3-70b-versatile".to_string(),
            timeout: Duration::from_secs(60),
            temperature: 0.1,
        }
    }
}

impl OracleConfig {
    /// Build from server configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.oracle_url.clone(),
            api_key: config.oracle_api_key.clone(),
            model: config.oracle_model.clone(),
            timeout: config.oracle_timeout,
            temperature: 0.1,
        }
    }
}

/// Chat-completions response body (the subset we read).
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// HTTP oracle client against an OpenAI-compatible chat endpoint.
pub struct ChatOracle {
    config: OracleConfig,
    client: reqwest::Client,
}

impl ChatOracle {
    /// Create a new client.
    pub fn new(config: OracleConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl Oracle for ChatOracle {
    async fn invoke(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut request = self.client.post(&url).json(&serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [{"role": "user", "content": prompt}],
        }));

        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Oracle(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::Oracle(format!(
                "completion request failed with status {}",
                response.status()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Oracle(format!("malformed completion response: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AgentError::Oracle("completion response had no choices".to_string()))?;

        debug!("oracle returned {} bytes", content.len());
        Ok(content)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted oracle used by tests across the crate.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Pops canned responses in order; errors when the script runs dry.
    pub struct ScriptedOracle {
        responses: Mutex<VecDeque<String>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedOracle {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn invoke(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::Oracle("scripted oracle exhausted".to_string()))
        }
    }

    /// Routes prompts to responses by substring match, with a default.
    pub struct RoutedOracle {
        routes: Vec<(String, String)>,
        pub default: String,
    }

    impl RoutedOracle {
        pub fn new(routes: Vec<(&str, &str)>, default: &str) -> Self {
            Self {
                routes: routes
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                default: default.to_string(),
            }
        }
    }

    #[async_trait]
    impl Oracle for RoutedOracle {
        async fn invoke(&self, prompt: &str) -> Result<String> {
            for (needle, response) in &self.routes {
                if prompt.contains(needle.as_str()) {
                    return Ok(response.clone());
                }
            }
            Ok(self.default.clone())
        }
    }
}
