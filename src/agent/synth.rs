//! Tool synthesis
//!
//! The create path of capability reflection: build a task-specific code
//! generation prompt (probe it with challenging examples, score the
//! generated code, refine from an error-analysis summary), then wrap the
//! refined prompt as a callable that asks the oracle for runnable code and
//! executes it through the sandboxed runner. Execution results come back as
//! a typed contract, never as inspected output streams, and generated code
//! never runs in the host process.

use crate::error::{AgentError, Result};
use crate::oracle::Oracle;
use crate::prompts;
use crate::tools::{extract_json_array, Tool};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:python)?\n([\s\S]*?)```").expect("static regex"));

/// Typed result of running generated code.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Sandboxed execution boundary for generated code.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Run a self-contained script with positional arguments.
    async fn run(&self, code: &str, args: &[String]) -> Result<RunOutput>;
}

/// Runs scripts in a subprocess with a cleared environment, a hard timeout
/// and capped output.
pub struct ProcessRunner {
    timeout: Duration,
    max_output_bytes: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: 64 * 1024,
        }
    }
}

impl ProcessRunner {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
        }
    }

    fn cap(&self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        text.chars().take(self.max_output_bytes).collect()
    }
}

#[async_trait]
impl CodeRunner for ProcessRunner {
    async fn run(&self, code: &str, args: &[String]) -> Result<RunOutput> {
        let mut command = Command::new("python3");
        command
            .arg("-")
            .args(args)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| AgentError::internal(format!("failed to spawn runner: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(code.as_bytes())
                .await
                .map_err(|e| AgentError::internal(format!("failed to feed script: {e}")))?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                output.map_err(|e| AgentError::internal(format!("runner failed: {e}")))?
            }
            Err(_) => {
                warn!("generated code timed out after {:?}", self.timeout);
                return Ok(RunOutput {
                    stdout: String::new(),
                    stderr: format!("execution timed out after {:?}", self.timeout),
                    success: false,
                });
            }
        };

        Ok(RunOutput {
            stdout: self.cap(&output.stdout),
            stderr: self.cap(&output.stderr),
            success: output.status.success(),
        })
    }
}

/// Extract the last fenced code block from oracle output.
pub fn extract_code_block(text: &str) -> Option<String> {
    CODE_FENCE_RE
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Refines a code generation prompt for a task and wraps it as a tool.
pub struct PromptRefiner {
    oracle: Arc<dyn Oracle>,
    runner: Arc<dyn CodeRunner>,
    iterations: usize,
}

impl PromptRefiner {
    pub fn new(oracle: Arc<dyn Oracle>, runner: Arc<dyn CodeRunner>, iterations: usize) -> Self {
        Self {
            oracle,
            runner,
            iterations: iterations.max(1),
        }
    }

    /// Iteratively refine a generation prompt for the task: generate
    /// challenging examples, generate and score candidate code against
    /// them, summarize the failures, and fold the analysis back into the
    /// prompt. Runs a fixed number of refinement iterations.
    pub async fn refine(&self, task_description: &str) -> Result<String> {
        let mut prompt = self
            .oracle
            .invoke(&prompts::prompt_generation_prompt(task_description))
            .await?;
        let mut history: Vec<String> = Vec::new();
        let mut analyses: Vec<String> = Vec::new();

        for iteration in 0..self.iterations {
            let full_prompt = format!("{prompt}{}", prompts::META_PROMPT_TAIL);

            let examples = self.challenging_examples(task_description, &prompt).await;
            let mut failures: Vec<String> = Vec::new();

            for example in &examples {
                match self.score_example(&full_prompt, example).await {
                    Some((score, report)) if score < 4 => {
                        failures.push(report);
                    }
                    Some(_) => {}
                    None => failures.push(format!("input '{example}': no runnable code produced")),
                }
            }

            history.push(full_prompt.clone());
            let analysis = self
                .oracle
                .invoke(&prompts::error_analysis_prompt(
                    &full_prompt,
                    &failures.join("\n"),
                ))
                .await?;
            analyses.push(analysis);

            prompt = self
                .oracle
                .invoke(&prompts::prompt_reflection_prompt(
                    &full_prompt,
                    &history,
                    &analyses,
                    task_description,
                ))
                .await?;
            debug!("refinement iteration {} complete", iteration + 1);
        }

        Ok(format!("{prompt}{}", prompts::META_PROMPT_TAIL))
    }

    async fn challenging_examples(&self, task_description: &str, prompt: &str) -> Vec<String> {
        let raw = match self
            .oracle
            .invoke(&prompts::edge_case_prompt(task_description, prompt))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("challenging example generation failed: {e}");
                return Vec::new();
            }
        };

        extract_json_array(&raw)
            .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
            .unwrap_or_default()
    }

    /// Generate code for one example, run it, and have the oracle score the
    /// result. Returns the score and a failure report line.
    async fn score_example(&self, full_prompt: &str, example: &str) -> Option<(i64, String)> {
        let generation = full_prompt.replace("{query}", example);
        let raw = self.oracle.invoke(&generation).await.ok()?;
        let code = extract_code_block(&raw)?;

        let output = self
            .runner
            .run(&code, &[])
            .await
            .unwrap_or_else(|e| RunOutput {
                stdout: String::new(),
                stderr: e.to_string(),
                success: false,
            });

        let observed = if output.success {
            output.stdout
        } else {
            output.stderr
        };
        let response = format!("Generated Code : {code}\nObtained output : {observed}");

        let verdict = self
            .oracle
            .invoke(&prompts::ranking_prompt(example, &response, full_prompt))
            .await
            .ok()?;
        let score = extract_json_array(&verdict)
            .and_then(|json| serde_json::from_str::<Vec<Value>>(json).ok())
            .and_then(|values| values.first().and_then(|v| v.as_i64()))?;

        Some((score, format!("input '{example}' scored {score}: {response}")))
    }

    /// Synthesize a complete tool for a described task. The returned tool
    /// asks the oracle to emit runnable code for each invocation and runs
    /// it in the sandbox, returning captured stdout on success.
    pub async fn synthesize(&self, name: &str, description: &str) -> Result<Tool> {
        if name.trim().is_empty() {
            return Err(AgentError::InvalidTool(
                "synthesized tool needs a name".to_string(),
            ));
        }
        if description.trim().is_empty() {
            return Err(AgentError::InvalidTool(
                "synthesized tool needs a non-empty description".to_string(),
            ));
        }

        let template = self.refine(description).await?;
        info!("synthesized generation prompt for tool '{name}'");

        let oracle = Arc::clone(&self.oracle);
        let runner = Arc::clone(&self.runner);
        let tool_name = name.to_string();
        let tool_description =
            format!("{description} Takes 1 argument: the input for the task.");

        Ok(Tool::new(name, &tool_description, move |args: Vec<Value>| {
            let oracle = Arc::clone(&oracle);
            let runner = Arc::clone(&runner);
            let template = template.clone();
            let tool_name = tool_name.clone();
            async move {
                let input = args
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");

                let raw = oracle.invoke(&template.replace("{query}", &input)).await?;
                let code = extract_code_block(&raw).ok_or_else(|| {
                    AgentError::Parse("generated response had no code block".to_string())
                })?;

                let output = runner.run(&code, &[]).await?;
                if output.success {
                    Ok(output.stdout.trim().to_string())
                } else {
                    Err(AgentError::capability(&tool_name, output.stderr))
                }
            }
        }))
    }
}

/// Wrap operator-supplied script code as a registered tool. The script runs
/// in the sandbox with the call arguments passed positionally.
pub fn plugin_tool(
    name: &str,
    description: &str,
    code: &str,
    runner: Arc<dyn CodeRunner>,
) -> Result<Tool> {
    if description.trim().is_empty() {
        return Err(AgentError::InvalidTool(format!(
            "plugin tool '{name}' needs a non-empty description"
        )));
    }
    if code.trim().is_empty() {
        return Err(AgentError::InvalidTool(format!(
            "plugin tool '{name}' needs script code"
        )));
    }

    let script = code.to_string();
    let tool_name = name.to_string();
    Ok(Tool::new(name, description, move |args: Vec<Value>| {
        let runner = Arc::clone(&runner);
        let script = script.clone();
        let tool_name = tool_name.clone();
        async move {
            let args: Vec<String> = args
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();

            let output = runner.run(&script, &args).await?;
            if output.success {
                Ok(output.stdout.trim().to_string())
            } else {
                Err(AgentError::capability(&tool_name, output.stderr))
            }
        }
    }))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Echoes the script back as stdout, or fails on demand.
    pub struct StubRunner {
        pub fail: bool,
        pub stdout: String,
    }

    #[async_trait]
    impl CodeRunner for StubRunner {
        async fn run(&self, _code: &str, args: &[String]) -> Result<RunOutput> {
            if self.fail {
                return Ok(RunOutput {
                    stdout: String::new(),
                    stderr: "boom".to_string(),
                    success: false,
                });
            }
            let mut stdout = self.stdout.clone();
            if !args.is_empty() {
                stdout = format!("{stdout} {}", args.join(" "));
            }
            Ok(RunOutput {
                stdout,
                stderr: String::new(),
                success: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StubRunner;
    use super::*;
    use crate::oracle::testing::ScriptedOracle;

    #[test]
    fn test_extract_code_block() {
        let text = "Sure:\n```python\nprint(4)\n```\ndone";
        assert_eq!(extract_code_block(text).unwrap(), "print(4)");

        let bare = "```\nprint(2)\n```";
        assert_eq!(extract_code_block(bare).unwrap(), "print(2)");

        assert!(extract_code_block("no code here").is_none());
    }

    #[test]
    fn test_extract_code_block_takes_last_fence() {
        let text = "```python\nfirst\n```\ntext\n```python\nsecond\n```";
        assert_eq!(extract_code_block(text).unwrap(), "second");
    }

    #[tokio::test]
    async fn test_refine_runs_fixed_iterations() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            "draft instruction",                    // prompt generation
            r#"["tricky input"]"#,                  // challenging examples
            "```python\nprint('x')\n```",           // code for the example
            r#"[5, "flawless"]"#,                   // ranking: passes
            "no systematic weaknesses",             // error analysis
            "refined instruction",                  // prompt reflection
        ]));
        let runner = Arc::new(StubRunner {
            fail: false,
            stdout: "x".to_string(),
        });

        let refiner = PromptRefiner::new(oracle.clone(), runner, 1);
        let template = refiner.refine("parse dates").await.unwrap();

        assert!(template.starts_with("refined instruction"));
        assert!(template.contains("{query}"));
        assert_eq!(oracle.call_count(), 6);
    }

    #[tokio::test]
    async fn test_synthesized_tool_executes_generated_code() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            // refinement pass
            "draft",
            "[]",        // no challenging examples
            "analysis",
            "refined",
            // tool invocation
            "```python\nprint('result!')\n```",
        ]));
        let runner = Arc::new(StubRunner {
            fail: false,
            stdout: "result!".to_string(),
        });

        let refiner = PromptRefiner::new(oracle, runner, 1);
        let tool = refiner.synthesize("dateparse", "parses dates").await.unwrap();
        assert_eq!(tool.name, "dateparse");

        let response = tool
            .execute(vec![Value::String("2026-08-07".to_string())])
            .await
            .unwrap();
        assert_eq!(response, "result!");
    }

    #[tokio::test]
    async fn test_synthesize_validates_inputs() {
        let oracle = Arc::new(ScriptedOracle::new(vec![]));
        let runner = Arc::new(StubRunner {
            fail: false,
            stdout: String::new(),
        });
        let refiner = PromptRefiner::new(oracle, runner, 1);

        assert!(matches!(
            refiner.synthesize("", "desc").await,
            Err(AgentError::InvalidTool(_))
        ));
        assert!(matches!(
            refiner.synthesize("name", "  ").await,
            Err(AgentError::InvalidTool(_))
        ));
    }

    #[tokio::test]
    async fn test_plugin_tool_passes_arguments_and_maps_failure() {
        let ok = plugin_tool(
            "greet",
            "greets someone",
            "import sys\nprint('hi', sys.argv[1])",
            Arc::new(StubRunner {
                fail: false,
                stdout: "hi".to_string(),
            }),
        )
        .unwrap();
        let response = ok
            .execute(vec![Value::String("ada".to_string())])
            .await
            .unwrap();
        assert_eq!(response, "hi ada");

        let failing = plugin_tool(
            "fails",
            "always fails",
            "raise SystemExit(1)",
            Arc::new(StubRunner {
                fail: true,
                stdout: String::new(),
            }),
        )
        .unwrap();
        let err = failing.execute(vec![]).await.unwrap_err();
        assert!(matches!(err, AgentError::Capability { .. }));
    }

    #[test]
    fn test_plugin_tool_validation() {
        let runner = Arc::new(StubRunner {
            fail: false,
            stdout: String::new(),
        });
        assert!(matches!(
            plugin_tool("x", "", "print(1)", runner.clone()),
            Err(AgentError::InvalidTool(_))
        ));
        assert!(matches!(
            plugin_tool("x", "desc", "  ", runner),
            Err(AgentError::InvalidTool(_))
        ));
    }
}
