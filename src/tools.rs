//! Tool registry and call grammar
//!
//! Tools are opaque async callables identified by name, with a
//! natural-language description used both for oracle-side selection and
//! human-readable justification. Each session keeps a base set and a working
//! copy; the working copy may shrink or grow during one query and is reset
//! from the base set at the start of the next.

use crate::error::{AgentError, Result};
use crate::oracle::Oracle;
use crate::prompts;
use crate::search::WebSearch;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the document-retrieval tool, dispatched specially by the
/// supervisor.
pub const RETRIEVAL_TOOL: &str = "document_qa";

/// Name of the terminal sentinel tool.
pub const SENTINEL_TOOL: &str = "finish";

/// Response value that ends the supervisor loop.
pub const SENTINEL_RESPONSE: &str = "end";

/// One structured tool invocation parsed from oracle output.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    /// Ordered argument values
    pub arguments: Vec<Value>,
    pub rationale: String,
}

impl ToolCall {
    /// Render back into the textual grammar, for prompts and the scratchpad.
    pub fn render(&self) -> String {
        serde_json::json!([self.name, self.arguments, self.rationale]).to_string()
    }

    /// First argument coerced to text; the common case for single-argument
    /// tools like retrieval.
    pub fn first_arg_text(&self) -> String {
        match self.arguments.first() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// The canonical sentinel call.
    pub fn sentinel() -> Self {
        Self {
            name: SENTINEL_TOOL.to_string(),
            arguments: vec![Value::String(SENTINEL_RESPONSE.to_string())],
            rationale: "the query is answered".to_string(),
        }
    }
}

/// Parsed oracle decision.
#[derive(Debug, Clone)]
pub enum Directive {
    Call(ToolCall),
    /// Terminal sentinel
    Finish,
    /// No suitable tool
    NoTool,
}

/// Extract the first bracket-balanced JSON array from text.
pub(crate) fn extract_json_array(s: &str) -> Option<&str> {
    let start = s.find('[')?;
    let mut depth = 0;
    let mut end = start;

    for (i, c) in s[start..].char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if end > start {
        Some(&s[start..end])
    } else {
        None
    }
}

/// Extract the first brace-balanced JSON object from text.
pub(crate) fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, c) in s[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if end > start {
        Some(&s[start..end])
    } else {
        None
    }
}

/// Parse oracle output into a directive.
///
/// The grammar is a JSON array `["tool_name", [arguments], "rationale"]`;
/// the bare words `NONE` and `finish` are also accepted, as is `end_tool`
/// for the sentinel. Everything else is a `Parse` error.
pub fn parse_directive(raw: &str) -> Result<Directive> {
    let trimmed = raw.trim();

    if trimmed.eq_ignore_ascii_case("none") {
        return Ok(Directive::NoTool);
    }
    if trimmed.eq_ignore_ascii_case(SENTINEL_TOOL) || trimmed.eq_ignore_ascii_case("end_tool") {
        return Ok(Directive::Finish);
    }

    let json = extract_json_array(trimmed)
        .ok_or_else(|| AgentError::Parse(format!("no call array in: {}", preview(trimmed))))?;
    let values: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| AgentError::Parse(format!("{e} in: {}", preview(json))))?;

    let name = values
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::Parse(format!("call has no tool name: {}", preview(json))))?
        .to_string();

    if name.eq_ignore_ascii_case("none") {
        return Ok(Directive::NoTool);
    }
    if name.eq_ignore_ascii_case(SENTINEL_TOOL) || name.eq_ignore_ascii_case("end_tool") {
        return Ok(Directive::Finish);
    }

    let arguments = match values.get(1) {
        Some(Value::Array(args)) => args.clone(),
        Some(_) | None => {
            return Err(AgentError::Parse(format!(
                "call arguments must be an array: {}",
                preview(json)
            )))
        }
    };

    let rationale = values
        .get(2)
        .and_then(|v| v.as_str())
        .unwrap_or("Reason is not provided")
        .to_string();

    Ok(Directive::Call(ToolCall {
        name,
        arguments,
        rationale,
    }))
}

fn preview(s: &str) -> String {
    let mut out: String = s.chars().take(120).collect();
    if out.len() < s.len() {
        out.push_str("...");
    }
    out
}

/// Type alias for tool handler futures.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Type alias for tool handler functions.
pub type ToolHandler = Arc<dyn Fn(Vec<Value>) -> ToolFuture + Send + Sync>;

/// A registered tool.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    handler: ToolHandler,
}

impl Tool {
    /// Create a new tool from an async closure.
    pub fn new<F, Fut>(name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Execute the tool.
    pub async fn execute(&self, args: Vec<Value>) -> Result<String> {
        debug!("executing tool '{}'", self.name);
        (self.handler)(args).await
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Ordered, name-unique collection of tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. Names must be unique and descriptions non-empty.
    pub fn register(&mut self, tool: Tool) -> Result<()> {
        if tool.description.trim().is_empty() {
            return Err(AgentError::InvalidTool(format!(
                "tool '{}' has an empty description",
                tool.name
            )));
        }
        if self.contains(&tool.name) {
            return Err(AgentError::InvalidTool(format!(
                "tool name '{}' is already registered",
                tool.name
            )));
        }
        info!("registered tool '{}'", tool.name);
        self.tools.push(tool);
        Ok(())
    }

    /// Remove a tool by name. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.tools.len();
        self.tools.retain(|t| t.name != name);
        self.tools.len() < before
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Render the tool list for oracle prompts.
    pub fn render_for_prompt(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Build the base tool set every session starts with.
pub fn base_registry(oracle: Arc<dyn Oracle>, search: Arc<dyn WebSearch>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry
        .register(Tool::new(
            RETRIEVAL_TOOL,
            "Answers a question using content retrieved from the user's uploaded document. \
             Takes 1 argument: [question]. Example: [\"document_qa\", [\"What was the gross \
             margin in FY 2022?\"], \"the answer is in the uploaded report\"]",
            |_args| async {
                Err(AgentError::internal(
                    "document_qa is dispatched by the supervisor",
                ))
            },
        ))
        .expect("base registry construction");

    let search_oracle = Arc::clone(&oracle);
    registry
        .register(Tool::new(
            "web_search",
            "Looks up general, publicly available information online and answers from the \
             results. Takes 1 argument: [query]. Use only for information that cannot come \
             from the uploaded document.",
            move |args| {
                let oracle = Arc::clone(&search_oracle);
                let search = Arc::clone(&search);
                async move {
                    let query = match args.first() {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => {
                            return Err(AgentError::capability("web_search", "missing query"))
                        }
                    };
                    let results = search.search(&query, 3).await?;
                    oracle
                        .invoke(&prompts::web_search_prompt(&query, &results))
                        .await
                }
            },
        ))
        .expect("base registry construction");

    registry
        .register(Tool::new(
            SENTINEL_TOOL,
            "Ends the question-answering process once the query is fully answered. Takes 1 \
             argument which MUST be \"end\". Returns \"end\".",
            |_args| async { Ok(SENTINEL_RESPONSE.to_string()) },
        ))
        .expect("base registry construction");

    registry
}
