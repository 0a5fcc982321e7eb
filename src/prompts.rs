//! Prompt templates for every oracle decision point.
//!
//! All prompts that expect structured output state the exact shape and end
//! with a bare "respond with X only" line; the callers still treat the
//! output as untrusted and re-parse defensively.

/// Instructs the oracle to emit exactly one tool call.
pub fn select_prompt(query: &str, tools: &str, scratchpad: &str, responses: &[String]) -> String {
    format!(
        r#"You are a function calling agent. Given the user query, the available tools and the history of previous tool calls, decide the single next tool call that makes progress on the query.

Available tools (name: description):
{tools}

User query: {query}

Previous tool calls and their responses:
{scratchpad}

Raw responses so far: {responses:?}

Rules:
- Respond with EXACTLY ONE call in this format: ["tool_name", [arguments], "one sentence rationale"]
- Arguments must be a JSON array, one element per argument the tool takes.
- Do not repeat a call that already produced a usable response above.
- When the query is fully answered by the responses above, call ["finish", ["end"], "the query is answered"]
- If NO available tool can make progress, respond with the single word NONE.

Your response:"#
    )
}

/// Asks for a patched call after a failure.
pub fn code_reflection_prompt(query: &str, error: &str, tools: &str, last_call: &str) -> String {
    format!(
        r#"You are a function call reflexion agent. A tool call failed and you must repair it.

User query: {query}

Failing call: {last_call}

Error: {error}

Available tools (name: description):
{tools}

Rules:
- Respond with ONE corrected call in this format: ["tool_name", [arguments], "one sentence rationale"]
- Only use tools from the list above.
- If no tool in the list can accomplish the task, respond with the single word NONE.

Your response:"#
    )
}

/// Binary failure classification used after each failed patch attempt.
pub fn failure_class_prompt(call: &str, error: &str, tools: &str) -> String {
    format!(
        r#"You are a failure classification agent. Classify the error below.

Tool call: {call}

Error: {error}

Available tools (name: description):
{tools}

Classify as exactly one word:
- upstream : the failure comes from an external API or the network, retrying the same call will not help
- missing  : the call names a tool that does not exist in the list above
- logic    : the arguments or the tool choice are wrong and a corrected call could succeed

Respond with one word only:"#
    )
}

/// Pre-execution critique of a call's arguments.
pub fn critic_call_prompt(query: &str, call: &str, description: &str, scratchpad: &str) -> String {
    format!(
        r#"You are a response critic agent. Judge whether the arguments of the tool call below are sensible given the tool description, the user query and the call history.

User query: {query}

Tool call: {call}

Tool description: {description}

Call history:
{scratchpad}

Respond STRICTLY as JSON: {{"score": 0, "reasoning": "..."}}
Use score 0 when the arguments are acceptable and score 1 when they are implausible or malformed.

Your response:"#
    )
}

/// Post-execution critique of a tool's response.
pub fn critic_response_prompt(query: &str, call: &str, description: &str, response: &str) -> String {
    format!(
        r#"You are a response critic agent. Judge whether the response below is a plausible output for the tool call, given the tool description and the user query.

User query: {query}

Tool call: {call}

Tool description: {description}

Tool response: {response}

Respond STRICTLY as JSON: {{"score": 0, "reasoning": "..."}}
Use score 0 when the response plausibly answers what was asked and score 1 when it does not.

Your response:"#
    )
}

/// Single-shot argument repair when the critic rejects a call pre-execution.
pub fn silent_reflection_prompt(call: &str, query: &str, scratchpad: &str, reason: &str) -> String {
    format!(
        r#"You are a silent error reflexion agent. The arguments of the tool call below were judged implausible. Keep the SAME tool but fix the arguments.

User query: {query}

Tool call: {call}

Critic reasoning: {reason}

Call history:
{scratchpad}

Respond with ONE corrected call in this format: ["tool_name", [arguments], "one sentence rationale"]

Your response:"#
    )
}

/// Composes the final answer from the full call history.
pub fn final_response_prompt(query: &str, scratchpad: &str, responses: &[String]) -> String {
    format!(
        r#"You are a final response generator. Compose a complete answer to the user query from the tool call history below. Use only information present in the responses.

User query: {query}

Tool call history:
{scratchpad}

Responses: {responses:?}

Final answer:"#
    )
}

/// Classifies the next move of the retrieval-reasoning loop.
pub fn thought_prompt(question: &str, transcript: &str) -> String {
    format!(
        r#"You are a helpful Thought Generating Agent working on answering a question from a document. Given the question and the work so far, decide the next move.

Question: {question}

Work so far:
{transcript}

Respond with exactly one line, either:
RETRIEVAL THOUGHT <a single focused sub-query to retrieve from the document>
or:
REASONING THOUGHT <what can be concluded from the observations so far>

Prefer RETRIEVAL THOUGHT when information is still missing and REASONING THOUGHT when the observations already cover the question.

Your response:"#
    )
}

/// Produces intermediate reasoning or the terminal answer.
pub fn reasoning_prompt(question: &str, transcript: &str, force_completion: bool) -> String {
    let note = if force_completion {
        "\nNote: you MUST provide a final answer now, based on all information gathered so far."
    } else {
        ""
    };
    format!(
        r#"You are a helpful Reasoning Agent. Given the question and the observations below, reason towards the answer.

Question: {question}

Work so far:
{transcript}

If the observations are sufficient, respond with:
FINAL ANSWER: <the answer>
Otherwise respond with:
REASONING <one step of reasoning over the observations>{note}

Your response:"#
    )
}

/// Flags terms in the question that need clarification.
pub fn jargon_prompt(query: &str, previous: &[String]) -> String {
    format!(
        r#"You are a jargon detecting agent. Identify terms in the query below that are domain jargon, internal abbreviations or ambiguous names a reader could not resolve without a definition.

Query: {query}

Terms already clarified (do not report again): {previous:?}

Respond with a JSON array of strings, for example ["EBITDA", "QoQ"].
If there is no such term, respond with the single word None.

Your response:"#
    )
}

/// Rewrites the question using supplied jargon definitions.
pub fn rephrase_prompt(query: &str, definitions: &str) -> String {
    format!(
        r#"You are a query rephraser agent. Rewrite the query below so every jargon term is replaced or explained using the definitions provided. Keep the intent identical.

Query: {query}

Definitions: {definitions}

Rephrased query:"#
    )
}

/// Generates distinct single-hop queries answerable from a data chunk.
pub fn utility_query_prompt(number: usize, data: &str) -> String {
    let shape = (1..=number)
        .map(|i| format!("    \"query_{i}\": \"query text here\""))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        r#"You are an expert query generator agent. Given the data below, generate {number} distinct queries. Ensure each query is:
1. Single-hop (focuses on one specific aspect)
2. Clear and concise
3. Unique and relevant
4. Directly and unambiguously answerable from the data

Respond STRICTLY in this EXACT JSON format:
{{
{shape}
}}

DATA:
{data}

Your Response:"#
    )
}

/// Answers a query from a single cached chunk, or declines.
pub fn memory_hit_prompt(query: &str, chunk: &str) -> String {
    format!(
        r#"You are an expert reasoning agent tasked with answering the query from the given chunk of data.
Follow these guidelines:
1. Directly answer the query using ONLY the information in the provided chunk
2. If the chunk does not contain sufficient information, respond with "INSUFFICIENT_CONTEXT"
3. Be concise and precise in your response

Current Query: {query}
Chunk: {chunk}
Answer:"#
    )
}

/// Scores how well the transcript supports the answer.
pub fn confidence_prompt(steps: &str, answer: &str) -> String {
    format!(
        r#"You are a confidence scoring critic agent. Given the reasoning steps and the final answer below, score how well the steps support the answer.

Steps:
{steps}

Answer: {answer}

Respond with a single number between 0.0 and 1.0 only:"#
    )
}

/// Summarizes web search results into a direct answer.
pub fn web_search_prompt(query: &str, results: &[String]) -> String {
    format!(
        r#"You are a web research assistant. Answer the query using only the search results below. Be direct and cite which result supports the answer.

Query: {query}

Search results:
{results:?}

Answer:"#
    )
}

/// Retrieval-optimized table summary from its HTML representation.
pub fn table_summary_prompt(html: &str) -> String {
    format!(
        r#"You are an assistant tasked with summarizing tables for retrieval. These summaries will be embedded and used to retrieve the raw table elements. You will be given the HTML code of a table; return a concise summary of the table (without losing any information, including numerical), well optimized for retrieval. Table: {html} Summary:"#
    )
}

/// Short display title for an uploaded document.
pub fn title_prompt(text: &str) -> String {
    format!(
        r#"Generate a short display title (at most 8 words) for the document whose opening text is below. Respond with the title only, no quotes.

{text}

Title:"#
    )
}

/// Answers a question against retrieved context chunks.
pub fn context_answer_prompt(question: &str, context: &str) -> String {
    format!(
        r#"Answer the question using only the context below. If the context does not contain the answer, summarize what the context does say about the question.

Context:
{context}

Question: {question}

Answer:"#
    )
}

// Prompt-refinement pipeline used when synthesizing a new tool.

/// Base instruction every generated code prompt starts from.
pub const META_PROMPT: &str = r#"You are an expert Python programmer. Write a complete, self-contained Python script that accomplishes the task described below for a given input. The script must read nothing interactively, must print its result to stdout, and must not require any third-party package."#;

/// Suffix appended to every generated code prompt.
pub const META_PROMPT_TAIL: &str = r#"

Input: {query}

Respond with the code in a single fenced block:
```python
<code>
```"#;

/// First draft of a task-specific generation prompt.
pub fn prompt_generation_prompt(task_description: &str) -> String {
    format!(
        r#"{META_PROMPT}

Write an improved, task-specific version of the instruction above for the following task. Keep the stdout and no-third-party-package constraints. Respond with the instruction text only.

Task: {task_description}

Instruction:"#
    )
}

/// Challenging inputs for a task, used to probe a candidate prompt.
pub fn edge_case_prompt(task_description: &str, instruction: &str) -> String {
    format!(
        r#"You are a challenging and edge case generation agent. Given the task and the instruction used to generate code for it, produce 3 challenging example inputs that are likely to break naive implementations.

Task: {task_description}

Instruction: {instruction}

Respond STRICTLY as a JSON array of 3 strings.

Your response:"#
    )
}

/// Scores generated code against its captured output.
pub fn ranking_prompt(query: &str, response: &str, prompt: &str) -> String {
    format!(
        r#"You are a ranker agent. Score how well the generated code solved the input, on the scale [0, 1, 2, 3, 4, 5] where 5 is a flawless solution and 0 is a crash or an entirely wrong answer.

Input: {query}

Generation instruction: {prompt}

{response}

Respond STRICTLY as JSON: [score, "one sentence of reasoning"]

Your response:"#
    )
}

/// Summarizes what went wrong across the failing examples.
pub fn error_analysis_prompt(prompt: &str, failures: &str) -> String {
    format!(
        r#"You are an error analysis agent. The instruction below produced failing code for the listed inputs. Summarize the systematic weaknesses of the instruction in a few sentences.

Instruction:
{prompt}

Failures:
{failures}

Analysis:"#
    )
}

/// Produces the next refinement of the generation prompt.
pub fn prompt_reflection_prompt(
    initial_prompt: &str,
    history: &[String],
    error_analysis: &[String],
    task_description: &str,
) -> String {
    format!(
        r#"You are a final prompt agent. Refine the code generation instruction below using the error analysis. Keep the constraints: self-contained Python, result printed to stdout, no third-party packages, input substituted at {{query}}.

Task: {task_description}

Current instruction:
{initial_prompt}

Previous instructions: {history:?}

Error analysis: {error_analysis:?}

Respond with the refined instruction text only:"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_prompt_mentions_grammar_and_tools() {
        let p = select_prompt("q", "- finish: ends", "", &[]);
        assert!(p.contains("[\"tool_name\", [arguments]"));
        assert!(p.contains("- finish: ends"));
        assert!(p.contains("NONE"));
    }

    #[test]
    fn test_utility_query_prompt_shape_matches_count() {
        let p = utility_query_prompt(2, "data");
        assert!(p.contains("query_1"));
        assert!(p.contains("query_2"));
        assert!(!p.contains("query_3"));
    }

    #[test]
    fn test_reasoning_prompt_force_note() {
        assert!(reasoning_prompt("q", "t", true).contains("MUST provide a final answer"));
        assert!(!reasoning_prompt("q", "t", false).contains("MUST provide a final answer"));
    }
}
