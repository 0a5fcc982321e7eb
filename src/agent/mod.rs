//! Agentic orchestration engine
//!
//! The supervisor control loop and everything it leans on:
//! - critic: pre- and post-execution scoring of tool calls
//! - reflection: code, silent and capability recovery strategies
//! - synth: prompt-refined tool synthesis behind a sandboxed runner

pub mod critic;
pub mod reflection;
pub mod supervisor;
pub mod synth;

pub use critic::{Critic, Verdict};
pub use supervisor::{RunOutcome, Supervisor, SupervisorConfig};
pub use synth::{plugin_tool, CodeRunner, ProcessRunner, PromptRefiner, RunOutput};
