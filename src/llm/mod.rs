//! LLM collaborator: chat and tool-calling

pub mod client;
pub mod tool_loop;

pub use client::{ChatMessage, ChatModel, ChatOutcome, ChatRequest, LlmClient, ToolCall, ToolDefinition};
pub use tool_loop::{run_tool_loop, ToolExecutor, ToolLoopConfig, ToolLoopResult, ToolOutcome};
