pub mod clients;
pub mod compare;
pub mod config;
pub mod core;
pub mod mcp;
pub mod prompts;
pub mod sse;
pub mod tools;

#[cfg(test)]
mod testing;

pub use clients::{
    LLMClient, LLMError, Message, MessageRole, OpenAIClient, StreamChunk, TokenUsage,
    ToolDefinition, create_llm_client,
};
pub use compare::{Approach, Comparison, ComparisonReport};
pub use config::{LlmOverrides, LlmSettings};
pub use core::{AgentError, FunctionCallingAgent, ReactAgent, RunOutcome, Step};
pub use mcp::{MCPConfig, MCPError, MCPManager, McpClient, McpServer};
pub use tools::{ToolExecutor, ToolManager, ToolTrait, default_tools};
