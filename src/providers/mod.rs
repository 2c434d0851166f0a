pub mod base;
pub mod openai;

pub use base::{ChatProvider, ChatRequest, ChatResponse, Message, ToolCallRequest, ToolDefinition, Usage};
pub use openai::OpenAiProvider;
