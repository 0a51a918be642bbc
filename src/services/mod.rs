//! External collaborators (chat completion provider)

pub mod llm;

pub use llm::{provider_from_env, AnthropicProvider, CompletionProvider, FallbackProvider, LlmConfig};
