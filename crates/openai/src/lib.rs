// OpenAI Driver Implementation
//
// This crate provides an OpenAI-compatible LLM driver. It implements the
// LlmDriver trait from runloop-core, so the ModelAdapter can talk to the
// chat completions API (or any endpoint speaking the same protocol).

mod driver;
mod types;

#[cfg(test)]
mod tests;

pub use driver::{OpenAiDriver, DEFAULT_API_URL};
pub use types::{OpenAiMessage, OpenAiRequest, OpenAiResponse, OpenAiTool, OpenAiToolCall};

// Re-export core types for convenience
pub use runloop_core::LlmDriver;
