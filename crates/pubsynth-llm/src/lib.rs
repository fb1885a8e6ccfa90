//! pubsynth-llm: LLM backend abstraction layer.
//! Provider backends behind the `LlmBackend` trait, the retried and cached
//! `GenerationClient`, and the prompt templates used by the analysis crate.

pub mod backend;
pub mod client;
pub mod prompts;

pub use backend::{GeminiBackend, LlmBackend, LlmRequest, LlmResponse, Message, OpenAiCompatibleBackend};
pub use client::GenerationClient;
