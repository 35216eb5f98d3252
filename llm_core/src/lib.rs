//! Streaming LLM provider abstraction.
//!
//! Canonical message model plus three wire variants: chat-completion style
//! (OpenAI), messages-API style (Anthropic) and `contents`/`systemInstruction`
//! style (Gemini). Every provider exposes the same trait: a one-shot `chat`
//! and a cancellable `stream` of plain-text deltas.

pub mod cache;
pub mod memory;
pub mod providers;

pub use cache::ResponseCache;
pub use memory::{ConversationStore, ConversationStoreConfig};
pub use providers::anthropic::AnthropicClient;
pub use providers::gemini::GeminiClient;
pub use providers::openai::OpenAiClient;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/* ---------------------- Public types ---------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct ChatOpts {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Cancelling this token must propagate to the network layer: the
    /// underlying request is dropped and the stream ends with `Cancelled`.
    pub cancel: CancellationToken,
}

impl ChatOpts {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: 1024,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing API key: {0}")]
    MissingKey(&'static str),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("cancelled")]
    Cancelled,
}

/// A cancellable sequence of plain-text deltas.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/* ------------------ Provider trait ------------------ */

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-shot completion of the full response.
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOpts) -> Result<String, LlmError>;

    /// Stream response tokens as they are generated.
    fn stream(&self, messages: &[ChatMessage], opts: &ChatOpts) -> TokenStream;

    /// Rough cost in USD for the given token count.
    fn estimate_cost(&self, tokens: u32) -> f64;

    fn max_tokens(&self) -> u32;

    /// Cheap liveness probe against the provider API.
    async fn health_check(&self) -> Result<(), LlmError>;
}
