//! Streaming text-to-speech.
//!
//! A provider turns text into a cancellable async sequence of encoded audio
//! byte chunks (MP3). Cancelling the token closes the underlying transport
//! and terminates the iterator.

pub mod elevenlabs;
pub mod openai;

pub use elevenlabs::ElevenLabsTts;
pub use openai::OpenAiTts;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Per-stream synthesis options.
#[derive(Debug, Clone)]
pub struct TtsOpts {
    pub voice_id: String,
    /// Provider latency/quality knob (0 = best quality, 4 = fastest).
    pub optimize_streaming_latency: u32,
    pub output_format: String,
    pub cancel: CancellationToken,
}

impl Default for TtsOpts {
    fn default() -> Self {
        Self {
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            optimize_streaming_latency: 3,
            output_format: "mp3_44100_128".to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("missing API key: {0}")]
    MissingKey(&'static str),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("handshake timeout after {0} ms")]
    HandshakeTimeout(u64),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cancelled")]
    Cancelled,
}

/// A cancellable sequence of encoded audio chunks.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes, TtsError>> + Send>>;

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start synthesis of `text`, yielding audio chunks as the provider
    /// produces them.
    async fn stream(&self, text: &str, opts: &TtsOpts) -> Result<AudioStream, TtsError>;

    async fn health_check(&self) -> Result<(), TtsError>;
}
