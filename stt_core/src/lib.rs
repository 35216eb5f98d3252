//! Streaming speech-to-text.
//!
//! A provider is driven through a command handle and reports back through a
//! bounded event channel the session drains; providers never hold a
//! reference back into session state.

pub mod analyzer;
pub mod deepgram;
pub mod endpointing;
pub mod text;

pub use analyzer::{analyze, CompletionAnalysis, Suggestion};
pub use deepgram::{DeepgramConfig, DeepgramStt};
pub use endpointing::EndpointingConfig;
pub use text::{normalize_transcript, FinalDedup};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    Pcm16,
    Opus,
}

/// Connection parameters for one streaming transcription session.
#[derive(Debug, Clone)]
pub struct SttParams {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
    pub endpointing: EndpointingConfig,
    /// Ceiling for silence-based final promotion.
    pub silence_timeout_ms: u64,
}

impl Default for SttParams {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Pcm16,
            sample_rate: 16_000,
            channels: 1,
            language: "en".to_string(),
            endpointing: EndpointingConfig::default(),
            silence_timeout_ms: 5_000,
        }
    }
}

/// Lifecycle of the provider stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Connecting,
    Open,
    Reconnecting,
    Closing,
    Closed,
}

/// Events emitted by a provider stream into the session's queue.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// Stream is open and flushed; carries the connect handshake latency.
    Ready {
        connect_latency_ms: u64,
        queued_frames: usize,
    },
    Partial {
        text: String,
    },
    Final {
        text: String,
        start_ms: u64,
        end_ms: u64,
        /// True when the final came from the silence-promotion timer rather
        /// than the provider's own endpointing.
        promoted: bool,
    },
    StateChange {
        state: StreamState,
    },
    Error {
        message: String,
        /// Terminal errors abort the turn; transient ones only log.
        terminal: bool,
    },
}

#[derive(Debug, Error)]
pub enum SttError {
    #[error("missing API key: {0}")]
    MissingKey(&'static str),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connect timeout after {0} ms")]
    ConnectTimeout(u64),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}")]
    Api { status: u16 },
}

pub(crate) enum Command {
    Audio(Bytes),
    /// Ask the provider to flush a final for buffered audio now.
    Finalize,
    Close,
}

/// Cheap cloneable handle onto a running stream task.
#[derive(Clone)]
pub struct SttStreamHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) ready: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl SttStreamHandle {
    /// A handle that accepts and discards everything, always ready. For
    /// provider stubs in tests.
    pub fn detached() -> Self {
        let (commands, mut rx) = mpsc::channel(8);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self {
            commands,
            ready: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    /// Hand an audio frame to the stream. Returns false when the stream's
    /// inbox is full (backpressure) or the stream has shut down.
    pub fn send_audio(&self, bytes: Bytes) -> bool {
        self.commands.try_send(Command::Audio(bytes)).is_ok()
    }

    /// Force endpointing now (push-to-talk release, `audio.end`).
    pub async fn finalize(&self) {
        let _ = self.commands.send(Command::Finalize).await;
    }

    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a streaming transcription session. Events flow into `events`
    /// until the stream closes.
    async fn connect(
        &self,
        params: SttParams,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<SttStreamHandle, SttError>;

    async fn health_check(&self) -> Result<(), SttError>;
}
