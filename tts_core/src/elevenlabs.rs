//! ElevenLabs streaming synthesis over WebSocket.
//!
//! The stream-input protocol wants a prime message (a single space plus
//! voice settings) before the text, then an empty-text end-of-stream
//! marker. Audio arrives base64-encoded; a message with `isFinal` ends the
//! stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AudioStream, TtsError, TtsOpts, TtsProvider};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(7);
const RECONNECT_MAX_ATTEMPTS: u32 = 3;
const RECONNECT_BASE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    pub model_id: String,
    pub base_url: String,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            model_id: "eleven_turbo_v2_5".to_string(),
            base_url: "wss://api.elevenlabs.io".to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

pub struct ElevenLabsTts {
    api_key: Arc<str>,
    config: ElevenLabsConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ServerMessage {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ElevenLabsTts {
    pub fn new(api_key: impl Into<String>, config: ElevenLabsConfig) -> Self {
        Self {
            api_key: api_key.into().into(),
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env(config: ElevenLabsConfig) -> Result<Self, TtsError> {
        let api_key = std::env::var("ELEVENLABS_API_KEY")
            .map_err(|_| TtsError::MissingKey("ELEVENLABS_API_KEY"))?;
        Ok(Self::new(api_key, config))
    }

    fn stream_url(&self, opts: &TtsOpts) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream-input?model_id={}&optimize_streaming_latency={}&output_format={}",
            self.config.base_url,
            opts.voice_id,
            self.config.model_id,
            opts.optimize_streaming_latency,
            opts.output_format,
        )
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsTts {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn stream(&self, text: &str, opts: &TtsOpts) -> Result<AudioStream, TtsError> {
        let (tx, rx) = mpsc::channel::<Result<Bytes, TtsError>>(64);
        let worker = StreamWorker {
            url: self.stream_url(opts),
            api_key: self.api_key.clone(),
            stability: self.config.stability,
            similarity_boost: self.config.similarity_boost,
            text: text.to_string(),
            cancel: opts.cancel.clone(),
            tx,
        };
        tokio::spawn(worker.run());
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> Result<(), TtsError> {
        let response = self
            .http
            .get("https://api.elevenlabs.io/v1/voices")
            .header("xi-api-key", &*self.api_key)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TtsError::Api {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }
}

struct StreamWorker {
    url: String,
    api_key: Arc<str>,
    stability: f32,
    similarity_boost: f32,
    text: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Bytes, TtsError>>,
}

impl StreamWorker {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            match self.attempt_once().await {
                Ok(()) => return,
                Err(RetryOrFail::Fail(e)) => {
                    let _ = self.tx.send(Err(e)).await;
                    return;
                }
                // Reconnect only when the session dropped before any audio
                // was delivered.
                Err(RetryOrFail::Retry(reason)) => {
                    attempt += 1;
                    if attempt > RECONNECT_MAX_ATTEMPTS {
                        let _ = self.tx.send(Err(TtsError::WebSocket(reason))).await;
                        return;
                    }
                    let backoff = RECONNECT_BASE * 2u32.saturating_pow(attempt - 1);
                    let jitter = Duration::from_millis(
                        rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4),
                    );
                    warn!(attempt, reason = %reason, "tts stream reconnecting before first audio");
                    tokio::time::sleep(backoff + jitter).await;
                }
            }
        }
    }

    async fn attempt_once(&self) -> Result<(), RetryOrFail> {
        let connect = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async(self.url.as_str()),
        );
        let (mut socket, _response) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RetryOrFail::Fail(TtsError::Cancelled)),
            result = connect => match result {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(RetryOrFail::Retry(e.to_string())),
                Err(_) => {
                    return Err(RetryOrFail::Fail(TtsError::HandshakeTimeout(
                        HANDSHAKE_TIMEOUT.as_millis() as u64,
                    )))
                }
            },
        };

        // Prime with a space and voice settings, then the text, then EOS.
        let prime = json!({
            "text": " ",
            "voice_settings": {
                "stability": self.stability,
                "similarity_boost": self.similarity_boost,
            },
            "xi_api_key": &*self.api_key,
        });
        let body = json!({ "text": format!("{} ", self.text), "try_trigger_generation": true });
        let eos = json!({ "text": "" });
        for message in [prime, body, eos] {
            if let Err(e) = socket.send(Message::Text(message.to_string())).await {
                return Err(RetryOrFail::Retry(e.to_string()));
            }
        }

        let mut delivered_audio = false;
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = socket.close(None).await;
                    return Err(RetryOrFail::Fail(TtsError::Cancelled));
                }
                message = socket.next() => message,
            };

            match message {
                Some(Ok(Message::Text(raw))) => {
                    let parsed = match serde_json::from_str::<ServerMessage>(&raw) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(error = %e, "unparseable tts server message");
                            continue;
                        }
                    };
                    if let Some(error) = parsed.error {
                        let detail = parsed.message.unwrap_or(error);
                        return Err(RetryOrFail::Fail(TtsError::WebSocket(detail)));
                    }
                    if let Some(audio) = parsed.audio {
                        let bytes = BASE64
                            .decode(audio.as_bytes())
                            .map_err(|e| RetryOrFail::Fail(TtsError::Decode(e.to_string())))?;
                        if !bytes.is_empty() {
                            delivered_audio = true;
                            if self.tx.send(Ok(Bytes::from(bytes))).await.is_err() {
                                let _ = socket.close(None).await;
                                return Ok(());
                            }
                        }
                    }
                    if parsed.is_final == Some(true) {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if !bytes.is_empty() {
                        delivered_audio = true;
                        if self.tx.send(Ok(Bytes::from(bytes))).await.is_err() {
                            let _ = socket.close(None).await;
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return if delivered_audio {
                        // Mid-utterance drop after audio: no safe resume point.
                        Err(RetryOrFail::Fail(TtsError::WebSocket(
                            "stream closed mid-utterance".into(),
                        )))
                    } else {
                        Err(RetryOrFail::Retry("stream closed before first audio".into()))
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return if delivered_audio {
                        Err(RetryOrFail::Fail(TtsError::WebSocket(e.to_string())))
                    } else {
                        Err(RetryOrFail::Retry(e.to_string()))
                    };
                }
            }
        }
    }
}

enum RetryOrFail {
    Retry(String),
    Fail(TtsError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_encodes_voice_and_format() {
        let tts = ElevenLabsTts::new("key", ElevenLabsConfig::default());
        let opts = TtsOpts {
            voice_id: "voice123".into(),
            optimize_streaming_latency: 4,
            ..TtsOpts::default()
        };
        let url = tts.stream_url(&opts);
        assert!(url.contains("/v1/text-to-speech/voice123/stream-input"));
        assert!(url.contains("optimize_streaming_latency=4"));
        assert!(url.contains("output_format=mp3_44100_128"));
    }

    #[test]
    fn audio_payload_parses() {
        let raw = r#"{"audio":"aGVsbG8=","isFinal":false}"#;
        let parsed: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.audio.as_deref(), Some("aGVsbG8="));
        assert_eq!(parsed.is_final, Some(false));
    }

    #[test]
    fn final_marker_parses() {
        let raw = r#"{"isFinal":true}"#;
        let parsed: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(parsed.audio.is_none());
        assert_eq!(parsed.is_final, Some(true));
    }
}
