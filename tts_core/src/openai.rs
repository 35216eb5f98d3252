//! OpenAI speech synthesis over chunked HTTP.
//!
//! Fallback TTS capability: a single POST whose body streams MP3 bytes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{AudioStream, TtsError, TtsOpts, TtsProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_VOICE: &str = "alloy";

#[derive(Debug, Clone)]
pub struct OpenAiTtsConfig {
    pub model: String,
    pub base_url: String,
}

impl Default for OpenAiTtsConfig {
    fn default() -> Self {
        Self {
            model: "tts-1".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

pub struct OpenAiTts {
    api_key: Arc<str>,
    config: OpenAiTtsConfig,
    client: Client,
}

/// Voice ids from other providers are meaningless here; anything that is
/// not a known OpenAI voice falls back to the default.
fn resolve_voice(voice_id: &str) -> &str {
    match voice_id {
        "alloy" | "echo" | "fable" | "onyx" | "nova" | "shimmer" => voice_id,
        _ => DEFAULT_VOICE,
    }
}

impl OpenAiTts {
    pub fn new(api_key: impl Into<String>, config: OpenAiTtsConfig) -> Result<Self, TtsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            api_key: api_key.into().into(),
            config,
            client,
        })
    }

    pub fn from_env(config: OpenAiTtsConfig) -> Result<Self, TtsError> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| TtsError::MissingKey("OPENAI_API_KEY"))?;
        Self::new(api_key, config)
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn stream(&self, text: &str, opts: &TtsOpts) -> Result<AudioStream, TtsError> {
        let body = json!({
            "model": self.config.model,
            "input": text,
            "voice": resolve_voice(&opts.voice_id),
            "response_format": "mp3",
        });

        let response = self
            .client
            .post(format!("{}/audio/speech", self.config.base_url))
            .bearer_auth(&*self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError::Api { status, body });
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, TtsError>>(64);
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(TtsError::Cancelled)).await;
                        return;
                    }
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(bytes)) => {
                        if !bytes.is_empty() && tx.send(Ok(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(TtsError::Http(e))).await;
                        return;
                    }
                    None => return,
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> Result<(), TtsError> {
        let response = self
            .client
            .get(format!("{}/models", self.config.base_url))
            .bearer_auth(&*self.api_key)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_voice_falls_back() {
        assert_eq!(resolve_voice("21m00Tcm4TlvDq8ikWAM"), "alloy");
        assert_eq!(resolve_voice("nova"), "nova");
    }
}
