//! Gemini-style provider (`contents` / `systemInstruction` wire format).
//!
//! The assistant role is spelled `model`, and generation parameters live
//! under `generationConfig`.

use std::{env, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use super::{sse_data, LineBuffer};
use crate::{ChatMessage, ChatOpts, LlmError, LlmProvider, Role};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const COST_PER_1K_TOKENS_USD: f64 = 0.002;

pub struct GeminiClient {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Result<Self, LlmError> {
        let client = Arc::new(
            Client::builder()
                .timeout(Duration::from_secs(120))
                .tcp_keepalive(Duration::from_secs(60))
                .pool_max_idle_per_host(50)
                .pool_idle_timeout(Duration::from_secs(90))
                .build()?,
        );
        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: api_key.into(),
        })
    }

    pub fn from_env() -> Result<Self, LlmError> {
        let api_key =
            env::var("GEMINI_API_KEY").map_err(|_| LlmError::MissingKey("GEMINI_API_KEY"))?;
        Self::new(api_key, env::var("GEMINI_BASE_URL").ok())
    }

    fn request_body(messages: &[ChatMessage], opts: &ChatOpts) -> GenerateRequest {
        let mut system_instruction = None;
        let mut contents = Vec::with_capacity(messages.len());
        for m in messages {
            match m.role {
                Role::System => {
                    system_instruction = Some(SystemInstruction {
                        parts: vec![Part { text: m.content.clone() }],
                    });
                }
                Role::User => contents.push(Content {
                    role: "user",
                    parts: vec![Part { text: m.content.clone() }],
                }),
                Role::Assistant => contents.push(Content {
                    role: "model",
                    parts: vec![Part { text: m.content.clone() }],
                }),
            }
        }
        GenerateRequest {
            system_instruction,
            contents,
            generation_config: GenerationConfig {
                temperature: opts.temperature,
                max_output_tokens: opts.max_tokens,
            },
        }
    }

    fn extract_text(response: GenerateResponse) -> Option<String> {
        let parts = response.candidates.into_iter().next()?.content?.parts;
        let text: String = parts.into_iter().map(|p| p.text).collect();
        (!text.is_empty()).then_some(text)
    }
}

#[async_trait]
impl LlmProvider for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOpts) -> Result<String, LlmError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, opts.model, self.api_key
        );
        let response = self
            .client
            .post(url)
            .json(&Self::request_body(messages, opts))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let parsed = response.json::<GenerateResponse>().await?;
        Self::extract_text(parsed).ok_or_else(|| LlmError::Stream("empty candidates".into()))
    }

    fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOpts,
    ) -> Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>> {
        let (tx, rx) = mpsc::channel::<Result<String, LlmError>>(100);
        let body = Self::request_body(messages, opts);
        let client = self.client.clone();
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, opts.model, self.api_key
        );
        let cancel = opts.cancel.clone();

        tokio::spawn(async move {
            let request = client.post(&url).json(&body).send();
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(LlmError::Cancelled)).await;
                    return;
                }
                r = request => r,
            };

            let response = match response {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    let _ = tx.send(Err(LlmError::Api { status, body })).await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Err(LlmError::Http(e))).await;
                    return;
                }
            };

            let mut stream = response.bytes_stream();
            let mut lines = LineBuffer::new();

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(LlmError::Cancelled)).await;
                        return;
                    }
                    item = stream.next() => item,
                };
                let Some(item) = item else { break };
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Http(e))).await;
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    let Some(data) = sse_data(&line) else { continue };
                    if let Ok(chunk) = serde_json::from_str::<GenerateResponse>(data) {
                        if let Some(text) = Self::extract_text(chunk) {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    fn estimate_cost(&self, tokens: u32) -> f64 {
        f64::from(tokens) / 1000.0 * COST_PER_1K_TOKENS_USD
    }

    fn max_tokens(&self) -> u32 {
        8_192
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let url = format!("{}/v1beta/models?key={}", self.base_url, self.api_key);
        let response = self.client.get(url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LlmError::Api {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }
}
