//! Chat-completion style provider (OpenAI wire format).

use std::{env, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use super::{sse_data, LineBuffer};
use crate::{ChatMessage, ChatOpts, LlmError, LlmProvider, Role};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
// gpt-4o class pricing, blended in/out per 1k tokens.
const COST_PER_1K_TOKENS_USD: f64 = 0.0075;

pub struct OpenAiClient {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
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
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| LlmError::MissingKey("OPENAI_API_KEY"))?;
        Self::new(api_key, env::var("OPENAI_BASE_URL").ok())
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: m.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOpts) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: opts.model.clone(),
            messages: Self::wire_messages(messages),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let parsed = response.json::<ChatResponse>().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Stream("empty choices".into()))
    }

    fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOpts,
    ) -> Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>> {
        let (tx, rx) = mpsc::channel::<Result<String, LlmError>>(100);
        let body = ChatRequest {
            model: opts.model.clone(),
            messages: Self::wire_messages(messages),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            stream: true,
        };
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.base_url);
        let api_key = self.api_key.clone();
        let cancel = opts.cancel.clone();

        tokio::spawn(async move {
            let request = client.post(&url).bearer_auth(&api_key).json(&body).send();
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
                    if data == "[DONE]" {
                        return;
                    }
                    if let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) {
                        if let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
                            if !delta.is_empty() && tx.send(Ok(delta)).await.is_err() {
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
        16_384
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
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
