//! Messages-API style provider (Anthropic wire format).
//!
//! The system prompt travels outside the message list, and streaming uses
//! typed SSE events rather than a bare delta array.

use std::{env, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use super::{sse_data, LineBuffer};
use crate::{ChatMessage, ChatOpts, LlmError, LlmProvider, Role};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const COST_PER_1K_TOKENS_USD: f64 = 0.009;

pub struct AnthropicClient {
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
struct MessagesRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: TextDelta },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: ApiErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

impl AnthropicClient {
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
            env::var("ANTHROPIC_API_KEY").map_err(|_| LlmError::MissingKey("ANTHROPIC_API_KEY"))?;
        Self::new(api_key, env::var("ANTHROPIC_BASE_URL").ok())
    }

    /// Split the canonical list into (system, alternating user/assistant).
    fn wire_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut wire = Vec::with_capacity(messages.len());
        for m in messages {
            match m.role {
                Role::System => system = Some(m.content.clone()),
                Role::User => wire.push(WireMessage { role: "user", content: m.content.clone() }),
                Role::Assistant => {
                    wire.push(WireMessage { role: "assistant", content: m.content.clone() })
                }
            }
        }
        (system, wire)
    }

    fn request_body(messages: &[ChatMessage], opts: &ChatOpts, stream: bool) -> MessagesRequest {
        let (system, wire) = Self::wire_messages(messages);
        MessagesRequest {
            model: opts.model.clone(),
            system,
            messages: wire,
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            stream,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOpts) -> Result<String, LlmError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::request_body(messages, opts, false))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let parsed = response.json::<MessagesResponse>().await?;
        Ok(parsed.content.into_iter().map(|b| b.text).collect())
    }

    fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOpts,
    ) -> Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>> {
        let (tx, rx) = mpsc::channel::<Result<String, LlmError>>(100);
        let body = Self::request_body(messages, opts, true);
        let client = self.client.clone();
        let url = format!("{}/messages", self.base_url);
        let api_key = self.api_key.clone();
        let cancel = opts.cancel.clone();

        tokio::spawn(async move {
            let request = client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send();
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
                    match serde_json::from_str::<StreamEvent>(data) {
                        Ok(StreamEvent::ContentBlockDelta { delta }) => {
                            if let Some(text) = delta.text {
                                if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(StreamEvent::MessageStop) => return,
                        Ok(StreamEvent::Error { error }) => {
                            let _ = tx.send(Err(LlmError::Stream(error.message))).await;
                            return;
                        }
                        _ => {}
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
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_is_lifted_out_of_messages() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let (system, wire) = AnthropicClient::wire_messages(&messages);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "assistant");
    }
}
