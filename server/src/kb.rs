//! Knowledge-base grounding, consumed through a narrow async interface.
//!
//! The retrieval service itself is an external collaborator; the gateway
//! only asks it for a grounded answer and decides whether the answer is
//! confident enough to speak directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of a grounded-answer lookup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroundedAnswer {
    /// Direct answer, if the KB produced one.
    #[serde(default)]
    pub answer: Option<String>,
    /// Supporting chunks for system-prompt injection when there is no
    /// direct answer.
    #[serde(default)]
    pub chunks: Vec<String>,
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn grounded_answer(&self, text: &str, agent_id: &str) -> anyhow::Result<GroundedAnswer>;
}

/// An answer is confident enough to speak when it is substantial and not
/// the configured "insufficient" sentinel.
pub fn is_high_confidence(answer: &str, insufficient_sentinel: &str) -> bool {
    answer.len() > 20 && answer.trim() != insufficient_sentinel.trim()
}

/// Wrap supporting chunks in an instruction block for the system prompt.
pub fn chunk_instruction_block(chunks: &[String]) -> String {
    let mut block = String::from(
        "\n\nUse the following retrieved context when it is relevant. \
         If it does not answer the question, say you are not sure.\n",
    );
    for chunk in chunks {
        block.push_str("- ");
        block.push_str(chunk);
        block.push('\n');
    }
    block
}

pub struct HttpKnowledgeBase {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroundedAnswerRequest<'a> {
    text: &'a str,
    agent_id: &'a str,
}

impl HttpKnowledgeBase {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl KnowledgeBase for HttpKnowledgeBase {
    async fn grounded_answer(&self, text: &str, agent_id: &str) -> anyhow::Result<GroundedAnswer> {
        let response = self
            .client
            .post(format!("{}/grounded-answer", self.base_url))
            .json(&GroundedAnswerRequest { text, agent_id })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<GroundedAnswer>().await?)
    }
}
