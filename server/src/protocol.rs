//! Control-plane envelopes and binary frame headers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stt_core::AudioEncoding;

use crate::error::ErrorCode;

/* ------------------ Client -> server ------------------ */

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEnvelope {
    #[serde(rename = "session.start")]
    SessionStart(SessionStart),

    #[serde(rename = "audio.end")]
    AudioEnd {},

    #[serde(rename = "barge.cancel")]
    BargeCancel {},

    #[serde(rename = "test.utterance")]
    TestUtterance { data: TestUtteranceData },

    #[serde(rename = "session.end")]
    SessionEnd {},
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub session_id: String,
    #[serde(default)]
    pub turn_id: Option<u64>,
    #[serde(default)]
    pub data: SessionStartData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartData {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub vad_enabled: bool,
    #[serde(default)]
    pub ptt_mode: bool,
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default)]
    pub endpointing: Option<EndpointingParams>,
    #[serde(default)]
    pub first_message_mode: Option<FirstMessageMode>,
    #[serde(default)]
    pub first_message: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub cached_agent_data: Option<Value>,
    #[serde(default)]
    pub providers: Option<ProviderOverrides>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Hi,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Hi => "hi",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointingParams {
    #[serde(default)]
    pub wait_seconds: Option<f32>,
    #[serde(default)]
    pub punctuation_seconds: Option<f32>,
    #[serde(default)]
    pub no_punct_seconds: Option<f32>,
    #[serde(default)]
    pub number_seconds: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstMessageMode {
    AssistantSpeaksFirst,
    UserSpeaksFirst,
    WaitForUser,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOverrides {
    #[serde(default)]
    pub llm: Option<LlmOverride>,
    #[serde(default)]
    pub stt: Option<SttOverride>,
    #[serde(default)]
    pub tts: Option<TtsOverride>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmOverride {
    pub r#type: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SttOverride {
    pub r#type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsOverride {
    pub r#type: String,
    #[serde(default)]
    pub voice_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestUtteranceData {
    pub text: String,
}

/// Validate a JSON value as a client envelope.
pub fn validate_envelope(value: Value) -> Result<ClientEnvelope, EnvelopeError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(EnvelopeError::MissingType)?;
    serde_json::from_value(value).map_err(|e| EnvelopeError::Invalid { kind, detail: e.to_string() })
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope has no type field")]
    MissingType,

    #[error("invalid {kind} envelope: {detail}")]
    Invalid { kind: String, detail: String },
}

/* ------------------ Server -> client ------------------ */

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEnvelope {
    #[serde(rename = "stt.partial")]
    SttPartial { text: String },

    #[serde(rename = "stt.final")]
    #[serde(rename_all = "camelCase")]
    SttFinal {
        text: String,
        start_ts: u64,
        end_ts: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        intent: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        entities: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },

    #[serde(rename = "llm.partial")]
    LlmPartial { text: String },

    #[serde(rename = "llm.final")]
    LlmFinal { text: String },

    #[serde(rename = "tts.end")]
    TtsEnd { reason: TtsEndReason },

    #[serde(rename = "metrics.update")]
    MetricsUpdate { data: Value },

    #[serde(rename = "intent.detected")]
    IntentDetected { data: Value },

    #[serde(rename = "action.executed")]
    #[serde(rename_all = "camelCase")]
    ActionExecuted {
        action: String,
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        recoverable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    #[serde(rename = "session.ended")]
    SessionEnded { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsEndReason {
    Complete,
    Barge,
    Error,
}

/* ------------------ Binary frame headers ------------------ */

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkHeader {
    pub r#type: String,
    pub seq: u64,
    pub codec: AudioEncoding,
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsChunkHeader {
    pub r#type: &'static str,
    pub seq: u64,
    pub mime: &'static str,
    pub session_id: String,
    pub turn_id: u64,
    pub ts: i64,
}

impl TtsChunkHeader {
    pub fn new(seq: u64, session_id: &str, turn_id: u64) -> Self {
        Self {
            r#type: "tts.chunk",
            seq,
            mime: "audio/mpeg",
            session_id: session_id.to_string(),
            turn_id,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}
