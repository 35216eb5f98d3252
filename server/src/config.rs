//! Gateway configuration, loaded from environment variables.

use std::time::Duration;

use tracing::warn;

use crate::codec::FrameLimits;

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub safety: SafetyConfig,
    pub features: FeatureFlags,
    pub providers: ProviderKeys,
    pub latency: LatencyThresholds,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub log_level: String,
    pub test_hooks_enabled: bool,
    /// CSV origin allow-list; empty means any origin.
    pub allowed_origins: Vec<String>,
    /// Optional shared bearer token for the WS endpoint.
    pub agent_ws_token: Option<String>,
    /// Optional HMAC secret for per-session signed tokens.
    pub session_jwt_secret: Option<String>,
    /// Maximum concurrent WS connections.
    pub max_connections: usize,
    pub idle_connection_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub silence_timeout_ms: u64,
    pub utterance_end_ms: u64,
    pub endpointing_ms: u64,
    pub model: String,
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub min_duration_ms: u64,
    pub barge_threshold_words: usize,
    pub protected_phrases: Vec<String>,
    pub sentence_boundary_protection: bool,
    pub clause_protection_ms: u64,
    pub critical_info_protection: bool,
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub max_frame_bytes: usize,
    pub max_json_bytes: usize,
    pub max_audio_frames_per_sec: u32,
    pub conversation_max: usize,
}

#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub multi_provider: bool,
    pub provider_router: bool,
    pub early_llm: bool,
    pub early_tts: bool,
    pub strict_turn_taking: bool,
    pub partial_barge: bool,
    pub actions_enabled: bool,
    pub kb_enabled: bool,
    pub response_cache_ttl_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderKeys {
    pub deepgram_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub kb_base_url: Option<String>,
    pub kb_insufficient_sentinel: String,
}

#[derive(Debug, Clone, Copy)]
pub struct LatencyThresholds {
    pub warn_ms: u64,
    pub critical_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let protected_phrases = std::env::var("TTS_PROTECTED_PHRASES")
            .ok()
            .map(|phrases| {
                phrases
                    .split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            server: ServerConfig {
                port: env_parse("PORT", 8085),
                log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                test_hooks_enabled: env_flag("TEST_HOOKS_ENABLED", false),
                allowed_origins,
                agent_ws_token: std::env::var("AGENT_WS_TOKEN").ok().filter(|t| !t.is_empty()),
                session_jwt_secret: std::env::var("SESSION_JWT_SECRET")
                    .ok()
                    .filter(|t| !t.is_empty()),
                max_connections: env_parse("MAX_CONNECTIONS", 200),
                idle_connection_ttl: Duration::from_millis(env_parse(
                    "IDLE_CONNECTION_TTL_MS",
                    300_000u64,
                )),
            },
            stt: SttConfig {
                silence_timeout_ms: env_parse("STT_SILENCE_TIMEOUT_MS", 5000),
                utterance_end_ms: env_parse("DEEPGRAM_UTTERANCE_END_MS", 1000),
                endpointing_ms: env_parse("DEEPGRAM_ENDPOINTING_MS", 300),
                model: std::env::var("DEEPGRAM_MODEL").unwrap_or_else(|_| "nova-2".to_string()),
                auto_reconnect: env_flag("DEEPGRAM_AUTO_RECONNECT", true),
            },
            tts: TtsConfig {
                min_duration_ms: env_parse("TTS_MIN_DURATION_MS", 1500),
                barge_threshold_words: env_parse("TTS_BARGE_THRESHOLD_WORDS", 3),
                protected_phrases,
                sentence_boundary_protection: env_flag("TTS_SENTENCE_BOUNDARY_PROTECTION", true),
                clause_protection_ms: env_parse("TTS_CLAUSE_PROTECTION_MS", 1200),
                critical_info_protection: env_flag("TTS_CRITICAL_INFO_PROTECTION", true),
            },
            safety: SafetyConfig {
                max_frame_bytes: env_parse("MAX_FRAME_BYTES", 512 * 1024),
                max_json_bytes: env_parse("MAX_JSON_BYTES", 64 * 1024),
                max_audio_frames_per_sec: env_parse("MAX_AUDIO_FRAMES_PER_SEC", 60),
                conversation_max: env_parse("CONVERSATION_MAX", 17),
            },
            features: FeatureFlags {
                multi_provider: env_flag("ENABLE_MULTI_PROVIDER", true),
                provider_router: env_flag("ENABLE_PROVIDER_ROUTER", true),
                early_llm: env_flag("ENABLE_EARLY_LLM", false),
                early_tts: env_flag("EARLY_TTS_ENABLED", true),
                strict_turn_taking: env_flag("STRICT_TURN_TAKING", true),
                partial_barge: env_flag("ENABLE_PARTIAL_BARGE", false),
                actions_enabled: env_flag("ACTIONS_ENABLED", false),
                kb_enabled: env_flag("KB_ENABLED", false),
                response_cache_ttl_ms: env_parse("RESPONSE_CACHE_TTL_MS", 300_000),
            },
            providers: ProviderKeys {
                deepgram_api_key: std::env::var("DEEPGRAM_API_KEY").ok().filter(|k| !k.is_empty()),
                openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
                anthropic_api_key: std::env::var("ANTHROPIC_API_KEY")
                    .ok()
                    .filter(|k| !k.is_empty()),
                gemini_api_key: std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()),
                elevenlabs_api_key: std::env::var("ELEVENLABS_API_KEY")
                    .ok()
                    .filter(|k| !k.is_empty()),
                kb_base_url: std::env::var("KB_BASE_URL").ok().filter(|k| !k.is_empty()),
                kb_insufficient_sentinel: std::env::var("KB_INSUFFICIENT_SENTINEL")
                    .unwrap_or_else(|_| "I don't have enough information to answer that.".to_string()),
            },
            latency: LatencyThresholds {
                warn_ms: env_parse("LATENCY_WARN_MS", 2500),
                critical_ms: env_parse("LATENCY_CRITICAL_MS", 5000),
            },
        }
    }

    /// Reject on missing required secrets; warn on malformed key shapes.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.providers.deepgram_api_key.is_none() {
            anyhow::bail!("DEEPGRAM_API_KEY is required (streaming STT)");
        }
        if self.providers.openai_api_key.is_none()
            && self.providers.anthropic_api_key.is_none()
            && self.providers.gemini_api_key.is_none()
        {
            anyhow::bail!("at least one LLM key is required (GEMINI_API_KEY, ANTHROPIC_API_KEY or OPENAI_API_KEY)");
        }
        if self.providers.elevenlabs_api_key.is_none() && self.providers.openai_api_key.is_none() {
            anyhow::bail!("at least one TTS key is required (ELEVENLABS_API_KEY or OPENAI_API_KEY)");
        }

        if let Some(key) = &self.providers.openai_api_key {
            if !key.starts_with("sk-") {
                warn!("OPENAI_API_KEY does not look like an sk-... key");
            }
        }
        if let Some(key) = &self.providers.anthropic_api_key {
            if !key.starts_with("sk-ant-") {
                warn!("ANTHROPIC_API_KEY does not look like an sk-ant-... key");
            }
        }
        if let Some(secret) = &self.server.session_jwt_secret {
            if secret.len() < 16 {
                warn!("SESSION_JWT_SECRET is shorter than 16 bytes");
            }
        }
        Ok(())
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_frame_bytes: self.safety.max_frame_bytes,
            max_json_bytes: self.safety.max_json_bytes,
        }
    }

    /// Snapshot of feature flags for the `/flag-status` endpoint.
    pub fn flag_status(&self) -> serde_json::Value {
        serde_json::json!({
            "multiProvider": self.features.multi_provider,
            "providerRouter": self.features.provider_router,
            "earlyLlm": self.features.early_llm,
            "earlyTts": self.features.early_tts,
            "strictTurnTaking": self.features.strict_turn_taking,
            "partialBarge": self.features.partial_barge,
            "actionsEnabled": self.features.actions_enabled,
            "kbEnabled": self.features.kb_enabled,
            "testHooksEnabled": self.server.test_hooks_enabled,
            "responseCacheTtlMs": self.features.response_cache_ttl_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var driven tests mutate process state; keep them to shape checks.
    #[test]
    fn defaults_are_sane() {
        let config = Config::from_env();
        assert!(config.safety.max_frame_bytes >= config.safety.max_json_bytes);
        assert!(config.tts.min_duration_ms > 0);
        assert!(config.latency.critical_ms > config.latency.warn_ms);
    }

    #[test]
    fn validation_requires_stt_key() {
        let mut config = Config::from_env();
        config.providers.deepgram_api_key = None;
        assert!(config.validate().is_err());

        config.providers.deepgram_api_key = Some("dg-key".into());
        config.providers.openai_api_key = Some("sk-test".into());
        config.providers.anthropic_api_key = None;
        config.providers.gemini_api_key = None;
        config.providers.elevenlabs_api_key = Some("el-key".into());
        assert!(config.validate().is_ok());
    }
}
