//! Process-wide gateway state, initialized once at startup.

use std::sync::Arc;

use llm_core::{ConversationStore, ConversationStoreConfig, ResponseCache};
use stt_core::deepgram::{DeepgramConfig, DeepgramStt};
use tts_core::elevenlabs::{ElevenLabsConfig, ElevenLabsTts};
use tts_core::openai::{OpenAiTts, OpenAiTtsConfig};

use crate::config::Config;
use crate::health::{HealthConfig, HealthStore};
use crate::kb::{HttpKnowledgeBase, KnowledgeBase};
use crate::metrics::GatewayMetrics;
use crate::pool::ConnectionPool;
use crate::ratelimit::{ActionLimits, ActionRateLimiter};
use crate::router::{ProviderRegistry, ProviderRouter};

pub struct Gateway {
    pub config: Config,
    pub pool: ConnectionPool,
    pub health: Arc<HealthStore>,
    pub registry: Arc<ProviderRegistry>,
    pub router: ProviderRouter,
    pub memory: ConversationStore,
    pub cache: ResponseCache,
    pub kb: Option<Arc<dyn KnowledgeBase>>,
    pub metrics: GatewayMetrics,
    pub action_limits: ActionRateLimiter,
    pub started_at: std::time::Instant,
}

pub type SharedGateway = Arc<Gateway>;

impl Gateway {
    /// Build a gateway around an explicit provider registry. Used by tests
    /// that stub out the provider layer.
    pub fn with_registry(config: Config, registry: Arc<ProviderRegistry>) -> Self {
        let health = Arc::new(HealthStore::new(HealthConfig::default()));
        let router = ProviderRouter::new(health.clone(), registry.clone());
        Self {
            pool: ConnectionPool::new(
                config.server.max_connections,
                config.safety.max_audio_frames_per_sec,
            ),
            health,
            registry,
            router,
            memory: ConversationStore::new(ConversationStoreConfig {
                max_messages: config.safety.conversation_max,
                ..ConversationStoreConfig::default()
            }),
            cache: ResponseCache::new(
                500,
                std::time::Duration::from_millis(config.features.response_cache_ttl_ms),
            ),
            kb: None,
            metrics: GatewayMetrics::new(),
            action_limits: ActionRateLimiter::new(ActionLimits::default()),
            started_at: std::time::Instant::now(),
            config,
        }
    }

    /// Wire up providers and shared stores from validated configuration.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let mut registry = ProviderRegistry {
            llms: Vec::new(),
            stts: Vec::new(),
            ttss: Vec::new(),
        };

        if let Some(key) = &config.providers.gemini_api_key {
            registry
                .llms
                .push(Arc::new(llm_core::GeminiClient::new(key.clone(), None)?));
        }
        if let Some(key) = &config.providers.anthropic_api_key {
            registry
                .llms
                .push(Arc::new(llm_core::AnthropicClient::new(key.clone(), None)?));
        }
        if let Some(key) = &config.providers.openai_api_key {
            registry
                .llms
                .push(Arc::new(llm_core::OpenAiClient::new(key.clone(), None)?));
        }

        if let Some(key) = &config.providers.deepgram_api_key {
            registry.stts.push(Arc::new(DeepgramStt::new(
                key.clone(),
                DeepgramConfig {
                    model: config.stt.model.clone(),
                    auto_reconnect: config.stt.auto_reconnect,
                    endpointing_ms: config.stt.endpointing_ms,
                    utterance_end_ms: config.stt.utterance_end_ms,
                    ..DeepgramConfig::default()
                },
            )));
        }

        if let Some(key) = &config.providers.elevenlabs_api_key {
            registry
                .ttss
                .push(Arc::new(ElevenLabsTts::new(key.clone(), ElevenLabsConfig::default())));
        }
        if let Some(key) = &config.providers.openai_api_key {
            registry
                .ttss
                .push(Arc::new(OpenAiTts::new(key.clone(), OpenAiTtsConfig::default())?));
        }

        let registry = Arc::new(registry);
        let health = Arc::new(HealthStore::new(HealthConfig::default()));
        let router = ProviderRouter::new(health.clone(), registry.clone());

        let kb: Option<Arc<dyn KnowledgeBase>> = match (&config.providers.kb_base_url, config.features.kb_enabled) {
            (Some(base_url), true) => Some(Arc::new(HttpKnowledgeBase::new(base_url.clone()))),
            _ => None,
        };

        Ok(Self {
            pool: ConnectionPool::new(
                config.server.max_connections,
                config.safety.max_audio_frames_per_sec,
            ),
            health,
            registry,
            router,
            memory: ConversationStore::new(ConversationStoreConfig {
                max_messages: config.safety.conversation_max,
                ..ConversationStoreConfig::default()
            }),
            cache: ResponseCache::new(
                500,
                std::time::Duration::from_millis(config.features.response_cache_ttl_ms),
            ),
            kb,
            metrics: GatewayMetrics::new(),
            action_limits: ActionRateLimiter::new(ActionLimits::default()),
            started_at: std::time::Instant::now(),
            config,
        })
    }
}
