//! Provider router: deterministic capability selection with health-aware
//! fallback and human-readable decision reasons.

use std::str::FromStr;
use std::sync::Arc;

use llm_core::LlmProvider;
use serde::Serialize;
use stt_core::SttProvider;
use thiserror::Error;
use tts_core::TtsProvider;

use crate::health::{Capability, HealthStore};

/// Rough per-turn token budget used to price LLM candidates.
const TURN_TOKEN_ESTIMATE: u32 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl FromStr for Tier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Complex,
}

impl FromStr for Complexity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(Complexity::Simple),
            "complex" => Ok(Complexity::Complex),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no healthy {0} provider")]
    NoHealthyProvider(Capability),
}

/// Everything the gateway can route between, built once at startup.
pub struct ProviderRegistry {
    pub llms: Vec<Arc<dyn LlmProvider>>,
    pub stts: Vec<Arc<dyn SttProvider>>,
    pub ttss: Vec<Arc<dyn TtsProvider>>,
}

impl ProviderRegistry {
    pub fn llm(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.llms.iter().find(|p| p.name() == name).cloned()
    }

    pub fn stt(&self, name: &str) -> Option<Arc<dyn SttProvider>> {
        self.stts.iter().find(|p| p.name() == name).cloned()
    }

    pub fn tts(&self, name: &str) -> Option<Arc<dyn TtsProvider>> {
        self.ttss.iter().find(|p| p.name() == name).cloned()
    }
}

/// Cheapest sensible model for a provider, used for greeting turns.
pub fn fast_model(provider: &str) -> &'static str {
    ProviderRouter::llm_model(provider, Complexity::Simple)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterDecision {
    pub stt: String,
    pub llm: String,
    pub llm_model: String,
    pub tts: String,
    pub reasons: Vec<String>,
}

pub struct ProviderRouter {
    health: Arc<HealthStore>,
    registry: Arc<ProviderRegistry>,
}

impl ProviderRouter {
    pub fn new(health: Arc<HealthStore>, registry: Arc<ProviderRegistry>) -> Self {
        Self { health, registry }
    }

    /// Fixed LLM candidate order for the given inputs.
    fn llm_candidates(tier: Tier, complexity: Complexity) -> [&'static str; 3] {
        let quality_first =
            tier == Tier::Enterprise || (tier == Tier::Pro && complexity == Complexity::Complex);
        if quality_first {
            ["anthropic", "openai", "gemini"]
        } else {
            ["gemini", "anthropic", "openai"]
        }
    }

    fn llm_model(provider: &str, complexity: Complexity) -> &'static str {
        match (provider, complexity) {
            ("gemini", Complexity::Simple) => "gemini-2.0-flash",
            ("gemini", Complexity::Complex) => "gemini-1.5-pro",
            ("anthropic", Complexity::Simple) => "claude-3-5-haiku-latest",
            ("anthropic", Complexity::Complex) => "claude-3-5-sonnet-latest",
            (_, Complexity::Simple) => "gpt-4o-mini",
            (_, Complexity::Complex) => "gpt-4o",
        }
    }

    pub async fn select(
        &self,
        tier: Tier,
        complexity: Complexity,
        budget_usd: Option<f64>,
    ) -> Result<RouterDecision, RouterError> {
        let mut reasons = vec![
            format!("tier={}", tier_str(tier)),
            format!("complexity={}", complexity_str(complexity)),
        ];
        match budget_usd {
            Some(budget) => reasons.push(format!("budget=${budget:.4}")),
            None => reasons.push("budget=unconstrained".to_string()),
        }

        // LLM: tier/complexity pick the order, budget prunes candidates.
        let mut llm = None;
        let candidates = Self::llm_candidates(tier, complexity);
        for (i, name) in candidates.iter().copied().enumerate() {
            let Some(provider) = self.registry.llm(name) else {
                reasons.push(format!("llm.{name}=unconfigured"));
                continue;
            };
            if let Some(budget) = budget_usd {
                let cost = provider.estimate_cost(TURN_TOKEN_ESTIMATE);
                if cost > budget {
                    reasons.push(format!("llm.{name}=over-budget (${cost:.4})"));
                    continue;
                }
            }
            let probe = provider.clone();
            let healthy = self
                .health
                .check(Capability::Llm, name, move || async move {
                    probe.health_check().await.is_ok()
                })
                .await;
            if healthy {
                reasons.push(format!("llm.{name}=healthy"));
                llm = Some(name.to_string());
                break;
            }
            reasons.push(format!("llm.{name}=unhealthy"));
            if let Some(next) = candidates.get(i + 1) {
                reasons.push(format!("llm.fallback={next}"));
            }
        }
        let llm = llm.ok_or(RouterError::NoHealthyProvider(Capability::Llm))?;
        let llm_model = Self::llm_model(&llm, complexity).to_string();
        reasons.push(format!("llm.model={llm_model}"));

        // STT: single candidate.
        let mut stt = None;
        for name in ["deepgram"] {
            let Some(provider) = self.registry.stt(name) else {
                reasons.push(format!("stt.{name}=unconfigured"));
                continue;
            };
            let probe = provider.clone();
            let healthy = self
                .health
                .check(Capability::Stt, name, move || async move {
                    probe.health_check().await.is_ok()
                })
                .await;
            reasons.push(format!(
                "stt.{name}={}",
                if healthy { "healthy" } else { "unhealthy" }
            ));
            if healthy {
                stt = Some(name.to_string());
                break;
            }
        }
        let stt = stt.ok_or(RouterError::NoHealthyProvider(Capability::Stt))?;

        // TTS: primary then fallback.
        let mut tts = None;
        for name in ["elevenlabs", "openai"] {
            let Some(provider) = self.registry.tts(name) else {
                reasons.push(format!("tts.{name}=unconfigured"));
                continue;
            };
            let probe = provider.clone();
            let healthy = self
                .health
                .check(Capability::Tts, name, move || async move {
                    probe.health_check().await.is_ok()
                })
                .await;
            if healthy {
                reasons.push(format!("tts.{name}=healthy"));
                tts = Some(name.to_string());
                break;
            }
            reasons.push(format!("tts.{name}=unhealthy"));
            if name == "elevenlabs" {
                reasons.push("tts.fallback=openai".to_string());
            }
        }
        let tts = tts.ok_or(RouterError::NoHealthyProvider(Capability::Tts))?;

        Ok(RouterDecision { stt, llm, llm_model, tts, reasons })
    }
}

fn tier_str(tier: Tier) -> &'static str {
    match tier {
        Tier::Free => "free",
        Tier::Pro => "pro",
        Tier::Enterprise => "enterprise",
    }
}

fn complexity_str(complexity: Complexity) -> &'static str {
    match complexity {
        Complexity::Simple => "simple",
        Complexity::Complex => "complex",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use async_trait::async_trait;
    use llm_core::{ChatMessage, ChatOpts, LlmError, TokenStream};
    use stt_core::{SttError, SttEvent, SttParams, SttStreamHandle};
    use tokio::sync::mpsc;
    use tts_core::{AudioStream, TtsError, TtsOpts};

    struct StubLlm {
        name: &'static str,
        healthy: bool,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn chat(&self, _: &[ChatMessage], _: &ChatOpts) -> Result<String, LlmError> {
            Ok(String::new())
        }
        fn stream(&self, _: &[ChatMessage], _: &ChatOpts) -> TokenStream {
            Box::pin(futures_util::stream::empty())
        }
        fn estimate_cost(&self, _tokens: u32) -> f64 {
            0.001
        }
        fn max_tokens(&self) -> u32 {
            1024
        }
        async fn health_check(&self) -> Result<(), LlmError> {
            if self.healthy {
                Ok(())
            } else {
                Err(LlmError::Stream("down".into()))
            }
        }
    }

    struct StubStt {
        healthy: bool,
    }

    #[async_trait]
    impl stt_core::SttProvider for StubStt {
        fn name(&self) -> &'static str {
            "deepgram"
        }
        async fn connect(
            &self,
            _: SttParams,
            _: mpsc::Sender<SttEvent>,
        ) -> Result<SttStreamHandle, SttError> {
            Ok(SttStreamHandle::detached())
        }
        async fn health_check(&self) -> Result<(), SttError> {
            if self.healthy {
                Ok(())
            } else {
                Err(SttError::WebSocket("down".into()))
            }
        }
    }

    struct StubTts {
        name: &'static str,
        healthy: bool,
    }

    #[async_trait]
    impl tts_core::TtsProvider for StubTts {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn stream(&self, _: &str, _: &TtsOpts) -> Result<AudioStream, TtsError> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
        async fn health_check(&self) -> Result<(), TtsError> {
            if self.healthy {
                Ok(())
            } else {
                Err(TtsError::WebSocket("down".into()))
            }
        }
    }

    fn registry(tts_primary_healthy: bool) -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry {
            llms: vec![
                Arc::new(StubLlm { name: "gemini", healthy: true }),
                Arc::new(StubLlm { name: "anthropic", healthy: true }),
                Arc::new(StubLlm { name: "openai", healthy: true }),
            ],
            stts: vec![Arc::new(StubStt { healthy: true })],
            ttss: vec![
                Arc::new(StubTts { name: "elevenlabs", healthy: tts_primary_healthy }),
                Arc::new(StubTts { name: "openai", healthy: true }),
            ],
        })
    }

    #[tokio::test]
    async fn free_simple_prefers_gemini() {
        let router = ProviderRouter::new(
            Arc::new(HealthStore::new(HealthConfig::default())),
            registry(true),
        );
        let decision = router.select(Tier::Free, Complexity::Simple, None).await.unwrap();
        assert_eq!(decision.llm, "gemini");
        assert_eq!(decision.llm_model, "gemini-2.0-flash");
        assert_eq!(decision.stt, "deepgram");
        assert_eq!(decision.tts, "elevenlabs");
    }

    #[tokio::test]
    async fn enterprise_complex_prefers_anthropic() {
        let router = ProviderRouter::new(
            Arc::new(HealthStore::new(HealthConfig::default())),
            registry(true),
        );
        let decision = router
            .select(Tier::Enterprise, Complexity::Complex, None)
            .await
            .unwrap();
        assert_eq!(decision.llm, "anthropic");
        assert_eq!(decision.llm_model, "claude-3-5-sonnet-latest");
    }

    #[tokio::test]
    async fn unhealthy_primary_tts_falls_back() {
        let router = ProviderRouter::new(
            Arc::new(HealthStore::new(HealthConfig::default())),
            registry(false),
        );
        let decision = router.select(Tier::Pro, Complexity::Simple, None).await.unwrap();
        assert_eq!(decision.tts, "openai");
        assert!(decision.reasons.iter().any(|r| r == "tts.elevenlabs=unhealthy"));
        assert!(decision.reasons.iter().any(|r| r == "tts.fallback=openai"));
        assert!(decision.reasons.iter().any(|r| r == "tts.openai=healthy"));
    }

    #[tokio::test]
    async fn decision_is_deterministic_for_fixed_health() {
        let health = Arc::new(HealthStore::new(HealthConfig::default()));
        let router = ProviderRouter::new(health, registry(true));
        let first = router.select(Tier::Pro, Complexity::Simple, Some(0.01)).await.unwrap();
        let second = router.select(Tier::Pro, Complexity::Simple, Some(0.01)).await.unwrap();
        assert_eq!(first.reasons, second.reasons);
        assert_eq!(first.llm, second.llm);
    }

    #[tokio::test]
    async fn tight_budget_prunes_candidates() {
        let registry = Arc::new(ProviderRegistry {
            llms: vec![
                Arc::new(StubLlm { name: "gemini", healthy: true }),
                Arc::new(StubLlm { name: "anthropic", healthy: true }),
            ],
            stts: vec![Arc::new(StubStt { healthy: true })],
            ttss: vec![Arc::new(StubTts { name: "elevenlabs", healthy: true })],
        });
        let router =
            ProviderRouter::new(Arc::new(HealthStore::new(HealthConfig::default())), registry);
        // Stub cost is 0.001 per selection; a lower budget rejects them all.
        let result = router.select(Tier::Free, Complexity::Simple, Some(0.0001)).await;
        assert!(matches!(result, Err(RouterError::NoHealthyProvider(Capability::Llm))));
    }
}
