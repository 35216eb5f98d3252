//! Common utilities for integration tests

use axum::Router;
use server::config::Config;
use server::{build_gateway, build_router};

/// Create a test app instance with fake provider keys and no network
/// dependencies at construction time.
pub fn create_test_app() -> Router {
    create_test_app_with(|_| {})
}

pub fn create_test_app_with(tweak: impl FnOnce(&mut Config)) -> Router {
    let mut config = Config::from_env();
    config.providers.deepgram_api_key = Some("dg-test-key".to_string());
    config.providers.openai_api_key = Some("sk-test-key".to_string());
    config.providers.elevenlabs_api_key = Some("el-test-key".to_string());
    config.providers.anthropic_api_key = None;
    config.providers.gemini_api_key = None;
    config.features.kb_enabled = false;
    tweak(&mut config);

    let gateway = build_gateway(config).expect("gateway for tests");
    build_router(gateway)
}
