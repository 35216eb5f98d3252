//! HTTP sidecar: health, metrics, flags, router preview and connectivity
//! probes. Lives in the same process as the WS gateway.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde_json::{json, Value};
use sysinfo::System;

use crate::error::ApiError;
use crate::router::{Complexity, Tier};
use crate::state::SharedGateway;

pub async fn healthz(State(gateway): State<SharedGateway>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": gateway.started_at.elapsed().as_secs(),
        "activeConnections": gateway.pool.active(),
        "providers": gateway.health.snapshot(),
    }))
}

pub async fn metrics(State(gateway): State<SharedGateway>) -> Json<Value> {
    let snapshot = gateway.metrics.snapshot(gateway.config.latency);

    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu();

    let provider_names = json!({
        "stt": gateway.registry.stts.iter().map(|p| p.name()).collect::<Vec<_>>(),
        "llm": gateway.registry.llms.iter().map(|p| p.name()).collect::<Vec<_>>(),
        "tts": gateway.registry.ttss.iter().map(|p| p.name()).collect::<Vec<_>>(),
    });

    Json(json!({
        "gateway": snapshot,
        "providers": provider_names,
        "conversations": gateway.memory.len().await,
        "system": {
            "cpuUsagePercent": system.global_cpu_info().cpu_usage(),
            "memoryUsedMb": system.used_memory() / 1024 / 1024,
            "memoryTotalMb": system.total_memory() / 1024 / 1024,
            "uptimeSeconds": gateway.started_at.elapsed().as_secs(),
        },
    }))
}

pub async fn flag_status(State(gateway): State<SharedGateway>) -> Json<Value> {
    Json(gateway.config.flag_status())
}

pub async fn router_preview(
    State(gateway): State<SharedGateway>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let tier: Tier = params
        .get("tier")
        .map(|t| t.parse().map_err(|_| ApiError::InvalidInput(format!("unknown tier: {t}"))))
        .transpose()?
        .unwrap_or(Tier::Pro);
    let complexity: Complexity = params
        .get("complexity")
        .map(|c| {
            c.parse()
                .map_err(|_| ApiError::InvalidInput(format!("unknown complexity: {c}")))
        })
        .transpose()?
        .unwrap_or(Complexity::Simple);
    let budget_usd = params
        .get("budgetUSD")
        .map(|b| {
            b.parse::<f64>()
                .map_err(|_| ApiError::InvalidInput(format!("bad budgetUSD: {b}")))
        })
        .transpose()?;

    let decision = gateway
        .router
        .select(tier, complexity, budget_usd)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(serde_json::to_value(decision).unwrap_or_default()))
}

/// DNS + HTTPS reachability probes against each provider endpoint.
pub async fn debug_connectivity(State(gateway): State<SharedGateway>) -> Json<Value> {
    let mut targets: Vec<(&str, &str)> = vec![("deepgram", "api.deepgram.com")];
    if gateway.config.providers.openai_api_key.is_some() {
        targets.push(("openai", "api.openai.com"));
    }
    if gateway.config.providers.anthropic_api_key.is_some() {
        targets.push(("anthropic", "api.anthropic.com"));
    }
    if gateway.config.providers.gemini_api_key.is_some() {
        targets.push(("gemini", "generativelanguage.googleapis.com"));
    }
    if gateway.config.providers.elevenlabs_api_key.is_some() {
        targets.push(("elevenlabs", "api.elevenlabs.io"));
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default();

    let mut rows = Vec::with_capacity(targets.len());
    for (name, host) in targets {
        let dns_ok = tokio::net::lookup_host((host, 443)).await.is_ok();
        let https = if dns_ok {
            let started = std::time::Instant::now();
            match client.get(format!("https://{host}/")).send().await {
                Ok(_) => json!({"ok": true, "ms": started.elapsed().as_millis() as u64}),
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            }
        } else {
            json!({"ok": false, "error": "dns failed"})
        };
        rows.push(json!({"provider": name, "host": host, "dns": dns_ok, "https": https}));
    }

    Json(json!({ "probes": rows }))
}
