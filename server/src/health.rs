//! Provider health store with circuit breaking.
//!
//! Results are cached per `(capability, provider)` for a TTL; after K
//! consecutive failures the circuit opens for a fixed duration during
//! which checks return false without invoking the probe.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Stt,
    Llm,
    Tts,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Stt => write!(f, "stt"),
            Capability::Llm => write!(f, "llm"),
            Capability::Tts => write!(f, "tts"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Cached result validity.
    pub ttl: Duration,
    /// Probe timeout.
    pub timeout: Duration,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit refuses probes.
    pub open_duration: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_millis(2500),
            failure_threshold: 3,
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct HealthRecord {
    healthy: bool,
    checked_at: Instant,
    failures: u32,
    open_until: Option<Instant>,
}

/// Snapshot row for `/healthz`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub capability: Capability,
    pub name: String,
    pub healthy: bool,
    pub failures: u32,
    pub circuit_open: bool,
}

pub struct HealthStore {
    records: Mutex<HashMap<(Capability, String), HealthRecord>>,
    config: HealthConfig,
}

impl HealthStore {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Check a provider, using the cached result when fresh and the circuit
    /// breaker when open. The probe runs outside the lock.
    pub async fn check<F, Fut>(&self, capability: Capability, name: &str, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        let now = Instant::now();
        {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = records.get(&(capability, name.to_string())) {
                if let Some(open_until) = record.open_until {
                    if now < open_until {
                        return false;
                    }
                }
                if now.duration_since(record.checked_at) < self.config.ttl {
                    return record.healthy;
                }
            }
        }

        let healthy = tokio::time::timeout(self.config.timeout, probe())
            .await
            .unwrap_or(false);

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry((capability, name.to_string()))
            .or_insert(HealthRecord {
                healthy,
                checked_at: now,
                failures: 0,
                open_until: None,
            });
        record.healthy = healthy;
        record.checked_at = Instant::now();
        if healthy {
            record.failures = 0;
            record.open_until = None;
        } else {
            record.failures += 1;
            if record.failures >= self.config.failure_threshold {
                record.open_until = Some(Instant::now() + self.config.open_duration);
                warn!(%capability, name, failures = record.failures, "circuit opened");
            }
        }
        healthy
    }

    /// Record an observed provider failure outside a health probe, feeding
    /// the same circuit.
    pub fn record_failure(&self, capability: Capability, name: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let record = records
            .entry((capability, name.to_string()))
            .or_insert(HealthRecord {
                healthy: true,
                checked_at: now,
                failures: 0,
                open_until: None,
            });
        record.failures += 1;
        record.healthy = false;
        record.checked_at = now;
        if record.failures >= self.config.failure_threshold {
            record.open_until = Some(now + self.config.open_duration);
            warn!(%capability, name, failures = record.failures, "circuit opened");
        }
    }

    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let now = Instant::now();
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<HealthSnapshot> = records
            .iter()
            .map(|((capability, name), record)| HealthSnapshot {
                capability: *capability,
                name: name.clone(),
                healthy: record.healthy,
                failures: record.failures,
                circuit_open: record.open_until.is_some_and(|until| now < until),
            })
            .collect();
        rows.sort_by(|a, b| (a.capability as u8, &a.name).cmp(&(b.capability as u8, &b.name)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> HealthConfig {
        HealthConfig {
            ttl: Duration::from_millis(100),
            timeout: Duration::from_millis(200),
            failure_threshold: 3,
            open_duration: Duration::from_millis(500),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cached_result_skips_probe() {
        let store = HealthStore::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let healthy = store
                .check(Capability::Tts, "elevenlabs", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    true
                })
                .await;
            assert!(healthy);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        let calls2 = calls.clone();
        store
            .check(Capability::Tts, "elevenlabs", move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                true
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_after_consecutive_failures() {
        let store = HealthStore::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(150)).await;
            let calls = calls.clone();
            let healthy = store
                .check(Capability::Llm, "openai", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    false
                })
                .await;
            assert!(!healthy);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Circuit is open: no probe invocation even past the TTL.
        tokio::time::advance(Duration::from_millis(150)).await;
        let calls2 = calls.clone();
        let healthy = store
            .check(Capability::Llm, "openai", move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                true
            })
            .await;
        assert!(!healthy);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // After the open window the probe runs again and can recover.
        tokio::time::advance(Duration::from_millis(600)).await;
        let calls3 = calls.clone();
        let healthy = store
            .check(Capability::Llm, "openai", move || async move {
                calls3.fetch_add(1, Ordering::SeqCst);
                true
            })
            .await;
        assert!(healthy);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_times_out_as_unhealthy() {
        let store = HealthStore::new(fast_config());
        let healthy = store
            .check(Capability::Stt, "deepgram", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                true
            })
            .await;
        assert!(!healthy);
    }

    #[tokio::test]
    async fn snapshot_reports_rows() {
        let store = HealthStore::new(fast_config());
        store.check(Capability::Tts, "elevenlabs", || async { true }).await;
        store.record_failure(Capability::Tts, "openai");
        let rows = store.snapshot();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.name == "elevenlabs" && r.healthy));
        assert!(rows.iter().any(|r| r.name == "openai" && !r.healthy));
    }
}
