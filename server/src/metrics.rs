// Metrics collection and tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::LatencyThresholds;

/// Rolling latency history, capped at the most recent 50 samples.
#[derive(Debug, Default)]
pub struct RollingHistory {
    samples: Mutex<VecDeque<u64>>,
}

const HISTORY_CAP: usize = 50;

impl RollingHistory {
    pub fn record(&self, value_ms: u64) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back(value_ms);
        while samples.len() > HISTORY_CAP {
            samples.pop_front();
        }
    }

    pub fn average(&self) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }

    pub fn last(&self) -> Option<u64> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Latency classification buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    Ok,
    Warn,
    Critical,
}

pub fn classify(latency_ms: u64, thresholds: LatencyThresholds) -> LatencyClass {
    if latency_ms >= thresholds.critical_ms {
        LatencyClass::Critical
    } else if latency_ms >= thresholds.warn_ms {
        LatencyClass::Warn
    } else {
        LatencyClass::Ok
    }
}

/// Measurements for one completed turn.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetrics {
    pub connect_latency_ms: Option<u64>,
    pub stt_final_latency_ms: Option<u64>,
    pub llm_first_token_ms: Option<u64>,
    pub tts_first_audio_ms: Option<u64>,
    pub e2e_ms: Option<u64>,
}

/// Process-wide gateway counters and rolling latency histories.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub active_calls: AtomicU64,
    pub total_sessions: AtomicU64,
    pub total_turns: AtomicU64,
    pub barged_turns: AtomicU64,
    pub errored_turns: AtomicU64,
    pub dropped_audio_frames: AtomicU64,
    pub stt_connect: RollingHistory,
    pub stt_final: RollingHistory,
    pub llm_first_token: RollingHistory,
    pub tts_first_audio: RollingHistory,
    pub e2e: RollingHistory,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.active_calls.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        // Saturating decrement.
        let _ = self
            .active_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn record_turn(&self, turn: &TurnMetrics) {
        self.total_turns.fetch_add(1, Ordering::Relaxed);
        if let Some(v) = turn.connect_latency_ms {
            self.stt_connect.record(v);
        }
        if let Some(v) = turn.stt_final_latency_ms {
            self.stt_final.record(v);
        }
        if let Some(v) = turn.llm_first_token_ms {
            self.llm_first_token.record(v);
        }
        if let Some(v) = turn.tts_first_audio_ms {
            self.tts_first_audio.record(v);
        }
        if let Some(v) = turn.e2e_ms {
            self.e2e.record(v);
        }
    }

    pub fn snapshot(&self, thresholds: LatencyThresholds) -> MetricsSnapshot {
        let e2e_last = self.e2e.last();
        MetricsSnapshot {
            timestamp: Utc::now(),
            active_calls: self.active_calls.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            total_turns: self.total_turns.load(Ordering::Relaxed),
            barged_turns: self.barged_turns.load(Ordering::Relaxed),
            errored_turns: self.errored_turns.load(Ordering::Relaxed),
            dropped_audio_frames: self.dropped_audio_frames.load(Ordering::Relaxed),
            latencies: LatencySnapshot {
                stt_connect_avg_ms: self.stt_connect.average(),
                stt_final_avg_ms: self.stt_final.average(),
                llm_first_token_avg_ms: self.llm_first_token.average(),
                tts_first_audio_avg_ms: self.tts_first_audio.average(),
                e2e_avg_ms: self.e2e.average(),
                e2e_last_ms: e2e_last,
                e2e_class: e2e_last.map(|v| classify(v, thresholds)),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub active_calls: u64,
    pub total_sessions: u64,
    pub total_turns: u64,
    pub barged_turns: u64,
    pub errored_turns: u64,
    pub dropped_audio_frames: u64,
    pub latencies: LatencySnapshot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub stt_connect_avg_ms: f64,
    pub stt_final_avg_ms: f64,
    pub llm_first_token_avg_ms: f64,
    pub tts_first_audio_avg_ms: f64,
    pub e2e_avg_ms: f64,
    pub e2e_last_ms: Option<u64>,
    pub e2e_class: Option<LatencyClass>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> LatencyThresholds {
        LatencyThresholds { warn_ms: 2500, critical_ms: 5000 }
    }

    #[test]
    fn rolling_history_caps_at_50() {
        let history = RollingHistory::default();
        for i in 0..120u64 {
            history.record(i);
        }
        assert_eq!(history.len(), 50);
        // Oldest samples were evicted: average over 70..=119.
        assert_eq!(history.average(), (70..120).sum::<u64>() as f64 / 50.0);
        assert_eq!(history.last(), Some(119));
    }

    #[test]
    fn classification_buckets() {
        assert_eq!(classify(100, thresholds()), LatencyClass::Ok);
        assert_eq!(classify(3000, thresholds()), LatencyClass::Warn);
        assert_eq!(classify(9000, thresholds()), LatencyClass::Critical);
    }

    #[test]
    fn turn_recording_feeds_histories() {
        let metrics = GatewayMetrics::new();
        metrics.record_turn(&TurnMetrics {
            connect_latency_ms: Some(120),
            stt_final_latency_ms: Some(300),
            llm_first_token_ms: Some(450),
            tts_first_audio_ms: Some(700),
            e2e_ms: Some(1600),
        });
        let snapshot = metrics.snapshot(thresholds());
        assert_eq!(snapshot.total_turns, 1);
        assert_eq!(snapshot.latencies.e2e_last_ms, Some(1600));
        assert_eq!(snapshot.latencies.e2e_class, Some(LatencyClass::Ok));
    }

    #[test]
    fn active_calls_never_underflow() {
        let metrics = GatewayMetrics::new();
        metrics.session_ended();
        assert_eq!(metrics.active_calls.load(Ordering::Relaxed), 0);
        metrics.session_started();
        metrics.session_ended();
        assert_eq!(metrics.active_calls.load(Ordering::Relaxed), 0);
    }
}
