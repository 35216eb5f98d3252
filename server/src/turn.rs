//! One conversational turn: response resolution, LLM streaming, early TTS
//! at the first sentence boundary, playback and exactly one `tts.end`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use llm_core::{ChatMessage, ChatOpts, LlmError, LlmProvider, Role};
use stt_core::endpointing::tts_start_delay;
use stt_core::{EndpointingConfig, SttProvider};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tts_core::{TtsError, TtsOpts, TtsProvider};

use crate::codec;
use crate::error::ErrorCode;
use crate::health::Capability;
use crate::kb::{chunk_instruction_block, is_high_confidence};
use crate::metrics::TurnMetrics;
use crate::protocol::{ServerEnvelope, TtsChunkHeader, TtsEndReason};
use crate::state::SharedGateway;
use crate::textmatch::first_sentence_boundary;

/// Early TTS requires this many words before the sentence boundary.
const EARLY_TTS_MIN_WORDS: usize = 6;
const GREETING_INSTRUCTION: &str =
    "Greet the caller briefly and ask how you can help. One or two short sentences.";

/// Messages from the session loop to the client writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerEnvelope),
    Chunk(Vec<u8>),
    Close,
}

/// Providers resolved for this session (router decision plus overrides).
#[derive(Clone)]
pub struct ResolvedProviders {
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub tts: Arc<dyn TtsProvider>,
    pub voice_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Complete,
    Barged,
    Errored,
}

#[derive(Debug)]
pub enum TurnEvent {
    /// First audio chunk for this turn went out.
    Speaking { turn_id: u64 },
    Ended {
        turn_id: u64,
        outcome: TurnOutcome,
        metrics: TurnMetrics,
    },
}

/// State shared between the turn task and the session loop, read by the
/// barge-in policy.
pub struct TurnShared {
    pub tts_active: AtomicBool,
    pub tts_started_at: Mutex<Option<Instant>>,
    pub spoken_text: Mutex<String>,
    pub text_updated_at: Mutex<Option<Instant>>,
    pub seq: AtomicU64,
}

impl TurnShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tts_active: AtomicBool::new(false),
            tts_started_at: Mutex::new(None),
            spoken_text: Mutex::new(String::new()),
            text_updated_at: Mutex::new(None),
            seq: AtomicU64::new(0),
        })
    }

    fn note_text(&self, text: &str) {
        let mut spoken = self.spoken_text.lock().unwrap_or_else(|e| e.into_inner());
        if !spoken.is_empty() && !spoken.ends_with(' ') {
            spoken.push(' ');
        }
        spoken.push_str(text);
        *self.text_updated_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn note_first_audio(&self) -> bool {
        let mut started = self.tts_started_at.lock().unwrap_or_else(|e| e.into_inner());
        if started.is_none() {
            *started = Some(Instant::now());
            self.tts_active.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}

pub struct TurnContext {
    pub gateway: SharedGateway,
    pub session_id: String,
    pub agent_id: Option<String>,
    pub turn_id: u64,
    pub user_text: String,
    /// Pre-resolved response (stored first message, cache hit, early LLM).
    pub response_override: Option<String>,
    /// Whether the override counts as grounded for the endpointing cap
    /// (stored first messages do; adopted early-LLM output does not).
    pub override_grounded: bool,
    pub providers: ResolvedProviders,
    pub endpointing: EndpointingConfig,
    pub out: mpsc::Sender<Outbound>,
    pub events: mpsc::Sender<TurnEvent>,
    pub shared: Arc<TurnShared>,
    pub llm_cancel: CancellationToken,
    pub tts_cancel: CancellationToken,
    /// Set by the session loop while STT partials are flowing.
    pub user_speaking: Arc<AtomicBool>,
    pub stt_connect_latency_ms: Option<u64>,
    pub stt_final_latency_ms: Option<u64>,
}

pub async fn run_turn(ctx: TurnContext) {
    let started = Instant::now();
    let mut metrics = TurnMetrics {
        connect_latency_ms: ctx.stt_connect_latency_ms,
        stt_final_latency_ms: ctx.stt_final_latency_ms,
        ..TurnMetrics::default()
    };

    let outcome = execute(&ctx, started, &mut metrics).await;

    ctx.shared.tts_active.store(false, Ordering::Release);
    if let Some(first_audio) = *ctx
        .shared
        .tts_started_at
        .lock()
        .unwrap_or_else(|e| e.into_inner())
    {
        metrics.tts_first_audio_ms = Some(first_audio.duration_since(started).as_millis() as u64);
    }
    metrics.e2e_ms = Some(started.elapsed().as_millis() as u64);

    let _ = ctx
        .events
        .send(TurnEvent::Ended { turn_id: ctx.turn_id, outcome, metrics })
        .await;
}

async fn execute(ctx: &TurnContext, started: Instant, metrics: &mut TurnMetrics) -> TurnOutcome {
    match resolve_grounded_response(ctx).await {
        GroundedOutcome::Direct { text, grounded } => speak_direct(ctx, &text, grounded).await,
        GroundedOutcome::Augment(chunks) => stream_llm(ctx, started, metrics, chunks).await,
    }
}

enum GroundedOutcome {
    /// Speak this text directly, no LLM.
    Direct { text: String, grounded: bool },
    /// Run the LLM, optionally with KB chunks injected.
    Augment(Vec<String>),
}

async fn resolve_grounded_response(ctx: &TurnContext) -> GroundedOutcome {
    if let Some(text) = &ctx.response_override {
        return GroundedOutcome::Direct {
            text: text.clone(),
            grounded: ctx.override_grounded,
        };
    }

    if !ctx.user_text.is_empty() {
        if let Some(hit) = ctx
            .gateway
            .cache
            .get(ctx.agent_id.as_deref(), &ctx.user_text)
            .await
        {
            info!(turn = ctx.turn_id, "response cache hit");
            return GroundedOutcome::Direct { text: hit, grounded: true };
        }
    }

    if let (Some(kb), Some(agent_id)) = (&ctx.gateway.kb, ctx.agent_id.as_deref()) {
        if !ctx.user_text.is_empty() {
            match kb.grounded_answer(&ctx.user_text, agent_id).await {
                Ok(grounded) => {
                    let sentinel = &ctx.gateway.config.providers.kb_insufficient_sentinel;
                    if let Some(answer) = grounded.answer {
                        if is_high_confidence(&answer, sentinel) {
                            info!(turn = ctx.turn_id, "kb grounded answer");
                            return GroundedOutcome::Direct { text: answer, grounded: true };
                        }
                    }
                    if !grounded.chunks.is_empty() {
                        return GroundedOutcome::Augment(grounded.chunks);
                    }
                }
                Err(e) => warn!(error = %e, "kb lookup failed"),
            }
        }
    }

    GroundedOutcome::Augment(Vec::new())
}

/// Direct path: `llm.final` then TTS, no model call.
async fn speak_direct(ctx: &TurnContext, text: &str, grounded: bool) -> TurnOutcome {
    if send_frame(ctx, ServerEnvelope::LlmFinal { text: text.to_string() })
        .await
        .is_err()
    {
        return TurnOutcome::Errored;
    }
    ctx.gateway
        .memory
        .add_assistant_message(&ctx.session_id, text)
        .await;

    if !apply_tts_delay(ctx, grounded).await {
        return finish_barged(ctx).await;
    }
    match pump_segment(ctx, text).await {
        PumpEnd::Completed => finish_complete(ctx).await,
        PumpEnd::Cancelled => finish_barged(ctx).await,
        PumpEnd::Failed => finish_errored(ctx).await,
    }
}

/// LLM streaming path with early TTS at the first sentence boundary.
async fn stream_llm(
    ctx: &TurnContext,
    started: Instant,
    metrics: &mut TurnMetrics,
    kb_chunks: Vec<String>,
) -> TurnOutcome {
    let mut messages = ctx
        .gateway
        .memory
        .get(&ctx.session_id)
        .await
        .unwrap_or_else(|| vec![ChatMessage::system("You are a helpful voice assistant.")]);

    if !kb_chunks.is_empty() {
        if let Some(system) = messages.iter_mut().find(|m| m.role == Role::System) {
            system.content.push_str(&chunk_instruction_block(&kb_chunks));
        }
    }
    // A first-message greeting turn has no user utterance yet; it runs on
    // the provider's fast model and stays short.
    let greeting = !messages.iter().any(|m| m.role == Role::User);
    if greeting {
        messages.push(ChatMessage::user(GREETING_INSTRUCTION));
    }

    let opts = ChatOpts {
        model: if greeting {
            crate::router::fast_model(ctx.providers.llm.name()).to_string()
        } else {
            ctx.providers.llm_model.clone()
        },
        temperature: ctx.providers.llm_temperature,
        max_tokens: if greeting {
            128
        } else {
            ctx.providers.llm.max_tokens().min(1024)
        },
        cancel: ctx.llm_cancel.clone(),
    };

    let mut stream = ctx.providers.llm.stream(&messages, &opts);
    let mut full = String::new();
    let mut early_pump: Option<JoinHandle<PumpEnd>> = None;
    let mut prefix_len = 0usize;
    let mut barged = false;

    while let Some(item) = stream.next().await {
        match item {
            Ok(delta) => {
                if metrics.llm_first_token_ms.is_none() {
                    metrics.llm_first_token_ms = Some(started.elapsed().as_millis() as u64);
                }
                full.push_str(&delta);
                if send_frame(ctx, ServerEnvelope::LlmPartial { text: delta }).await.is_err() {
                    ctx.llm_cancel.cancel();
                    ctx.tts_cancel.cancel();
                    return TurnOutcome::Errored;
                }

                // Early TTS: once, at the first safe sentence boundary.
                if ctx.gateway.config.features.early_tts && early_pump.is_none() {
                    if let Some(end) = first_sentence_boundary(&full, EARLY_TTS_MIN_WORDS) {
                        if !apply_tts_delay(ctx, false).await {
                            barged = true;
                            break;
                        }
                        prefix_len = end;
                        let prefix = full[..end].to_string();
                        early_pump = Some(spawn_pump(ctx, prefix));
                    }
                }
            }
            Err(LlmError::Cancelled) => {
                barged = true;
                break;
            }
            Err(e) => {
                warn!(error = %e, provider = ctx.providers.llm.name(), "llm stream error");
                ctx.gateway
                    .health
                    .record_failure(Capability::Llm, ctx.providers.llm.name());
                let _ = send_frame(
                    ctx,
                    ServerEnvelope::Error {
                        code: ErrorCode::LlmError,
                        message: e.to_string(),
                        recoverable: true,
                        details: None,
                    },
                )
                .await;
                ctx.tts_cancel.cancel();
                if let Some(pump) = early_pump.take() {
                    let _ = pump.await;
                }
                return finish_errored(ctx).await;
            }
        }
    }

    if barged {
        ctx.tts_cancel.cancel();
        if let Some(pump) = early_pump.take() {
            let _ = pump.await;
        }
        if !full.is_empty() {
            ctx.gateway
                .memory
                .add_assistant_message(&ctx.session_id, &full)
                .await;
        }
        return finish_barged(ctx).await;
    }

    if send_frame(ctx, ServerEnvelope::LlmFinal { text: full.clone() }).await.is_err() {
        return TurnOutcome::Errored;
    }
    if !full.trim().is_empty() {
        ctx.gateway
            .memory
            .add_assistant_message(&ctx.session_id, &full)
            .await;
        if !ctx.user_text.is_empty() {
            ctx.gateway
                .cache
                .put(ctx.agent_id.as_deref(), &ctx.user_text, &full)
                .await;
        }
    }

    match early_pump {
        Some(pump) => {
            match pump.await.unwrap_or(PumpEnd::Failed) {
                PumpEnd::Completed => {}
                PumpEnd::Cancelled => return finish_barged(ctx).await,
                PumpEnd::Failed => return finish_errored(ctx).await,
            }
            // Stream whatever the prefix did not cover; if the prefix was
            // the whole response, we are already done.
            let remainder = full[prefix_len.min(full.len())..].trim().to_string();
            if remainder.is_empty() {
                return finish_complete(ctx).await;
            }
            match pump_segment(ctx, &remainder).await {
                PumpEnd::Completed => finish_complete(ctx).await,
                PumpEnd::Cancelled => finish_barged(ctx).await,
                PumpEnd::Failed => finish_errored(ctx).await,
            }
        }
        None => {
            if full.trim().is_empty() {
                return finish_complete(ctx).await;
            }
            if !apply_tts_delay(ctx, false).await {
                return finish_barged(ctx).await;
            }
            match pump_segment(ctx, &full).await {
                PumpEnd::Completed => finish_complete(ctx).await,
                PumpEnd::Cancelled => finish_barged(ctx).await,
                PumpEnd::Failed => finish_errored(ctx).await,
            }
        }
    }
}

/// Endpointing delay before TTS starts. Returns false when cancelled.
///
/// Strict turn-taking skips the delay entirely when the user has resumed
/// talking.
async fn apply_tts_delay(ctx: &TurnContext, grounded: bool) -> bool {
    let features = &ctx.gateway.config.features;
    if features.strict_turn_taking && ctx.user_speaking.load(Ordering::Acquire) {
        return true;
    }
    let delay = tts_start_delay(&ctx.user_text, &ctx.endpointing, grounded);
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        _ = ctx.tts_cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Completed,
    Cancelled,
    Failed,
}

/// Stream one text segment through TTS, forwarding encoded chunks.
async fn pump_segment(ctx: &TurnContext, text: &str) -> PumpEnd {
    spawn_pump(ctx, text.to_string())
        .await
        .unwrap_or(PumpEnd::Failed)
}

fn spawn_pump(ctx: &TurnContext, text: String) -> JoinHandle<PumpEnd> {
    let gateway = ctx.gateway.clone();
    let tts = ctx.providers.tts.clone();
    let opts = TtsOpts {
        voice_id: ctx
            .providers
            .voice_id
            .clone()
            .unwrap_or_else(|| TtsOpts::default().voice_id),
        cancel: ctx.tts_cancel.clone(),
        ..TtsOpts::default()
    };
    let out = ctx.out.clone();
    let events = ctx.events.clone();
    let shared = ctx.shared.clone();
    let session_id = ctx.session_id.clone();
    let turn_id = ctx.turn_id;

    tokio::spawn(async move {
        shared.note_text(&text);

        let mut stream = match tts.stream(&text, &opts).await {
            Ok(stream) => stream,
            Err(TtsError::Cancelled) => return PumpEnd::Cancelled,
            Err(e) => {
                warn!(error = %e, provider = tts.name(), "tts stream failed to start");
                gateway.health.record_failure(Capability::Tts, tts.name());
                return PumpEnd::Failed;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => {
                    if shared.note_first_audio() {
                        let _ = events.send(TurnEvent::Speaking { turn_id }).await;
                    }
                    let seq = shared.seq.fetch_add(1, Ordering::Relaxed);
                    let header = TtsChunkHeader::new(seq, &session_id, turn_id);
                    let header_value = match serde_json::to_value(&header) {
                        Ok(v) => v,
                        Err(_) => return PumpEnd::Failed,
                    };
                    match codec::encode(&header_value, &bytes, gateway.config.frame_limits()) {
                        Ok(frame) => {
                            if out.send(Outbound::Chunk(frame)).await.is_err() {
                                return PumpEnd::Cancelled;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "tts chunk encode failed");
                            return PumpEnd::Failed;
                        }
                    }
                }
                Err(TtsError::Cancelled) => return PumpEnd::Cancelled,
                Err(e) => {
                    warn!(error = %e, provider = tts.name(), "tts stream error");
                    gateway.health.record_failure(Capability::Tts, tts.name());
                    return PumpEnd::Failed;
                }
            }
        }
        PumpEnd::Completed
    })
}

async fn finish_complete(ctx: &TurnContext) -> TurnOutcome {
    let _ = send_frame(ctx, ServerEnvelope::TtsEnd { reason: TtsEndReason::Complete }).await;
    TurnOutcome::Complete
}

async fn finish_barged(ctx: &TurnContext) -> TurnOutcome {
    let _ = send_frame(ctx, ServerEnvelope::TtsEnd { reason: TtsEndReason::Barge }).await;
    TurnOutcome::Barged
}

async fn finish_errored(ctx: &TurnContext) -> TurnOutcome {
    let _ = send_frame(ctx, ServerEnvelope::TtsEnd { reason: TtsEndReason::Error }).await;
    TurnOutcome::Errored
}

async fn send_frame(ctx: &TurnContext, frame: ServerEnvelope) -> Result<(), ()> {
    ctx.out.send(Outbound::Frame(frame)).await.map_err(|_| ())
}
