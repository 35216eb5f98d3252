//! Per-connection session: WebSocket plumbing, the turn state machine and
//! barge-in decisions.
//!
//! One task owns all session state. Providers talk back through bounded
//! event channels; a writer task serializes every outbound frame so clients
//! observe `stt.partial* -> stt.final -> llm.partial* -> llm.final ->
//! tts.chunk* -> tts.end` in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use llm_core::cache::normalize;
use stt_core::{analyze, EndpointingConfig, SttEvent, SttParams, SttStreamHandle, Suggestion};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::barge::{self, BargeDecision, SpeechContext};
use crate::codec;
use crate::error::ErrorCode;
use crate::health::Capability;
use crate::protocol::{
    validate_envelope, AudioChunkHeader, ClientEnvelope, FirstMessageMode, Language,
    ServerEnvelope, SessionStart, SessionStartData,
};
use crate::state::SharedGateway;
use crate::textmatch::{substring_overlap, token_jaccard};
use crate::turn::{
    run_turn, Outbound, ResolvedProviders, TurnContext, TurnEvent, TurnOutcome, TurnShared,
};

/// Similarity above which a mid-turn final is treated as an echo of the
/// current utterance.
const OVERLAP_JACCARD: f64 = 0.8;
/// Early LLM requires a partial at least this long.
const EARLY_LLM_MIN_WORDS: usize = 8;

/// Formal turn state, for diagnostics and transition discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Idle,
    ListeningUser,
    AwaitingFinal,
    GeneratingLlm,
    SpeakingTts,
    Done,
    Barged,
    Errored,
}

struct SessionOptions {
    session_id: String,
    agent_id: Option<String>,
    user_id: Option<String>,
    voice_id: Option<String>,
    language: Language,
    endpointing: EndpointingConfig,
    first_message_mode: FirstMessageMode,
    first_message: Option<String>,
    ptt_mode: bool,
}

struct ActiveTurn {
    turn_id: u64,
    user_norm: String,
    llm_cancel: CancellationToken,
    tts_cancel: CancellationToken,
    shared: Arc<TurnShared>,
}

struct DeferredFinal {
    text: String,
    start_ms: u64,
    end_ms: u64,
}

struct EarlyLlm {
    partial_norm: String,
    cancel: CancellationToken,
    handle: JoinHandle<Option<String>>,
}

/* ------------------ HTTP entry ------------------ */

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<SharedGateway>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if auth::check_origin(origin, &gateway.config.server.allowed_origins).is_err() {
        info!(?origin, "rejecting connection: origin not allowed");
        return (axum::http::StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| query.get("token").map(String::as_str));
    if auth::check_bearer(presented, gateway.config.server.agent_ws_token.as_deref()).is_err() {
        return (axum::http::StatusCode::FORBIDDEN, "bad token").into_response();
    }

    match gateway.pool.register() {
        Some(connection_id) => ws.on_upgrade(move |socket| async move {
            Session::new(gateway, connection_id).run(socket).await;
        }),
        None => ws.on_upgrade(move |mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1013,
                    reason: "server overloaded".into(),
                })))
                .await;
        }),
    }
}

/* ------------------ Session ------------------ */

pub struct Session {
    gateway: SharedGateway,
    connection_id: Uuid,
    out: mpsc::Sender<Outbound>,
    out_rx: Option<mpsc::Receiver<Outbound>>,
    stt_tx: mpsc::Sender<SttEvent>,
    stt_rx: Option<mpsc::Receiver<SttEvent>>,
    turn_tx: mpsc::Sender<TurnEvent>,
    turn_rx: Option<mpsc::Receiver<TurnEvent>>,
    options: Option<SessionOptions>,
    providers: Option<ResolvedProviders>,
    stt: Option<SttStreamHandle>,
    stt_connect_latency_ms: Option<u64>,
    last_audio_at: Option<Instant>,
    last_activity: Instant,
    turn_seq: u64,
    active: Option<ActiveTurn>,
    deferred: Option<DeferredFinal>,
    early: Option<EarlyLlm>,
    early_used_this_turn: bool,
    user_speaking: Arc<AtomicBool>,
    state: TurnState,
    session_counted: bool,
    ended_sent: bool,
}

enum Flow {
    Continue,
    Break,
}

impl Session {
    fn new(gateway: SharedGateway, connection_id: Uuid) -> Self {
        let (out, out_rx) = mpsc::channel(256);
        // Buffers sized for bursts; providers block when the session lags.
        let (stt_tx, stt_rx) = mpsc::channel(64);
        let (turn_tx, turn_rx) = mpsc::channel(16);
        Self {
            gateway,
            connection_id,
            out,
            out_rx: Some(out_rx),
            stt_tx,
            stt_rx: Some(stt_rx),
            turn_tx,
            turn_rx: Some(turn_rx),
            options: None,
            providers: None,
            stt: None,
            stt_connect_latency_ms: None,
            last_audio_at: None,
            last_activity: Instant::now(),
            turn_seq: 0,
            active: None,
            deferred: None,
            early: None,
            early_used_this_turn: false,
            user_speaking: Arc::new(AtomicBool::new(false)),
            state: TurnState::Idle,
            session_counted: false,
            ended_sent: false,
        }
    }

    pub async fn run(mut self, socket: WebSocket) {
        let (mut ws_sink, mut ws_stream) = socket.split();

        let (Some(mut out_rx), Some(mut stt_rx), Some(mut turn_rx)) =
            (self.out_rx.take(), self.stt_rx.take(), self.turn_rx.take())
        else {
            return;
        };
        let writer: JoinHandle<()> = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let result = match message {
                    Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                        Ok(json) => ws_sink.send(Message::Text(json.into())).await,
                        Err(_) => continue,
                    },
                    Outbound::Chunk(bytes) => ws_sink.send(Message::Binary(bytes.into())).await,
                    Outbound::Close => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        let idle_ttl = self.gateway.config.server.idle_connection_ttl;
        loop {
            tokio::select! {
                message = ws_stream.next() => {
                    self.last_activity = Instant::now();
                    self.gateway.pool.touch(self.connection_id);
                    match message {
                        Some(Ok(message)) => {
                            if matches!(self.handle_ws_message(message).await, Flow::Break) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "websocket read error");
                            break;
                        }
                        None => break,
                    }
                }
                Some(event) = stt_rx.recv() => self.handle_stt_event(event).await,
                Some(event) = turn_rx.recv() => self.handle_turn_event(event).await,
                _ = tokio::time::sleep_until(self.last_activity + idle_ttl) => {
                    info!(connection = %self.connection_id, "closing idle connection");
                    self.send_session_ended("idle").await;
                    break;
                }
            }
        }

        self.teardown().await;
        let _ = self.out.send(Outbound::Close).await;
        drop(self.out);
        let _ = writer.await;
    }

    /* ------------------ Inbound frames ------------------ */

    async fn handle_ws_message(&mut self, message: Message) -> Flow {
        match message {
            Message::Text(text) => match serde_json::from_str::<serde_json::Value>(text.as_str()) {
                Ok(value) => self.handle_control(value).await,
                Err(_) => {
                    self.send_error(ErrorCode::BadEnvelope, "control frame is not JSON").await;
                    Flow::Continue
                }
            },
            Message::Binary(bytes) => self.handle_binary(bytes).await,
            Message::Close(_) => {
                self.send_session_ended("client closed").await;
                Flow::Break
            }
            _ => Flow::Continue,
        }
    }

    async fn handle_binary(&mut self, bytes: Bytes) -> Flow {
        let limits = self.gateway.config.frame_limits();

        // JSON-as-binary control frames are detected by a `{` first byte.
        if codec::is_json_control(&bytes) {
            if bytes.len() > limits.max_json_bytes {
                self.send_error(ErrorCode::PayloadTooLarge, "control frame too large").await;
                return Flow::Continue;
            }
            return match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(value) => self.handle_control(value).await,
                Err(_) => {
                    self.send_error(ErrorCode::BadEnvelope, "control frame is not JSON").await;
                    Flow::Continue
                }
            };
        }

        let (header, payload) = match codec::decode(&bytes, limits) {
            Ok(pair) => pair,
            Err(codec::CodecError::TooLarge { size, limit }) => {
                self.send_error(
                    ErrorCode::PayloadTooLarge,
                    &format!("frame of {size} bytes exceeds {limit}"),
                )
                .await;
                return Flow::Continue;
            }
            Err(e) => {
                self.send_error(ErrorCode::BadEnvelope, &e.to_string()).await;
                return Flow::Continue;
            }
        };

        let header: AudioChunkHeader = match serde_json::from_value(header) {
            Ok(h) => h,
            Err(_) => {
                self.send_error(ErrorCode::BadEnvelope, "bad audio header").await;
                return Flow::Continue;
            }
        };
        if header.r#type != "audio.chunk" {
            self.send_error(ErrorCode::Unsupported, "unexpected binary frame type").await;
            return Flow::Continue;
        }
        if self.options.is_none() {
            self.send_error(ErrorCode::BadEnvelope, "audio before session.start").await;
            return Flow::Continue;
        }

        // Token bucket: excess frames in a one-second window drop silently.
        if !self.gateway.pool.admit_audio_frame(self.connection_id) {
            self.gateway
                .metrics
                .dropped_audio_frames
                .fetch_add(1, Ordering::Relaxed);
            return Flow::Continue;
        }

        self.last_audio_at = Some(Instant::now());
        if self.ensure_stt(&header).await {
            if let Some(stt) = &self.stt {
                let payload = Bytes::copy_from_slice(payload);
                if !stt.send_audio(payload) {
                    debug!("stt inbox full, dropping frame");
                }
            }
        }
        Flow::Continue
    }

    /// Connect the STT stream lazily, from the first audio header.
    async fn ensure_stt(&mut self, header: &AudioChunkHeader) -> bool {
        if self.stt.is_some() {
            return true;
        }
        let Some(options) = &self.options else { return false };
        let Some(providers) = &self.providers else { return false };

        let params = SttParams {
            encoding: header.codec,
            sample_rate: header.sample_rate,
            channels: header.channels.unwrap_or(1),
            language: options.language.code().to_string(),
            endpointing: options.endpointing,
            silence_timeout_ms: self.gateway.config.stt.silence_timeout_ms,
        };
        match providers.stt.connect(params, self.stt_tx.clone()).await {
            Ok(handle) => {
                self.stt = Some(handle);
                true
            }
            Err(e) => {
                warn!(error = %e, "stt connect failed");
                self.gateway
                    .health
                    .record_failure(Capability::Stt, providers.stt.name());
                self.send_error(ErrorCode::SttError, &e.to_string()).await;
                false
            }
        }
    }

    /* ------------------ Control envelopes ------------------ */

    async fn handle_control(&mut self, value: serde_json::Value) -> Flow {
        let envelope = match validate_envelope(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.send_error(ErrorCode::Unsupported, &e.to_string()).await;
                return Flow::Continue;
            }
        };

        match envelope {
            ClientEnvelope::SessionStart(start) => self.handle_session_start(start).await,
            ClientEnvelope::AudioEnd {} => {
                if let Some(stt) = &self.stt {
                    stt.finalize().await;
                }
                Flow::Continue
            }
            ClientEnvelope::BargeCancel {} => {
                if let Some(active) = &self.active {
                    info!(turn = active.turn_id, "client barge.cancel");
                    active.llm_cancel.cancel();
                    active.tts_cancel.cancel();
                }
                Flow::Continue
            }
            ClientEnvelope::TestUtterance { data } => {
                if !self.gateway.config.server.test_hooks_enabled {
                    self.send_error(ErrorCode::Unsupported, "test hooks disabled").await;
                    return Flow::Continue;
                }
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                self.handle_final(data.text, now_ms, now_ms).await;
                Flow::Continue
            }
            ClientEnvelope::SessionEnd {} => {
                self.send_session_ended("client").await;
                Flow::Break
            }
        }
    }

    async fn handle_session_start(&mut self, start: SessionStart) -> Flow {
        if self.options.is_some() {
            self.send_error(ErrorCode::BadEnvelope, "session already started").await;
            return Flow::Continue;
        }

        // Optional per-session signed token.
        if let Some(secret) = &self.gateway.config.server.session_jwt_secret {
            let now = chrono::Utc::now().timestamp();
            let valid = start
                .data
                .token
                .as_deref()
                .map(|token| auth::verify_session_token(token, secret, &start.session_id, now))
                .unwrap_or(Err(auth::AuthError::MalformedToken));
            if let Err(e) = valid {
                warn!(error = %e, "session token rejected");
                self.send_error(ErrorCode::AuthFailed, "invalid session token").await;
                self.send_session_ended("auth failed").await;
                return Flow::Break;
            }
        }

        let data = &start.data;
        let cached = data.cached_agent_data.as_ref();
        let system_prompt = data
            .system_prompt
            .clone()
            .or_else(|| {
                cached
                    .and_then(|v| v.get("systemPrompt"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "You are a helpful voice assistant.".to_string());
        let first_message = data.first_message.clone().or_else(|| {
            cached
                .and_then(|v| v.get("firstMessage"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });

        let providers = match self.resolve_providers(data).await {
            Ok(providers) => providers,
            Err(message) => {
                self.send_error(ErrorCode::ProviderUnhealthy, &message).await;
                return Flow::Continue;
            }
        };

        let endpointing = {
            let defaults = EndpointingConfig::default();
            let params = data.endpointing.unwrap_or_default();
            EndpointingConfig {
                wait_seconds: params.wait_seconds.unwrap_or(defaults.wait_seconds),
                punctuation_seconds: params
                    .punctuation_seconds
                    .unwrap_or(defaults.punctuation_seconds),
                no_punct_seconds: params.no_punct_seconds.unwrap_or(defaults.no_punct_seconds),
                number_seconds: params.number_seconds.unwrap_or(defaults.number_seconds),
            }
        };

        let options = SessionOptions {
            session_id: start.session_id.clone(),
            agent_id: data.agent_id.clone(),
            user_id: data.user_id.clone(),
            voice_id: data
                .voice_id
                .clone()
                .or_else(|| providers.voice_id.clone()),
            language: data.language.unwrap_or(Language::En),
            endpointing,
            first_message_mode: data
                .first_message_mode
                .unwrap_or(FirstMessageMode::WaitForUser),
            first_message,
            ptt_mode: data.ptt_mode,
        };

        self.gateway
            .memory
            .create(&options.session_id, &system_prompt, None)
            .await;
        self.gateway.metrics.session_started();
        self.session_counted = true;
        info!(
            session = %options.session_id,
            agent = options.agent_id.as_deref().unwrap_or("-"),
            user = options.user_id.as_deref().unwrap_or("-"),
            ptt = options.ptt_mode,
            stt = providers.stt.name(),
            llm = providers.llm.name(),
            tts = providers.tts.name(),
            "session started"
        );

        self.providers = Some(providers);
        self.options = Some(options);

        if self.options.as_ref().map(|o| o.first_message_mode)
            == Some(FirstMessageMode::AssistantSpeaksFirst)
        {
            let first = self.options.as_ref().and_then(|o| o.first_message.clone());
            // A stored first message streams straight to TTS; without one a
            // fast-model greeting runs through the LLM.
            self.start_turn(String::new(), first, true).await;
        }
        Flow::Continue
    }

    async fn resolve_providers(&self, data: &SessionStartData) -> Result<ResolvedProviders, String> {
        let gateway = &self.gateway;
        let features = &gateway.config.features;

        let (mut stt_name, mut llm_name, mut llm_model, mut tts_name) = if features.provider_router {
            let decision = gateway
                .router
                .select(crate::router::Tier::Pro, crate::router::Complexity::Simple, None)
                .await
                .map_err(|e| e.to_string())?;
            debug!(reasons = ?decision.reasons, "router decision");
            (decision.stt, decision.llm, decision.llm_model, decision.tts)
        } else {
            let stt = gateway.registry.stts.first().ok_or("no stt provider configured")?;
            let llm = gateway.registry.llms.first().ok_or("no llm provider configured")?;
            let tts = gateway.registry.ttss.first().ok_or("no tts provider configured")?;
            (
                stt.name().to_string(),
                llm.name().to_string(),
                "gpt-4o-mini".to_string(),
                tts.name().to_string(),
            )
        };

        let mut llm_temperature = 0.7;
        let mut voice_id = None;
        if features.multi_provider {
            if let Some(overrides) = &data.providers {
                if let Some(llm) = &overrides.llm {
                    if gateway.registry.llm(&llm.r#type).is_some() {
                        llm_name = llm.r#type.clone();
                        if let Some(model) = &llm.model {
                            llm_model = model.clone();
                        }
                        if let Some(t) = llm.temperature {
                            llm_temperature = t;
                        }
                    }
                }
                if let Some(stt) = &overrides.stt {
                    if gateway.registry.stt(&stt.r#type).is_some() {
                        stt_name = stt.r#type.clone();
                    }
                }
                if let Some(tts) = &overrides.tts {
                    if gateway.registry.tts(&tts.r#type).is_some() {
                        tts_name = tts.r#type.clone();
                    }
                    voice_id = tts.voice_id.clone();
                }
            }
        }

        Ok(ResolvedProviders {
            stt: gateway.registry.stt(&stt_name).ok_or("stt provider missing")?,
            llm: gateway.registry.llm(&llm_name).ok_or("llm provider missing")?,
            llm_model,
            llm_temperature,
            tts: gateway.registry.tts(&tts_name).ok_or("tts provider missing")?,
            voice_id,
        })
    }

    /* ------------------ STT events ------------------ */

    async fn handle_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Ready { connect_latency_ms, .. } => {
                self.stt_connect_latency_ms = Some(connect_latency_ms);
            }
            SttEvent::StateChange { state } => {
                debug!(?state, "stt state change");
            }
            SttEvent::Partial { text } => self.handle_partial(text).await,
            SttEvent::Final { text, start_ms, end_ms, promoted } => {
                if promoted {
                    debug!("final promoted by silence timer");
                }
                self.handle_final(text, start_ms, end_ms).await;
            }
            SttEvent::Error { message, terminal } => {
                self.send_error(ErrorCode::SttError, &message).await;
                if let Some(providers) = &self.providers {
                    self.gateway
                        .health
                        .record_failure(Capability::Stt, providers.stt.name());
                }
                if terminal {
                    if let Some(active) = &self.active {
                        active.llm_cancel.cancel();
                        active.tts_cancel.cancel();
                    }
                    self.stt = None;
                }
            }
        }
    }

    async fn handle_partial(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        self.user_speaking.store(true, Ordering::Release);

        if self.state == TurnState::Idle {
            self.set_state(TurnState::ListeningUser);
        }
        let analysis = analyze(&text, Duration::ZERO);
        if self.state == TurnState::ListeningUser && analysis.suggestion == Suggestion::Process {
            self.set_state(TurnState::AwaitingFinal);
        }

        self.send_frame(ServerEnvelope::SttPartial { text: text.clone() }).await;

        let features = &self.gateway.config.features;

        // Partial-driven barge-in, flag-gated.
        if features.partial_barge {
            if let Some(active) = &self.active {
                if active.shared.tts_active.load(Ordering::Acquire) {
                    if let Some(decision) = self.evaluate_barge(&text) {
                        if let BargeDecision::Interrupt { reason } = decision {
                            info!(reason, "partial barge-in");
                            if let Some(active) = &self.active {
                                active.llm_cancel.cancel();
                                active.tts_cancel.cancel();
                            }
                        }
                    }
                }
            }
        }

        // Early LLM on a substantial partial: once per turn, never while
        // TTS is active, never under strict turn-taking.
        let tts_active = self
            .active
            .as_ref()
            .is_some_and(|a| a.shared.tts_active.load(Ordering::Acquire));
        if features.early_llm
            && !features.strict_turn_taking
            && !tts_active
            && self.active.is_none()
            && self.early.is_none()
            && !self.early_used_this_turn
            && analysis.suggestion == Suggestion::Process
            && text.split_whitespace().count() >= EARLY_LLM_MIN_WORDS
        {
            self.start_early_llm(text).await;
        }
    }

    async fn start_early_llm(&mut self, partial: String) {
        let (Some(options), Some(providers)) = (&self.options, &self.providers) else {
            return;
        };
        let Some(mut messages) = self.gateway.memory.get(&options.session_id).await else {
            return;
        };
        messages.push(llm_core::ChatMessage::user(&partial));

        let cancel = CancellationToken::new();
        let opts = llm_core::ChatOpts {
            model: providers.llm_model.clone(),
            temperature: providers.llm_temperature,
            max_tokens: providers.llm.max_tokens().min(1024),
            cancel: cancel.clone(),
        };
        let llm = providers.llm.clone();
        let handle = tokio::spawn(async move {
            let mut stream = llm.stream(&messages, &opts);
            let mut full = String::new();
            while let Some(item) = tokio_stream::StreamExt::next(&mut stream).await {
                match item {
                    Ok(delta) => full.push_str(&delta),
                    Err(_) => return None,
                }
            }
            (!full.is_empty()).then_some(full)
        });

        info!("early llm started on substantial partial");
        self.early_used_this_turn = true;
        self.early = Some(EarlyLlm {
            partial_norm: normalize(&partial),
            cancel,
            handle,
        });
    }

    async fn handle_final(&mut self, text: String, start_ms: u64, end_ms: u64) {
        if text.trim().is_empty() {
            return;
        }

        if let Some(active) = &self.active {
            let tts_active = active.shared.tts_active.load(Ordering::Acquire);
            if tts_active {
                match self.evaluate_barge(&text) {
                    Some(BargeDecision::Interrupt { reason }) => {
                        info!(reason, text = %text, "barge-in accepted");
                        self.deferred = Some(DeferredFinal { text, start_ms, end_ms });
                        if let Some(active) = &self.active {
                            active.llm_cancel.cancel();
                            active.tts_cancel.cancel();
                        }
                    }
                    Some(BargeDecision::Defer { reason }) => {
                        info!(reason, text = %text, "barge-in deferred");
                        self.deferred = Some(DeferredFinal { text, start_ms, end_ms });
                    }
                    None => {}
                }
                return;
            }

            // Turn is generating but not yet speaking: suppress echoes of
            // the current utterance, queue anything genuinely new.
            let norm = normalize(&text);
            if token_jaccard(&norm, &active.user_norm) >= OVERLAP_JACCARD
                || substring_overlap(&norm, &active.user_norm)
            {
                info!(text = %text, "suppressing overlapping final during active turn");
                return;
            }
            self.deferred = Some(DeferredFinal { text, start_ms, end_ms });
            return;
        }

        self.accept_final(text, start_ms, end_ms).await;
    }

    /// Accept a final as the start of a new turn.
    async fn accept_final(&mut self, text: String, start_ms: u64, end_ms: u64) {
        self.user_speaking.store(false, Ordering::Release);

        // Early LLM result is usable when the final matches the partial it
        // was started from.
        let mut response_override = None;
        if let Some(early) = self.early.take() {
            let norm_final = normalize(&text);
            if token_jaccard(&norm_final, &early.partial_norm) >= OVERLAP_JACCARD {
                match early.handle.await {
                    Ok(Some(response)) => {
                        info!("early llm response adopted");
                        response_override = Some(response);
                    }
                    _ => debug!("early llm produced nothing"),
                }
            } else {
                early.cancel.cancel();
                early.handle.abort();
            }
        }

        self.send_frame(ServerEnvelope::SttFinal {
            text: text.clone(),
            start_ts: start_ms,
            end_ts: end_ms,
            intent: None,
            confidence: None,
            entities: None,
            context: None,
        })
        .await;

        if let Some(options) = &self.options {
            self.gateway
                .memory
                .add_user_message(&options.session_id, &text)
                .await;
        }

        self.start_turn(text, response_override, false).await;
    }

    /// Spawn the turn task. `override_grounded` marks stored/cached text
    /// eligible for the tight endpointing cap.
    async fn start_turn(
        &mut self,
        user_text: String,
        response_override: Option<String>,
        override_grounded: bool,
    ) {
        let (Some(options), Some(providers)) = (&self.options, &self.providers) else {
            return;
        };

        self.turn_seq += 1;
        let turn_id = self.turn_seq;
        let llm_cancel = CancellationToken::new();
        let tts_cancel = CancellationToken::new();
        let shared = TurnShared::new();

        let stt_final_latency_ms = self
            .last_audio_at
            .map(|at| Instant::now().duration_since(at).as_millis() as u64);

        let ctx = TurnContext {
            gateway: self.gateway.clone(),
            session_id: options.session_id.clone(),
            agent_id: options.agent_id.clone(),
            turn_id,
            user_text: user_text.clone(),
            response_override,
            override_grounded,
            providers: ResolvedProviders {
                voice_id: options.voice_id.clone(),
                ..providers.clone()
            },
            endpointing: options.endpointing,
            out: self.out.clone(),
            events: self.turn_tx.clone(),
            shared: shared.clone(),
            llm_cancel: llm_cancel.clone(),
            tts_cancel: tts_cancel.clone(),
            user_speaking: self.user_speaking.clone(),
            stt_connect_latency_ms: self.stt_connect_latency_ms,
            stt_final_latency_ms,
        };

        self.active = Some(ActiveTurn {
            turn_id,
            user_norm: normalize(&user_text),
            llm_cancel,
            tts_cancel,
            shared,
        });
        self.early_used_this_turn = false;
        self.set_state(TurnState::GeneratingLlm);
        tokio::spawn(run_turn(ctx));
    }

    fn evaluate_barge(&self, user_text: &str) -> Option<BargeDecision> {
        let active = self.active.as_ref()?;
        let started = (*active
            .shared
            .tts_started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()))?;
        let spoken = active
            .shared
            .spoken_text
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let text_updated = active
            .shared
            .text_updated_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(started);
        let now = Instant::now();
        Some(barge::evaluate(
            user_text,
            SpeechContext {
                tts_text: &spoken,
                elapsed: now.duration_since(started),
                text_age: now.duration_since(text_updated),
            },
            &self.gateway.config.tts,
        ))
    }

    /* ------------------ Turn events ------------------ */

    async fn handle_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Speaking { turn_id } => {
                if self.active.as_ref().is_some_and(|a| a.turn_id == turn_id) {
                    self.set_state(TurnState::SpeakingTts);
                }
            }
            TurnEvent::Ended { turn_id, outcome, metrics } => {
                if !self.active.as_ref().is_some_and(|a| a.turn_id == turn_id) {
                    return;
                }
                self.active = None;
                self.gateway.metrics.record_turn(&metrics);
                match outcome {
                    TurnOutcome::Complete => self.set_state(TurnState::Done),
                    TurnOutcome::Barged => {
                        self.gateway
                            .metrics
                            .barged_turns
                            .fetch_add(1, Ordering::Relaxed);
                        self.set_state(TurnState::Barged);
                    }
                    TurnOutcome::Errored => {
                        self.gateway
                            .metrics
                            .errored_turns
                            .fetch_add(1, Ordering::Relaxed);
                        self.set_state(TurnState::Errored);
                    }
                }

                if let Ok(data) = serde_json::to_value(&metrics) {
                    self.send_frame(ServerEnvelope::MetricsUpdate { data }).await;
                }

                self.set_state(TurnState::Idle);
                // Replay the most recent deferred final, if any.
                if let Some(deferred) = self.deferred.take() {
                    self.accept_final(deferred.text, deferred.start_ms, deferred.end_ms)
                        .await;
                }
            }
        }
    }

    /* ------------------ Plumbing ------------------ */

    fn set_state(&mut self, state: TurnState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "turn state");
            self.state = state;
        }
    }

    async fn send_frame(&self, frame: ServerEnvelope) {
        let _ = self.out.send(Outbound::Frame(frame)).await;
    }

    async fn send_error(&self, code: ErrorCode, message: &str) {
        warn!(?code, message, "session error");
        self.send_frame(ServerEnvelope::Error {
            code,
            message: message.to_string(),
            recoverable: code.recoverable(),
            details: None,
        })
        .await;
    }

    async fn send_session_ended(&mut self, reason: &str) {
        if self.ended_sent {
            return;
        }
        self.ended_sent = true;
        self.send_frame(ServerEnvelope::SessionEnded { reason: reason.to_string() }).await;
    }

    async fn teardown(&mut self) {
        if let Some(active) = &self.active {
            active.llm_cancel.cancel();
            active.tts_cancel.cancel();
        }
        if let Some(early) = self.early.take() {
            early.cancel.cancel();
            early.handle.abort();
        }
        if let Some(stt) = &self.stt {
            stt.close().await;
        }
        self.gateway.pool.remove(self.connection_id);
        if self.session_counted {
            self.gateway.metrics.session_ended();
        }
        self.send_session_ended("disconnect").await;
        if let Some(options) = &self.options {
            info!(session = %options.session_id, "session closed");
        }
    }
}
