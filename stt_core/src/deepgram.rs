//! Deepgram streaming transcription over WebSocket.
//!
//! One task per stream owns the socket and all transcription state. The
//! lifecycle is `connecting -> open -> closing -> closed`, with
//! `reconnecting` entered only after audio has actually been sent; an idle
//! session that loses its socket simply closes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::analyzer::{analyze, Suggestion};
use crate::endpointing::promotion_delay;
use crate::text::{normalize_transcript, FinalDedup};
use crate::{
    AudioEncoding, Command, SttError, SttEvent, SttParams, SttProvider, SttStreamHandle,
    StreamState,
};

const QUEUE_CAP: usize = 20;
const COMMAND_CAP: usize = 64;
/// Outbound partial throttle: at most ~12/s.
const PARTIAL_MIN_INTERVAL: Duration = Duration::from_millis(85);
const WATCHDOG_DELAY: Duration = Duration::from_millis(700);
const WATCHDOG_QUEUE_THRESHOLD: usize = 10;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1500);
const CONNECT_OVERALL_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BASE: Duration = Duration::from_millis(200);
const RECONNECT_CAP: Duration = Duration::from_secs(4);
const RECONNECT_MAX_ATTEMPTS: u32 = 6;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct DeepgramConfig {
    pub model: String,
    pub auto_reconnect: bool,
    /// Provider-side endpointing, milliseconds.
    pub endpointing_ms: u64,
    pub utterance_end_ms: u64,
    pub base_url: String,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            auto_reconnect: true,
            endpointing_ms: 300,
            utterance_end_ms: 1000,
            base_url: "wss://api.deepgram.com".to_string(),
        }
    }
}

pub struct DeepgramStt {
    api_key: String,
    config: DeepgramConfig,
    http: reqwest::Client,
}

impl DeepgramStt {
    pub fn new(api_key: impl Into<String>, config: DeepgramConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env(config: DeepgramConfig) -> Result<Self, SttError> {
        let api_key =
            std::env::var("DEEPGRAM_API_KEY").map_err(|_| SttError::MissingKey("DEEPGRAM_API_KEY"))?;
        Ok(Self::new(api_key, config))
    }

    fn listen_url(&self, params: &SttParams) -> String {
        let encoding = match params.encoding {
            AudioEncoding::Pcm16 => "linear16",
            AudioEncoding::Opus => "opus",
        };
        format!(
            "{}/v1/listen?model={}&language={}&encoding={}&sample_rate={}&channels={}\
             &interim_results=true&punctuate=true&endpointing={}&utterance_end_ms={}",
            self.config.base_url,
            self.config.model,
            params.language,
            encoding,
            params.sample_rate,
            params.channels,
            self.config.endpointing_ms,
            self.config.utterance_end_ms,
        )
    }
}

#[async_trait]
impl SttProvider for DeepgramStt {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    async fn connect(
        &self,
        params: SttParams,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<SttStreamHandle, SttError> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAP);
        let ready = Arc::new(AtomicBool::new(false));

        let task = StreamTask {
            url: self.listen_url(&params),
            api_key: self.api_key.clone(),
            auto_reconnect: self.config.auto_reconnect,
            params,
            commands: command_rx,
            events,
            ready: ready.clone(),
            queue: VecDeque::new(),
            audio_ever_sent: false,
            reconnect_attempts: 0,
            watchdog_used: false,
            dedup: FinalDedup::default(),
            last_partial_norm: String::new(),
            last_partial_emit: None,
            pending: None,
            last_audio_at: Instant::now(),
        };
        tokio::spawn(task.run());

        Ok(SttStreamHandle {
            commands: command_tx,
            ready,
        })
    }

    async fn health_check(&self) -> Result<(), SttError> {
        let response = self
            .http
            .get("https://api.deepgram.com/v1/projects")
            .header("Authorization", format!("Token {}", self.api_key))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SttError::Api {
                status: response.status().as_u16(),
            })
        }
    }
}

/* ------------------ Stream task ------------------ */

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Results(ResultsMessage),
    UtteranceEnd {},
    SpeechStarted {},
    Metadata {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultsMessage {
    #[serde(default)]
    channel: Channel,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize, Default)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

struct PendingPromotion {
    text: String,
    start_ms: u64,
    end_ms: u64,
    partial_at: Instant,
    deadline: Instant,
    refired: bool,
}

enum Exit {
    /// Socket lost; decide on reconnect.
    SocketLost(String),
    /// Client asked to close, or event receiver dropped.
    Shutdown,
}

struct StreamTask {
    url: String,
    api_key: String,
    auto_reconnect: bool,
    params: SttParams,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SttEvent>,
    ready: Arc<AtomicBool>,
    queue: VecDeque<Bytes>,
    audio_ever_sent: bool,
    reconnect_attempts: u32,
    watchdog_used: bool,
    dedup: FinalDedup,
    last_partial_norm: String,
    last_partial_emit: Option<Instant>,
    pending: Option<PendingPromotion>,
    last_audio_at: Instant,
}

impl StreamTask {
    async fn run(mut self) {
        let first_attempt_at = Instant::now();

        loop {
            let state = if self.reconnect_attempts == 0 {
                StreamState::Connecting
            } else {
                StreamState::Reconnecting
            };
            self.set_state(state).await;

            let connect_started = Instant::now();
            let socket = match self.establish(connect_started).await {
                Ok(Some(socket)) => socket,
                Ok(None) => {
                    // Watchdog restart: retry immediately, once.
                    continue;
                }
                Err(e) => {
                    if first_attempt_at.elapsed() > CONNECT_OVERALL_TIMEOUT
                        || !self.backoff_or_give_up(&e.to_string()).await
                    {
                        self.fail_terminal(&e.to_string()).await;
                        return;
                    }
                    continue;
                }
            };

            let connect_latency_ms = connect_started.elapsed().as_millis() as u64;
            info!(latency_ms = connect_latency_ms, queued = self.queue.len(), "stt stream open");
            self.reconnect_attempts = 0;

            match self.serve(socket, connect_latency_ms).await {
                Exit::Shutdown => {
                    self.set_state(StreamState::Closed).await;
                    return;
                }
                Exit::SocketLost(reason) => {
                    self.ready.store(false, Ordering::Release);
                    // Idle sessions must not reconnect.
                    if !self.audio_ever_sent {
                        debug!("socket lost before any audio, closing idle stream");
                        self.set_state(StreamState::Closed).await;
                        return;
                    }
                    if !self.backoff_or_give_up(&reason).await {
                        self.fail_terminal(&reason).await;
                        return;
                    }
                }
            }
        }
    }

    /// Connect while continuing to accept audio into the bounded queue.
    ///
    /// `Ok(None)` signals a one-shot readiness-watchdog restart.
    async fn establish(&mut self, started: Instant) -> Result<Option<WsStream>, SttError> {
        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|e| SttError::WebSocket(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| SttError::WebSocket(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let connect = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(request));
        tokio::pin!(connect);
        let watchdog = tokio::time::sleep_until(started + WATCHDOG_DELAY);
        tokio::pin!(watchdog);
        let mut watchdog_armed = !self.watchdog_used;

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok((socket, _response))) => Ok(Some(socket)),
                        Ok(Err(e)) => Err(SttError::WebSocket(e.to_string())),
                        Err(_) => Err(SttError::ConnectTimeout(HANDSHAKE_TIMEOUT.as_millis() as u64)),
                    };
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Audio(bytes)) => self.enqueue(bytes),
                        Some(Command::Finalize) => {}
                        Some(Command::Close) | None => return Err(SttError::WebSocket("closed during connect".into())),
                    }
                }
                _ = &mut watchdog, if watchdog_armed => {
                    watchdog_armed = false;
                    if self.queue.len() >= WATCHDOG_QUEUE_THRESHOLD {
                        warn!(queued = self.queue.len(), "readiness watchdog restarting stt stream");
                        self.watchdog_used = true;
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Main open-phase loop; returns why the phase ended.
    async fn serve(&mut self, mut socket: WsStream, connect_latency_ms: u64) -> Exit {
        self.set_state(StreamState::Open).await;

        // Flush anything queued while connecting.
        let queued_frames = self.queue.len();
        while let Some(frame) = self.queue.pop_front() {
            if let Err(e) = socket.send(Message::Binary(frame.to_vec())).await {
                return Exit::SocketLost(e.to_string());
            }
            self.audio_ever_sent = true;
        }
        self.ready.store(true, Ordering::Release);
        if self
            .events
            .send(SttEvent::Ready { connect_latency_ms, queued_frames })
            .await
            .is_err()
        {
            return Exit::Shutdown;
        }

        let mut last_ws_send = Instant::now();

        loop {
            let promotion_deadline = self.pending.as_ref().map(|p| p.deadline);

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Audio(bytes)) => {
                            self.last_audio_at = Instant::now();
                            if let Err(e) = socket.send(Message::Binary(bytes.to_vec())).await {
                                self.enqueue(bytes);
                                return Exit::SocketLost(e.to_string());
                            }
                            self.audio_ever_sent = true;
                            last_ws_send = Instant::now();
                        }
                        Some(Command::Finalize) => {
                            if let Err(e) = socket.send(Message::Text("{\"type\":\"Finalize\"}".into())).await {
                                return Exit::SocketLost(e.to_string());
                            }
                            last_ws_send = Instant::now();
                        }
                        Some(Command::Close) => {
                            self.set_state(StreamState::Closing).await;
                            let _ = socket.send(Message::Text("{\"type\":\"CloseStream\"}".into())).await;
                            let _ = socket.close(None).await;
                            return Exit::Shutdown;
                        }
                        None => {
                            let _ = socket.close(None).await;
                            return Exit::Shutdown;
                        }
                    }
                }
                message = socket.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_server_message(&text).await.is_err() {
                                return Exit::Shutdown;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = socket.send(Message::Pong(payload)).await;
                            last_ws_send = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Exit::SocketLost("server closed stream".into());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Exit::SocketLost(e.to_string()),
                    }
                }
                _ = sleep_until_opt(promotion_deadline), if promotion_deadline.is_some() => {
                    if self.fire_promotion().await.is_err() {
                        return Exit::Shutdown;
                    }
                }
                _ = tokio::time::sleep_until(last_ws_send + KEEPALIVE_INTERVAL) => {
                    if let Err(e) = socket.send(Message::Text("{\"type\":\"KeepAlive\"}".into())).await {
                        return Exit::SocketLost(e.to_string());
                    }
                    last_ws_send = Instant::now();
                }
            }
        }
    }

    fn enqueue(&mut self, bytes: Bytes) {
        if self.queue.len() >= QUEUE_CAP {
            // Drop oldest on overflow.
            self.queue.pop_front();
        }
        self.queue.push_back(bytes);
    }

    async fn handle_server_message(&mut self, raw: &str) -> Result<(), ()> {
        let message = match serde_json::from_str::<ServerMessage>(raw) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "unparseable stt server message");
                return Ok(());
            }
        };

        match message {
            ServerMessage::Results(results) => {
                let transcript = results
                    .channel
                    .alternatives
                    .first()
                    .map(|a| a.transcript.trim().to_string())
                    .unwrap_or_default();
                if transcript.is_empty() {
                    return Ok(());
                }
                let start_ms = (results.start * 1000.0) as u64;
                let end_ms = ((results.start + results.duration) * 1000.0) as u64;

                if results.is_final || results.speech_final {
                    self.pending = None;
                    self.emit_final(transcript, start_ms, end_ms, false).await?;
                } else {
                    self.handle_partial(transcript, start_ms, end_ms).await?;
                }
            }
            ServerMessage::UtteranceEnd {} => {
                // Provider-side silence; try promoting an outstanding partial.
                if self.pending.is_some() {
                    self.fire_promotion().await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_partial(&mut self, text: String, start_ms: u64, end_ms: u64) -> Result<(), ()> {
        let now = Instant::now();
        let analysis = analyze(&text, Duration::ZERO);
        let delay = promotion_delay(
            &text,
            &self.params.endpointing,
            &analysis,
            Duration::from_millis(self.params.silence_timeout_ms),
        );
        self.pending = Some(PendingPromotion {
            text: text.clone(),
            start_ms,
            end_ms,
            partial_at: now,
            deadline: now + delay,
            refired: false,
        });

        // Throttle and suppress unchanged partials.
        let normalized = normalize_transcript(&text);
        if normalized == self.last_partial_norm {
            return Ok(());
        }
        if let Some(last) = self.last_partial_emit {
            if now.duration_since(last) < PARTIAL_MIN_INTERVAL {
                return Ok(());
            }
        }
        self.last_partial_norm = normalized;
        self.last_partial_emit = Some(now);
        self.events
            .send(SttEvent::Partial { text })
            .await
            .map_err(|_| ())
    }

    /// Silence timer fired: re-analyze and either promote or suppress.
    async fn fire_promotion(&mut self) -> Result<(), ()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let silence = Instant::now().duration_since(pending.partial_at);
        let analysis = analyze(&pending.text, silence);

        if analysis.is_complete || analysis.suggestion == Suggestion::Process {
            debug!(confidence = analysis.confidence, "promoting partial to final on silence");
            return self
                .emit_final(pending.text, pending.start_ms, pending.end_ms, true)
                .await;
        }

        if !pending.refired {
            // One more chance at the silence-timeout ceiling.
            let ceiling =
                pending.partial_at + Duration::from_millis(self.params.silence_timeout_ms);
            self.pending = Some(PendingPromotion {
                deadline: ceiling.max(Instant::now() + Duration::from_millis(50)),
                refired: true,
                ..pending
            });
        } else {
            debug!(text = %pending.text, "suppressing promotion of incomplete utterance");
        }
        Ok(())
    }

    async fn emit_final(
        &mut self,
        text: String,
        start_ms: u64,
        end_ms: u64,
        promoted: bool,
    ) -> Result<(), ()> {
        self.last_partial_norm.clear();
        if self.dedup.is_duplicate(&text) {
            info!(text = %text, "dropping duplicate stt final");
            return Ok(());
        }
        self.events
            .send(SttEvent::Final { text, start_ms, end_ms, promoted })
            .await
            .map_err(|_| ())
    }

    /// Sleep out the backoff for the next attempt; false when out of attempts.
    async fn backoff_or_give_up(&mut self, reason: &str) -> bool {
        if !self.auto_reconnect || self.reconnect_attempts >= RECONNECT_MAX_ATTEMPTS {
            return false;
        }
        let exp = RECONNECT_BASE
            .saturating_mul(1u32 << self.reconnect_attempts.min(5))
            .min(RECONNECT_CAP);
        let jitter = Duration::from_millis(
            rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 4),
        );
        self.reconnect_attempts += 1;
        warn!(
            attempt = self.reconnect_attempts,
            backoff_ms = (exp + jitter).as_millis() as u64,
            reason,
            "stt reconnecting"
        );
        tokio::time::sleep(exp + jitter).await;
        true
    }

    async fn fail_terminal(&mut self, message: &str) {
        self.ready.store(false, Ordering::Release);
        let _ = self
            .events
            .send(SttEvent::Error {
                message: message.to_string(),
                terminal: true,
            })
            .await;
        self.set_state(StreamState::Closed).await;
    }

    async fn set_state(&mut self, state: StreamState) {
        let _ = self.events.send(SttEvent::StateChange { state }).await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
