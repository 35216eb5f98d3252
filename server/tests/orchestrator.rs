//! End-to-end turn orchestration over a live WebSocket, with the provider
//! layer stubbed out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use llm_core::{ChatMessage, ChatOpts, LlmError, LlmProvider, TokenStream};
use serde_json::{json, Value};
use stt_core::{SttError, SttEvent, SttParams, SttProvider, SttStreamHandle};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tts_core::{AudioStream, TtsError, TtsOpts, TtsProvider};

use server::config::Config;
use server::router::ProviderRegistry;
use server::state::Gateway;

/* ------------------ Provider stubs ------------------ */

struct StubStt;

#[async_trait]
impl SttProvider for StubStt {
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
        Ok(())
    }
}

/// Streams a fixed response in word-sized deltas after a short delay.
struct StubLlm {
    response: &'static str,
    initial_delay_ms: u64,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn name(&self) -> &'static str {
        "openai"
    }
    async fn chat(&self, _: &[ChatMessage], _: &ChatOpts) -> Result<String, LlmError> {
        Ok(self.response.to_string())
    }
    fn stream(&self, _: &[ChatMessage], opts: &ChatOpts) -> TokenStream {
        let (tx, rx) = mpsc::channel(32);
        let response = self.response;
        let delay = self.initial_delay_ms;
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            for word in response.split_inclusive(' ') {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(LlmError::Cancelled)).await;
                    return;
                }
                if tx.send(Ok(word.to_string())).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
    fn estimate_cost(&self, _: u32) -> f64 {
        0.001
    }
    fn max_tokens(&self) -> u32 {
        1024
    }
    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Yields `chunks` audio chunks, one every `interval_ms`, honouring
/// cancellation.
struct StubTts {
    chunks: usize,
    interval_ms: u64,
}

#[async_trait]
impl TtsProvider for StubTts {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }
    async fn stream(&self, _: &str, opts: &TtsOpts) -> Result<AudioStream, TtsError> {
        let (tx, rx) = mpsc::channel(8);
        let chunks = self.chunks;
        let interval = self.interval_ms;
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            for i in 0..chunks {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(TtsError::Cancelled)).await;
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
                }
                let payload = vec![i as u8; 64];
                if tx.send(Ok(payload.into())).await.is_err() {
                    return;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
    async fn health_check(&self) -> Result<(), TtsError> {
        Ok(())
    }
}

/* ------------------ Harness ------------------ */

fn test_config() -> Config {
    let mut config = Config::from_env();
    config.server.test_hooks_enabled = true;
    config.server.allowed_origins = vec![];
    config.server.agent_ws_token = None;
    config.server.session_jwt_secret = None;
    config.features.provider_router = false;
    config.features.early_tts = true;
    config.features.early_llm = false;
    config.features.kb_enabled = false;
    config
}

async fn spawn_gateway(llm: StubLlm, tts: StubTts) -> SocketAddr {
    let registry = Arc::new(ProviderRegistry {
        llms: vec![Arc::new(llm)],
        stts: vec![Arc::new(StubStt)],
        ttss: vec![Arc::new(tts)],
    });
    let gateway = Arc::new(Gateway::with_registry(test_config(), registry));
    let app = server::build_router(gateway);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[derive(Debug)]
enum Observed {
    Text(Value),
    Chunk { seq: u64 },
}

async fn next_observed(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Option<Observed> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .ok()??
            .ok()?;
        match message {
            Message::Text(text) => {
                return Some(Observed::Text(serde_json::from_str(&text).unwrap()));
            }
            Message::Binary(bytes) => {
                let (header, payload) =
                    server::codec::decode(&bytes, server::codec::FrameLimits::default()).unwrap();
                assert_eq!(header["type"], "tts.chunk");
                assert_eq!(header["mime"], "audio/mpeg");
                assert!(!payload.is_empty());
                return Some(Observed::Chunk {
                    seq: header["seq"].as_u64().unwrap(),
                });
            }
            _ => continue,
        }
    }
}

fn session_start(first_message: Option<&str>) -> String {
    let mut data = json!({ "vadEnabled": true, "pttMode": false });
    if let Some(first) = first_message {
        data["firstMessageMode"] = json!("assistant_speaks_first");
        data["firstMessage"] = json!(first);
    }
    json!({
        "type": "session.start",
        "sessionId": "test-session",
        "turnId": 0,
        "data": data,
    })
    .to_string()
}

fn test_utterance(text: &str) -> String {
    json!({ "type": "test.utterance", "data": { "text": text } }).to_string()
}

/* ------------------ Scenarios ------------------ */

#[tokio::test]
async fn assistant_speaks_first_streams_stored_message() {
    let addr = spawn_gateway(
        StubLlm { response: "unused", initial_delay_ms: 0 },
        StubTts { chunks: 3, interval_ms: 10 },
    )
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/agent"))
        .await
        .unwrap();

    ws.send(Message::Text(session_start(Some("Hi, how can I help?")).into()))
        .await
        .unwrap();

    // llm.final precedes every tts.chunk; seq is monotonic; exactly one
    // tts.end(complete); no STT activity was needed.
    let mut saw_llm_final = false;
    let mut chunk_seqs = Vec::new();
    loop {
        match next_observed(&mut ws).await.expect("stream ended early") {
            Observed::Text(frame) => match frame["type"].as_str().unwrap() {
                "llm.final" => {
                    assert!(chunk_seqs.is_empty(), "llm.final must precede tts chunks");
                    assert_eq!(frame["text"], "Hi, how can I help?");
                    saw_llm_final = true;
                }
                "tts.end" => {
                    assert_eq!(frame["reason"], "complete");
                    break;
                }
                "metrics.update" | "session.ended" => {}
                other => panic!("unexpected frame type {other}"),
            },
            Observed::Chunk { seq } => {
                assert!(saw_llm_final);
                chunk_seqs.push(seq);
            }
        }
    }
    assert_eq!(chunk_seqs, vec![0, 1, 2]);
}

#[tokio::test]
async fn duplicate_utterance_during_generation_yields_one_turn() {
    let addr = spawn_gateway(
        StubLlm { response: "Sure, I can get you a quote right away. ", initial_delay_ms: 300 },
        StubTts { chunks: 2, interval_ms: 10 },
    )
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/agent"))
        .await
        .unwrap();

    ws.send(Message::Text(session_start(None).into())).await.unwrap();
    ws.send(Message::Text(test_utterance("I want a quote.").into()))
        .await
        .unwrap();
    // Second identical final lands while the first turn is generating.
    tokio::time::sleep(Duration::from_millis(50)).await;
    ws.send(Message::Text(test_utterance("I want a quote.").into()))
        .await
        .unwrap();

    let mut llm_finals = 0;
    let mut tts_ends = 0;
    loop {
        match next_observed(&mut ws).await.expect("stream ended early") {
            Observed::Text(frame) => match frame["type"].as_str().unwrap() {
                "llm.final" => llm_finals += 1,
                "tts.end" => {
                    tts_ends += 1;
                    break;
                }
                _ => {}
            },
            Observed::Chunk { .. } => {}
        }
    }
    // Give a suppressed duplicate a chance to (incorrectly) produce more.
    let mut extra_finals = 0;
    while let Ok(Some(Ok(message))) =
        tokio::time::timeout(Duration::from_millis(500), ws.next()).await
    {
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).unwrap();
            if frame["type"] == "llm.final" {
                extra_finals += 1;
            }
        }
    }

    assert_eq!(llm_finals, 1);
    assert_eq!(tts_ends, 1);
    assert_eq!(extra_finals, 0);
}

#[tokio::test]
async fn stop_phrase_barges_while_short_greeting_does_not() {
    let addr = spawn_gateway(
        StubLlm { response: "unused", initial_delay_ms: 0 },
        // Long utterance: 40 chunks, 100 ms apart.
        StubTts { chunks: 40, interval_ms: 100 },
    )
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/agent"))
        .await
        .unwrap();

    ws.send(Message::Text(
        session_start(Some("Your policy number is 12-345-67.")).into(),
    ))
    .await
    .unwrap();

    // Wait for audio to start flowing.
    let mut chunks_seen = 0;
    while chunks_seen < 3 {
        if let Some(Observed::Chunk { .. }) = next_observed(&mut ws).await {
            chunks_seen += 1;
        }
    }

    // A one-word non-stop utterance must not interrupt.
    ws.send(Message::Text(test_utterance("hi").into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // An explicit stop phrase interrupts even at 2 words.
    ws.send(Message::Text(test_utterance("um wait").into())).await.unwrap();

    let mut reason = None;
    loop {
        match next_observed(&mut ws).await.expect("stream ended early") {
            Observed::Text(frame) => {
                if frame["type"] == "tts.end" {
                    reason = frame["reason"].as_str().map(str::to_string);
                    break;
                }
            }
            Observed::Chunk { .. } => {}
        }
    }
    assert_eq!(reason.as_deref(), Some("barge"));
}

#[tokio::test]
async fn session_end_is_acknowledged() {
    let addr = spawn_gateway(
        StubLlm { response: "unused", initial_delay_ms: 0 },
        StubTts { chunks: 1, interval_ms: 5 },
    )
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/agent"))
        .await
        .unwrap();

    ws.send(Message::Text(session_start(None).into())).await.unwrap();
    ws.send(Message::Text(json!({"type": "session.end"}).to_string().into()))
        .await
        .unwrap();

    let mut ended = false;
    while let Some(observed) = next_observed(&mut ws).await {
        if let Observed::Text(frame) = observed {
            if frame["type"] == "session.ended" {
                ended = true;
                break;
            }
        }
    }
    assert!(ended);
}

#[tokio::test]
async fn unknown_envelope_gets_recoverable_error() {
    let addr = spawn_gateway(
        StubLlm { response: "unused", initial_delay_ms: 0 },
        StubTts { chunks: 1, interval_ms: 5 },
    )
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/agent"))
        .await
        .unwrap();

    ws.send(Message::Text(json!({"type": "bogus.kind"}).to_string().into()))
        .await
        .unwrap();

    let observed = next_observed(&mut ws).await.expect("expected an error frame");
    let Observed::Text(frame) = observed else {
        panic!("expected text frame");
    };
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["recoverable"], true);

    // Connection is still usable afterwards.
    ws.send(Message::Text(session_start(None).into())).await.unwrap();
    ws.send(Message::Text(json!({"type": "session.end"}).to_string().into()))
        .await
        .unwrap();
    let mut ended = false;
    while let Some(observed) = next_observed(&mut ws).await {
        if let Observed::Text(frame) = observed {
            if frame["type"] == "session.ended" {
                ended = true;
                break;
            }
        }
    }
    assert!(ended);
}
