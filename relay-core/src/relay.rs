//! The streaming relay: `POST /api/chat` in, server-sent events out.
//!
//! Until the first frame exists the handler can still answer with a plain
//! JSON error. Once the SSE response is returned the status line is
//! committed, and every later failure travels in-band as an `error` frame.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    handler::HandlerWithoutStateExt,
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tower_http::services::ServeDir;
use tracing::{Span, debug, error, info, warn};
use tracing_futures::Instrument;

use crate::config::UpstreamCfg;
use crate::error::RelayError;
use crate::model::{ChatMessage, ChatPayload, ChatRequest, StopReason};
use crate::normalizer::normalize_message;
use crate::provider::ChatProvider;
use crate::stream::{BoxStreamEv, StreamEvent};
use crate::system_instruction::SystemInstruction;
use crate::telemetry::{self, RelayLog, RelayOutcome};
use crate::wire::{self, ErrorBody};

/// Everything a request needs; read-only once built.
pub struct RelayState {
    provider: Arc<dyn ChatProvider>,
    instruction: SystemInstruction,
    model: String,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
}

pub type AppState = Arc<RelayState>;

impl RelayState {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        instruction: SystemInstruction,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            instruction,
            model: model.into(),
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn from_config(
        cfg: &UpstreamCfg,
        provider: Arc<dyn ChatProvider>,
        instruction: SystemInstruction,
    ) -> Self {
        Self::new(provider, instruction, cfg.model.clone())
            .with_sampling(cfg.temperature, cfg.max_output_tokens)
    }

    pub fn with_sampling(mut self, temperature: Option<f32>, max_output_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_output_tokens = max_output_tokens;
        self
    }

    fn upstream_request(&self, message: String, request_id: &str) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(self.instruction.as_str()),
                ChatMessage::user(message),
            ],
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            request_id: Some(request_id.to_string()),
        }
    }
}

/// API routes only; anything else is a JSON 404.
pub fn router(state: AppState) -> Router {
    api_routes()
        .fallback(not_found)
        .with_state(state)
}

/// API routes plus static files from `dir`; missing files are a JSON 404.
pub fn router_with_static(state: AppState, dir: impl AsRef<Path>) -> Router {
    let assets = ServeDir::new(dir)
        .call_fallback_on_method_not_allowed(true)
        .not_found_service(not_found.into_service());
    api_routes()
        .fallback_service(assets)
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/chat", post(handle_chat))
        .method_not_allowed_fallback(not_found)
}

pub async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, wire::ROUTE_NOT_FOUND)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

fn sse_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

/// `POST /api/chat`.
pub async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "relay.chat",
        req.id = %request_id,
        llm.provider = %state.provider.name(),
        llm.model = %state.model,
    );
    relay(state, payload, request_id)
        .instrument(span)
        .await
}

async fn relay(
    state: AppState,
    payload: Result<Json<Value>, JsonRejection>,
    request_id: String,
) -> Response {
    let raw = match read_payload(payload) {
        Ok(p) => p.message,
        Err(reason) => {
            warn!(error = %reason, "unreadable chat body");
            return error_response(StatusCode::BAD_REQUEST, wire::INVALID_BODY);
        }
    };
    let Some(message) = normalize_message(raw.as_deref()) else {
        debug!("empty message rejected");
        return error_response(StatusCode::BAD_REQUEST, wire::MESSAGE_REQUIRED);
    };

    let started = Instant::now();
    let upstream = match state
        .provider
        .chat_stream_events(state.upstream_request(message, &request_id))
        .await
    {
        Ok(s) => s,
        Err(e) => return reject(&state, &request_id, started, e),
    };

    let mut frames = RelayStream::new(upstream, &state, request_id, started);
    if let Err(e) = frames.prime().await {
        return reject(&state, &frames.request_id, started, e);
    }

    info!("streaming response");
    let body = futures::stream::unfold(frames, |mut s| async move {
        let frame = s.next_frame().await?;
        Some((Ok::<Bytes, Infallible>(frame), s))
    })
    .instrument(Span::current());
    sse_response(Body::from_stream(body))
}

/// The body must be a JSON object; serde would also accept a sequence for
/// `ChatPayload`, so the shape is checked before decoding.
fn read_payload(payload: Result<Json<Value>, JsonRejection>) -> Result<ChatPayload, String> {
    match payload {
        Ok(Json(obj @ Value::Object(_))) => {
            serde_json::from_value(obj).map_err(|e| e.to_string())
        }
        Ok(Json(other)) => Err(format!("expected a JSON object, got {other}")),
        Err(rejection) => Err(rejection.body_text()),
    }
}

/// Upstream failed before any frame existed: answer single-shot.
fn reject(state: &RelayState, request_id: &str, started: Instant, e: RelayError) -> Response {
    error!(error = %e, kind = e.kind(), "upstream rejected request");
    telemetry::emit(
        RelayLog::new(request_id, state.provider.name(), &state.model, RelayOutcome::Rejected)
            .latency_ms(started.elapsed().as_millis() as u64)
            .error(e.kind(), &e.to_string()),
    );
    error_response(StatusCode::INTERNAL_SERVER_ERROR, wire::UPSTREAM_FAILURE_MESSAGE)
}

/// Turns upstream events into wire frames, one request's worth.
///
/// Owns the upstream stream: dropping this (the client went away) drops the
/// upstream connection with it.
struct RelayStream {
    upstream: BoxStreamEv,
    lookahead: Option<StreamEvent>,
    finished: bool,

    request_id: String,
    provider: String,
    model: String,
    started: Instant,
    span: Span,

    deltas: u32,
    chars: u64,
    tokens: (Option<u32>, Option<u32>),
    stop_reason: Option<StopReason>,
}

impl RelayStream {
    fn new(upstream: BoxStreamEv, state: &RelayState, request_id: String, started: Instant) -> Self {
        Self {
            upstream,
            lookahead: None,
            finished: false,
            request_id,
            provider: state.provider.name().to_string(),
            model: state.model.clone(),
            started,
            span: Span::current(),
            deltas: 0,
            chars: 0,
            tokens: (None, None),
            stop_reason: None,
        }
    }

    /// Pull until an event that produces a frame is buffered.
    ///
    /// The SSE headers are held back until this returns, so a failure before
    /// the first frame can still be a plain JSON 500. An upstream that stalls
    /// here leaves the client without headers until it yields or drops.
    ///
    /// Errs only when the upstream fails before that point; the stream is
    /// then marked finished so dropping it is not counted as a disconnect.
    async fn prime(&mut self) -> Result<(), RelayError> {
        loop {
            match self.upstream.next().await {
                Some(StreamEvent::Usage { prompt, completion }) => self.record_usage(prompt, completion),
                Some(StreamEvent::DeltaText(t)) if t.is_empty() => continue,
                Some(StreamEvent::Error(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                Some(ev) => {
                    self.lookahead = Some(ev);
                    return Ok(());
                }
                None => {
                    self.lookahead = Some(StreamEvent::Stop { reason: None });
                    return Ok(());
                }
            }
        }
    }

    async fn next_frame(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        loop {
            let ev = match self.lookahead.take() {
                Some(ev) => ev,
                // exhaustion without an explicit Stop still completes normally
                None => self
                    .upstream
                    .next()
                    .await
                    .unwrap_or(StreamEvent::Stop { reason: None }),
            };
            match ev {
                StreamEvent::DeltaText(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    return Some(self.content_frame(text));
                }
                StreamEvent::Usage { prompt, completion } => self.record_usage(prompt, completion),
                StreamEvent::Final(resp) => {
                    self.record_usage(Some(resp.usage_prompt), Some(resp.usage_completion));
                    self.lookahead = Some(StreamEvent::Stop {
                        reason: resp.stop_reason,
                    });
                    if !resp.text.is_empty() {
                        return Some(self.content_frame(resp.text));
                    }
                }
                StreamEvent::Stop { reason } => {
                    self.stop_reason = reason;
                    self.finish(RelayOutcome::Done, None);
                    return Some(wire::StreamEvent::done().to_frame());
                }
                StreamEvent::Error(e) => {
                    self.finish(RelayOutcome::Error, Some(&e));
                    return Some(wire::StreamEvent::error(wire::UPSTREAM_FAILURE_MESSAGE).to_frame());
                }
            }
        }
    }

    fn content_frame(&mut self, text: String) -> Bytes {
        self.deltas += 1;
        self.chars += text.chars().count() as u64;
        wire::StreamEvent::content(text).to_frame()
    }

    fn record_usage(&mut self, prompt: Option<u32>, completion: Option<u32>) {
        self.tokens = (prompt.or(self.tokens.0), completion.or(self.tokens.1));
    }

    fn finish(&mut self, outcome: RelayOutcome, err: Option<&RelayError>) {
        self.finished = true;
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let _enter = self.span.enter();
        match (outcome, err) {
            (RelayOutcome::Error, Some(e)) => {
                error!(error = %e, kind = e.kind(), deltas = self.deltas, "upstream failed mid-stream")
            }
            (RelayOutcome::Disconnected, _) => {
                warn!(deltas = self.deltas, "client disconnected before terminal frame")
            }
            _ => info!(deltas = self.deltas, chars = self.chars, latency_ms, "stream complete"),
        }
        let mut log = RelayLog::new(&self.request_id, &self.provider, &self.model, outcome)
            .deltas(self.deltas, self.chars)
            .tokens(self.tokens.0, self.tokens.1)
            .stop_reason_opt(self.stop_reason.map(|r| r.as_str()))
            .latency_ms(latency_ms);
        if let Some(e) = err {
            log = log.error(e.kind(), &e.to_string());
        }
        telemetry::emit(log);
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(RelayOutcome::Disconnected, None);
        }
    }
}
