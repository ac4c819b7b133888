use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};
use crate::http_client::{HttpClient, SseStream};
use crate::model::{ChatMessage, ChatRequest, ChatResponse, StopReason};
use crate::provider::ChatProvider;
use crate::stream::{BoxStreamEv, StreamEvent};

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAI {
    http: HttpClient,
    base: String,
    org: Option<String>,
    name: String, // usually "openai"
    api_key: SecretString,
}

impl OpenAI {
    pub fn new(http: HttpClient, api_key: SecretString, base: String, org: Option<String>) -> Self {
        Self {
            http,
            api_key,
            base,
            org,
            name: "openai".into(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAI::new(
            HttpClient::new_default().unwrap(),
            SecretString::new("test-key".into()),
            server_base.to_string(),
            None,
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        if let Some(org) = &self.org {
            h.push(("OpenAI-Organization".into(), org.clone()));
        }
        h
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base)
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct OAChatReq<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

impl<'a> OAChatReq<'a> {
    fn from_request(req: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_output_tokens,
            stream,
        }
    }
}

#[derive(Deserialize)]
struct OAChatResp {
    id: String,
    choices: Vec<OAChoice>,
    usage: Option<OAUsage>,
}

#[derive(Deserialize)]
struct OAChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OAUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// One `data:` payload of a streamed completion.
#[derive(Deserialize)]
struct OAChunk {
    #[serde(default)]
    choices: Vec<OAChunkChoice>,
    #[serde(default)]
    usage: Option<OAUsage>,
    #[serde(default)]
    error: Option<OAStreamError>,
}

#[derive(Deserialize)]
struct OAChunkChoice {
    #[serde(default)]
    delta: OADelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OADelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OAStreamError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

fn map_finish(s: Option<&str>) -> Option<StopReason> {
    match s {
        Some("stop") => Some(StopReason::Stop),
        Some("length") => Some(StopReason::Length),
        Some("content_filter") => Some(StopReason::ContentFilter),
        Some("tool_calls") => Some(StopReason::ToolUse),
        Some(_) => Some(StopReason::Other),
        None => None,
    }
}

/// Decoder state threaded through `stream::unfold`.
struct ChunkDecoder {
    lines: SseStream,
    provider: String,
    finish: Option<StopReason>,
    /// Usage that arrived in the same chunk as a delta.
    pending: Option<StreamEvent>,
    done: bool,
}

impl ChunkDecoder {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(ev) = self.pending.take() {
            return Some(ev);
        }
        if self.done {
            return None;
        }
        loop {
            let line = match self.lines.next().await {
                Some(Ok(l)) => l,
                Some(Err(e)) => return Some(self.finish_with(StreamEvent::Error(e))),
                // EOF without [DONE]: treat as natural completion
                None => {
                    let reason = self.finish;
                    return Some(self.finish_with(StreamEvent::Stop { reason }));
                }
            };
            let Some(data) = line.strip_prefix("data:") else {
                continue; // blank separators, comments, event: lines
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                let reason = self.finish;
                return Some(self.finish_with(StreamEvent::Stop { reason }));
            }
            let chunk = match serde_json::from_str::<OAChunk>(data) {
                Ok(c) => c,
                Err(e) => {
                    let err = RelayError::ProviderError {
                        provider: self.provider.clone(),
                        code: "stream".into(),
                        message: format!("chunk decode error: {e}"),
                    };
                    return Some(self.finish_with(StreamEvent::Error(err)));
                }
            };
            if let Some(err) = chunk.error {
                let err = RelayError::ProviderError {
                    provider: self.provider.clone(),
                    code: err.kind.unwrap_or_else(|| "stream".into()),
                    message: err.message,
                };
                return Some(self.finish_with(StreamEvent::Error(err)));
            }
            let usage = chunk.usage.map(|u| StreamEvent::Usage {
                prompt: Some(u.prompt_tokens),
                completion: Some(u.completion_tokens),
            });
            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(reason) = choice.finish_reason.as_deref() {
                    self.finish = map_finish(Some(reason));
                }
                if let Some(content) = choice.delta.content
                    && !content.is_empty()
                {
                    self.pending = usage;
                    return Some(StreamEvent::DeltaText(content));
                }
            }
            if usage.is_some() {
                return usage;
            }
        }
    }

    fn finish_with(&mut self, ev: StreamEvent) -> StreamEvent {
        self.done = true;
        ev
    }
}

#[async_trait]
impl ChatProvider for OpenAI {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        let payload = OAChatReq::from_request(&req, false);
        let reply = self
            .http
            .post_json::<_, OAChatResp>(&self.url(), &payload, &self.headers(), req.request_id.as_deref())
            .await?;
        let resp = reply.body;

        let text = resp
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        let stop_reason = resp
            .choices
            .first()
            .and_then(|c| map_finish(c.finish_reason.as_deref()));
        let (usage_p, usage_c) = resp
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            model: req.model,
            text,
            usage_prompt: usage_p,
            usage_completion: usage_c,
            provider: self.name.clone(),
            stop_reason,
            provider_request_id: reply.provider_request_id.or(Some(resp.id)),
            created_at_ms: Self::now_ms(),
            latency_ms: reply.latency_ms,
        })
    }

    async fn chat_stream_events(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let payload = OAChatReq::from_request(&req, true);
        let lines = self
            .http
            .post_sse_lines(&self.url(), &payload, &self.headers(), req.request_id.as_deref())
            .await?;

        let decoder = ChunkDecoder {
            lines,
            provider: self.name.clone(),
            finish: None,
            pending: None,
            done: false,
        };
        let events = futures::stream::unfold(decoder, |mut d| async move {
            let ev = d.next_event().await?;
            Some((ev, d))
        });
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn req(content: &str) -> ChatRequest {
        ChatRequest {
            model: "gpt-3.5-turbo".into(),
            messages: vec![
                ChatMessage::system("You are a helpful assistant."),
                ChatMessage::user(content),
            ],
            temperature: None,
            max_output_tokens: None,
            request_id: Some("req-1".into()),
        }
    }

    fn sse_body(frames: &[&str]) -> String {
        frames.iter().map(|f| format!("data: {f}\n\n")).collect()
    }

    async fn collect(provider: &OpenAI, content: &str) -> Vec<StreamEvent> {
        provider
            .chat_stream_events(req(content))
            .await
            .expect("stream opens")
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn stream_yields_deltas_then_stop() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("Authorization", "Bearer test-key")
                .json_body_partial(
                    r#"{"stream":true,"messages":[
                        {"role":"system","content":"You are a helpful assistant."},
                        {"role":"user","content":"Hello"}]}"#,
                );
            then.status(200)
                .header("Content-Type", "text/event-stream")
                .body(sse_body(&[
                    r#"{"id":"c1","choices":[{"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
                    r#"{"id":"c1","choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#,
                    r#"{"id":"c1","choices":[{"delta":{"content":" there!"},"finish_reason":null}]}"#,
                    r#"{"id":"c1","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                    "[DONE]",
                ]));
        });

        let events = collect(&provider, "Hello").await;
        m.assert();
        let deltas: Vec<&str> = events.iter().filter_map(|e| e.as_text_delta()).collect();
        assert_eq!(deltas, vec!["Hi", " there!"]);
        assert_eq!(events.len(), 3);
        match events.last() {
            Some(StreamEvent::Stop { reason }) => assert_eq!(*reason, Some(StopReason::Stop)),
            other => panic!("expected Stop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_surfaces_usage_chunk() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(sse_body(&[
                r#"{"choices":[{"delta":{"content":"ok"},"finish_reason":"length"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":1}}"#,
                "[DONE]",
            ]));
        });

        let events = collect(&provider, "Hi").await;
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[1],
            StreamEvent::Usage { prompt: Some(7), completion: Some(1) }
        ));
        assert!(matches!(
            events[2],
            StreamEvent::Stop { reason: Some(StopReason::Length) }
        ));
    }

    #[tokio::test]
    async fn usage_sharing_a_chunk_with_a_delta_is_kept() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(sse_body(&[
                r#"{"choices":[{"delta":{"content":"end"},"finish_reason":"stop"}],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#,
                "[DONE]",
            ]));
        });

        let events = collect(&provider, "Hi").await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_text_delta(), Some("end"));
        assert!(matches!(
            events[1],
            StreamEvent::Usage { prompt: Some(4), completion: Some(2) }
        ));
        assert!(matches!(
            events[2],
            StreamEvent::Stop { reason: Some(StopReason::Stop) }
        ));
    }

    #[tokio::test]
    async fn stream_in_band_error_terminates() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(sse_body(&[
                r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
                r#"{"error":{"message":"overloaded","type":"server_error"}}"#,
                r#"{"choices":[{"delta":{"content":"never"}}]}"#,
            ]));
        });

        let events = collect(&provider, "Hi").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_text_delta(), Some("Hi"));
        match &events[1] {
            StreamEvent::Error(RelayError::ProviderError { code, message, .. }) => {
                assert_eq!(code, "server_error");
                assert_eq!(message, "overloaded");
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_malformed_chunk_is_error_event() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(sse_body(&["not-json"]));
        });

        let events = collect(&provider, "Hi").await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error(RelayError::ProviderError { message, .. }) => {
                assert!(message.starts_with("chunk decode error"))
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_eof_without_done_is_natural_stop() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .body(sse_body(&[r#"{"choices":[{"delta":{"content":"a"}}]}"#]));
        });

        let events = collect(&provider, "Hi").await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Stop { reason: None }));
    }

    #[tokio::test]
    async fn stream_401_is_rejected_before_streaming() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401).body("bad key");
        });

        let err = match provider.chat_stream_events(req("Hi")).await {
            Ok(_) => panic!("expected rejection"),
            Err(e) => e,
        };
        match err {
            RelayError::ProviderError { code, .. } => assert_eq!(code, "401"),
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_network_error_maps_to_unavailable() {
        let provider = OpenAI::new_for_tests("http://127.0.0.1:9");
        let res = provider.chat_stream_events(req("Hi")).await;
        assert!(matches!(res, Err(RelayError::ProviderUnavailable { .. })));
    }

    #[tokio::test]
    async fn chat_200_maps_fields() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .json_body_partial(r#"{"stream":false}"#);
            then.status(200).json_body(json!({
                "id": "cmpl_123",
                "choices": [{
                    "message": {"role":"assistant", "content":"Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5}
            }));
        });

        let resp = provider.chat(req("Hi")).await.expect("chat ok");
        assert_eq!(resp.text, "Hello!");
        assert_eq!(resp.stop_reason, Some(StopReason::Stop));
        assert_eq!(resp.usage_prompt, 10);
        assert_eq!(resp.usage_completion, 5);
        assert_eq!(resp.provider, "openai");
        assert_eq!(resp.provider_request_id, Some("cmpl_123".into()));
    }

    #[test]
    fn chat_finish_reason_matrix() {
        assert_eq!(map_finish(Some("stop")), Some(StopReason::Stop));
        assert_eq!(map_finish(Some("length")), Some(StopReason::Length));
        assert_eq!(map_finish(Some("content_filter")), Some(StopReason::ContentFilter));
        assert_eq!(map_finish(Some("tool_calls")), Some(StopReason::ToolUse));
        assert_eq!(map_finish(Some("weird_reason")), Some(StopReason::Other));
        assert_eq!(map_finish(None), None);
    }

    #[tokio::test]
    async fn chat_503_maps_to_provider_unavailable() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("down");
        });
        let err = provider.chat(req("Hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::ProviderUnavailable { .. }));
    }
}
