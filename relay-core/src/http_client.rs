//! Outbound HTTP to the upstream model API.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::Stream;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};

/// Upstream error bodies are clipped to this many bytes before logging.
const ERROR_BODY_LIMIT: usize = 300;

/// Headers upstreams use to echo their own request id.
const REQUEST_ID_HEADERS: [&str; 3] = ["x-request-id", "request-id", "openai-request-id"];

/// Lines of an event-stream body, terminators stripped.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<String>> + Send>>;

/// Decoded JSON reply plus what the transport learned about it.
#[derive(Debug)]
pub struct JsonReply<R> {
    pub body: R,
    pub provider_request_id: Option<String>,
    pub latency_ms: u32,
}

/// reqwest client configured from [`HttpCfg`].
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(ms) = cfg.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("chat-relay/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST `body` as JSON and decode a JSON reply.
    pub async fn post_json<T, R>(
        &self,
        url: &str,
        body: &T,
        headers: &[(String, String)],
        request_id: Option<&str>,
    ) -> CoreResult<JsonReply<R>>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let started = Instant::now();
        let resp = self
            .send(self.request(url, body, headers, request_id))
            .await?;
        let provider_request_id = upstream_request_id(resp.headers());
        let status = resp.status();
        let body = resp.json::<R>().await.map_err(|e| RelayError::ProviderError {
            provider: "http".into(),
            code: status.as_u16().to_string(),
            message: format!("json decode error: {e}"),
        })?;
        Ok(JsonReply {
            body,
            provider_request_id,
            latency_ms: started.elapsed().as_millis() as u32,
        })
    }

    /// POST `body` as JSON and stream the event-stream reply line by line.
    ///
    /// Connect failures and non-2xx statuses come back as `Err` before any
    /// line is produced.
    pub async fn post_sse_lines<T>(
        &self,
        url: &str,
        body: &T,
        headers: &[(String, String)],
        request_id: Option<&str>,
    ) -> CoreResult<SseStream>
    where
        T: Serialize + ?Sized,
    {
        let req = self
            .request(url, body, headers, request_id)
            .header("Accept", "text/event-stream");
        let resp = self.send(req).await?;
        Ok(Box::pin(LineStream::new(Box::pin(resp.bytes_stream()))))
    }

    fn request<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(String, String)],
        request_id: Option<&str>,
    ) -> RequestBuilder {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(rid) = request_id {
            req = req.header("X-Request-Id", rid);
        }
        req
    }

    /// Send and turn transport failures and error statuses into `RelayError`.
    async fn send(&self, req: RequestBuilder) -> CoreResult<Response> {
        let resp = req.send().await.map_err(|e| {
            tracing::debug!(error = %e, "upstream request failed to send");
            RelayError::ProviderUnavailable {
                provider: "http".into(),
            }
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = retry_after_secs(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(%status, body = %clip(&body, ERROR_BODY_LIMIT), "upstream refused request");
        Err(status_error(status, retry_after, &body))
    }
}

fn upstream_request_id(headers: &HeaderMap) -> Option<String> {
    REQUEST_ID_HEADERS
        .iter()
        .find_map(|k| headers.get(*k)?.to_str().ok())
        .map(str::to_string)
}

/// Only the delay-seconds form of `Retry-After`; HTTP dates are ignored.
fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn status_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> RelayError {
    let provider = "http".to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        RelayError::RateLimited {
            provider,
            retry_after,
        }
    } else if status.is_server_error() {
        RelayError::ProviderUnavailable { provider }
    } else {
        RelayError::ProviderError {
            provider,
            code: status.as_u16().to_string(),
            message: clip(body, ERROR_BODY_LIMIT),
        }
    }
}

/// Cut `s` to at most `max` bytes on a char boundary, marking the cut.
fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0);
    format!("{}...", &s[..cut])
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Splits a byte stream on `\n`.
///
/// Splitting happens on raw bytes so a code point cut across two network
/// chunks is only decoded once the whole line is buffered.
struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    ended: bool,
}

impl LineStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            ended: false,
        }
    }

    fn take_line(&mut self, end: usize) -> String {
        let mut raw: Vec<u8> = self.buf.drain(..end).collect();
        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        String::from_utf8(raw).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }
}

impl Stream for LineStream {
    type Item = CoreResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
                return Poll::Ready(Some(Ok(self.take_line(idx + 1))));
            }
            if self.ended {
                return Poll::Ready(None);
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    tracing::debug!(error = %e, "upstream body read failed");
                    self.ended = true;
                    return Poll::Ready(Some(Err(RelayError::ProviderUnavailable {
                        provider: "http".into(),
                    })));
                }
                Poll::Ready(None) => {
                    self.ended = true;
                    if !self.buf.is_empty() {
                        let len = self.buf.len();
                        return Poll::Ready(Some(Ok(self.take_line(len))));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
