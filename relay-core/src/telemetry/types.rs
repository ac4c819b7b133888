use serde::{Deserialize, Serialize};

/// How a relayed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayOutcome {
    /// Upstream finished and the `done` frame was written.
    Done,
    /// Upstream failed mid-stream; an `error` frame was written.
    Error,
    /// Upstream failed before streaming; a single-shot 5xx was returned.
    Rejected,
    /// The client went away before a terminal frame was written.
    Disconnected,
}

/// Structured, provider-agnostic record of one relayed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayLog {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub outcome: RelayOutcome,

    /// `content` frames written.
    pub deltas: u32,
    /// Characters relayed across all `content` frames.
    pub chars: u64,

    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub stop_reason: Option<String>,

    pub latency_ms: Option<u64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl RelayLog {
    pub fn new(
        request_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        outcome: RelayOutcome,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            provider: provider.into(),
            model: model.into(),
            outcome,
            deltas: 0,
            chars: 0,
            tokens_prompt: None,
            tokens_completion: None,
            stop_reason: None,
            latency_ms: None,
            error_kind: None,
            error_message: None,
        }
    }

    pub fn deltas(mut self, deltas: u32, chars: u64) -> Self {
        self.deltas = deltas;
        self.chars = chars;
        self
    }
    pub fn tokens(mut self, prompt: Option<u32>, completion: Option<u32>) -> Self {
        self.tokens_prompt = prompt;
        self.tokens_completion = completion;
        self
    }
    pub fn stop_reason_opt(mut self, v: Option<&str>) -> Self {
        self.stop_reason = v.map(|s| s.to_string());
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
}
