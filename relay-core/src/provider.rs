use async_trait::async_trait;
use futures::StreamExt;

use crate::error::CoreResult;
use crate::model::{ChatRequest, ChatResponse, StopReason};
use crate::stream::{BoxStreamEv, StreamEvent};

/// The upstream text-generation capability.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse>;

    /// Open a token stream.
    ///
    /// An `Err` here means the provider rejected the request before producing
    /// anything. Failures after that are reported in-band as
    /// [`StreamEvent::Error`].
    async fn chat_stream_events(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        // default: call chat once and surface it as a single Final event
        let single = self.chat(req).await?;
        Ok(futures::stream::iter([StreamEvent::Final(single)]).boxed())
    }
}

/// Offline provider that answers every request with a canned completion.
/// Lets the relay run end to end without credentials.
pub struct NullProvider;

pub const NULL_RESPONSE: &str = "[null provider response]";

#[async_trait]
impl ChatProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        Ok(ChatResponse {
            model: req.model,
            text: NULL_RESPONSE.into(),
            usage_prompt: req.messages.iter().map(|m| m.content.len() as u32).sum(),
            usage_completion: 0,
            provider: "null".into(),
            stop_reason: Some(StopReason::Stop),
            provider_request_id: None,
            created_at_ms: 0,
            latency_ms: 0,
        })
    }
}
