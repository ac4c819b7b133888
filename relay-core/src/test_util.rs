//! Test doubles shared across modules.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::{CoreResult, RelayError};
use crate::model::{ChatRequest, ChatResponse};
use crate::provider::ChatProvider;
use crate::stream::{BoxStreamEv, StreamEvent};

type Script = Box<dyn Fn() -> CoreResult<Vec<StreamEvent>> + Send + Sync>;

/// Provider that replays a fixed script and records how it was used.
pub struct ScriptedProvider {
    script: Script,
    hang: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
    dropped: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn() -> CoreResult<Vec<StreamEvent>> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            hang: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emits each part as a delta, then `Stop`.
    pub fn deltas(parts: &[&str]) -> Self {
        let parts: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        Self::new(move || {
            let mut evs: Vec<StreamEvent> =
                parts.iter().cloned().map(StreamEvent::DeltaText).collect();
            evs.push(StreamEvent::Stop { reason: None });
            Ok(evs)
        })
    }

    /// Emits the parts, then never yields again.
    pub fn hanging_after(parts: &[&str]) -> Self {
        let parts: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        let mut p = Self::new(move || Ok(parts.iter().cloned().map(StreamEvent::DeltaText).collect()));
        p.hang = true;
        p
    }

    /// Refuses to open a stream at all.
    pub fn rejecting() -> Self {
        Self::new(|| {
            Err(RelayError::ProviderUnavailable {
                provider: "scripted".into(),
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// True once the last stream handed out has been dropped.
    pub fn stream_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, _req: ChatRequest) -> CoreResult<ChatResponse> {
        Err(RelayError::Validation("scripted provider only streams".into()))
    }

    async fn chat_stream_events(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req);
        let events = (self.script)()?;

        self.dropped.store(false, Ordering::SeqCst);
        let guard = DropFlag(self.dropped.clone());
        let base: BoxStreamEv = if self.hang {
            futures::stream::iter(events)
                .chain(futures::stream::pending())
                .boxed()
        } else {
            futures::stream::iter(events).boxed()
        };
        Ok(base
            .map(move |ev| {
                let _keep = &guard;
                ev
            })
            .boxed())
    }
}
