//! Client side of the relay protocol.
//!
//! [`ChatClient::send_message`] posts one message, reads the event stream as
//! it arrives and keeps a [`Transcript`] up to date.

mod decode;
mod transcript;

pub use decode::{FrameDecoder, Utf8Decoder};
pub use transcript::{Entry, EntryId, MarkupTranscript, Speaker, Transcript, render_markup};

use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{CoreResult, RelayError};
use crate::model::ChatPayload;
use crate::wire::{self, StreamEvent};

/// Shown in the bot entry until the first delta arrives.
pub const TYPING_PLACEHOLDER: &str = "Typing...";
/// Shown in place of the reply whenever the exchange fails.
pub const FAILURE_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

/// How a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// `done` frame received.
    Done,
    /// `error` frame received.
    Failed,
    /// Body ended without a terminal frame.
    Eof,
    /// Reading the body failed.
    Transport,
}

pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ChatClient {
    /// Client for the relay at `server` (e.g. `http://localhost:3000`).
    pub fn new(server: &str) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/chat", server.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `text` and stream the reply into `transcript`.
    ///
    /// Blank input is ignored. Every failure ends up as [`FAILURE_MESSAGE`]
    /// in the bot entry rather than as an error to the caller.
    pub async fn send_message<T>(&self, text: &str, transcript: &mut T)
    where
        T: Transcript + ?Sized,
    {
        let message = text.trim();
        if message.is_empty() {
            debug!("blank message ignored");
            return;
        }

        transcript.push_user(message);
        let entry = transcript.push_bot_placeholder();
        transcript.scroll_to_end();

        let payload = ChatPayload {
            message: Some(message.to_string()),
        };
        let resp = match self.http.post(&self.endpoint).json(&payload).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "relay refused message");
                transcript.fail(entry, FAILURE_MESSAGE);
                return;
            }
            Err(e) => {
                warn!(error = %e, endpoint = %self.endpoint, "relay unreachable");
                transcript.fail(entry, FAILURE_MESSAGE);
                return;
            }
        };

        let end = consume(resp.bytes_stream(), transcript, entry).await;
        debug!(?end, "reply finished");
    }
}

/// Drive one bot entry from a raw event-stream body.
///
/// An `error` frame replaces whatever was rendered so far with
/// [`FAILURE_MESSAGE`]. A failed read only does so when nothing has been
/// rendered yet; otherwise the partial reply stays.
pub async fn consume<S, E, T>(body: S, transcript: &mut T, entry: EntryId) -> StreamEnd
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
    T: Transcript + ?Sized,
{
    futures::pin_mut!(body);
    let mut frames = FrameDecoder::default();
    let mut reply = Reply {
        transcript,
        entry,
        text: String::new(),
    };

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, received = reply.text.len(), "stream read failed");
                if reply.text.is_empty() {
                    reply.transcript.fail(entry, FAILURE_MESSAGE);
                }
                return StreamEnd::Transport;
            }
        };
        for frame in frames.push(&chunk) {
            if let Some(end) = reply.apply(&frame) {
                return end;
            }
        }
    }

    if let Some(tail) = frames.finish() {
        if let Some(end) = reply.apply(&tail) {
            return end;
        }
    }
    warn!(received = reply.text.len(), "stream ended without a terminal frame");
    if reply.text.is_empty() {
        reply.transcript.fail(entry, FAILURE_MESSAGE);
    }
    StreamEnd::Eof
}

struct Reply<'a, T: ?Sized> {
    transcript: &'a mut T,
    entry: EntryId,
    text: String,
}

impl<T: Transcript + ?Sized> Reply<'_, T> {
    fn apply(&mut self, frame: &str) -> Option<StreamEnd> {
        let event = match wire::parse_frame(frame) {
            Ok(Some(ev)) => ev,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "skipping malformed frame");
                return None;
            }
        };
        match event {
            StreamEvent::Content { content } => {
                if !content.is_empty() {
                    self.text.push_str(&content);
                    self.transcript.render(self.entry, &self.text);
                    self.transcript.scroll_to_end();
                }
                None
            }
            StreamEvent::Error { error } => {
                warn!(error = %error, "relay reported failure");
                self.transcript.fail(self.entry, FAILURE_MESSAGE);
                Some(StreamEnd::Failed)
            }
            StreamEvent::Done { done: true } => {
                if self.text.is_empty() {
                    // empty completion: drop the indicator
                    self.transcript.render(self.entry, "");
                }
                Some(StreamEnd::Done)
            }
            StreamEvent::Done { done: false } => None,
        }
    }
}
