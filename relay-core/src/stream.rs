//! Upstream streaming primitives.
//!
//! Contract:
//! - Providers may emit 0..n `DeltaText` events, interleaved with optional `Usage` updates.
//! - The stream **must** terminate with exactly one terminal event: `Stop`, `Final`, or `Error`.
//! - After a terminal event, no further events are emitted.
//!
//! These are the events a provider yields to the relay; the frames the relay
//! writes to clients live in [`crate::wire`].

/// What the relay receives incrementally from a provider.
#[non_exhaustive]
#[derive(Debug)]
pub enum StreamEvent {
    /// Partial assistant text (delta). Empty string is allowed but should be rare.
    DeltaText(String),
    /// Optional token usage updates mid-stream.
    Usage {
        prompt: Option<u32>,
        completion: Option<u32>,
    },
    /// Provider has decided to stop (with reason).
    Stop {
        reason: Option<crate::model::StopReason>,
    },
    /// Whole response from a provider that does not stream natively.
    Final(crate::model::ChatResponse),
    /// Transport/parse error surfaced mid-stream; stream ends after this.
    Error(crate::error::RelayError),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Stop`, `Final`, or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Final(_) | Self::Error(_))
    }

    /// Convenience accessor for `DeltaText` contents.
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::DeltaText(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Boxed stream of streaming events. Providers that support streaming return this.
pub type BoxStreamEv = futures::stream::BoxStream<'static, StreamEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_work() {
        let d = StreamEvent::DeltaText("hi".into());
        assert!(!d.is_terminal());
        assert_eq!(d.as_text_delta(), Some("hi"));

        let s = StreamEvent::Stop { reason: None };
        assert!(s.is_terminal());
        assert_eq!(s.as_text_delta(), None);

        let u = StreamEvent::Usage { prompt: Some(1), completion: None };
        assert!(!u.is_terminal());

        let e = StreamEvent::Error(crate::error::RelayError::Transport("gone".into()));
        assert!(e.is_terminal());
    }
}
