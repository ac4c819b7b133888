use std::{fmt, path::Path, sync::Arc};

/// Used when no instruction file is configured or it cannot be read.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant.";

/// Process-wide system prompt, loaded once at startup and shared read-only.
///
/// Cloning is cheap; there is no way to change the text after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct SystemInstruction(Arc<str>);

impl SystemInstruction {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    /// Read the instruction from `path`, falling back to
    /// [`DEFAULT_SYSTEM_INSTRUCTION`] when the path is absent, unreadable or blank.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(path) {
            Ok(text) if !text.trim().is_empty() => {
                tracing::info!(path = %path.display(), "loaded system instruction");
                Self::new(text.trim())
            }
            Ok(_) => {
                tracing::warn!(path = %path.display(), "system instruction file is empty; using default");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "system instruction unavailable; using default");
                Self::default()
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SystemInstruction {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_INSTRUCTION)
    }
}

impl fmt::Debug for SystemInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SystemInstruction")
            .field(&self.0.len())
            .finish()
    }
}
