/// Handle to one transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Bot,
}

/// The visible conversation a [`ChatClient`](super::ChatClient) drives.
pub trait Transcript {
    fn push_user(&mut self, text: &str) -> EntryId;

    /// Append a bot entry showing the working indicator.
    fn push_bot_placeholder(&mut self) -> EntryId;

    /// Replace the entry's content with `full_text`. Rendering the same text
    /// twice leaves the entry unchanged.
    fn render(&mut self, entry: EntryId, full_text: &str);

    /// Replace the entry's content with a failure message.
    fn fail(&mut self, entry: EntryId, message: &str);

    fn scroll_to_end(&mut self) {}
}

/// Escape markup-significant characters and turn line breaks into `<br>`.
pub fn render_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' => out.push_str("<br>"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub speaker: Speaker,
    pub markup: String,
}

/// In-memory transcript holding each entry as rendered markup.
#[derive(Debug, Default)]
pub struct MarkupTranscript {
    entries: Vec<Entry>,
    scrolls: usize,
}

impl MarkupTranscript {
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn markup(&self, entry: EntryId) -> Option<&str> {
        self.entries.get(entry.0).map(|e| e.markup.as_str())
    }

    pub fn scrolls(&self) -> usize {
        self.scrolls
    }

    fn push(&mut self, speaker: Speaker, markup: String) -> EntryId {
        self.entries.push(Entry { speaker, markup });
        EntryId(self.entries.len() - 1)
    }

    fn set(&mut self, entry: EntryId, markup: String) {
        if let Some(e) = self.entries.get_mut(entry.0) {
            e.markup = markup;
        }
    }
}

impl Transcript for MarkupTranscript {
    fn push_user(&mut self, text: &str) -> EntryId {
        self.push(Speaker::User, render_markup(text))
    }

    fn push_bot_placeholder(&mut self) -> EntryId {
        self.push(Speaker::Bot, super::TYPING_PLACEHOLDER.to_string())
    }

    fn render(&mut self, entry: EntryId, full_text: &str) {
        self.set(entry, render_markup(full_text));
    }

    fn fail(&mut self, entry: EntryId, message: &str) {
        self.set(entry, render_markup(message));
    }

    fn scroll_to_end(&mut self) {
        self.scrolls += 1;
    }
}
