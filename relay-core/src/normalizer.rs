use unicode_normalization::UnicodeNormalization;

/// Unicode NFC normalization + BOM strip + CRLF -> LF + trim.
pub fn clean_text(s: &str) -> String {
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Clean an inbound chat message. `None` when nothing is left to send.
pub fn normalize_message(raw: Option<&str>) -> Option<String> {
    let cleaned = clean_text(raw?);
    if cleaned.is_empty() { None } else { Some(cleaned) }
}
