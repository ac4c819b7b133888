use crate::wire::FRAME_SEPARATOR;

/// Incremental UTF-8 decoding: a code point split across two reads is held
/// back until its remaining bytes arrive.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much of `pending + chunk` as is complete. Invalid sequences
    /// become U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // incomplete tail, wait for more bytes
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// End of input: a dangling partial code point becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Splits a byte stream into frames on the blank-line separator.
///
/// Frames may arrive split across reads or several to a read; only complete
/// frames are returned from [`push`](Self::push).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    utf8: Utf8Decoder,
    buf: String,
}

impl FrameDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = self.utf8.decode(chunk);
        self.buf.push_str(&text);
        let mut frames = Vec::new();
        while let Some(idx) = self.buf.find(FRAME_SEPARATOR) {
            let mut frame: String = self.buf.drain(..idx + FRAME_SEPARATOR.len()).collect();
            frame.truncate(idx);
            frames.push(frame);
        }
        frames
    }

    /// Whatever is left once the stream ends, if it is more than whitespace.
    pub fn finish(&mut self) -> Option<String> {
        let tail = self.utf8.finish();
        self.buf.push_str(&tail);
        let rest = std::mem::take(&mut self.buf);
        (!rest.trim().is_empty()).then_some(rest)
    }
}
