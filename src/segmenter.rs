//! Splits a streaming token sequence into sentences as soon as they complete.
//!
//! A sentence ends at a run of `。！？.!?`. A run touching the end of the buffer is
//! held back, since the next chunk may extend it. Decimals and abbreviations are
//! not special-cased: `3.14` splits after `3.`.

fn is_terminator(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '.' | '!' | '?')
}

#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    /// Byte offset up to which `buffer` has been scanned.
    scanned: usize,
    /// Whether the scanned prefix ends inside a terminator run.
    in_run: bool,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every sentence it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let start = self.scanned;
        self.buffer.push_str(chunk);
        let mut sentences = Vec::new();
        let mut cut = 0;
        for (offset, c) in self.buffer[start..].char_indices() {
            if is_terminator(c) {
                self.in_run = true;
            } else if self.in_run {
                let idx = start + offset;
                sentences.push(self.buffer[cut..idx].to_string());
                cut = idx;
                self.in_run = false;
            }
        }
        self.buffer.drain(..cut);
        self.scanned = self.buffer.len();
        sentences
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        self.in_run = false;
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    pub fn remaining(&self) -> &str {
        &self.buffer
    }
}

/// True when `text` has something worth synthesizing.
pub fn is_speakable(text: &str) -> bool {
    text.chars().any(|c| c.is_alphanumeric())
}
