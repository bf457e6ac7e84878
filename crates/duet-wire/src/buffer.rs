use anyhow::Result;
use std::collections::VecDeque;

/// Splits a chunked byte feed into complete lines. Transport chunks land
/// anywhere, so bytes that have not yet seen their `\n` stay queued until
/// the next chunk arrives.
pub struct LineBuffer {
    pending: VecDeque<u8>,
}

impl LineBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }

    /// Next complete line with the terminator removed: one `\n` plus at
    /// most one `\r` before it. Everything else in the line, whitespace
    /// included, is content. None until a newline has been buffered.
    pub fn next_line(&mut self) -> Option<Result<String>> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;

        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        Some(String::from_utf8(line).map_err(|e| anyhow::anyhow!("invalid UTF-8 in stream: {}", e)))
    }
}
