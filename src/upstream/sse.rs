//! Server-sent-event decoder for the upstream streaming protocol.
//!
//! The upstream emits `data: {...}` lines carrying delta-content frames and a
//! terminating `data: [DONE]`. [`SseDecoder`] handles line buffering across
//! TCP chunk boundaries, keep-alive blank lines, and extracts the content
//! deltas directly.

use serde_json::Value;

/// Incremental decoder turning raw response bytes into content deltas.
///
/// # Example
///
/// ```
/// use quorum::upstream::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// let chunk = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";
/// let deltas = decoder.push(chunk);
/// assert_eq!(deltas, vec!["Hi".to_string()]);
/// assert!(decoder.is_done());
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    done: bool,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` terminator has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes; returns the content deltas completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(delta) = self.decode_line(line.trim()) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush whatever remains in the buffer after the stream ends.
    pub fn finish(&mut self) -> Vec<String> {
        let remaining = std::mem::take(&mut self.buffer);
        remaining
            .lines()
            .filter_map(|line| self.decode_line(line.trim()))
            .collect()
    }

    fn decode_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() || line.starts_with("event:") || line.starts_with(':') {
            return None;
        }
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();
        if data == "[DONE]" {
            self.done = true;
            return None;
        }
        let value: Value = serde_json::from_str(data).ok()?;
        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())?;
        if content.is_empty() {
            None
        } else {
            Some(content.to_string())
        }
    }
}
