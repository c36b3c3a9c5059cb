//! Wire framing for streamed provider responses.
//!
//! Handles both SSE (`data: {...}` lines, blank-line separated) and NDJSON
//! (one JSON object per line); adapters receive whole frames and never see
//! transport chunking.

/// Reassembles frames from arbitrarily split byte chunks.
pub struct FrameBuffer {
    pending: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            pending: String::new(),
        }
    }

    /// Feeds bytes; returns every complete frame they finish. A frame is one
    /// non-empty line, with any `data: ` SSE prefix stripped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        let mut frames = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue; // keep-alive or event separator
            }
            if let Some(event) = line.strip_prefix("event:") {
                // Event names ride along with the next data line; adapters
                // that need them get the composed "event/data" frame.
                frames.push(format!("event:{}", event.trim()));
                continue;
            }
            let frame = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
            frames.push(frame.to_string());
        }
        frames
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The OpenAI-style terminal sentinel.
pub const DONE_SENTINEL: &str = "[DONE]";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_frames_across_chunk_boundaries() {
        let mut buffer = FrameBuffer::new();
        let mut frames = buffer.push(b"data: {\"a\":");
        assert!(frames.is_empty());
        frames.extend(buffer.push(b"1}\n\ndata: [DONE]\n"));
        assert_eq!(frames, vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn ndjson_lines_pass_through() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(b"{\"done\":false}\n{\"done\":true}\n");
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn comments_and_blank_lines_are_dropped() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(b": keep-alive\n\ndata: x\n");
        assert_eq!(frames, vec!["x"]);
    }
}
