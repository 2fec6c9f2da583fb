//! Server-Sent-Events Framing
//!
//! Incremental parser over a byte stream. Chunks may split anywhere,
//! including between a CR and its LF; partial frames stay buffered until
//! the terminating blank line arrives. Only `event:` and `data:` fields are
//! retained; comment lines and unknown fields are skipped per the SSE
//! grammar.

/// One complete event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field; empty when the frame had none.
    pub event: String,
    /// Joined `data:` lines (newline-separated when repeated).
    pub data: String,
}

/// Incremental SSE frame parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        // consume complete lines; the tail (no LF yet) stays buffered
        while let Some(lf) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=lf).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.consume_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Pending bytes of an unterminated line or frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn consume_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        if line.is_empty() {
            // blank line terminates the frame
            if self.event.is_empty() && self.data.is_empty() {
                return None;
            }
            let event = SseEvent {
                event: std::mem::take(&mut self.event),
                data: std::mem::take(&mut self.data).join("\n"),
            };
            return Some(event);
        }
        if line[0] == b':' {
            return None; // comment
        }

        let text = String::from_utf8_lossy(line);
        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (text.as_ref(), ""),
        };
        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}
