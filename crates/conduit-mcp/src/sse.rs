//! Server-Sent Events (SSE) framing.
//!
//! Incremental, line-oriented parser: feed it arbitrary chunks and it yields
//! each event once the blank line that terminates it has arrived.

/// A single SSE event parsed from the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Longest line the parser buffers before discarding it.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Incremental SSE parser that processes text into events.
#[derive(Debug)]
pub struct SseParser {
    buffer: String,
    partial_utf8: Vec<u8>,
    event_type: Option<String>,
    id: Option<String>,
    data_lines: Vec<String>,
    max_line: usize,
    /// Dropping the rest of an over-long line until its newline.
    discarding: bool,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: String::new(),
            partial_utf8: Vec::new(),
            event_type: None,
            id: None,
            data_lines: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Feed raw bytes. A multi-byte character split across chunks is held
    /// back until the rest of it arrives.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial_utf8.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.partial_utf8) {
            Ok(_) => self.partial_utf8.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.partial_utf8).into_owned();
                self.partial_utf8.clear();
                return self.feed(&text);
            }
        };
        let bytes: Vec<u8> = self.partial_utf8.drain(..valid_up_to).collect();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.feed(&text)
    }

    /// Feed a chunk of text and return any complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        if self.discarding {
            self.buffer.clear();
        } else if self.buffer.len() > self.max_line {
            tracing::warn!("Discarding SSE line longer than {} bytes", self.max_line);
            // The event the line belonged to is incomplete now
            self.event_type = None;
            self.id = None;
            self.data_lines.clear();
            self.buffer.clear();
            self.discarding = true;
        }

        events
    }

    /// Flush whatever is buffered when the stream ends without a trailing
    /// blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if std::mem::take(&mut self.discarding) {
            self.buffer.clear();
        }
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.take_event()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        let event_type = self.event_type.take();
        let id = self.id.take();
        if self.data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event_type,
            id,
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}
