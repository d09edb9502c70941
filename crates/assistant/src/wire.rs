//! Request/response shapes of the chat backend and incremental body decoders.

use serde::{Deserialize, Serialize};

/// Shown when the backend answers with JSON that carries no reply text.
pub const UNPROCESSED_REPLY: &str = "Sorry, I couldn't process your request.";

const SSE_DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ChatResponse {
    pub fn reply_text(&self) -> &str {
        match self.response.as_deref() {
            Some(text) if !text.trim().is_empty() => text,
            _ => UNPROCESSED_REPLY,
        }
    }
}

/// How a successful reply body is framed, decided from `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyFormat {
    Json,
    EventStream,
    PlainText,
}

impl ReplyFormat {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return Self::PlainText;
        };

        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "application/json" => Self::Json,
            "text/event-stream" => Self::EventStream,
            _ => Self::PlainText,
        }
    }
}

/// Decodes UTF-8 across arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match error.error_len() {
                        Some(invalid_len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid_len);
                        }
                        // Incomplete sequence at the tail: keep it for the next chunk.
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }

        text
    }

    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseEvent {
    Data(String),
    Done,
    Error(String),
}

/// Minimal server-sent-events framing: `event:` and `data:` fields, blank line dispatch.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    text: Utf8Decoder,
    buffer: String,
    event_name: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let decoded = self.text.push(chunk);
        self.buffer.push_str(&decoded);

        let mut events = Vec::new();
        while let Some(position) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=position).collect();
            if let Some(event) = self.process_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = self.text.finish();
        self.buffer.push_str(&rest);
        let remaining = std::mem::take(&mut self.buffer);

        let mut events = Vec::new();
        for line in remaining.lines() {
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        if let Some(event) = self.dispatch() {
            events.push(event);
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event_name = self.event_name.take();
        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        match event_name.as_deref() {
            Some("error") => Some(SseEvent::Error(data)),
            _ if data.trim() == SSE_DONE_MARKER => Some(SseEvent::Done),
            _ => Some(SseEvent::Data(data)),
        }
    }
}
