//! Server-Sent Events wire parsing
//!
//! Incremental parser for `text/event-stream` bodies. Chunks may split
//! lines and multibyte characters anywhere; complete events are returned as
//! soon as their terminating blank line arrives.

use std::time::Duration;

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    /// Event type; `None` means the default `message`
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<Duration>,
}

impl SseEvent {
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental `text/event-stream` parser
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    retry: Option<Duration>,
    last_event_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and collect every event completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let line = String::from_utf8_lossy(&raw);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush a trailing event that was not followed by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    /// Id of the most recently dispatched event that carried one
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
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
            "id" => {
                // ids containing NUL are ignored
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                }
            }
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let id = self.id.take();
        let event = self.event.take();
        let retry = self.retry.take();

        if let Some(id) = &id {
            self.last_event_id = Some(id.clone());
        }

        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();

        Some(SseEvent {
            id,
            event,
            data,
            retry,
        })
    }
}

/// Parse a complete SSE body in one go
pub fn parse_body(body: &[u8]) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.feed(body);
    events.extend(parser.finish());
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let events = parse_body(
            b"id: 4\nevent: message\nretry: 1500\ndata: {\"jsonrpc\":\"2.0\"}\n\n",
        );
        assert_eq!(
            events,
            vec![SseEvent {
                id: Some("4".into()),
                event: Some("message".into()),
                data: r#"{"jsonrpc":"2.0"}"#.into(),
                retry: Some(Duration::from_millis(1500)),
            }]
        );
    }

    #[test]
    fn test_chunk_boundaries_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"id: 1\r\nda").is_empty());
        assert!(parser.feed(b"ta: a\r\n").is_empty());
        let events = parser.feed(b"data: b\r\n\r\n: keep-alive\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(parser.last_event_id(), Some("1"));
    }

    #[test]
    fn test_multibyte_split() {
        let body = "data: héllo\n\n".as_bytes();
        let mut parser = SseParser::new();
        assert!(parser.feed(&body[..8]).is_empty());
        let events = parser.feed(&body[8..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_endpoint_event_and_default_type() {
        let events = parse_body(b"event: endpoint\ndata: /messages?sessionId=abc\n\ndata: x\n\n");
        assert_eq!(events[0].event_type(), "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=abc");
        assert_eq!(events[1].event_type(), "message");
    }

    #[test]
    fn test_id_only_event_updates_last_id() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"id: 9\n\n").is_empty());
        assert_eq!(parser.last_event_id(), Some("9"));
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
    }
}
