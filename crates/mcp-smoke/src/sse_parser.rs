/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn is(&self, name: &str) -> bool {
        self.event == name
    }
}

/// Incremental `text/event-stream` parser fed with raw byte chunks
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
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
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.id.clone(),
        })
    }
}

/// Parse a complete event-stream body
pub fn parse_all(body: &[u8]) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.feed(body);
    events.extend(parser.finish());
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_and_message_events() {
        let body = b"event: endpoint\ndata: /message?sessionId=abc\n\n\
                     event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        let events = parse_all(body);
        assert_eq!(events.len(), 2);
        assert!(events[0].is("endpoint"));
        assert_eq!(events[0].data, "/message?sessionId=abc");
        assert!(events[1].is("message"));
        assert!(events[1].data.contains("\"id\":1"));
    }

    #[test]
    fn test_chunks_split_anywhere() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"eve").is_empty());
        assert!(parser.feed(b"nt: ping\r\nda").is_empty());
        let events = parser.feed(b"ta: a\r\ndata: b\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "ping".to_string(),
                data: "a\nb".to_string(),
                id: None,
            }]
        );
    }

    #[test]
    fn test_comments_and_default_event_name() {
        let events = parse_all(b": keep-alive\n\nid: 7\ndata: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_trailing_event_without_blank_line() {
        let events = parse_all(b"data: {\"id\":2}");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"id\":2}");
    }
}
