use crate::api::Usage;

/// Events emitted while a streaming response is in flight.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The provider assigned this call its response id. Emitted once, early.
    ResponseId { id: String },

    /// Incremental reply text, in provider order.
    TextDelta { text: String },

    /// Stream completed. `usage` is what the final event reported; empty if
    /// the provider never sent accounting.
    Done {
        response_id: Option<String>,
        usage: Usage,
    },

    /// Error during streaming; no further events follow.
    Error { message: String },
}

/// Parse a single SSE line from the provider's streaming API.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_split_into_event_and_data() {
        match parse_sse_line("event: response.output_text.delta") {
            Some(SseParsed::Event(e)) => assert_eq!(e, "response.output_text.delta"),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_sse_line(r#"data: {"type":"response.created"}"#) {
            Some(SseParsed::Data(d)) => assert!(d.contains("response.created")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_sse_line(": keep-alive comment").is_none());
    }
}
