//! Line-oriented parser for upstream `text/event-stream` bodies

use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;

use super::types::ChatChunk;
use super::{ChunkStream, UpstreamError};

/// Terminal data payload used by OpenAI-compatible APIs
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental parser. Bytes are buffered until a full line is available so
/// multi-byte characters split across network reads survive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            self.process_line(line.trim_end_matches('\r'), &mut events);
        }

        events
    }

    /// Flush whatever is left once the body ends
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            self.process_line(line.trim_end_matches('\r'), &mut events);
        }
        self.finish_event(&mut events);
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.finish_event(events);
        } else if line.starts_with(':') {
            // comment / keep-alive
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        } else if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

struct ChunkDecoder<S> {
    body: S,
    parser: SseParser,
    pending: VecDeque<Result<ChatChunk, UpstreamError>>,
    finished: bool,
}

impl<S> ChunkDecoder<S> {
    fn enqueue(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.finished {
                return;
            }
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == DONE_SENTINEL {
                self.finished = true;
                return;
            }
            let decoded = serde_json::from_str::<ChatChunk>(data)
                .map_err(|e| UpstreamError::Decode(format!("{} in chunk {}", e, data)));
            self.pending.push_back(decoded);
        }
    }
}

/// Turn a raw SSE body into decoded chunks, stopping at `[DONE]` or end of body.
pub fn decode_chunks<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let decoder = ChunkDecoder {
        body,
        parser: SseParser::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(decoder, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    let events = st.parser.push(bytes.as_ref());
                    st.enqueue(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(UpstreamError::Transport(e.to_string())), st));
                }
                None => {
                    let events = st.parser.finish();
                    st.enqueue(events);
                    st.finished = true;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_handles_split_lines_and_comments() {
        let mut parser = SseParser::new();
        assert!(parser.push(b": keep-alive\n\ndata: {\"a\"").is_empty());
        let events = parser.push(b":1}\r\n\r\nevent: ping\ndata: x\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].event.as_deref(), Some("ping"));
    }

    #[test]
    fn test_parser_keeps_split_utf8() {
        let mut parser = SseParser::new();
        let text = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'
        assert!(parser.push(&text[..8]).is_empty());
        let events = parser.push(&text[8..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[tokio::test]
    async fn test_decode_stops_at_done() {
        let body = concat!(
            "data: {\"id\":\"1\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"}}]}\n\n",
            "data: {\"id\":\"1\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"y\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"id\":\"ignored\"}\n\n",
        );
        let parts: Vec<Result<Vec<u8>, std::io::Error>> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();

        let chunks: Vec<_> = decode_chunks(futures_util::stream::iter(parts)).collect().await;
        assert_eq!(chunks.len(), 2);
        let second = chunks[1].as_ref().unwrap();
        assert_eq!(second.content(), Some("y"));
        assert_eq!(second.finish_reason(), Some("stop"));
    }

    #[tokio::test]
    async fn test_decode_reports_bad_json() {
        let parts: Vec<Result<&[u8], std::io::Error>> = vec![Ok(b"data: {oops\n\n".as_slice())];
        let chunks: Vec<_> = decode_chunks(futures_util::stream::iter(parts)).collect().await;
        assert!(matches!(chunks[0], Err(UpstreamError::Decode(_))));
    }
}
