//! Incremental Server-Sent Events frame decoder
//!
//! Bytes arrive in arbitrary chunks from `reqwest::Response::bytes_stream`;
//! the decoder buffers partial lines and yields complete frames in arrival
//! order.

/// One dispatched SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if present
    pub event: Option<String>,
    /// `data:` lines joined with newlines
    pub data: String,
    /// Value of the `id:` field, if present
    pub id: Option<String>,
}

impl SseFrame {
    /// Event type, `message` when the frame names none
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Buffered SSE decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line).into_owned();
            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
            } else if !line.starts_with(':') {
                self.field(&line);
            }
        }

        frames
    }

    /// Flush a trailing frame left unterminated when the body ended
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() && !line.starts_with(':') {
                self.field(line);
            }
        }
        self.dispatch()
    }

    fn field(&mut self, line: &str) {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() {
            self.event = None;
            self.id = None;
            return None;
        }

        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
            id: self.id.take(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: endpoint\nda").is_empty());
        let frames = decoder.push(b"ta: /messages?session_id=abc\n\nevent: message\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), "endpoint");
        assert_eq!(frames[0].data, "/messages?session_id=abc");

        let frames = decoder.push(b"data: {\"id\":1}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), "message");
        assert_eq!(frames[0].data, "{\"id\":1}");
    }

    #[test]
    fn test_comments_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\n\ndata: line one\ndata: line two\nid: 9\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "line one\nline two");
        assert_eq!(frames[0].id.as_deref(), Some("9"));
        assert_eq!(frames[0].event_type(), "message");
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"id\":2}").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(frame.data, "{\"id\":2}");
        assert!(decoder.finish().is_none());
    }
}
