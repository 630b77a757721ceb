/// Line-oriented parser for `data: <payload>` event streams.
///
/// Completion servers emit one `data:` line per JSON chunk and finish with a
/// literal `data: [DONE]`. Blank lines, comments (`:`) and other fields are
/// ignored. Bytes are buffered until a full line arrives, so chunks may split
/// lines (and multi-byte characters) anywhere.

/// One decoded `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLine {
    /// JSON (or other) payload text
    Payload(String),
    /// The `[DONE]` terminator
    Done,
}

/// Incremental parser that buffers incomplete lines across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the HTTP response. Returns any complete data lines found.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DataLine> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = decode_line(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<DataLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        decode_line(&raw)
    }
}

fn decode_line(raw: &[u8]) -> Option<DataLine> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\n', '\r']);
    let value = line.strip_prefix("data:")?.trim_start_matches(' ');
    if value.is_empty() {
        return None;
    }
    if value.trim() == "[DONE]" {
        return Some(DataLine::Done);
    }
    Some(DataLine::Payload(value.to_string()))
}
