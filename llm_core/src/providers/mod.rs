pub mod anthropic;
pub mod gemini;
pub mod openai;

/// Accumulates raw byte chunks and splits out complete lines.
///
/// SSE bodies arrive as arbitrary byte chunks; a JSON payload can straddle a
/// chunk boundary, so deltas are only parsed from complete `\n`-terminated
/// lines.
pub(crate) struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Push a chunk, returning any complete lines (trimmed, non-empty).
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(text) = std::str::from_utf8(chunk) else {
            return out;
        };
        self.buf.push_str(text);
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim().to_string();
            self.buf = self.buf[pos + 1..].to_string();
            if !line.is_empty() {
                out.push(line);
            }
        }
        out
    }
}

/// Strip the `data: ` prefix from an SSE line, if present.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_handles_split_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"par").is_empty());
        let lines = buf.push(b"tial\":1}\n\ndata: done\n");
        assert_eq!(lines, vec!["data: {\"partial\":1}", "data: done"]);
    }

    #[test]
    fn sse_data_strips_prefix() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("event: ping"), None);
    }
}
