//! Line framing for the agent's Server-Sent Events streams.

const DATA_PREFIX: &str = "data:";

/// Returns the payload of an SSE `data:` line, or `None` for any other line
/// (comments, `event:`, `id:`, blank separators).
#[must_use]
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(DATA_PREFIX)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Accumulates body chunks and hands back complete `data:` payloads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk; returns the payloads of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(payload) = data_payload(line) {
                if !payload.is_empty() {
                    out.push(payload.to_string());
                }
            }
        }
        out
    }

    /// Drains a trailing line that never saw its newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest);
        data_payload(line.trim_end_matches('\r'))
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }
}
