// Server-Sent-Events framing
//
// Records are `event:` / `data:` lines closed by a blank line. Bytes arrive
// in arbitrary pieces; anything after the last complete record is kept
// verbatim and re-parsed together with the next read.

use tracing::trace;

/// One complete record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Parse every complete record in `buffer`
///
/// Returns the records and the unconsumed remainder (a partial record, or
/// empty).
pub fn parse_buffer(buffer: &str) -> (Vec<SseFrame>, &str) {
    let mut frames = Vec::new();
    let mut record_start = 0;
    let mut offset = 0;
    let mut event: Option<&str> = None;
    let mut data: Option<&str> = None;

    while let Some(pos) = buffer[offset..].find('\n') {
        let raw = &buffer[offset..offset + pos];
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        offset += pos + 1;

        if line.is_empty() {
            if let Some(name) = event.take() {
                frames.push(SseFrame {
                    event: name.to_string(),
                    data: data.unwrap_or_default().to_string(),
                });
            }
            data = None;
            record_start = offset;
        } else if let Some(value) = field(line, "event") {
            event = Some(value);
        } else if let Some(value) = field(line, "data") {
            data = Some(value);
        } else {
            trace!("Ignoring SSE line: {:?}", line);
        }
    }

    (frames, &buffer[record_start..])
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let value = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Incremental parser over a byte stream
///
/// Multi-byte characters split across reads are held back until complete.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    pending: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes and return the records they complete
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.decode(bytes);

        let (frames, remainder) = parse_buffer(&self.buffer);
        let consumed = self.buffer.len() - remainder.len();
        self.buffer.drain(..consumed);

        frames
    }

    /// Text of the partial record still waiting for its terminator
    pub fn remainder(&self) -> &str {
        &self.buffer
    }

    fn decode(&mut self, bytes: &[u8]) {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut rest: &[u8] = &input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.buffer.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }
}
