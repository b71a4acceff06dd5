//! Streaming JSON object framer.
//!
//! # How This Parser Works
//!
//! The agent's JSON objects reach us through a pseudo-terminal, which means:
//! - one object may be split across several reads,
//! - one read may contain several objects back to back,
//! - banners, box-drawing and cursor noise sit between objects,
//! - a wrapping terminal may inject literal CR/LF in the middle of a string.
//!
//! There is no delimiter to split on, so the parser finds object boundaries
//! by counting braces. Counting is quote-aware (braces inside strings are
//! ignored) and escape-aware (`\"` does not end a string).
//!
//! A partial object stays at the front of the buffer until the next `feed`,
//! together with how far it has been scanned, so each byte is looked at
//! once however many reads the object spans.

use serde_json::Value;

use super::types::StreamMessage;

/// Upper bound on buffered, not-yet-framed input.
///
/// Anything beyond this is a producer that will never close its object
/// (corrupted or endless non-JSON output).
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// One result of feeding data to the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutput {
    Message(StreamMessage),
    /// A framed span that was not a valid message, or a buffer reset.
    /// Never fatal.
    Error(String),
}

/// Frames JSON objects out of a chunked terminal stream.
///
/// One instance per task. Never reuse a buffer across tasks; call
/// [`StreamParser::reset`] if an instance is recycled.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: String,
    /// Progress through the partial object at the front of `buffer`.
    scan: Scan,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and extract every complete object now available.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParseOutput> {
        self.buffer.push_str(chunk);
        let mut outputs = self.extract();

        if self.buffer.len() > MAX_BUFFER_BYTES {
            log::warn!(
                "stream buffer exceeded {} bytes without a complete object, discarding",
                MAX_BUFFER_BYTES
            );
            outputs.push(ParseOutput::Error(format!(
                "buffer exceeded {} bytes without a complete object; discarded {} bytes",
                MAX_BUFFER_BYTES,
                self.buffer.len()
            )));
            self.reset();
        }

        outputs
    }

    /// Try to parse whatever is left in the buffer as a final object.
    ///
    /// Call when the stream closes, to recover an object that arrived right
    /// before the end without its trailing noise.
    pub fn flush(&mut self) -> Vec<ParseOutput> {
        let remaining = std::mem::take(&mut self.buffer);
        self.scan = Scan::default();
        let remaining = remaining.trim_end();
        let Some(first) = remaining.find('{') else {
            return Vec::new();
        };

        // A stray '{' in leading noise keeps the depth from ever returning
        // to zero, so try every opening brace before giving up.
        for (start, _) in remaining.match_indices('{') {
            if let Ok(value) = parse_json(&remaining[start..]) {
                return vec![to_output(value)];
            }
        }

        vec![ParseOutput::Error(format!(
            "incomplete object at end of stream ({} bytes)",
            remaining.len() - first
        ))]
    }

    /// Drop all buffered input.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan = Scan::default();
    }

    /// Bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn extract(&mut self) -> Vec<ParseOutput> {
        let mut outputs = Vec::new();
        let mut consumed = 0;
        // Only ever non-default for an object starting at offset 0.
        let mut scan = std::mem::take(&mut self.scan);

        {
            let bytes = self.buffer.as_bytes();
            loop {
                // Anything before the next '{' is terminal noise.
                let Some(offset) = bytes[consumed..].iter().position(|&b| b == b'{') else {
                    consumed = bytes.len();
                    break;
                };
                let start = consumed + offset;

                match scan.advance(&bytes[start..]) {
                    Some(len) => {
                        let end = start + len;
                        outputs.push(parse_candidate(&self.buffer[start..end]));
                        // On failure the whole span is discarded and scanning
                        // resumes after it.
                        consumed = end;
                        scan = Scan::default();
                    }
                    None => {
                        // Incomplete; keep it for the next feed.
                        consumed = start;
                        break;
                    }
                }
            }
        }

        // A partial object moves to the front; its scan state still holds.
        self.buffer.drain(..consumed);
        self.scan = scan;
        outputs
    }
}

/// Brace-matching state for an object that starts with `{`.
#[derive(Debug, Default, Clone, Copy)]
struct Scan {
    /// Bytes of the object already examined.
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Continue through `bytes`, the object from its opening brace.
    ///
    /// Returns the object's length once it closes, `None` if more input is
    /// needed.
    fn advance(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate().skip(self.scanned) {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }

        self.scanned = bytes.len();
        None
    }
}

fn parse_candidate(candidate: &str) -> ParseOutput {
    match parse_json(candidate) {
        Ok(value) => to_output(value),
        Err(err) => {
            log::debug!("discarding malformed object: {}", err);
            ParseOutput::Error(format!("malformed JSON object: {}", err))
        }
    }
}

fn parse_json(candidate: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str::<Value>(candidate).or_else(|first_err| {
        // Literal CR/LF inside a string is invalid JSON; a wrapping
        // terminal inserts them, so drop them and retry.
        let sanitized: String = candidate
            .chars()
            .filter(|c| *c != '\r' && *c != '\n')
            .collect();
        serde_json::from_str::<Value>(&sanitized).map_err(|_| first_err)
    })
}

fn to_output(value: Value) -> ParseOutput {
    match StreamMessage::from_value(value) {
        Ok(message) => ParseOutput::Message(message),
        Err(err) => {
            log::debug!("discarding object: {}", err);
            ParseOutput::Error(err)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
