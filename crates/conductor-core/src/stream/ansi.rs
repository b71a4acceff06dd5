//! Terminal output cleanup.
//!
//! Output read from a pty is raw bytes with escape sequences mixed in.
//! [`Utf8Decoder`] turns chunks into text without splitting multi-byte
//! characters across reads, and [`strip_ansi`] removes escape sequences
//! and stray control characters before the text reaches the parser.
//! [`AnsiStripper`] does the same for a stream of chunks, where a sequence
//! may be split between two reads.

use regex::Regex;
use std::sync::OnceLock;

static ANSI_REGEX: OnceLock<Regex> = OnceLock::new();

fn ansi_regex() -> &'static Regex {
    ANSI_REGEX.get_or_init(|| {
        // - CSI: ESC [ params intermediates final
        // - OSC: ESC ] ... BEL or ESC \
        // - DCS/SOS/PM/APC: ESC P|X|^|_ ... ESC \
        // - Two-byte escapes: ESC followed by one char in @-Z, \-_
        // - Remaining C0 controls except \t \n \r, plus DEL
        Regex::new(
            r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[PX^_][^\x1b]*\x1b\\|\x1b[@-Z\\-_]|[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]",
        )
        .expect("ANSI pattern is valid")
    })
}

/// Strip ANSI escape sequences and control characters from text.
///
/// Newlines, carriage returns and tabs are kept; the parser decides what
/// to do with them.
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

static PARTIAL_ESCAPE_REGEX: OnceLock<Regex> = OnceLock::new();

/// An escape sequence cut off at the end of the text.
fn partial_escape_regex() -> &'static Regex {
    PARTIAL_ESCAPE_REGEX.get_or_init(|| {
        Regex::new(r"\x1b(?:\[[0-?]*[ -/]*|\][^\x07\x1b]*|[PX^_][^\x1b]*)?$")
            .expect("partial escape pattern is valid")
    })
}

/// Longest unterminated sequence held back before giving up on it.
const MAX_HELD_ESCAPE: usize = 4096;

/// [`strip_ansi`] for chunked text.
///
/// An escape sequence left open at the end of a chunk is held back and
/// completed by the next one. Whatever is still held when the stream ends
/// is dropped.
#[derive(Debug, Default)]
pub struct AnsiStripper {
    pending: String,
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strip(&mut self, text: &str) -> String {
        self.pending.push_str(text);
        let mut text = std::mem::take(&mut self.pending);

        if let Some(tail) = partial_escape_regex().find(&text) {
            if text.len() - tail.start() <= MAX_HELD_ESCAPE {
                self.pending = text.split_off(tail.start());
            }
        }
        strip_ansi(&text)
    }

    /// Bytes held back waiting for the rest of a sequence.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Incremental UTF-8 decoder for chunked reads.
///
/// A read may end in the middle of a multi-byte character. The incomplete
/// tail is held back until the next chunk arrives. Invalid sequences are
/// replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `data` (plus any held-back bytes) as possible.
    pub fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // Incomplete character at the end; wait for more.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod strip {
        use super::*;

        #[test]
        fn colors() {
            assert_eq!(strip_ansi("\x1b[31mred\x1b[0m text"), "red text");
        }

        #[test]
        fn truecolor_and_256() {
            assert_eq!(strip_ansi("\x1b[38;2;255;0;0mA\x1b[38;5;196mB\x1b[0m"), "AB");
        }

        #[test]
        fn private_modes_and_cursor() {
            assert_eq!(strip_ansi("\x1b[?25l\x1b[2K\x1b[1Ghello\x1b[?25h"), "hello");
        }

        #[test]
        fn osc_title_with_bel_and_st() {
            assert_eq!(strip_ansi("\x1b]0;title\x07a\x1b]8;;http://x\x1b\\b"), "ab");
        }

        #[test]
        fn keeps_newlines_and_tabs() {
            assert_eq!(strip_ansi("a\r\n\tb\x07"), "a\r\n\tb");
        }

        #[test]
        fn leaves_json_alone() {
            let json = r#"{"type":"text","part":{"text":"use \"{}\" here"}}"#;
            assert_eq!(strip_ansi(json), json);
        }
    }

    mod stripper {
        use super::*;

        #[test]
        fn csi_split_across_chunks() {
            let mut stripper = AnsiStripper::new();
            assert_eq!(stripper.strip("{\"text\":\"a\x1b[3"), r#"{"text":"a"#);
            assert_eq!(stripper.pending_len(), 3);
            assert_eq!(stripper.strip(r#"1mred"}"#), r#"red"}"#);
            assert_eq!(stripper.pending_len(), 0);
        }

        #[test]
        fn lone_escape_waits_for_next_chunk() {
            let mut stripper = AnsiStripper::new();
            assert_eq!(stripper.strip("ok\x1b"), "ok");
            assert_eq!(stripper.strip("[0m done"), " done");
        }

        #[test]
        fn osc_split_before_terminator() {
            let mut stripper = AnsiStripper::new();
            assert_eq!(stripper.strip("a\x1b]0;tit"), "a");
            assert_eq!(stripper.strip("le\x07b"), "b");
        }

        #[test]
        fn complete_sequences_are_not_held() {
            let mut stripper = AnsiStripper::new();
            assert_eq!(stripper.strip("\x1b[31mred\x1b[0m"), "red");
            assert_eq!(stripper.pending_len(), 0);
        }

        #[test]
        fn oversized_sequence_is_released() {
            let mut stripper = AnsiStripper::new();
            let long = format!("\x1b]{}", "x".repeat(MAX_HELD_ESCAPE + 1));
            assert!(!stripper.strip(&long).is_empty());
            assert_eq!(stripper.pending_len(), 0);
        }
    }

    mod decoder {
        use super::*;

        #[test]
        fn split_multibyte_character() {
            let bytes = "héllo".as_bytes();
            let mut decoder = Utf8Decoder::new();
            let first = decoder.decode(&bytes[..2]);
            assert_eq!(first, "h");
            assert_eq!(decoder.pending_len(), 1);
            let rest = decoder.decode(&bytes[2..]);
            assert_eq!(rest, "éllo");
            assert_eq!(decoder.pending_len(), 0);
        }

        #[test]
        fn invalid_bytes_are_replaced() {
            let mut decoder = Utf8Decoder::new();
            assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
        }
    }
}
