//! Agent output stream handling.
//!
//! Raw pty bytes go through [`Utf8Decoder`] and [`AnsiStripper`], then
//! [`StreamParser`] frames them into [`StreamMessage`]s.

mod ansi;
mod parser;
mod types;

pub use ansi::{strip_ansi, AnsiStripper, Utf8Decoder};
pub use parser::{ParseOutput, StreamParser, MAX_BUFFER_BYTES};
pub use types::{FinishReason, StreamMessage, ToolState};
