//! Per-task transcript files.
//!
//! Every byte exchanged with an agent (and every event derived from it) can
//! be appended to `{log_dir}/{task_id}.log` for later debugging.

use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe handle to an append-only transcript file.
///
/// Holds `None` when transcripts are disabled; writes are then no-ops.
pub type TranscriptHandle = Arc<Mutex<Option<File>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stdout,
    Stdin,
    Event,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Stdout => "STDOUT",
            Direction::Stdin => "STDIN",
            Direction::Event => "EVENT",
        }
    }
}

/// Current UTC time as ISO 8601 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Append a timestamped line to the transcript (if one is open).
pub fn write_line(handle: &TranscriptHandle, direction: Direction, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let _ = writeln!(file, "[{}] {}: {}", utc_timestamp(), direction.as_str(), data);
            let _ = file.flush();
        }
    }
}

/// Open (or create) `{log_dir}/{task_id}.log`.
///
/// A missing `log_dir` or any I/O failure yields a disabled handle; a
/// transcript is never a reason to fail a task.
pub fn open_transcript(log_dir: Option<&Path>, task_id: &str) -> TranscriptHandle {
    let file = log_dir.and_then(|dir| {
        let path = dir.join(format!("{}.log", task_id));
        if let Err(e) = std::fs::create_dir_all(dir) {
            log::warn!("cannot create transcript dir {}: {}", dir.display(), e);
            return None;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| log::warn!("cannot open transcript {}: {}", path.display(), e))
            .ok()
    });
    Arc::new(Mutex::new(file))
}

/// A handle that discards everything.
pub fn disabled() -> TranscriptHandle {
    Arc::new(Mutex::new(None))
}
