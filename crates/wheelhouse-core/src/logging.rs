//! Per-session raw payload logs.
//!
//! When a log directory is configured, every raw transport payload is
//! appended to `{log_dir}/{session_id}.log` with a UTC timestamp and the
//! channel it arrived on. Useful for replaying a provider stream against the
//! normalizer after the fact.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

/// Thread-safe handle to an append-only log file. Holds `None` when logging
/// is disabled or the file could not be opened.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Append a timestamped line to the log (if present). Write failures are
/// swallowed; raw logging is best-effort.
pub fn log_line(handle: &LogHandle, channel: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let _ = writeln!(file, "[{}] {}: {}", ts, channel, data);
            let _ = file.flush();
        }
    }
}

/// Open (or create) `{log_dir}/{session_id}.log` and return a shared handle.
pub fn open_log_file(log_dir: Option<&str>, session_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        let path = Path::new(dir).join(format!("{}.log", session_id));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    Arc::new(Mutex::new(file))
}
