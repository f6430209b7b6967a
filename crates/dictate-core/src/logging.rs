//! Structured event log.
//!
//! The supervisor reports what happens to a session as `(event, fields)`
//! pairs through an [`EventSink`]. [`JsonLineLog`] appends each event as one
//! JSON object per line to `<log_dir>/dictate.log`:
//!
//! ```text
//! {"timestamp":"2026-02-04T10:15:30.123Z","action":"state_change","state":"listening"}
//! ```
//!
//! Every event is mirrored to the `log` facade at debug level. Logging never
//! fails from the caller's point of view: write errors fall back to
//! `log::error!`.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub const DEFAULT_LOG_FILENAME: &str = "dictate.log";

/// Receiver of structured diagnostic events.
pub trait EventSink: Send + Sync {
    fn log(&self, event: &str, fields: Value);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn log(&self, _event: &str, _fields: Value) {}
}

/// Format current UTC time as ISO 8601 with milliseconds.
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build the JSON object written for one event.
///
/// Object fields are flattened next to `timestamp` and `action`; any other
/// value is stored under `data`.
fn build_entry(timestamp: String, event: &str, fields: Value) -> Value {
    let mut entry = Map::new();
    entry.insert("timestamp".to_string(), Value::String(timestamp));
    entry.insert("action".to_string(), Value::String(event.to_string()));
    match fields {
        Value::Object(map) => {
            for (key, value) in map {
                if key != "timestamp" && key != "action" {
                    entry.insert(key, value);
                }
            }
        }
        Value::Null => {}
        other => {
            entry.insert("data".to_string(), other);
        }
    }
    Value::Object(entry)
}

/// Append-only JSON-lines event log.
#[derive(Debug)]
pub struct JsonLineLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl JsonLineLog {
    /// Log to `{log_dir}/dictate.log`, or only to the `log` facade when
    /// `log_dir` is `None`.
    ///
    /// The file is opened lazily on the first event, creating the directory
    /// if needed.
    pub fn new(log_dir: Option<&Path>) -> Self {
        Self {
            path: log_dir.map(|dir| dir.join(DEFAULT_LOG_FILENAME)),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn append(&self, path: &Path, line: &str) -> std::io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            *guard = Some(OpenOptions::new().create(true).append(true).open(path)?);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        let result = writeln!(file, "{}", line).and_then(|_| file.flush());
        if result.is_err() {
            // Reopen on the next event.
            guard.take();
        }
        result
    }
}

impl EventSink for JsonLineLog {
    fn log(&self, event: &str, fields: Value) {
        let entry = build_entry(utc_timestamp(), event, fields);
        let line = entry.to_string();
        log::debug!("[{}] {}", event, line);

        if let Some(path) = &self.path {
            if let Err(e) = self.append(path, &line) {
                log::error!(
                    "Failed to write to log file {}: {} ({})",
                    path.display(),
                    e,
                    line
                );
            }
        }
    }
}
