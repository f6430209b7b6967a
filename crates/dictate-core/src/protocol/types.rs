//! Wire types for the transcriber's stdout protocol.
//!
//! The transcriber writes one JSON object per line. Every object carries a
//! `status` tag:
//!
//! - `{"status": "state_change", "state": "listening"}`
//! - `{"status": "state_change", "state": "ready", "payload": "hello world"}`
//! - `{"status": "info", "message": "Recording started."}`
//! - `{"status": "error", "message": "No audio data was captured."}`
//!
//! `payload` is only meaningful on a `ready` state change, where it carries
//! the transcript.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a dictation session, as surfaced to the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingState {
    #[default]
    Idle,
    Initializing,
    Listening,
    Processing,
    Ready,
    Error,
}

impl LoadingState {
    /// `ready` and `error` end a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadingState::Ready | LoadingState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoadingState::Idle => "idle",
            LoadingState::Initializing => "initializing",
            LoadingState::Listening => "listening",
            LoadingState::Processing => "processing",
            LoadingState::Ready => "ready",
            LoadingState::Error => "error",
        }
    }
}

impl fmt::Display for LoadingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single status message emitted by the transcriber subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildProcessUpdate {
    StateChange {
        state: LoadingState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
    Info {
        message: String,
    },
}

impl ChildProcessUpdate {
    /// Transcript text carried by a `ready` state change.
    ///
    /// String payloads are trimmed; any other JSON value is rendered as JSON
    /// text. Returns `None` for every other message, and for a `ready`
    /// without payload.
    pub fn transcript(&self) -> Option<String> {
        match self {
            ChildProcessUpdate::StateChange {
                state: LoadingState::Ready,
                payload: Some(payload),
            } => Some(match payload {
                serde_json::Value::String(text) => text.trim().to_string(),
                other => other.to_string(),
            }),
            _ => None,
        }
    }
}
