//! Per-session state.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::LineDecoder;
use crate::spawn::TranscriberProcess;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durations recorded when the transcriber reports `ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyTiming {
    pub since_spawn: Duration,
    pub since_first_output: Option<Duration>,
}

/// Timing marks kept for diagnostics only.
#[derive(Debug, Clone)]
pub struct SessionTiming {
    spawned_at: Instant,
    first_output_at: Option<Instant>,
    ready_at: Option<Instant>,
}

impl SessionTiming {
    pub fn started_now() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(spawned_at: Instant) -> Self {
        Self {
            spawned_at,
            first_output_at: None,
            ready_at: None,
        }
    }

    /// Record the first stdout chunk. Returns the delay since spawn the first
    /// time only.
    pub fn mark_first_output(&mut self, now: Instant) -> Option<Duration> {
        if self.first_output_at.is_some() {
            return None;
        }
        self.first_output_at = Some(now);
        Some(now.saturating_duration_since(self.spawned_at))
    }

    /// Record the `ready` report. Returns timings the first time only.
    pub fn mark_ready(&mut self, now: Instant) -> Option<ReadyTiming> {
        if self.ready_at.is_some() {
            return None;
        }
        self.ready_at = Some(now);
        Some(ReadyTiming {
            since_spawn: now.saturating_duration_since(self.spawned_at),
            since_first_output: self
                .first_output_at
                .map(|first| now.saturating_duration_since(first)),
        })
    }
}

/// One supervised transcriber subprocess.
///
/// The process handle is owned here and nowhere else. A session is
/// `detached` once it reached a terminal state: its events are no longer
/// acted on, but a process that is still running stays owned until it is
/// reaped.
pub struct Session {
    pub id: SessionId,
    pub(crate) process: TranscriberProcess,
    pub(crate) decoder: LineDecoder,
    pub(crate) timing: SessionTiming,
    pub(crate) result_delivered: bool,
    pub(crate) detached: bool,
}

impl Session {
    pub(crate) fn new(id: SessionId, process: TranscriberProcess) -> Self {
        Self {
            id,
            process,
            decoder: LineDecoder::new(),
            timing: SessionTiming::started_now(),
            result_delivered: false,
            detached: false,
        }
    }

    /// Live and not yet terminal.
    pub fn is_active(&self) -> bool {
        !self.detached
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }
}
