//! # dictate-core
//!
//! Supervision of the external dictation transcriber.
//!
//! The transcriber is a separate process (normally a Python script in a
//! virtualenv) that records from the microphone, waits for a newline on
//! stdin, transcribes, and reports progress as newline-delimited JSON on
//! stdout. This crate spawns it, decodes that stream, and exposes the
//! result as a small state machine.
//!
//! ## Key Concepts
//!
//! - **Session**: one managed lifetime of the transcriber subprocess
//! - **LoadingState**: `idle → initializing → listening → processing → ready | error`
//! - **Finish signal**: a single `\n` on stdin telling the transcriber to stop
//!   capturing and produce a transcript

pub mod event_bus;
pub mod logging;
pub mod managers;
pub mod paths;
pub mod protocol;
pub mod session;
pub mod shell;
pub mod spawn;

// Re-export commonly used types
pub use logging::{EventSink, JsonLineLog};
pub use managers::{ProcessSupervisor, SessionObserver, StartOutcome, SupervisorConfig};
pub use protocol::{ChildProcessUpdate, LoadingState};
pub use session::SessionId;
