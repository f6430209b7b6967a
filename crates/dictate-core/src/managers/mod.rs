//! Process managers.
//!
//! Framework-agnostic: the supervisor reports through [`SessionObserver`]
//! and [`crate::logging::EventSink`], so any front-end can drive it.

pub mod supervisor;

pub use supervisor::{
    ProcessSupervisor, SessionObserver, StartOutcome, SupervisorConfig, FINISH_SIGNAL,
};
