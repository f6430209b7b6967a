//! Session lifecycle: identity, diagnostics and the state machine.

mod machine;
mod state;

pub use machine::{SessionStateMachine, Transition};
pub use state::{ReadyTiming, Session, SessionId, SessionTiming};
