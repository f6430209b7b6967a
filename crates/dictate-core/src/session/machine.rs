//! The lifecycle state machine observed by the consumer.
//!
//! ```text
//! idle ──start──▶ initializing ──reported──▶ listening ─▶ processing ─▶ ready
//!   ▲                  │                         │             │
//!   │                  └─────────── fail ────────┴─────────────┴──▶ error
//!   └──────────────────────────── reset (kill) ◀────────────────────────┘
//! ```
//!
//! `ready` and `error` are terminal: reported states no longer apply until
//! the next `begin`. `idle` and `initializing` belong to the supervisor and
//! are never accepted from the transcriber.

use crate::protocol::LoadingState;

/// Result of attempting a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State moved; consumers should be told.
    Changed(LoadingState),
    /// Already in the requested state.
    Unchanged,
    /// Transition not allowed from the current state.
    Rejected { from: LoadingState, to: LoadingState },
}

#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: LoadingState,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LoadingState {
        self.state
    }

    /// A new session starts: `idle | ready | error -> initializing`.
    pub fn begin(&mut self) -> Transition {
        match self.state {
            LoadingState::Idle | LoadingState::Ready | LoadingState::Error => {
                self.set(LoadingState::Initializing)
            }
            from => Transition::Rejected {
                from,
                to: LoadingState::Initializing,
            },
        }
    }

    /// Apply a state reported by the transcriber.
    pub fn apply_reported(&mut self, to: LoadingState) -> Transition {
        let from = self.state;
        if matches!(to, LoadingState::Idle | LoadingState::Initializing) || from.is_terminal() {
            return Transition::Rejected { from, to };
        }
        if from == LoadingState::Idle {
            // No session was started.
            return Transition::Rejected { from, to };
        }
        self.set(to)
    }

    /// Force `error`. A successful `ready` is never overwritten.
    pub fn fail(&mut self) -> Transition {
        match self.state {
            LoadingState::Ready => Transition::Rejected {
                from: LoadingState::Ready,
                to: LoadingState::Error,
            },
            _ => self.set(LoadingState::Error),
        }
    }

    /// Force `idle` from anywhere.
    pub fn reset(&mut self) -> Transition {
        self.set(LoadingState::Idle)
    }

    fn set(&mut self, to: LoadingState) -> Transition {
        if self.state == to {
            Transition::Unchanged
        } else {
            self.state = to;
            Transition::Changed(to)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LoadingState::*;

    fn at(state: LoadingState) -> SessionStateMachine {
        SessionStateMachine { state }
    }

    #[test]
    fn starts_idle() {
        let machine = SessionStateMachine::new();
        assert_eq!(machine.state(), Idle);
        assert!(!machine.state().is_terminal());
    }

    #[test]
    fn happy_path() {
        let mut machine = SessionStateMachine::new();
        assert_eq!(machine.begin(), Transition::Changed(Initializing));
        assert_eq!(machine.apply_reported(Listening), Transition::Changed(Listening));
        assert_eq!(machine.apply_reported(Processing), Transition::Changed(Processing));
        assert_eq!(machine.apply_reported(Ready), Transition::Changed(Ready));
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn begin_allowed_after_terminal_states() {
        for from in [Idle, Ready, Error] {
            assert_eq!(at(from).begin(), Transition::Changed(Initializing));
        }
    }

    #[test]
    fn begin_rejected_mid_session() {
        for from in [Initializing, Listening, Processing] {
            let mut machine = at(from);
            assert!(matches!(machine.begin(), Transition::Rejected { .. }));
            assert_eq!(machine.state(), from);
        }
    }

    #[test]
    fn duplicate_report_is_unchanged() {
        let mut machine = at(Listening);
        assert_eq!(machine.apply_reported(Listening), Transition::Unchanged);
    }

    #[test]
    fn reported_supervisor_states_rejected() {
        let mut machine = at(Listening);
        assert!(matches!(machine.apply_reported(Idle), Transition::Rejected { .. }));
        assert!(matches!(
            machine.apply_reported(Initializing),
            Transition::Rejected { .. }
        ));
        assert_eq!(machine.state(), Listening);
    }

    #[test]
    fn reports_ignored_without_session() {
        let mut machine = SessionStateMachine::new();
        assert!(matches!(machine.apply_reported(Listening), Transition::Rejected { .. }));
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn terminal_states_ignore_reports() {
        for from in [Ready, Error] {
            let mut machine = at(from);
            assert!(matches!(
                machine.apply_reported(Processing),
                Transition::Rejected { .. }
            ));
            assert_eq!(machine.state(), from);
        }
    }

    #[test]
    fn reported_error_is_accepted() {
        let mut machine = at(Processing);
        assert_eq!(machine.apply_reported(Error), Transition::Changed(Error));
    }

    #[test]
    fn fail_from_any_non_ready_state() {
        for from in [Idle, Initializing, Listening, Processing] {
            assert_eq!(at(from).fail(), Transition::Changed(Error));
        }
        assert_eq!(at(Error).fail(), Transition::Unchanged);
    }

    #[test]
    fn fail_never_overwrites_ready() {
        let mut machine = at(Ready);
        assert!(matches!(machine.fail(), Transition::Rejected { .. }));
        assert_eq!(machine.state(), Ready);
    }

    #[test]
    fn reset_from_anywhere() {
        for from in [Initializing, Listening, Processing, Ready, Error] {
            assert_eq!(at(from).reset(), Transition::Changed(Idle));
        }
        assert_eq!(at(Idle).reset(), Transition::Unchanged);
    }
}
