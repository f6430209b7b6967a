//! Framework-agnostic event broadcasting.
//!
//! The EventBus fans supervisor callbacks out to any number of consumers
//! (a terminal front-end, a socket bridge, tests). [`BusObserver`] plugs a
//! bus into the supervisor's observer seam.
//!
//! # Example
//!
//! ```rust
//! use dictate_core::event_bus::{DictationEvent, EventBus};
//! use dictate_core::protocol::LoadingState;
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.emit_dictation(&DictationEvent::State(LoadingState::Listening));
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(
//!     DictationEvent::from_broadcast(&event),
//!     Some(DictationEvent::State(LoadingState::Listening))
//! );
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::managers::SessionObserver;
use crate::protocol::LoadingState;

/// Default channel capacity for the event bus.
/// Events beyond this capacity will cause slow subscribers to miss events (lag).
const DEFAULT_CAPACITY: usize = 256;

pub const STATE_EVENT: &str = "dictation:state";
pub const RESULT_EVENT: &str = "dictation:result";

/// A broadcast event containing an event type and JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Event type identifier (e.g., "dictation:state").
    pub event_type: String,

    /// JSON payload for the event.
    pub payload: serde_json::Value,
}

impl BroadcastEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Typed view of the events the supervisor publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictationEvent {
    State(LoadingState),
    Result(String),
}

impl DictationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DictationEvent::State(_) => STATE_EVENT,
            DictationEvent::Result(_) => RESULT_EVENT,
        }
    }

    /// Decode a broadcast event; `None` for foreign or malformed events.
    pub fn from_broadcast(event: &BroadcastEvent) -> Option<Self> {
        match event.event_type.as_str() {
            STATE_EVENT => serde_json::from_value(event.payload.clone())
                .ok()
                .map(DictationEvent::State),
            RESULT_EVENT => event
                .payload
                .as_str()
                .map(|text| DictationEvent::Result(text.to_string())),
            _ => None,
        }
    }
}

/// A broadcast channel of [`BroadcastEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// If there are no subscribers, the event is dropped and 0 is returned.
    pub fn emit<T: Serialize>(&self, event_type: &str, payload: &T) -> usize {
        let json_payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to serialize event payload: {}", e);
                return 0;
            }
        };

        self.sender
            .send(BroadcastEvent::new(event_type, json_payload))
            .unwrap_or(0)
    }

    pub fn emit_dictation(&self, event: &DictationEvent) -> usize {
        match event {
            DictationEvent::State(state) => self.emit(event.event_type(), state),
            DictationEvent::Result(text) => self.emit(event.event_type(), text),
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards supervisor callbacks onto an [`EventBus`].
#[derive(Clone)]
pub struct BusObserver {
    bus: Arc<EventBus>,
}

impl BusObserver {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl SessionObserver for BusObserver {
    fn on_state_change(&self, state: LoadingState) {
        self.bus.emit_dictation(&DictationEvent::State(state));
    }

    fn on_result(&self, text: &str) {
        self.bus
            .emit_dictation(&DictationEvent::Result(text.to_string()));
    }
}
