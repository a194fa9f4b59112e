//! Message Bus for run lifecycle events
//!
//! The MessageBus provides a pub/sub pattern so callers can observe run
//! transitions without polling the status store. It uses bounded channels
//! and never blocks the publisher: a subscriber whose buffer is full misses
//! the event, and subscribers that dropped their receiver are pruned.

use crate::status::Phase;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// A run entered a new phase
    PhaseEntered,
    /// A plan step finished and its record was captured
    StepRecorded,
    /// A run reached COMPLETED
    RunCompleted,
    /// A run reached FAILED
    RunFailed,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PhaseEntered {
        session_id: String,
        phase: Phase,
    },
    StepRecorded {
        session_id: String,
        step: u32,
        /// Commit id, or `None` for a no-op step
        commit: Option<String>,
    },
    RunCompleted {
        session_id: String,
        branch: String,
        message: String,
    },
    RunFailed {
        session_id: String,
        kind: String,
        error: String,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::PhaseEntered { .. } => EventType::PhaseEntered,
            Event::StepRecorded { .. } => EventType::StepRecorded,
            Event::RunCompleted { .. } => EventType::RunCompleted,
            Event::RunFailed { .. } => EventType::RunFailed,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Event::PhaseEntered { session_id, .. }
            | Event::StepRecorded { session_id, .. }
            | Event::RunCompleted { session_id, .. }
            | Event::RunFailed { session_id, .. } => session_id,
        }
    }

    /// True for the last event a run publishes
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::RunCompleted { .. } | Event::RunFailed { .. })
    }
}

/// Message bus for pub/sub communication between components
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    /// Each subscriber gets a bounded channel with CHANNEL_BUFFER_SIZE capacity
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    /// Create a new MessageBus
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to the subscribers of its type and of `EventType::All`
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!(?event_type, "subscriber buffer full, event dropped");
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
