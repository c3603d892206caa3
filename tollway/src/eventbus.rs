//! Application event bus.
//!
//! Topic-based fanout for everything observers care about: manager state
//! transitions, session lifecycle, transfer statistics and host power
//! events. Publishing is fire-and-forget: a publisher never blocks on its
//! subscribers, and a topic without subscribers drops events silently.
//!
//! Each topic is a `tokio::sync::broadcast` channel. Slow subscribers that
//! fall more than [`TOPIC_CAPACITY`] events behind lose the oldest events;
//! all topics here are advisory, so that is acceptable.

use crate::connection::{SessionEvent, StateEvent, StatisticsEvent};
use crate::sleep;
use tokio::sync::broadcast;

/// Buffered events per topic before a lagging subscriber starts losing them.
pub const TOPIC_CAPACITY: usize = 64;

/// Topic names, used for logging only; subscriptions are typed.
pub const TOPIC_CONNECTION_STATE: &str = "connection-state";
pub const TOPIC_CONNECTION_STATISTICS: &str = "connection-statistics";
pub const TOPIC_CONNECTION_SESSION: &str = "connection-session";
pub const TOPIC_SLEEP_NOTIFICATION: &str = "sleep-notification";

/// Cloneable handle to the bus. All clones fan out to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    state_tx: broadcast::Sender<StateEvent>,
    stats_tx: broadcast::Sender<StatisticsEvent>,
    session_tx: broadcast::Sender<SessionEvent>,
    sleep_tx: broadcast::Sender<sleep::Event>,
}

impl EventBus {
    /// Create a bus with no subscribers yet.
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(TOPIC_CAPACITY);
        let (stats_tx, _) = broadcast::channel(TOPIC_CAPACITY);
        let (session_tx, _) = broadcast::channel(TOPIC_CAPACITY);
        let (sleep_tx, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            state_tx,
            stats_tx,
            session_tx,
            sleep_tx,
        }
    }

    /// Publish a manager state transition.
    pub fn publish_state(&self, event: StateEvent) {
        tracing::debug!(topic = TOPIC_CONNECTION_STATE, state = %event.state, "publishing event");
        let _ = self.state_tx.send(event);
    }

    /// Publish a statistics report.
    pub fn publish_statistics(&self, event: StatisticsEvent) {
        let _ = self.stats_tx.send(event);
    }

    /// Publish a session lifecycle event.
    pub fn publish_session(&self, event: SessionEvent) {
        tracing::debug!(topic = TOPIC_CONNECTION_SESSION, kind = ?event.kind, "publishing event");
        let _ = self.session_tx.send(event);
    }

    /// Publish a host power-state notification.
    pub fn publish_sleep(&self, event: sleep::Event) {
        tracing::debug!(topic = TOPIC_SLEEP_NOTIFICATION, event = ?event, "publishing event");
        let _ = self.sleep_tx.send(event);
    }

    /// Subscribe to manager state transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateEvent> {
        self.state_tx.subscribe()
    }

    /// Subscribe to statistics reports.
    pub fn subscribe_statistics(&self) -> broadcast::Receiver<StatisticsEvent> {
        self.stats_tx.subscribe()
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    /// Subscribe to host power-state notifications.
    pub fn subscribe_sleep(&self) -> broadcast::Receiver<sleep::Event> {
        self.sleep_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
