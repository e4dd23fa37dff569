//! Per-instance event log and broadcast bus
//!
//! Steps publish [`RunEvent`]s through the context; the engine appends them
//! to the instance's ordered log and broadcasts them to subscribers.
//! Events are fire-and-forget: they are never acknowledged back into the
//! instance, and ordering is guaranteed per instance only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Well-known lifecycle event types emitted by the engine
pub mod event_types {
    /// Instance created and dispatched
    pub const INSTANCE_STARTED: &str = "instance.started";

    /// Instance suspended awaiting input or an async task
    pub const INSTANCE_SUSPENDED: &str = "instance.suspended";

    /// Instance resumed with external input
    pub const INSTANCE_RESUMED: &str = "instance.resumed";

    /// Instance completed successfully (terminal)
    pub const INSTANCE_COMPLETED: &str = "instance.completed";

    /// Instance failed (terminal)
    pub const INSTANCE_FAILED: &str = "instance.failed";

    /// Instance cancelled (terminal)
    pub const INSTANCE_CANCELLED: &str = "instance.cancelled";

    /// Per-step trace record, persisted when tracing is enabled
    pub const STEP_TRACE: &str = "step.trace";
}

/// An event in a workflow instance's ordered log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    /// Event type identifier
    pub event_type: String,

    /// Event payload (JSON)
    pub payload: serde_json::Value,

    /// When the event was published
    pub ts: DateTime<Utc>,
}

impl RunEvent {
    /// Create a new event stamped with the current time
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            ts: Utc::now(),
        }
    }

    /// Whether this is a terminal lifecycle event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            event_types::INSTANCE_COMPLETED
                | event_types::INSTANCE_FAILED
                | event_types::INSTANCE_CANCELLED
        )
    }
}

/// A broadcast envelope: event plus its owning instance and log position
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    /// Owning run id
    pub run_id: Uuid,

    /// Position in the instance's event log
    pub seq: u64,

    /// The event
    pub event: RunEvent,
}

/// Broadcast bus fanning events out to subscribers
///
/// Lagging subscribers lose events (fire-and-forget); the durable record
/// is the store's per-instance event log.
pub struct EventBus {
    tx: broadcast::Sender<InstanceEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all instance events
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; subscriber absence is not an error
    pub fn publish(&self, run_id: Uuid, seq: u64, event: RunEvent) {
        let _ = self.tx.send(InstanceEvent { run_id, seq, event });
    }
}
