//! Transparency event bus.
//!
//! Every component reports progress by appending [`TransparencyEvent`]s
//! under a session. The bus is split along its two audiences: the
//! capability-facing [`EventSink`] (append) and the client-facing
//! [`EventSource`] (subscribe/poll), so the transport (long-lived
//! stream or periodic fetch) stays an adapter concern.

mod bus;

pub use bus::InMemoryEventBus;

use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::EngineResult;
use crate::types::{EventKind, TransparencyEvent};

/// What an emitter hands to the sink. Id, step number, and timestamp
/// are assigned by the bus at append time.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub capability_name: String,
    pub kind: EventKind,
    pub title: String,
    pub details: serde_json::Value,
    pub duration_ms: Option<u64>,
}

/// Capability-facing side of the bus. Each append is one atomic
/// operation: id and per-(session, capability) step number are assigned
/// under the same lock that stores the event.
pub trait EventSink: Send + Sync {
    fn append(&self, session_id: &str, draft: EventDraft) -> EngineResult<TransparencyEvent>;
}

/// One frame of a subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Event { event: TransparencyEvent },
    Complete {
        session_id: String,
        total_events: usize,
        final_answer: Option<String>,
    },
    Error { message: String },
    Timeout { session_id: String },
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFrame::Event { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub events: Vec<TransparencyEvent>,
    pub has_more: bool,
}

/// Client-facing side of the bus.
///
/// Delivery is at-least-once: a consumer may see an event twice across
/// reconnects and must treat duplicate ids as a no-op.
pub trait EventSource: Send + Sync {
    /// Lazy ordered stream of everything appended under the session,
    /// from the beginning, terminated by a completion, error, or
    /// inactivity-timeout frame.
    fn subscribe(&self, session_id: &str) -> BoxStream<'static, StreamFrame>;

    /// Pull fallback: events strictly newer than `since_event_id`
    /// (everything, when absent). `has_more` stays true until the
    /// session reaches a terminal state.
    fn poll(&self, session_id: &str, since_event_id: Option<&str>) -> PollResponse;
}

/// Binds a sink to one (session, capability) pair so call sites stay
/// one-liners. Append failures are logged, never propagated; losing
/// an audit record must not fail the work being audited.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    session_id: String,
    capability_name: String,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>, session_id: &str, capability_name: &str) -> Self {
        Self {
            sink,
            session_id: session_id.to_string(),
            capability_name: capability_name.to_string(),
        }
    }

    pub fn received(&self, title: &str, details: serde_json::Value) {
        self.emit(EventKind::Received, title, details, None);
    }

    pub fn thinking(&self, title: &str, details: serde_json::Value) {
        self.emit(EventKind::Thinking, title, details, None);
    }

    pub fn decision(&self, title: &str, details: serde_json::Value) {
        self.emit(EventKind::Decision, title, details, None);
    }

    pub fn action(&self, title: &str, details: serde_json::Value) {
        self.emit(EventKind::Action, title, details, None);
    }

    pub fn result(&self, title: &str, details: serde_json::Value, duration_ms: Option<u64>) {
        self.emit(EventKind::Result, title, details, duration_ms);
    }

    pub fn error(&self, title: &str, details: serde_json::Value) {
        self.emit(EventKind::Error, title, details, None);
    }

    fn emit(
        &self,
        kind: EventKind,
        title: &str,
        details: serde_json::Value,
        duration_ms: Option<u64>,
    ) {
        let draft = EventDraft {
            capability_name: self.capability_name.clone(),
            kind,
            title: title.to_string(),
            details,
            duration_ms,
        };
        if let Err(e) = self.sink.append(&self.session_id, draft) {
            warn!(session_id = %self.session_id, error = %e, "failed to append transparency event");
        }
    }
}
