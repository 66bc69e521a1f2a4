//! In-memory event bus implementation.
//!
//! One append-only log per session behind a mutex, with a `Notify` to
//! wake subscribers. Appends assign the event id and the monotone
//! per-(session, capability) step number under the log lock, so
//! concurrent appenders can never interleave half-written records and
//! no reader observes a gap.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::errors::EngineResult;
use crate::types::TransparencyEvent;

use super::{EventDraft, EventSink, EventSource, PollResponse, StreamFrame};

/// Terminal state of a session's log.
#[derive(Debug, Clone)]
enum SessionTerminal {
    Complete { final_answer: Option<String> },
    Error { message: String },
}

#[derive(Default)]
struct SessionLog {
    events: Vec<TransparencyEvent>,
    /// Next step number per capability; starts at 1.
    counters: HashMap<String, u32>,
    terminal: Option<SessionTerminal>,
}

struct SessionState {
    log: Mutex<SessionLog>,
    notify: Notify,
}

impl SessionState {
    fn new() -> Self {
        Self {
            log: Mutex::new(SessionLog::default()),
            notify: Notify::new(),
        }
    }
}

pub struct InMemoryEventBus {
    sessions: DashMap<String, Arc<SessionState>>,
    inactivity_timeout: Duration,
}

impl InMemoryEventBus {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            inactivity_timeout,
        }
    }

    fn state(&self, session_id: &str) -> Arc<SessionState> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionState::new()))
            .clone()
    }

    /// Mark the session complete. The first terminal wins; later calls
    /// are no-ops so a racing error cannot overwrite a completion.
    pub fn complete_session(&self, session_id: &str, final_answer: Option<String>) {
        let state = self.state(session_id);
        {
            let mut log = state.log.lock().expect("session log poisoned");
            if log.terminal.is_none() {
                log.terminal = Some(SessionTerminal::Complete { final_answer });
            }
        }
        state.notify.notify_waiters();
    }

    /// Mark the session failed at the request level.
    pub fn fail_session(&self, session_id: &str, message: &str) {
        let state = self.state(session_id);
        {
            let mut log = state.log.lock().expect("session log poisoned");
            if log.terminal.is_none() {
                log.terminal = Some(SessionTerminal::Error {
                    message: message.to_string(),
                });
            }
        }
        state.notify.notify_waiters();
    }

    pub fn is_complete(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(state) => state.log.lock().expect("session log poisoned").terminal.is_some(),
            None => false,
        }
    }

    /// Drop a session's log once its streams have closed.
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn event_count(&self, session_id: &str) -> usize {
        match self.sessions.get(session_id) {
            Some(state) => state.log.lock().expect("session log poisoned").events.len(),
            None => 0,
        }
    }
}

impl EventSink for InMemoryEventBus {
    fn append(&self, session_id: &str, draft: EventDraft) -> EngineResult<TransparencyEvent> {
        let state = self.state(session_id);
        let event = {
            let mut log = state.log.lock().expect("session log poisoned");
            let counter = log
                .counters
                .entry(draft.capability_name.clone())
                .or_insert(0);
            *counter += 1;
            let event = TransparencyEvent {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                capability_name: draft.capability_name,
                kind: draft.kind,
                title: draft.title,
                details: draft.details,
                step_number: *counter,
                created_at: Utc::now(),
                duration_ms: draft.duration_ms,
            };
            log.events.push(event.clone());
            event
        };
        state.notify.notify_waiters();
        Ok(event)
    }
}

struct Subscription {
    state: Arc<SessionState>,
    session_id: String,
    cursor: usize,
    pending: VecDeque<StreamFrame>,
    done: bool,
}

fn terminal_frame(terminal: SessionTerminal, session_id: &str, total: usize) -> StreamFrame {
    match terminal {
        SessionTerminal::Complete { final_answer } => StreamFrame::Complete {
            session_id: session_id.to_string(),
            total_events: total,
            final_answer,
        },
        SessionTerminal::Error { message } => StreamFrame::Error { message },
    }
}

impl EventSource for InMemoryEventBus {
    fn subscribe(&self, session_id: &str) -> BoxStream<'static, StreamFrame> {
        let sub = Subscription {
            state: self.state(session_id),
            session_id: session_id.to_string(),
            cursor: 0,
            pending: VecDeque::new(),
            done: false,
        };
        let inactivity = self.inactivity_timeout;

        Box::pin(futures::stream::unfold(sub, move |mut sub| async move {
            loop {
                if sub.done {
                    return None;
                }
                if let Some(frame) = sub.pending.pop_front() {
                    if frame.is_terminal() {
                        sub.done = true;
                    }
                    return Some((frame, sub));
                }

                let state = Arc::clone(&sub.state);

                // Register interest before re-checking the log, so an
                // append landing between the check and the await still
                // wakes us (Notify::notify_waiters has no permit).
                let notified = state.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let must_wait = {
                    let log = state.log.lock().expect("session log poisoned");
                    if log.events.len() > sub.cursor {
                        let new = log.events[sub.cursor..].to_vec();
                        sub.cursor = log.events.len();
                        sub.pending
                            .extend(new.into_iter().map(|event| StreamFrame::Event { event }));
                        false
                    } else if let Some(terminal) = log.terminal.clone() {
                        let total = log.events.len();
                        sub.pending
                            .push_back(terminal_frame(terminal, &sub.session_id, total));
                        false
                    } else {
                        true
                    }
                };

                if must_wait
                    && tokio::time::timeout(inactivity, notified).await.is_err()
                {
                    sub.done = true;
                    return Some((
                        StreamFrame::Timeout {
                            session_id: sub.session_id.clone(),
                        },
                        sub,
                    ));
                }
            }
        }))
    }

    fn poll(&self, session_id: &str, since_event_id: Option<&str>) -> PollResponse {
        let state = self.state(session_id);
        let log = state.log.lock().expect("session log poisoned");
        let start = match since_event_id {
            Some(id) => log
                .events
                .iter()
                .position(|e| e.id == id)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        PollResponse {
            events: log.events[start..].to_vec(),
            has_more: log.terminal.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use futures::StreamExt;

    fn draft(capability: &str, kind: EventKind, title: &str) -> EventDraft {
        EventDraft {
            capability_name: capability.to_string(),
            kind,
            title: title.to_string(),
            details: serde_json::json!({}),
            duration_ms: None,
        }
    }

    fn bus() -> InMemoryEventBus {
        InMemoryEventBus::new(Duration::from_secs(30))
    }

    #[test]
    fn test_step_numbers_increase_without_gaps_per_capability() {
        let bus = bus();
        for i in 0..5 {
            bus.append("s", draft("alpha", EventKind::Thinking, &format!("t{}", i)))
                .unwrap();
        }
        bus.append("s", draft("beta", EventKind::Received, "other"))
            .unwrap();

        let events = bus.poll("s", None).events;
        let alpha_steps: Vec<u32> = events
            .iter()
            .filter(|e| e.capability_name == "alpha")
            .map(|e| e.step_number)
            .collect();
        assert_eq!(alpha_steps, vec![1, 2, 3, 4, 5]);
        let beta_steps: Vec<u32> = events
            .iter()
            .filter(|e| e.capability_name == "beta")
            .map(|e| e.step_number)
            .collect();
        assert_eq!(beta_steps, vec![1]);
    }

    #[test]
    fn test_poll_since_event_id() {
        let bus = bus();
        let first = bus
            .append("s", draft("alpha", EventKind::Received, "one"))
            .unwrap();
        bus.append("s", draft("alpha", EventKind::Result, "two"))
            .unwrap();

        let response = bus.poll("s", Some(&first.id));
        assert_eq!(response.events.len(), 1);
        assert_eq!(response.events[0].title, "two");
        assert!(response.has_more);

        bus.complete_session("s", Some("done".to_string()));
        assert!(!bus.poll("s", None).has_more);
    }

    #[test]
    fn test_poll_unknown_since_id_returns_everything() {
        let bus = bus();
        bus.append("s", draft("alpha", EventKind::Received, "one"))
            .unwrap();
        let response = bus.poll("s", Some("not-an-id"));
        assert_eq!(response.events.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_yields_events_then_complete() {
        let bus = Arc::new(bus());
        bus.append("s", draft("alpha", EventKind::Received, "one"))
            .unwrap();

        let mut stream = bus.subscribe("s");

        let writer = Arc::clone(&bus);
        tokio::spawn(async move {
            writer
                .append("s", draft("alpha", EventKind::Result, "two"))
                .unwrap();
            writer.complete_session("s", Some("answer".to_string()));
        });

        let mut titles = Vec::new();
        let mut completion: Option<(usize, Option<String>)> = None;
        while let Some(frame) = stream.next().await {
            match frame {
                StreamFrame::Event { event } => titles.push(event.title),
                StreamFrame::Complete {
                    total_events,
                    final_answer,
                    ..
                } => {
                    completion = Some((total_events, final_answer));
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(titles, vec!["one", "two"]);
        let (total, answer) = completion.expect("no completion frame");
        assert_eq!(total, 2);
        assert_eq!(answer.as_deref(), Some("answer"));
    }

    #[tokio::test]
    async fn test_subscribe_inactivity_timeout() {
        let bus = InMemoryEventBus::new(Duration::from_millis(20));
        let mut stream = bus.subscribe("quiet");
        match stream.next().await {
            Some(StreamFrame::Timeout { session_id }) => assert_eq!(session_id, "quiet"),
            other => panic!("expected timeout frame, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_terminal_frame() {
        let bus = bus();
        bus.fail_session("s", "planning failed");
        let mut stream = bus.subscribe("s");
        match stream.next().await {
            Some(StreamFrame::Error { message }) => assert_eq!(message, "planning failed"),
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[test]
    fn test_first_terminal_wins() {
        let bus = bus();
        bus.complete_session("s", Some("answer".to_string()));
        bus.fail_session("s", "late error");
        let response = bus.poll("s", None);
        assert!(!response.has_more);
        // Subscribers still see the completion, not the late error.
        let state = bus.state("s");
        let log = state.log.lock().unwrap();
        assert!(matches!(
            log.terminal,
            Some(SessionTerminal::Complete { .. })
        ));
    }
}
