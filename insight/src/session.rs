//! Session lifecycle: cancellation tokens and the registry of requests
//! currently in flight.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::types::SessionId;

/// Cloneable cancellation signal shared by the orchestrator and every
/// task it spawns for one session. Built on a watch channel so that
/// in-flight work can both poll (`is_cancelled`) and await
/// (`cancelled`) the signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without cancelling; park forever so callers
        // select!-ing against real work are never woken spuriously.
        std::future::pending::<()>().await
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the cancellation token of every session with work in flight.
/// The gateway uses it to propagate a client disconnect or an explicit
/// "new chat" reset to all still-running steps of that session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: DashMap<SessionId, CancelToken>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { active: DashMap::new() }
    }

    /// Register a new in-flight session and hand back its token.
    pub fn begin(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.active.insert(session_id.to_string(), token.clone());
        token
    }

    /// Cancel a session if it is still running. Returns whether a
    /// running session was found.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.active.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop bookkeeping once a session's orchestration has settled.
    pub fn finish(&self, session_id: &str) {
        self.active.remove(session_id);
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_token_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[test]
    fn test_registry_cancel_and_finish() {
        let registry = SessionRegistry::new();
        let token = registry.begin("s1");
        assert!(registry.is_active("s1"));
        assert!(registry.cancel("s1"));
        assert!(token.is_cancelled());
        registry.finish("s1");
        assert!(!registry.is_active("s1"));
        assert!(!registry.cancel("s1"));
    }
}
