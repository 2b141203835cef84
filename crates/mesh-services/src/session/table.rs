//! Live sessions keyed by account.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::Session;

#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    shutting_down: Arc<AtomicBool>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session previously held for the same account.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.account().to_string(), session)
    }

    pub fn get(&self, account: &str) -> Option<Arc<Session>> {
        self.sessions.get(account).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, account: &str) -> Option<Arc<Session>> {
        self.sessions.remove(account).map(|(_, session)| session)
    }

    /// Drop `session`'s entry unless its account has since been taken over
    /// by a newer session.
    pub(crate) fn remove_session(&self, session: &Session) {
        self.sessions.remove_if(session.account(), |_, current| {
            std::ptr::eq(Arc::as_ptr(current), session)
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions not yet closed.
    pub fn active(&self) -> usize {
        self.sessions.iter().filter(|entry| !entry.is_closed()).count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Close every session and drop pending reconnects. Returns how many
    /// sessions this call actually tore down.
    pub async fn close_all(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);

        // Collect first; DashMap guards must not be held across an await.
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut closed = 0;
        for session in sessions {
            session.cancel_reconnect();
            if session.close().await {
                closed += 1;
            }
        }
        self.sessions.clear();
        tracing::info!(closed, "session table drained");
        closed
    }
}
