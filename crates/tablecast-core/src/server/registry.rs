//! Session registry
//!
//! Owned by the hub task; every method runs on that task, so no locking.

use std::collections::HashMap;

use tracing::debug;

use super::session::{Session, Subscription};
use crate::protocol::{SessionId, SyncConfig};

/// All connected sessions, keyed by session id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session; it receives no updates until it subscribes
    pub fn register(&mut self, session: Session) {
        debug!(session = %session.id(), "Session registered");
        if let Some(previous) = self.sessions.insert(session.id().to_string(), session) {
            previous.close();
        }
    }

    /// Remove a session
    ///
    /// Idempotent. Dropping the returned session cancels its timers and
    /// releases its transport.
    pub fn unregister(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id);
        if session.is_some() {
            debug!(session = %session_id, "Session unregistered");
        }
        session
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    /// Point a session at a data source, replacing any earlier subscription
    ///
    /// Returns false if the session is unknown.
    pub fn subscribe(
        &mut self,
        session_id: &str,
        data_source_id: &str,
        collection_id: &str,
        config: SyncConfig,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session.set_subscription(Some(Subscription {
            data_source_id: data_source_id.to_string(),
            collection_id: collection_id.to_string(),
            config,
        }));
        debug!(session = %session_id, source = %data_source_id, collection = %collection_id, "Session subscribed");
        true
    }

    /// Drop a session's subscription, cancelling its polling timer
    pub fn unsubscribe(&mut self, session_id: &str) -> Option<Subscription> {
        self.sessions
            .get_mut(session_id)
            .and_then(|s| s.set_subscription(None))
    }

    /// Record a heartbeat; returns false if the session is unknown
    pub fn touch(&mut self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Sessions subscribed to a data source
    pub fn sessions_for<'a>(&'a self, data_source_id: &'a str) -> impl Iterator<Item = &'a Session> + 'a {
        self.sessions
            .values()
            .filter(move |s| s.is_subscribed_to(data_source_id))
    }

    pub fn subscriber_count(&self, data_source_id: &str) -> usize {
        self.sessions_for(data_source_id).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every session
    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }
}
