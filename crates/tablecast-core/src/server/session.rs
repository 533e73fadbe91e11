//! Connected sessions and their transports

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::protocol::{ServerMessage, SessionId, SyncConfig};

/// A frame queued for a session's socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// JSON message
    Message(ServerMessage),
    /// WebSocket-level ping (liveness probe)
    Ping,
    /// Close the socket
    Close,
}

/// Delivery handle for one session
///
/// `send` never blocks: it either queues the frame or fails immediately,
/// so one slow peer cannot stall the caller.
pub trait Transport: Send + fmt::Debug {
    fn send(&self, frame: Outbound) -> Result<(), TransportError>;
}

/// Transport backed by a bounded queue drained by a socket writer task
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
    capacity: usize,
}

impl ChannelTransport {
    /// Create a transport and the receiving end for its writer
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Outbound) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// What a session is subscribed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub data_source_id: String,
    pub collection_id: String,
    pub config: SyncConfig,
}

/// Timers owned by a session, aborted when the session is dropped
#[derive(Debug, Default)]
pub struct SessionTimers {
    heartbeat: Option<AbortHandle>,
    poll: Option<AbortHandle>,
}

impl SessionTimers {
    /// Install the heartbeat timer, replacing any previous one
    pub fn set_heartbeat(&mut self, handle: AbortHandle) {
        if let Some(old) = self.heartbeat.replace(handle) {
            old.abort();
        }
    }

    /// Install the polling timer, replacing any previous one
    pub fn set_poll(&mut self, handle: AbortHandle) {
        if let Some(old) = self.poll.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the polling timer
    pub fn clear_poll(&mut self) {
        if let Some(old) = self.poll.take() {
            old.abort();
        }
    }

    pub fn has_poll(&self) -> bool {
        self.poll.is_some()
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        for handle in [self.heartbeat.take(), self.poll.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Generate a new opaque session id
pub fn new_session_id() -> SessionId {
    format!("session-{}", uuid::Uuid::new_v4())
}

/// One connected peer
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    transport: Box<dyn Transport>,
    subscription: Option<Subscription>,
    connected_at: DateTime<Utc>,
    last_heartbeat: Instant,
    timers: SessionTimers,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, transport: Box<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            transport,
            subscription: None,
            connected_at: Utc::now(),
            last_heartbeat: Instant::now(),
            timers: SessionTimers::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Whether this session receives updates for `data_source_id`
    pub fn is_subscribed_to(&self, data_source_id: &str) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|s| s.data_source_id == data_source_id)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    /// Record a heartbeat from the peer
    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn timers_mut(&mut self) -> &mut SessionTimers {
        &mut self.timers
    }

    /// Queue a message
    pub fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        self.transport.send(Outbound::Message(message))
    }

    /// Queue a transport-level ping
    pub fn ping(&self) -> Result<(), TransportError> {
        self.transport.send(Outbound::Ping)
    }

    /// Ask the writer to close the socket
    pub fn close(&self) {
        let _ = self.transport.send(Outbound::Close);
    }

    /// Replace the subscription; any polling timer belonged to the old one
    pub(crate) fn set_subscription(
        &mut self,
        subscription: Option<Subscription>,
    ) -> Option<Subscription> {
        self.timers.clear_poll();
        std::mem::replace(&mut self.subscription, subscription)
    }
}
