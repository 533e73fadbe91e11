//! Client connection manager
//!
//! Keeps one WebSocket connection to a tablecast server alive: connects,
//! waits for the server to identify the session, sends heartbeats, and
//! reconnects with exponential backoff when the connection drops. A
//! user-initiated close never triggers a reconnect.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use crate::error::ConnectionError;
use crate::protocol::{ClientMessage, ServerMessage, SessionId, SyncConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, not trying
    Idle,
    /// Opening the socket and waiting for the session id
    Connecting,
    /// Connected and identified
    Open,
    /// Waiting before the next connection attempt
    Reconnecting { attempt: u32 },
    /// Sending the close frame after a user close
    Closing,
    /// Retry budget spent; terminal
    Failed,
}

/// Events emitted by the connection task
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// State changed
    StateChanged(ConnectionState),
    /// Server identified the session
    Connected { session_id: SessionId },
    /// An open connection ended
    Disconnected { reason: String },
    /// Next attempt scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// Message from the server
    Message(ServerMessage),
    /// Error occurred
    Error(String),
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL
    pub url: String,
    /// Deadline for opening the socket and receiving the session id
    pub connect_timeout: Duration,
    /// Time between heartbeats
    pub heartbeat_interval: Duration,
    /// How long to wait for a heartbeat reply
    pub heartbeat_timeout: Duration,
    /// Reconnect backoff
    pub backoff: BackoffPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3001".to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Commands sent to the connection task
#[derive(Debug)]
enum Command {
    Send(ClientMessage),
    Close,
}

/// Connection manager, before the connection task is started
///
/// Listeners registered with [`ConnectionManager::subscribe`] before
/// [`ConnectionManager::connect`] observe every event from the first
/// state change on.
pub struct ConnectionManager {
    config: ConnectionConfig,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { config, events }
    }

    /// Register an event listener
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Start the connection task
    pub fn connect(self) -> ConnectionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let task = tokio::spawn(connection_loop(
            self.config,
            command_rx,
            self.events.clone(),
            state_tx,
        ));

        ConnectionHandle {
            command_tx,
            state_rx,
            events: self.events,
            task,
        }
    }
}

/// Handle to control and observe a running connection
pub struct ConnectionHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Send a message
    ///
    /// While not connected, `start-sync` and `stop-sync` only update the
    /// remembered subscription (replayed on the next connect); other
    /// messages are dropped.
    pub fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        self.command_tx
            .send(Command::Send(message))
            .map_err(|_| ConnectionError::Stopped)
    }

    /// Subscribe the session to a data source
    pub fn start_sync(
        &self,
        data_source_id: &str,
        collection_id: &str,
        config: SyncConfig,
    ) -> Result<(), ConnectionError> {
        self.send(ClientMessage::start_sync(data_source_id, collection_id, config))
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch state changes
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register another event listener
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Wait until the state satisfies `predicate`, returning that state
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(ConnectionState) -> bool,
    ) -> Result<ConnectionState, ConnectionError> {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            if predicate(state) {
                return Ok(state);
            }
            rx.changed().await.map_err(|_| ConnectionError::Stopped)?;
        }
    }

    /// Close the connection without reconnecting and wait for the task to end
    pub async fn close(self) {
        let _ = self.command_tx.send(Command::Close);
        let _ = self.task.await;
    }
}

/// Publishes state and events
struct Reporter {
    events: broadcast::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Reporter {
    fn state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        let _ = self.events.send(ConnectionEvent::StateChanged(state));
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

/// Why the open phase ended
enum Exit {
    /// Closed by the user (or every handle dropped)
    Closed,
    /// Connection lost; reconnect
    Lost(ConnectionError),
}

/// Track the subscription to replay after reconnecting
fn remember(message: &ClientMessage, sync: &mut Option<ClientMessage>) {
    match message {
        ClientMessage::StartSync { .. } => *sync = Some(message.clone()),
        ClientMessage::StopSync => *sync = None,
        _ => {}
    }
}

/// Main connection loop with reconnection
async fn connection_loop(
    config: ConnectionConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let reporter = Reporter { events, state_tx };
    let mut sync: Option<ClientMessage> = None;
    // Reconnect attempts since the last successful open
    let mut attempt: u32 = 0;

    loop {
        reporter.state(ConnectionState::Connecting);

        // Connect, but keep serving commands so close() is never stuck
        let opened = {
            let open = open(&config);
            tokio::pin!(open);
            loop {
                tokio::select! {
                    result = &mut open => break Some(result),
                    command = commands.recv() => match command {
                        Some(Command::Send(message)) => {
                            remember(&message, &mut sync);
                            debug!(kind = message.kind(), "Not connected, message held or dropped");
                        }
                        Some(Command::Close) | None => break None,
                    },
                }
            }
        };

        match opened {
            None => {
                reporter.state(ConnectionState::Idle);
                return;
            }
            Some(Ok((ws, session_id))) => {
                attempt = 0;
                info!(url = %config.url, session = %session_id, "Connected");
                reporter.state(ConnectionState::Open);
                reporter.emit(ConnectionEvent::Connected { session_id });

                match run_open(ws, &config, &mut commands, &mut sync, &reporter).await {
                    Exit::Closed => {
                        reporter.emit(ConnectionEvent::Disconnected {
                            reason: "closed by client".to_string(),
                        });
                        reporter.state(ConnectionState::Idle);
                        return;
                    }
                    Exit::Lost(e) => {
                        warn!(url = %config.url, "Connection lost: {}", e);
                        reporter.emit(ConnectionEvent::Disconnected {
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Some(Err(e)) => {
                warn!(url = %config.url, attempt, "Connection attempt failed: {}", e);
                reporter.emit(ConnectionEvent::Error(e.to_string()));
            }
        }

        if !config.backoff.allows(attempt) {
            let e = ConnectionError::ReconnectExhausted { attempts: attempt };
            warn!(url = %config.url, "{}", e);
            reporter.state(ConnectionState::Failed);
            reporter.emit(ConnectionEvent::Error(e.to_string()));
            return;
        }

        // Wait before reconnecting, but check for close
        let delay = config.backoff.delay(attempt);
        attempt += 1;
        reporter.state(ConnectionState::Reconnecting { attempt });
        reporter.emit(ConnectionEvent::Reconnecting { attempt, delay });

        let wake = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => break,
                command = commands.recv() => match command {
                    Some(Command::Send(message)) => remember(&message, &mut sync),
                    Some(Command::Close) | None => {
                        reporter.state(ConnectionState::Idle);
                        return;
                    }
                },
            }
        }
    }
}

/// Open the socket and wait for the server's `connection` message, both
/// within the connect timeout
async fn open(config: &ConnectionConfig) -> Result<(WsStream, SessionId), ConnectionError> {
    let deadline = Instant::now() + config.connect_timeout;

    let (mut ws, _) = tokio::time::timeout_at(deadline, connect_async(config.url.as_str()))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(config.connect_timeout))?
        .map_err(|e| ConnectionError::Connect {
            url: config.url.clone(),
            details: e.to_string(),
        })?;

    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(config.connect_timeout))?;

        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Ok(ServerMessage::Connection { session_id, .. }) = ServerMessage::decode(&text)
                {
                    return Ok((ws, session_id));
                }
            }
            Some(Ok(Message::Close(_))) | None => return Err(ConnectionError::HandshakeClosed),
            Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
            Some(Ok(_)) => {}
        }
    }
}

/// Run an open connection until it is lost or closed
async fn run_open(
    ws: WsStream,
    config: &ConnectionConfig,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    sync: &mut Option<ClientMessage>,
    reporter: &Reporter,
) -> Exit {
    let (mut write, mut read) = ws.split();

    // Replay the last subscription
    if let Some(message) = sync.as_ref() {
        if let Err(e) = send_message(&mut write, message).await {
            return Exit::Lost(e);
        }
        debug!("Replayed subscription");
    }

    let interval = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if pong_deadline.is_none() {
                    if let Err(e) = send_message(&mut write, &ClientMessage::Ping).await {
                        return Exit::Lost(e);
                    }
                    pong_deadline = Some(Instant::now() + config.heartbeat_timeout);
                }
            }

            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                write.close().await.ok();
                return Exit::Lost(ConnectionError::HeartbeatTimeout(config.heartbeat_timeout));
            }

            command = commands.recv() => match command {
                Some(Command::Send(message)) => {
                    remember(&message, sync);
                    if let Err(e) = send_message(&mut write, &message).await {
                        return Exit::Lost(e);
                    }
                }
                Some(Command::Close) | None => {
                    reporter.state(ConnectionState::Closing);
                    write.send(Message::Close(None)).await.ok();
                    return Exit::Closed;
                }
            },

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::decode(&text) {
                    Ok(message) => {
                        if matches!(message, ServerMessage::Pong { .. }) {
                            pong_deadline = None;
                        }
                        reporter.emit(ConnectionEvent::Message(message));
                    }
                    Err(e) => {
                        reporter.emit(ConnectionEvent::Error(format!("Invalid server message: {}", e)));
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Exit::Lost(ConnectionError::Transport(
                        "server closed the connection".to_string(),
                    ));
                }
                Some(Err(e)) => return Exit::Lost(ConnectionError::Transport(e.to_string())),
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_message<S>(write: &mut S, message: &ClientMessage) -> Result<(), ConnectionError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = message
        .encode()
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn fast_config(url: String) -> ConnectionConfig {
        ConnectionConfig {
            url,
            connect_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(40),
                max_attempts: 3,
            },
        }
    }

    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<ConnectionEvent>,
        pick: impl Fn(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pick(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn bind_server() -> (String, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (url, listener)
    }

    async fn accept_and_greet(listener: &TcpListener, session_id: &str) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let greeting = ServerMessage::connection(session_id).encode().unwrap();
        ws.send(Message::Text(greeting)).await.unwrap();
        ws
    }

    async fn next_client_message(ws: &mut WebSocketStream<TcpStream>) -> ClientMessage {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return ClientMessage::decode(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Expected a client message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let manager = ConnectionManager::new(fast_config(refused_url().await));
        let mut events = manager.subscribe();
        let handle = manager.connect();

        let mut delays = Vec::new();
        let mut errors = Vec::new();
        loop {
            match next_event(&mut events, |_| true).await {
                ConnectionEvent::Reconnecting { delay, .. } => delays.push(delay),
                ConnectionEvent::Error(e) => {
                    let done = e.contains("Gave up");
                    errors.push(e);
                    if done {
                        break;
                    }
                }
                ConnectionEvent::Connected { .. } => panic!("Should never connect"),
                _ => {}
            }
        }

        assert_eq!(handle.state(), ConnectionState::Failed);
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
        // Initial attempt plus three retries, then the terminal error
        assert_eq!(errors.len(), 5);
        assert_eq!(errors[4], "Gave up reconnecting after 3 attempts");
    }

    #[tokio::test]
    async fn test_retry_budget_is_the_same_after_a_drop() {
        let (url, listener) = bind_server().await;
        let manager = ConnectionManager::new(fast_config(url));
        let mut events = manager.subscribe();
        let handle = manager.connect();

        let server = accept_and_greet(&listener, "session-1").await;
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Connected { .. })).await;

        // Server goes away entirely
        drop(listener);
        drop(server);

        let mut delays = Vec::new();
        loop {
            match next_event(&mut events, |_| true).await {
                ConnectionEvent::Reconnecting { delay, .. } => delays.push(delay),
                ConnectionEvent::Error(e) if e.contains("Gave up") => {
                    assert_eq!(e, "Gave up reconnecting after 3 attempts");
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(delays.len(), 3);
        assert_eq!(handle.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_then_reconnects() {
        let (url, listener) = bind_server().await;
        // Completes the WebSocket handshake but never identifies the session
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                if let Ok(ws) = accept_async(stream).await {
                    held.push(ws);
                }
            }
        });

        let mut config = fast_config(url);
        config.connect_timeout = Duration::from_millis(100);
        let manager = ConnectionManager::new(config);
        let mut events = manager.subscribe();
        let handle = manager.connect();

        let expected = ConnectionError::ConnectTimeout(Duration::from_millis(100)).to_string();
        match next_event(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await {
            ConnectionEvent::Error(e) => assert_eq!(e, expected),
            other => panic!("Expected Error, got {:?}", other),
        }
        match next_event(&mut events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await {
            ConnectionEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("Expected Reconnecting, got {:?}", other),
        }

        handle.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_close_while_open_does_not_reconnect() {
        let (url, listener) = bind_server().await;
        let manager = ConnectionManager::new(fast_config(url));
        let mut events = manager.subscribe();
        let handle = manager.connect();

        let _server = accept_and_greet(&listener, "session-1").await;
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Connected { .. })).await;

        let state = handle.state_watch();
        handle.close().await;
        assert_eq!(*state.borrow(), ConnectionState::Idle);

        // Every sender is gone once the task ends, so this drains and stops
        let mut seen = Vec::new();
        while let Ok(event) = events.recv().await {
            seen.push(event);
        }
        assert!(seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::StateChanged(ConnectionState::Closing))));
        assert!(seen.iter().any(
            |e| matches!(e, ConnectionEvent::Disconnected { reason } if reason == "closed by client")
        ));
        assert!(!seen.iter().any(|e| matches!(
            e,
            ConnectionEvent::Reconnecting { .. }
                | ConnectionEvent::StateChanged(ConnectionState::Reconnecting { .. })
        )));
        assert!(matches!(
            seen.last(),
            Some(ConnectionEvent::StateChanged(ConnectionState::Idle))
        ));
    }

    #[tokio::test]
    async fn test_close_while_reconnecting_goes_idle() {
        let mut config = fast_config(refused_url().await);
        config.backoff = BackoffPolicy {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(60),
            max_attempts: 5,
        };
        let handle = ConnectionManager::new(config).connect();

        handle
            .wait_for_state(|s| matches!(s, ConnectionState::Reconnecting { .. }))
            .await
            .unwrap();

        let state = handle.state_watch();
        handle.close().await;
        assert_eq!(*state.borrow(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connects_and_identifies_session() {
        let (url, listener) = bind_server().await;
        let manager = ConnectionManager::new(fast_config(url));
        let mut events = manager.subscribe();
        let handle = manager.connect();

        let mut server = accept_and_greet(&listener, "session-1").await;
        match next_event(&mut events, |e| matches!(e, ConnectionEvent::Connected { .. })).await {
            ConnectionEvent::Connected { session_id } => assert_eq!(session_id, "session-1"),
            other => panic!("Expected Connected, got {:?}", other),
        }
        assert_eq!(handle.state(), ConnectionState::Open);

        handle
            .start_sync("S1", "C1", SyncConfig::default())
            .unwrap();
        assert_eq!(
            next_client_message(&mut server).await,
            ClientMessage::start_sync("S1", "C1", SyncConfig::default())
        );

        let pong = ServerMessage::pong().encode().unwrap();
        server.send(Message::Text(pong)).await.unwrap();
        assert!(matches!(
            next_event(&mut events, |e| matches!(e, ConnectionEvent::Message(_))).await,
            ConnectionEvent::Message(ServerMessage::Pong { .. })
        ));

        handle.close().await;
    }

    #[tokio::test]
    async fn test_subscription_is_replayed_after_reconnect() {
        let (url, listener) = bind_server().await;
        let manager = ConnectionManager::new(fast_config(url));
        let mut events = manager.subscribe();
        let handle = manager.connect();

        let mut first = accept_and_greet(&listener, "session-1").await;
        handle
            .start_sync("S1", "C1", SyncConfig::default())
            .unwrap();
        next_client_message(&mut first).await;

        // Drop the connection from the server side
        drop(first);

        next_event(&mut events, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await;
        let mut second = accept_and_greet(&listener, "session-2").await;
        assert_eq!(
            next_client_message(&mut second).await,
            ClientMessage::start_sync("S1", "C1", SyncConfig::default())
        );

        match next_event(&mut events, |e| matches!(e, ConnectionEvent::Connected { .. })).await {
            ConnectionEvent::Connected { session_id } => assert_eq!(session_id, "session-2"),
            other => panic!("Expected Connected, got {:?}", other),
        }

        handle.close().await;
    }

    #[test]
    fn test_stop_sync_clears_replay() {
        let mut sync = None;
        remember(&ClientMessage::start_sync("S1", "C1", SyncConfig::default()), &mut sync);
        assert!(sync.is_some());

        remember(&ClientMessage::Ping, &mut sync);
        assert!(sync.is_some());

        remember(&ClientMessage::StopSync, &mut sync);
        assert!(sync.is_none());
    }

    #[tokio::test]
    async fn test_unanswered_heartbeat_drops_connection() {
        let (url, listener) = bind_server().await;
        let mut config = fast_config(url);
        config.heartbeat_interval = Duration::from_millis(50);
        config.heartbeat_timeout = Duration::from_millis(50);
        let manager = ConnectionManager::new(config);
        let mut events = manager.subscribe();
        let handle = manager.connect();

        let mut server = accept_and_greet(&listener, "session-1").await;
        assert_eq!(next_client_message(&mut server).await, ClientMessage::Ping);

        match next_event(&mut events, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await {
            ConnectionEvent::Disconnected { reason } => assert!(reason.contains("Heartbeat")),
            other => panic!("Expected Disconnected, got {:?}", other),
        }

        handle.close().await;
    }
}
