//! Hub task
//!
//! A single task owns the session registry and every data source, and
//! processes [`HubCommand`]s one at a time. Connection tasks, watchers and
//! timers never touch that state directly; they only send commands.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dispatch::dispatch;
use super::registry::SessionRegistry;
use super::session::Session;
use crate::error::{CycleError, HubError, OriginError, ProtocolError};
use crate::protocol::{ClientMessage, ServerMessage, SessionId, SyncConfig};
use crate::source::{
    CycleOutcome, DataSource, FileOrigin, Origin, SourceSnapshot, SourceSummary, SourceWatcher,
    WatchOptions,
};
use crate::table::{ParseOptions, Table, TableParser};

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Watcher debounce window
    pub debounce: Duration,
    /// Parser options for every source
    pub parse: ParseOptions,
    /// Install filesystem watches for file origins
    pub watch_filesystem: bool,
    /// How often sessions are probed
    pub session_ping_interval: Duration,
    /// Sessions silent for longer than this are dropped
    pub session_timeout: Duration,
    /// Outbound queue length per session
    pub session_queue_capacity: usize,
    /// Lower bound for per-session polling intervals
    pub min_poll_interval: Duration,
    /// Where uploaded files are stored
    pub upload_dir: PathBuf,
    /// Largest accepted upload
    pub max_upload_bytes: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            parse: ParseOptions::default(),
            watch_filesystem: true,
            session_ping_interval: Duration::from_secs(30),
            session_timeout: Duration::from_secs(90),
            session_queue_capacity: 256,
            min_poll_interval: Duration::from_millis(1000),
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Counters reported by the health endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub sessions: usize,
    pub subscribed: usize,
    pub sources: usize,
}

/// Commands processed by the hub task
#[derive(Debug)]
pub(crate) enum HubCommand {
    Connect {
        session: Session,
    },
    Disconnect {
        session_id: SessionId,
        reason: String,
    },
    Inbound {
        session_id: SessionId,
        message: ClientMessage,
    },
    ProtocolViolation {
        session_id: SessionId,
        error: ProtocolError,
    },
    Heartbeat {
        session_id: SessionId,
    },
    HeartbeatTick {
        session_id: SessionId,
    },
    PollTick {
        session_id: SessionId,
    },
    Reparsed(CycleOutcome),
    RegisterSource {
        id: String,
        title: String,
        origin: Arc<dyn Origin>,
        table: Table,
        reply: oneshot::Sender<Result<SourceSummary, HubError>>,
    },
    Snapshot {
        id: String,
        reply: oneshot::Sender<Result<SourceSnapshot, HubError>>,
    },
    ListSources {
        reply: oneshot::Sender<Vec<SourceSummary>>,
    },
    Refresh {
        id: String,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown,
}

/// Handle for talking to the hub task
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
    parser: TableParser,
    upload_dir: PathBuf,
    max_upload_bytes: usize,
    session_queue_capacity: usize,
}

/// Spawn the hub task
pub fn spawn_hub(options: HubOptions) -> HubHandle {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = HubHandle {
        tx: tx.clone(),
        parser: TableParser::new(options.parse.clone()),
        upload_dir: options.upload_dir.clone(),
        max_upload_bytes: options.max_upload_bytes,
        session_queue_capacity: options.session_queue_capacity,
    };

    let hub = Hub {
        options,
        tx,
        registry: SessionRegistry::new(),
        sources: HashMap::new(),
    };
    tokio::spawn(hub.run(rx));

    handle
}

impl HubHandle {
    fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).map_err(|_| HubError::Stopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Whether the hub task is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Largest accepted upload in bytes
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Outbound queue length to use for new sessions
    pub fn session_queue_capacity(&self) -> usize {
        self.session_queue_capacity
    }

    /// Register a newly connected session
    pub fn connect(&self, session: Session) -> Result<(), HubError> {
        self.send(HubCommand::Connect { session })
    }

    /// Report a closed connection
    pub fn disconnect(&self, session_id: &str, reason: impl Into<String>) {
        let _ = self.send(HubCommand::Disconnect {
            session_id: session_id.to_string(),
            reason: reason.into(),
        });
    }

    /// Forward a decoded client message
    pub fn inbound(&self, session_id: &str, message: ClientMessage) -> Result<(), HubError> {
        self.send(HubCommand::Inbound {
            session_id: session_id.to_string(),
            message,
        })
    }

    /// Report an undecodable client frame
    pub fn protocol_violation(&self, session_id: &str, error: ProtocolError) -> Result<(), HubError> {
        self.send(HubCommand::ProtocolViolation {
            session_id: session_id.to_string(),
            error,
        })
    }

    /// Record a transport-level heartbeat (pong frame)
    pub fn heartbeat(&self, session_id: &str) {
        let _ = self.send(HubCommand::Heartbeat {
            session_id: session_id.to_string(),
        });
    }

    /// Read and parse an origin, then register it as a watched data source
    pub async fn register_source(
        &self,
        id: impl Into<String>,
        title: impl Into<String>,
        origin: Arc<dyn Origin>,
    ) -> Result<SourceSummary, HubError> {
        let id = id.into();
        let reader = Arc::clone(&origin);
        let text = tokio::task::spawn_blocking(move || reader.read())
            .await
            .map_err(|_| OriginError::Interrupted {
                origin: origin.describe(),
            })??;

        let table = self
            .parser
            .parse(&text)
            .map_err(|source| HubError::InvalidTable {
                name: id.clone(),
                source,
            })?;

        self.register_parsed(id, title.into(), origin, table).await
    }

    /// Register a file on disk
    pub async fn register_file(
        &self,
        id: impl Into<String>,
        title: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<SourceSummary, HubError> {
        self.register_source(id, title, Arc::new(FileOrigin::new(path)))
            .await
    }

    /// Store uploaded text and register it as a watched data source
    pub async fn upload(&self, file_name: &str, content: &str) -> Result<SourceSummary, HubError> {
        if content.len() > self.max_upload_bytes {
            return Err(HubError::TooLarge {
                size: content.len(),
                limit: self.max_upload_bytes,
            });
        }

        let name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| HubError::Rejected("missing file name".to_string()))?;

        let table = self
            .parser
            .parse(content)
            .map_err(|source| HubError::InvalidTable {
                name: name.to_string(),
                source,
            })?;

        let id = upload_id(name, Utc::now().timestamp_millis());
        let title = name.strip_suffix(".csv").unwrap_or(name).to_string();
        let path = self.upload_dir.join(format!("{}.csv", id));

        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|source| HubError::Store {
                path: self.upload_dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| HubError::Store {
                path: path.clone(),
                source,
            })?;

        info!(source = %id, path = %path.display(), rows = table.row_count(), "Stored upload");
        self.register_parsed(id, title, Arc::new(FileOrigin::new(path)), table)
            .await
    }

    async fn register_parsed(
        &self,
        id: String,
        title: String,
        origin: Arc<dyn Origin>,
        table: Table,
    ) -> Result<SourceSummary, HubError> {
        self.request(|reply| HubCommand::RegisterSource {
            id,
            title,
            origin,
            table,
            reply,
        })
        .await?
    }

    /// Full snapshot of a data source
    pub async fn snapshot(&self, id: &str) -> Result<SourceSnapshot, HubError> {
        self.request(|reply| HubCommand::Snapshot {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Summaries of every registered source
    pub async fn list_sources(&self) -> Result<Vec<SourceSummary>, HubError> {
        self.request(|reply| HubCommand::ListSources { reply }).await
    }

    /// Signal a source's watcher as if its origin changed
    pub async fn refresh(&self, id: &str) -> Result<(), HubError> {
        self.request(|reply| HubCommand::Refresh {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }

    /// Stop the hub, closing every session and watcher
    pub fn shutdown(&self) {
        let _ = self.send(HubCommand::Shutdown);
    }
}

/// Id assigned to uploaded sources
fn upload_id(file_name: &str, millis: i64) -> String {
    let clean: String = file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("local-{}-{}", clean, millis)
}

struct Hub {
    options: HubOptions,
    tx: mpsc::UnboundedSender<HubCommand>,
    registry: SessionRegistry,
    sources: HashMap<String, DataSource>,
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        info!("Hub started");

        while let Some(command) = rx.recv().await {
            if matches!(command, HubCommand::Shutdown) {
                break;
            }
            self.handle(command);
        }

        for session in self.registry.drain() {
            session.close();
        }
        self.sources.clear();
        info!("Hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { session } => self.on_connect(session),
            HubCommand::Disconnect { session_id, reason } => {
                self.drop_session(&session_id, &reason)
            }
            HubCommand::Inbound {
                session_id,
                message,
            } => self.on_message(&session_id, message),
            HubCommand::ProtocolViolation { session_id, error } => {
                debug!(session = %session_id, "Rejected message: {}", error);
                self.reply(&session_id, ServerMessage::error(error.to_string()));
            }
            HubCommand::Heartbeat { session_id } => {
                self.registry.touch(&session_id);
            }
            HubCommand::HeartbeatTick { session_id } => self.on_heartbeat_tick(&session_id),
            HubCommand::PollTick { session_id } => self.on_poll_tick(&session_id),
            HubCommand::Reparsed(outcome) => self.on_reparsed(outcome),
            HubCommand::RegisterSource {
                id,
                title,
                origin,
                table,
                reply,
            } => {
                let _ = reply.send(self.register(id, title, origin, table));
            }
            HubCommand::Snapshot { id, reply } => {
                let snapshot = self
                    .sources
                    .get(&id)
                    .map(DataSource::snapshot)
                    .ok_or(HubError::UnknownSource(id));
                let _ = reply.send(snapshot);
            }
            HubCommand::ListSources { reply } => {
                let mut summaries: Vec<SourceSummary> = self
                    .sources
                    .values()
                    .map(|s| s.summary(self.registry.subscriber_count(s.id())))
                    .collect();
                summaries.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(summaries);
            }
            HubCommand::Refresh { id, reply } => {
                let result = match self.sources.get(&id) {
                    Some(source) => {
                        source.signal();
                        Ok(())
                    }
                    None => Err(HubError::UnknownSource(id)),
                };
                let _ = reply.send(result);
            }
            HubCommand::Stats { reply } => {
                let subscribed = self
                    .sources
                    .keys()
                    .map(|id| self.registry.subscriber_count(id))
                    .sum();
                let _ = reply.send(HubStats {
                    sessions: self.registry.len(),
                    subscribed,
                    sources: self.sources.len(),
                });
            }
            HubCommand::Shutdown => {}
        }
    }

    fn register(
        &mut self,
        id: String,
        title: String,
        origin: Arc<dyn Origin>,
        table: Table,
    ) -> Result<SourceSummary, HubError> {
        if self.sources.contains_key(&id) {
            return Err(HubError::DuplicateSource(id));
        }

        let tx = self.tx.clone();
        let watcher = SourceWatcher::spawn(
            id.clone(),
            Arc::clone(&origin),
            WatchOptions {
                debounce: self.options.debounce,
                parse: self.options.parse.clone(),
                watch_filesystem: self.options.watch_filesystem,
            },
            move |outcome| tx.send(HubCommand::Reparsed(outcome)).is_ok(),
        );

        let mut source = DataSource::new(id.clone(), title, table, origin);
        source.attach_watcher(watcher);
        let summary = source.summary(0);

        info!(source = %id, origin = %summary.origin, rows = summary.row_count, "Data source registered");
        self.sources.insert(id, source);
        Ok(summary)
    }

    fn on_connect(&mut self, mut session: Session) {
        let session_id = session.id().to_string();

        let tx = self.tx.clone();
        let id = session_id.clone();
        let period = self.options.session_ping_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let tick = HubCommand::HeartbeatTick {
                    session_id: id.clone(),
                };
                if tx.send(tick).is_err() {
                    break;
                }
            }
        });
        session.timers_mut().set_heartbeat(heartbeat.abort_handle());

        if let Err(e) = session.send(ServerMessage::connection(&session_id)) {
            warn!(session = %session_id, "Could not greet session: {}", e);
            return;
        }

        info!(session = %session_id, "Session connected");
        self.registry.register(session);
    }

    fn on_message(&mut self, session_id: &str, message: ClientMessage) {
        if !self.registry.touch(session_id) {
            debug!(session = %session_id, kind = message.kind(), "Message for unknown session");
            return;
        }

        match message {
            ClientMessage::StartSync {
                data_source_id,
                collection_id,
                config,
            } => self.start_sync(session_id, data_source_id, collection_id, config),
            ClientMessage::StopSync => {
                if let Some(previous) = self.registry.unsubscribe(session_id) {
                    info!(session = %session_id, source = %previous.data_source_id, "Sync stopped");
                    self.reap_source(&previous.data_source_id);
                }
                self.reply(
                    session_id,
                    ServerMessage::SyncStopped {
                        timestamp: Utc::now(),
                    },
                );
            }
            ClientMessage::Ping => self.reply(session_id, ServerMessage::pong()),
            ClientMessage::RequestData { data_source_id } => {
                let message = match self.sources.get(&data_source_id) {
                    Some(source) => {
                        ServerMessage::sheet_data(source.id(), source.title(), source.table())
                    }
                    None => ServerMessage::error(
                        HubError::UnknownSource(data_source_id).to_string(),
                    ),
                };
                self.reply(session_id, message);
            }
        }
    }

    fn start_sync(
        &mut self,
        session_id: &str,
        data_source_id: String,
        collection_id: String,
        config: SyncConfig,
    ) {
        if !self.sources.contains_key(&data_source_id) {
            self.reply(
                session_id,
                ServerMessage::error(HubError::UnknownSource(data_source_id).to_string()),
            );
            return;
        }

        let previous = self
            .registry
            .get(session_id)
            .and_then(|s| s.subscription())
            .map(|s| s.data_source_id.clone());

        let poll = config
            .sync_interval_ms
            .map(|ms| Duration::from_millis(ms).max(self.options.min_poll_interval));
        self.registry
            .subscribe(session_id, &data_source_id, &collection_id, config);

        if let Some(period) = poll {
            let tx = self.tx.clone();
            let id = session_id.to_string();
            let timer = tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let tick = HubCommand::PollTick {
                        session_id: id.clone(),
                    };
                    if tx.send(tick).is_err() {
                        break;
                    }
                }
            });
            if let Some(session) = self.registry.get_mut(session_id) {
                session.timers_mut().set_poll(timer.abort_handle());
            }
            debug!(session = %session_id, interval = ?period, "Polling enabled");
        }

        info!(session = %session_id, source = %data_source_id, collection = %collection_id, "Sync started");
        self.reply(
            session_id,
            ServerMessage::SyncStarted {
                data_source_id,
                collection_id,
                timestamp: Utc::now(),
            },
        );

        if let Some(previous) = previous {
            self.reap_source(&previous);
        }
    }

    fn on_heartbeat_tick(&mut self, session_id: &str) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };

        let silent = session.last_heartbeat().elapsed();
        if silent > self.options.session_timeout {
            warn!(session = %session_id, silent = ?silent, "Session timed out");
            session.close();
            self.drop_session(session_id, "heartbeat timeout");
            return;
        }

        if let Err(e) = session.ping() {
            self.drop_session(session_id, &e.to_string());
        }
    }

    fn on_poll_tick(&mut self, session_id: &str) {
        let source = self
            .registry
            .get(session_id)
            .and_then(|s| s.subscription())
            .and_then(|sub| self.sources.get(&sub.data_source_id));
        if let Some(source) = source {
            source.signal();
        }
    }

    fn on_reparsed(&mut self, outcome: CycleOutcome) {
        let CycleOutcome { source_id, result } = outcome;

        let table = match result {
            Ok(table) => table,
            Err(CycleError::Origin(e)) if e.is_removed() => {
                if let Some(source) = self.sources.get_mut(&source_id) {
                    source.mark_origin_removed();
                }
                self.reap_source(&source_id);
                return;
            }
            // Already logged by the watcher; the cached table stays
            Err(_) => return,
        };

        let Some(source) = self.sources.get_mut(&source_id) else {
            return;
        };
        let update = source.apply(table);
        if update.is_empty() {
            debug!(source = %source_id, "No changes");
            return;
        }

        let report = dispatch(&self.registry, &source_id, &update);
        for (session_id, error) in report.failed {
            self.drop_session(&session_id, &error.to_string());
        }
    }

    /// Reply to one session; a failed reply drops the session
    fn reply(&mut self, session_id: &str, message: ServerMessage) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        if let Err(e) = session.send(message) {
            self.drop_session(session_id, &e.to_string());
        }
    }

    fn drop_session(&mut self, session_id: &str, reason: &str) {
        let Some(session) = self.registry.unregister(session_id) else {
            return;
        };
        info!(session = %session_id, reason = %reason, "Session closed");

        let source_id = session.subscription().map(|s| s.data_source_id.clone());
        drop(session);
        if let Some(source_id) = source_id {
            self.reap_source(&source_id);
        }
    }

    /// Remove a source whose origin is gone and that nobody watches
    fn reap_source(&mut self, source_id: &str) {
        let Some(source) = self.sources.get(source_id) else {
            return;
        };
        if !source.is_origin_removed() || self.registry.subscriber_count(source_id) > 0 {
            return;
        }

        info!(source = %source_id, "Origin removed and no subscribers, dropping data source");
        self.sources.remove(source_id);
    }
}
