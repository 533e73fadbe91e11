//! tablecast Core Library
//!
//! Live change capture for tabular files: a server watches table origins,
//! re-parses them when they change, computes cell-level diffs, and fans
//! the diffs out over WebSocket to the sessions subscribed to each
//! source. A reconnecting client is included.
//!
//! # Architecture
//!
//! - **Hub**: one task owns every data source and the session registry;
//!   everything else talks to it through commands.
//! - **Watchers**: one per source, debouncing change notifications into
//!   re-parse cycles.
//! - **Sessions**: one WebSocket connection each, with a bounded outbound
//!   queue, so a slow peer never delays the others.
//!
//! # Quick Start
//!
//! ```text
//! let server = tablecast_core::server::start(HubOptions::default(), "127.0.0.1:3001", "127.0.0.1:3002").await?;
//! server.hub.register_file("colors", "Colors", "colors.csv").await?;
//!
//! let handle = ConnectionManager::new(ConnectionConfig::default()).connect();
//! handle.start_sync("colors", "collection-1", SyncConfig::default())?;
//! ```
//!
//! # Modules
//!
//! - `table`: Table model, parser, and diff engine
//! - `source`: Origins, data sources, and the debounced watcher
//! - `protocol`: Wire messages
//! - `server`: Hub, sessions, dispatch, WebSocket and HTTP listeners
//! - `client`: Reconnecting connection manager
//! - `config`: Application configuration

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod source;
pub mod table;

pub use client::{ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState};
pub use config::Config;
pub use error::{ConnectionError, HubError, OriginError, ParseError, ProtocolError, TransportError};
pub use protocol::{ClientMessage, ServerMessage, SyncConfig};
pub use server::{HubHandle, HubOptions, RunningServer};
pub use source::{DataSource, FileOrigin, MemoryOrigin, Origin};
pub use table::{diff, CellChange, DiffSet, ParseOptions, Table, TableParser};
