//! Error types
//!
//! One error enum per concern. Parse and origin errors make a watcher
//! cycle a no-op, transport errors stay inside one session, protocol
//! errors are answered on the wire, and connection errors surface to the
//! client's caller.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while scanning delimited text into a table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Input ended while still inside a quoted field
    #[error("Unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },

    /// Input contained no non-blank rows
    #[error("Table is empty")]
    Empty,
}

/// Errors reading a data source's backing origin
#[derive(Error, Debug)]
pub enum OriginError {
    /// The origin no longer exists
    #[error("Origin '{origin}' not found")]
    NotFound { origin: String },

    /// The origin exists but could not be read
    #[error("Failed to read origin '{origin}': {source}")]
    Unreadable {
        origin: String,
        #[source]
        source: io::Error,
    },

    /// The blocking read task was cancelled or panicked
    #[error("Read of origin '{origin}' was interrupted")]
    Interrupted { origin: String },
}

impl OriginError {
    /// Classify an I/O error for the given origin description
    pub fn from_io(error: io::Error, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        match error.kind() {
            io::ErrorKind::NotFound => OriginError::NotFound { origin },
            _ => OriginError::Unreadable {
                origin,
                source: error,
            },
        }
    }

    /// Whether the origin is gone for good (as opposed to a transient failure)
    pub fn is_removed(&self) -> bool {
        matches!(self, OriginError::NotFound { .. })
    }
}

/// Why a single watcher cycle produced no table
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Origin(#[from] OriginError),
}

/// Errors delivering a frame to one session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The session's writer has gone away
    #[error("Session transport closed")]
    Closed,

    /// The session's outbound queue is full (slow or wedged peer)
    #[error("Session outbound queue full ({capacity} frames)")]
    Backpressure { capacity: usize },

    /// Writing to the socket failed
    #[error("Socket write failed: {0}")]
    Write(String),
}

/// Errors decoding an inbound wire message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not valid JSON, or not an object
    #[error("Invalid message format: {0}")]
    Malformed(String),

    /// The `type` field is missing
    #[error("Message has no type")]
    MissingType,

    /// The `type` field names no known message
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Known type with missing or ill-typed fields
    #[error("Invalid '{kind}' message: {details}")]
    InvalidFields { kind: String, details: String },

    /// Binary frames are not part of the protocol
    #[error("Binary frames are not supported")]
    BinaryFrame,
}

/// Client-side connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Opening the socket failed
    #[error("Failed to connect to {url}: {details}")]
    Connect { url: String, details: String },

    /// Connect or identify did not finish in time
    #[error("Timed out after {0:?} waiting for the server")]
    ConnectTimeout(Duration),

    /// Server closed the socket before identifying the session
    #[error("Server closed the connection during handshake")]
    HandshakeClosed,

    /// No pong arrived within the heartbeat timeout
    #[error("Heartbeat not acknowledged within {0:?}")]
    HeartbeatTimeout(Duration),

    /// Send or receive failure on an open connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Retry budget spent; terminal
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The connection task is not running
    #[error("Connection manager has stopped")]
    Stopped,
}

impl ConnectionError {
    /// Whether the manager should keep retrying after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::ReconnectExhausted { .. } | ConnectionError::Stopped
        )
    }
}

/// Errors returned by hub requests (registration, snapshots)
#[derive(Error, Debug)]
pub enum HubError {
    /// No data source with that id
    #[error("Data source '{0}' not found")]
    UnknownSource(String),

    /// A data source with that id is already registered
    #[error("Data source '{0}' already exists")]
    DuplicateSource(String),

    /// The initial parse of a new source failed
    #[error("Failed to parse '{name}': {source}")]
    InvalidTable {
        name: String,
        #[source]
        source: ParseError,
    },

    /// The new source's origin could not be read
    #[error(transparent)]
    Origin(#[from] OriginError),

    /// Writing an uploaded file failed
    #[error("Failed to store upload at '{path}': {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Upload exceeds the configured size limit
    #[error("Upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    /// Upload rejected before parsing
    #[error("Upload rejected: {0}")]
    Rejected(String),

    /// The hub task has shut down
    #[error("Hub is not running")]
    Stopped,
}
