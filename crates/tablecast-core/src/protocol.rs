//! Wire protocol message types
//!
//! JSON objects exchanged over the WebSocket, discriminated by their
//! `type` field. Unknown types are rejected with a [`ProtocolError`]
//! rather than ignored.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::table::{DiffSet, Table};

/// Session identifier assigned by the server on connect
pub type SessionId = String;

/// Per-session sync options sent with `start-sync`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Polling fallback interval in milliseconds
    #[serde(
        rename = "syncInterval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sync_interval_ms: Option<u64>,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Subscribe this session to a data source
    #[serde(rename = "start-sync")]
    StartSync {
        #[serde(rename = "dataSourceId")]
        data_source_id: String,
        #[serde(rename = "collectionId")]
        collection_id: String,
        #[serde(default)]
        config: SyncConfig,
    },

    /// Drop this session's subscription
    #[serde(rename = "stop-sync")]
    StopSync,

    /// Application-level liveness probe
    #[serde(rename = "ping")]
    Ping,

    /// Ask for a full snapshot of a data source
    #[serde(rename = "request-data")]
    RequestData {
        #[serde(rename = "dataSourceId")]
        data_source_id: String,
    },
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Greeting carrying the session id
    #[serde(rename = "connection")]
    Connection {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Subscription accepted
    #[serde(rename = "sync-started")]
    SyncStarted {
        #[serde(rename = "dataSourceId")]
        data_source_id: String,
        #[serde(rename = "collectionId")]
        collection_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Subscription dropped
    #[serde(rename = "sync-stopped")]
    SyncStopped { timestamp: DateTime<Utc> },

    /// Cell changes for a subscribed data source
    #[serde(rename = "sheet-update")]
    SheetUpdate {
        #[serde(rename = "dataSourceId")]
        data_source_id: String,
        #[serde(rename = "collectionId")]
        collection_id: String,
        changes: DiffSet,
        /// Present only when the header row changed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<Vec<String>>,
        timestamp: DateTime<Utc>,
    },

    /// Full snapshot in reply to `request-data`
    #[serde(rename = "sheet-data")]
    SheetData {
        #[serde(rename = "dataSourceId")]
        data_source_id: String,
        title: String,
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
        timestamp: DateTime<Utc>,
    },

    /// Reply to `ping`
    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },

    /// Request could not be handled; the connection stays open
    #[serde(rename = "error")]
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ClientMessage {
    const KINDS: &'static [&'static str] = &["start-sync", "stop-sync", "ping", "request-data"];

    /// Create a start-sync message
    pub fn start_sync(
        data_source_id: impl Into<String>,
        collection_id: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        ClientMessage::StartSync {
            data_source_id: data_source_id.into(),
            collection_id: collection_id.into(),
            config,
        }
    }

    /// Decode from JSON text
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_tagged(text, Self::KINDS)
    }

    /// Encode to JSON text
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::StartSync { .. } => "start-sync",
            ClientMessage::StopSync => "stop-sync",
            ClientMessage::Ping => "ping",
            ClientMessage::RequestData { .. } => "request-data",
        }
    }
}

impl ServerMessage {
    const KINDS: &'static [&'static str] = &[
        "connection",
        "sync-started",
        "sync-stopped",
        "sheet-update",
        "sheet-data",
        "pong",
        "error",
    ];

    /// Create the greeting sent on connect
    pub fn connection(session_id: &str) -> Self {
        ServerMessage::Connection {
            session_id: session_id.to_string(),
            message: "Connected to tablecast".to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Create an error message
    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a pong
    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: Utc::now(),
        }
    }

    /// Create a full snapshot message
    pub fn sheet_data(data_source_id: &str, title: &str, table: &Table) -> Self {
        ServerMessage::SheetData {
            data_source_id: data_source_id.to_string(),
            title: title.to_string(),
            headers: table.headers().to_vec(),
            rows: table.rows().to_vec(),
            timestamp: Utc::now(),
        }
    }

    /// Decode from JSON text
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_tagged(text, Self::KINDS)
    }

    /// Encode to JSON text
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Decode a `type`-tagged message, distinguishing unknown types from
/// malformed known ones
fn decode_tagged<T: DeserializeOwned>(text: &str, kinds: &[&str]) -> Result<T, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    };
    let kind = object
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !kinds.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
        kind,
        details: e.to_string(),
    })
}
