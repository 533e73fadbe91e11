//! Client side: a reconnecting WebSocket connection to a tablecast server

mod backoff;
mod connection;

pub use backoff::BackoffPolicy;
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState,
};
