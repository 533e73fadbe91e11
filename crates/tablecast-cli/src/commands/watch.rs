//! Watch command handler
//!
//! Subscribes to one data source and prints updates as they arrive,
//! reconnecting as the connection manager sees fit.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::RecvError;

use tablecast_core::client::{ConnectionEvent, ConnectionManager, ConnectionState};
use tablecast_core::{Config, ServerMessage, SyncConfig};

use crate::output::Output;

/// Watch a data source until interrupted
pub async fn run(
    config: &Config,
    source: String,
    collection: String,
    interval_ms: Option<u64>,
    url: Option<String>,
    output: &Output,
) -> Result<()> {
    let mut connection = config.connection_config();
    if let Some(url) = url {
        connection.url = url;
    }

    output.message(&format!("Connecting to {}...", connection.url));

    let manager = ConnectionManager::new(connection);
    let mut events = manager.subscribe();
    let handle = manager.connect();
    handle.start_sync(
        &source,
        &collection,
        SyncConfig {
            sync_interval_ms: interval_ms,
        },
    )?;

    // Header row, learned from the first snapshot and header changes
    let mut headers: Vec<String> = Vec::new();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                handle.close().await;
                output.success("Stopped watching");
                return Ok(());
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                output.message(&format!("Output fell behind, skipped {} event(s)", missed));
                continue;
            }
            Err(RecvError::Closed) => bail!("Connection manager stopped"),
        };

        match event {
            ConnectionEvent::Connected { session_id } => {
                output.message(&format!("Connected (session {})", session_id));
            }
            ConnectionEvent::Message(message) => {
                on_message(message, &mut headers, &source, &handle, output)?;
            }
            ConnectionEvent::Disconnected { reason } => {
                output.message(&format!("Disconnected: {}", reason));
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                output.message(&format!(
                    "Reconnecting in {} (attempt {})",
                    format_delay(delay),
                    attempt
                ));
            }
            ConnectionEvent::Error(e) => {
                if handle.state() == ConnectionState::Failed {
                    bail!("{}", e);
                }
                output.message(&format!("Error: {}", e));
            }
            ConnectionEvent::StateChanged(_) => {}
        }
    }
}

fn on_message(
    message: ServerMessage,
    headers: &mut Vec<String>,
    source: &str,
    handle: &tablecast_core::ConnectionHandle,
    output: &Output,
) -> Result<()> {
    match message {
        ServerMessage::SyncStarted {
            data_source_id,
            collection_id,
            ..
        } => {
            output.success(&format!(
                "Watching {} (collection {})",
                data_source_id, collection_id
            ));
            // Column names for the change listing
            handle.send(tablecast_core::ClientMessage::RequestData {
                data_source_id: source.to_string(),
            })?;
        }
        ServerMessage::SheetData {
            headers: current, ..
        } => {
            *headers = current;
        }
        ServerMessage::SheetUpdate {
            changes,
            headers: changed,
            timestamp,
            ..
        } => {
            if let Some(changed) = changed {
                output.message(&format!("Header row changed: {}", changed.join(", ")));
                *headers = changed;
            }
            let label = timestamp.format("%H:%M:%S").to_string();
            output.print_changes(&label, &changes, headers);
        }
        ServerMessage::Error { error, .. } => {
            output.message(&format!("Server error: {}", error));
        }
        ServerMessage::SyncStopped { .. }
        | ServerMessage::Pong { .. }
        | ServerMessage::Connection { .. } => {}
    }
    Ok(())
}

fn format_delay(delay: Duration) -> String {
    if delay.as_millis() < 1000 {
        format!("{}ms", delay.as_millis())
    } else {
        format!("{}s", delay.as_secs())
    }
}
