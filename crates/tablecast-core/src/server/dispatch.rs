//! Broadcast dispatcher
//!
//! Fans one source update out to every subscribed session. Each delivery
//! is independent: a closed or full queue on one session is recorded and
//! the rest still receive the update.

use chrono::Utc;
use tracing::{debug, warn};

use super::registry::SessionRegistry;
use crate::error::TransportError;
use crate::protocol::{ServerMessage, SessionId};
use crate::source::SourceUpdate;

/// Outcome of one dispatch
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Sessions the update was queued for
    pub delivered: usize,
    /// Sessions whose transport rejected the update
    pub failed: Vec<(SessionId, TransportError)>,
}

impl DispatchReport {
    pub fn failed_sessions(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|(id, _)| id.as_str())
    }
}

/// Queue a `sheet-update` for every session subscribed to `data_source_id`
pub fn dispatch(
    registry: &SessionRegistry,
    data_source_id: &str,
    update: &SourceUpdate,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    let timestamp = Utc::now();

    for session in registry.sessions_for(data_source_id) {
        let Some(subscription) = session.subscription() else {
            continue;
        };

        let message = ServerMessage::SheetUpdate {
            data_source_id: data_source_id.to_string(),
            collection_id: subscription.collection_id.clone(),
            changes: update.changes.clone(),
            headers: update.headers.clone(),
            timestamp,
        };

        match session.send(message) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(session = %session.id(), source = %data_source_id, "Delivery failed: {}", e);
                report.failed.push((session.id().to_string(), e));
            }
        }
    }

    debug!(
        source = %data_source_id,
        cells = update.changes.len(),
        delivered = report.delivered,
        failed = report.failed.len(),
        "Dispatched update"
    );

    report
}
