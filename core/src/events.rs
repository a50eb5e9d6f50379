use std::sync::mpsc::Sender;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::record::{RecordId, TransferRecord};

/// Notification emitted by the scheduler. Every variant except `Removed`
/// carries a full snapshot of the record at the time of the event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TransferEvent {
    Started(TransferRecord),
    Queued(TransferRecord),
    Progress(TransferRecord),
    Completed(TransferRecord),
    Paused(TransferRecord),
    Cancelled(TransferRecord),
    Error(TransferRecord),
    Removed { id: RecordId },
}

impl TransferEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TransferEvent::Started(_) => "started",
            TransferEvent::Queued(_) => "queued",
            TransferEvent::Progress(_) => "progress",
            TransferEvent::Completed(_) => "completed",
            TransferEvent::Paused(_) => "paused",
            TransferEvent::Cancelled(_) => "cancelled",
            TransferEvent::Error(_) => "error",
            TransferEvent::Removed { .. } => "removed",
        }
    }

    pub fn record_id(&self) -> RecordId {
        match self {
            TransferEvent::Started(record)
            | TransferEvent::Queued(record)
            | TransferEvent::Progress(record)
            | TransferEvent::Completed(record)
            | TransferEvent::Paused(record)
            | TransferEvent::Cancelled(record)
            | TransferEvent::Error(record) => record.id,
            TransferEvent::Removed { id } => *id,
        }
    }

    pub fn record(&self) -> Option<&TransferRecord> {
        match self {
            TransferEvent::Removed { .. } => None,
            TransferEvent::Started(record)
            | TransferEvent::Queued(record)
            | TransferEvent::Progress(record)
            | TransferEvent::Completed(record)
            | TransferEvent::Paused(record)
            | TransferEvent::Cancelled(record)
            | TransferEvent::Error(record) => Some(record),
        }
    }
}

/// Receives scheduler notifications. Called with no scheduler lock held.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TransferEvent);
}

#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: TransferEvent) {}
}

/// Writes lifecycle events to the tracing subscriber.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: TransferEvent) {
        match &event {
            TransferEvent::Progress(record) => debug!(
                id = %record.id,
                received = record.received_bytes,
                total = record.total_bytes,
                "progress"
            ),
            TransferEvent::Removed { id } => info!(%id, "removed"),
            TransferEvent::Error(record) => warn!(
                id = %record.id,
                error = record.last_error.as_deref().unwrap_or(""),
                "transfer error"
            ),
            other => {
                if let Some(record) = other.record() {
                    info!(id = %record.id, status = %record.status, "{}", other.kind());
                }
            }
        }
    }
}

/// Forwards events over an mpsc channel. A dropped receiver is ignored.
pub struct ChannelSink {
    sender: Mutex<Sender<TransferEvent>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<TransferEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: TransferEvent) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event);
        }
    }
}
