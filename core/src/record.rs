use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::transfer::TransferProgress;

pub type RecordId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Active,
    Paused,
    Extracting,
    Converting,
    Relocating,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Active => "active",
            TransferStatus::Paused => "paused",
            TransferStatus::Extracting => "extracting",
            TransferStatus::Converting => "converting",
            TransferStatus::Relocating => "relocating",
            TransferStatus::Completed => "completed",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransferStatus::Pending),
            "active" => Some(TransferStatus::Active),
            "paused" => Some(TransferStatus::Paused),
            "extracting" => Some(TransferStatus::Extracting),
            "converting" => Some(TransferStatus::Converting),
            "relocating" => Some(TransferStatus::Relocating),
            "completed" => Some(TransferStatus::Completed),
            "cancelled" => Some(TransferStatus::Cancelled),
            "failed" => Some(TransferStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed
        )
    }

    pub fn is_post_processing(&self) -> bool {
        matches!(
            self,
            TransferStatus::Extracting | TransferStatus::Converting | TransferStatus::Relocating
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical download, from submission to its terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: RecordId,
    pub url: String,
    pub filename: String,
    pub destination: PathBuf,
    pub status: TransferStatus,
    pub total_bytes: u64,
    pub received_bytes: u64,
    pub progress_percent: f64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: f64,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub updated_at: u64,
}

impl TransferRecord {
    pub fn new(url: String, filename: String, destination: PathBuf) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            url,
            filename,
            destination,
            status: TransferStatus::Pending,
            total_bytes: 0,
            received_bytes: 0,
            progress_percent: 0.0,
            speed_bytes_per_sec: 0.0,
            eta_seconds: 0.0,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Resets the byte counters for a fresh engine run and marks the record pending.
    pub fn requeue(&mut self) {
        self.status = TransferStatus::Pending;
        self.received_bytes = 0;
        self.progress_percent = 0.0;
        self.last_error = None;
        self.completed_at = None;
        self.clear_rate();
        self.touch();
    }

    pub fn start(&mut self) {
        self.status = TransferStatus::Active;
        self.received_bytes = 0;
        self.progress_percent = 0.0;
        self.last_error = None;
        self.started_at = Some(now_millis());
        self.clear_rate();
        self.touch();
    }

    pub fn apply_progress(&mut self, progress: &TransferProgress) {
        if progress.total_bytes > 0 {
            self.total_bytes = progress.total_bytes;
        }
        // Late samples from a slower reporter tick never move the counter back.
        self.received_bytes = self.received_bytes.max(progress.received_bytes);
        if self.total_bytes > 0 {
            self.received_bytes = self.received_bytes.min(self.total_bytes);
        }
        self.progress_percent = progress_percent(self.received_bytes, self.total_bytes);
        self.speed_bytes_per_sec = progress.speed_bytes_per_sec;
        self.eta_seconds = progress.eta_seconds;
        self.touch();
    }

    pub fn pause(&mut self) {
        self.status = TransferStatus::Paused;
        self.clear_rate();
        self.touch();
    }

    /// Enters a post-processing phase. The bytes are all in at this point.
    pub fn enter_stage(&mut self, stage: TransferStatus) {
        self.status = stage;
        self.progress_percent = 100.0;
        self.clear_rate();
        self.touch();
    }

    pub fn complete(&mut self, total_bytes: u64) {
        if total_bytes > 0 {
            self.total_bytes = total_bytes;
        }
        self.received_bytes = self.total_bytes;
        self.status = TransferStatus::Completed;
        self.progress_percent = 100.0;
        self.last_error = None;
        self.completed_at = Some(now_millis());
        self.clear_rate();
        self.touch();
    }

    pub fn cancel(&mut self) {
        self.status = TransferStatus::Cancelled;
        self.clear_rate();
        self.touch();
    }

    pub fn fail(&mut self, error: String) {
        self.status = TransferStatus::Failed;
        self.last_error = Some(error);
        self.clear_rate();
        self.touch();
    }

    fn clear_rate(&mut self) {
        self.speed_bytes_per_sec = 0.0;
        self.eta_seconds = 0.0;
    }
}

/// `min(100, received / total * 100)`, or 0 while the total is unknown.
pub fn progress_percent(received: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((received as f64 / total as f64) * 100.0).min(100.0)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(received: u64, total: u64) -> TransferProgress {
        TransferProgress {
            received_bytes: received,
            total_bytes: total,
            speed_bytes_per_sec: 10.0,
            eta_seconds: 1.0,
        }
    }

    fn record() -> TransferRecord {
        TransferRecord::new(
            "https://example.com/a.bin".to_string(),
            "a.bin".to_string(),
            PathBuf::from("/tmp/a.bin"),
        )
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::Active,
            TransferStatus::Paused,
            TransferStatus::Extracting,
            TransferStatus::Converting,
            TransferStatus::Relocating,
            TransferStatus::Completed,
            TransferStatus::Cancelled,
            TransferStatus::Failed,
        ] {
            assert_eq!(TransferStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TransferStatus::from_str("bogus"), None);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(progress_percent(0, 0), 0.0);
        assert_eq!(progress_percent(50, 200), 25.0);
        assert_eq!(progress_percent(300, 200), 100.0);
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut record = record();
        record.start();
        record.apply_progress(&sample(60, 100));
        record.apply_progress(&sample(40, 100));
        assert_eq!(record.received_bytes, 60);
        assert_eq!(record.progress_percent, 60.0);
        record.apply_progress(&sample(150, 100));
        assert_eq!(record.received_bytes, 100);
        assert_eq!(record.progress_percent, 100.0);
    }

    #[test]
    fn failure_keeps_error_until_restart() {
        let mut record = record();
        record.start();
        record.fail("HTTP 500".to_string());
        assert_eq!(record.status, TransferStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("HTTP 500"));
        record.requeue();
        assert_eq!(record.status, TransferStatus::Pending);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn completion_fills_counters() {
        let mut record = record();
        record.start();
        record.apply_progress(&sample(10, 100));
        record.complete(100);
        assert_eq!(record.received_bytes, 100);
        assert_eq!(record.progress_percent, 100.0);
        assert_eq!(record.speed_bytes_per_sec, 0.0);
        assert!(record.completed_at.is_some());
        assert!(record.status.is_terminal());
    }
}
