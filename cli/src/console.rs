use std::sync::Mutex;
use std::time::{Duration, Instant};

use fetchq_core::{EventSink, TransferEvent, TransferRecord};

const PROGRESS_EVERY: Duration = Duration::from_secs(1);

/// Prints lifecycle events to stdout, progress at most once a second.
#[derive(Default)]
pub struct ConsoleSink {
    last_progress: Mutex<Option<Instant>>,
}

impl ConsoleSink {
    fn progress_due(&self) -> bool {
        let Ok(mut last) = self.last_progress.lock() else {
            return false;
        };
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < PROGRESS_EVERY => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: TransferEvent) {
        match &event {
            TransferEvent::Progress(record) => {
                if record.status.is_post_processing() || self.progress_due() {
                    println!("{}", progress_line(record));
                }
            }
            TransferEvent::Removed { id } => println!("removed {}", id),
            TransferEvent::Error(record) => println!(
                "failed {} {}: {}",
                short_id(record),
                record.filename,
                record.last_error.as_deref().unwrap_or("unknown error")
            ),
            TransferEvent::Completed(record) => println!(
                "completed {} {} -> {}",
                short_id(record),
                format_bytes(record.total_bytes),
                record.destination.display()
            ),
            other => {
                if let Some(record) = other.record() {
                    println!("{} {} {}", other.kind(), short_id(record), record.filename);
                }
            }
        }
    }
}

pub fn progress_line(record: &TransferRecord) -> String {
    let percent = if record.total_bytes > 0 {
        format!("{:.1}%", record.progress_percent)
    } else {
        "--".to_string()
    };
    let total = if record.total_bytes > 0 {
        format_bytes(record.total_bytes)
    } else {
        "?".to_string()
    };
    let eta = if record.eta_seconds > 0.0 {
        format_duration(record.eta_seconds.round() as u64)
    } else {
        "--:--".to_string()
    };
    format!(
        "[{}] {} {} {}/{} ({}/s) eta {} {}",
        record.status,
        short_id(record),
        percent,
        format_bytes(record.received_bytes),
        total,
        format_bytes(record.speed_bytes_per_sec as u64),
        eta,
        record.filename
    )
}

fn short_id(record: &TransferRecord) -> String {
    record.id.to_string()[..8].to_string()
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

pub fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn formats_sizes_and_durations() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00MB");
        assert_eq!(format_duration(65), "01:05");
        assert_eq!(format_duration(3725), "01:02:05");
    }

    #[test]
    fn progress_line_handles_unknown_size() {
        let record = TransferRecord::new(
            "http://example.com/a.bin".to_string(),
            "a.bin".to_string(),
            PathBuf::from("/tmp/a.bin"),
        );
        let line = progress_line(&record);
        assert!(line.starts_with("[pending] "));
        assert!(line.contains(" -- 0B/? (0B/s) eta --:-- a.bin"));
    }
}
