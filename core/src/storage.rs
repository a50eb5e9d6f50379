use crate::config::{Settings, SettingsPatch};
use crate::error::{CoreError, CoreResult};
use crate::record::{progress_percent, RecordId, TransferRecord, TransferStatus};

#[cfg(feature = "sqlite")]
use rusqlite::params;
#[cfg(feature = "sqlite")]
use std::path::PathBuf;

/// Persisted history and settings.
///
/// `add_record` enforces the history cap by evicting the oldest terminal
/// records and returns their ids. `update_record` only touches records that are
/// still stored, so a late write never resurrects a removed record.
pub trait RecordStore: Send {
    fn add_record(&mut self, record: &TransferRecord) -> CoreResult<Vec<RecordId>>;
    fn update_record(&mut self, record: &TransferRecord) -> CoreResult<()>;
    fn remove_record(&mut self, id: &RecordId) -> CoreResult<()>;
    /// Newest first.
    fn list_records(&self) -> CoreResult<Vec<TransferRecord>>;

    fn settings(&self) -> CoreResult<Settings>;
    fn save_settings(&mut self, settings: &Settings) -> CoreResult<()>;

    fn update_settings(&mut self, patch: &SettingsPatch) -> CoreResult<Settings> {
        let mut settings = self.settings()?;
        settings.apply(patch);
        self.save_settings(&settings)?;
        Ok(settings)
    }

    fn reset_settings(&mut self) -> CoreResult<Settings> {
        let settings = Settings::default();
        self.save_settings(&settings)?;
        Ok(settings)
    }
}

/// Picks eviction victims from a newest-first listing.
fn eviction_candidates(newest_first: &[(RecordId, TransferStatus)], cap: usize) -> Vec<RecordId> {
    if newest_first.len() <= cap {
        return Vec::new();
    }
    let excess = newest_first.len() - cap;
    newest_first
        .iter()
        .rev()
        .filter(|(_, status)| status.is_terminal())
        .take(excess)
        .map(|(id, _)| *id)
        .collect()
}

#[derive(Default)]
pub struct MemoryStore {
    records: Vec<TransferRecord>,
    settings: Settings,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            records: Vec::new(),
            settings,
        }
    }
}

impl RecordStore for MemoryStore {
    fn add_record(&mut self, record: &TransferRecord) -> CoreResult<Vec<RecordId>> {
        self.records.retain(|existing| existing.id != record.id);
        self.records.insert(0, record.clone());

        let listing: Vec<(RecordId, TransferStatus)> =
            self.records.iter().map(|r| (r.id, r.status)).collect();
        let evicted = eviction_candidates(&listing, self.settings.max_history);
        self.records.retain(|r| !evicted.contains(&r.id));
        Ok(evicted)
    }

    fn update_record(&mut self, record: &TransferRecord) -> CoreResult<()> {
        if let Some(existing) = self.records.iter_mut().find(|r| r.id == record.id) {
            *existing = record.clone();
        }
        Ok(())
    }

    fn remove_record(&mut self, id: &RecordId) -> CoreResult<()> {
        self.records.retain(|r| &r.id != id);
        Ok(())
    }

    fn list_records(&self) -> CoreResult<Vec<TransferRecord>> {
        Ok(self.records.clone())
    }

    fn settings(&self) -> CoreResult<Settings> {
        Ok(self.settings.clone())
    }

    fn save_settings(&mut self, settings: &Settings) -> CoreResult<()> {
        self.settings = settings.clone();
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub struct SqliteStore {
    pub path: PathBuf,
}

#[cfg(feature = "sqlite")]
impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let store = Self { path: path.into() };
        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
            }
        }
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path).map_err(|err| CoreError::Storage(err.to_string()))
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                filename TEXT NOT NULL,
                destination TEXT NOT NULL,
                status TEXT NOT NULL,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                received_bytes INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn listing(conn: &rusqlite::Connection) -> CoreResult<Vec<(RecordId, TransferStatus)>> {
        let mut stmt = conn
            .prepare("SELECT id, status FROM records ORDER BY seq DESC")
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        let mut listing = Vec::new();
        for row in rows {
            let (id, status) = row.map_err(|err| CoreError::Storage(err.to_string()))?;
            let id = RecordId::parse_str(&id).map_err(|_| CoreError::Storage(id.clone()))?;
            let status = TransferStatus::from_str(&status)
                .ok_or_else(|| CoreError::Storage(format!("unknown status {}", status)))?;
            listing.push((id, status));
        }
        Ok(listing)
    }
}

#[cfg(feature = "sqlite")]
impl RecordStore for SqliteStore {
    fn add_record(&mut self, record: &TransferRecord) -> CoreResult<Vec<RecordId>> {
        let max_history = self.settings()?.max_history;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        tx.execute(
            "DELETE FROM records WHERE id = ?1",
            params![record.id.to_string()],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        tx.execute(
            "
            INSERT INTO records (
                id, url, filename, destination, status, total_bytes, received_bytes,
                last_error, created_at, started_at, completed_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
            params![
                record.id.to_string(),
                record.url.as_str(),
                record.filename.as_str(),
                record.destination.to_string_lossy().as_ref(),
                record.status.as_str(),
                record.total_bytes as i64,
                record.received_bytes as i64,
                record.last_error.as_deref(),
                record.created_at as i64,
                record.started_at.map(|v| v as i64),
                record.completed_at.map(|v| v as i64),
                record.updated_at as i64,
            ],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;

        let evicted = eviction_candidates(&Self::listing(&tx)?, max_history);
        for id in &evicted {
            tx.execute("DELETE FROM records WHERE id = ?1", params![id.to_string()])
                .map_err(|err| CoreError::Storage(err.to_string()))?;
        }

        tx.commit()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(evicted)
    }

    fn update_record(&mut self, record: &TransferRecord) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "
            UPDATE records SET
                destination = ?2,
                status = ?3,
                total_bytes = ?4,
                received_bytes = ?5,
                last_error = ?6,
                started_at = ?7,
                completed_at = ?8,
                updated_at = ?9
            WHERE id = ?1
            ",
            params![
                record.id.to_string(),
                record.destination.to_string_lossy().as_ref(),
                record.status.as_str(),
                record.total_bytes as i64,
                record.received_bytes as i64,
                record.last_error.as_deref(),
                record.started_at.map(|v| v as i64),
                record.completed_at.map(|v| v as i64),
                record.updated_at as i64,
            ],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn remove_record(&mut self, id: &RecordId) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM records WHERE id = ?1", params![id.to_string()])
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn list_records(&self) -> CoreResult<Vec<TransferRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT id, url, filename, destination, status, total_bytes, received_bytes,
                       last_error, created_at, started_at, completed_at, updated_at
                FROM records ORDER BY seq DESC
                ",
            )
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(4)?;
                let status =
                    TransferStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?;
                let total_bytes = row.get::<_, i64>(5)? as u64;
                let received_bytes = row.get::<_, i64>(6)? as u64;
                let progress = if status == TransferStatus::Completed || status.is_post_processing()
                {
                    100.0
                } else {
                    progress_percent(received_bytes, total_bytes)
                };

                Ok(TransferRecord {
                    id: RecordId::parse_str(row.get::<_, String>(0)?.as_str())
                        .map_err(|_| rusqlite::Error::InvalidQuery)?,
                    url: row.get(1)?,
                    filename: row.get(2)?,
                    destination: PathBuf::from(row.get::<_, String>(3)?),
                    status,
                    total_bytes,
                    received_bytes,
                    progress_percent: progress,
                    speed_bytes_per_sec: 0.0,
                    eta_seconds: 0.0,
                    last_error: row.get(7)?,
                    created_at: row.get::<_, i64>(8)? as u64,
                    started_at: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
                    completed_at: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
                    updated_at: row.get::<_, i64>(11)? as u64,
                })
            })
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|err| CoreError::Storage(err.to_string()))?);
        }
        Ok(records)
    }

    fn settings(&self) -> CoreResult<Settings> {
        use rusqlite::OptionalExtension;

        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'settings'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        match value {
            Some(json) => {
                serde_json::from_str(&json).map_err(|err| CoreError::Storage(err.to_string()))
            }
            None => Ok(Settings::default()),
        }
    }

    fn save_settings(&mut self, settings: &Settings) -> CoreResult<()> {
        let json =
            serde_json::to_string(settings).map_err(|err| CoreError::Storage(err.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO settings (key, value) VALUES ('settings', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![json],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }
}
