//! Persistent SQLite store for bus reminders.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bot::reminders::{DaysMode, NewReminder, Reminder, parse_trigger_time};

pub const DEFAULT_TABLE: &str = "bus_reminders";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reminder #{seq} not found")]
    NotFound { seq: i64 },
    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("corrupt reminder row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Reminder persistence keyed by (owner_id, seq).
pub struct ReminderStore {
    conn: Mutex<Connection>,
    table: String,
}

impl ReminderStore {
    /// Create a new in-memory store.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_TABLE)
    }

    /// Open (or create) the store at the given path.
    ///
    /// `table` must already be validated as a plain SQL identifier; it is
    /// interpolated into every statement.
    pub fn open(path: &Path, table: &str) -> Result<Self, StoreError> {
        let store = Self::from_connection(Connection::open(path)?, table)?;
        info!("Opened reminder store {:?} ({} reminders)", path, store.count()?);
        Ok(store)
    }

    fn from_connection(conn: Connection, table: &str) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let t = &self.table;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                service_no TEXT NOT NULL,
                stop_code TEXT NOT NULL,
                stop_name TEXT NOT NULL,
                days TEXT NOT NULL,
                trigger_time TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(owner_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_{t}_owner ON {t}(owner_id);
            "#
        ))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
            row.get(0)
        })?;
        Ok(n as usize)
    }

    #[cfg(test)]
    pub(crate) fn execute_sql(&self, sql: &str) -> Result<(), StoreError> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    /// Persist a reminder, assigning the owner's next sequence number.
    ///
    /// Returns only after the transaction has committed.
    pub fn create(&self, new: &NewReminder) -> Result<Reminder, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let t = &self.table;

        let seq: i64 = tx.query_row(
            &format!("SELECT COALESCE(MAX(seq), 0) + 1 FROM {t} WHERE owner_id = ?1"),
            params![new.owner_id],
            |row| row.get(0),
        )?;
        let created_at = Utc::now();

        tx.execute(
            &format!(
                "INSERT INTO {t} (owner_id, seq, service_no, stop_code, stop_name, days, trigger_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                new.owner_id,
                seq,
                new.service_no,
                new.stop_code,
                new.stop_name,
                new.days.as_str(),
                new.time.to_string(),
                created_at.to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!(
            "Saved reminder #{} for {} (bus {} at {}, {} {})",
            seq, new.owner_id, new.service_no, new.stop_code, new.days.as_str(), new.time
        );

        Ok(Reminder {
            id,
            owner_id: new.owner_id,
            seq,
            service_no: new.service_no.clone(),
            stop_code: new.stop_code.clone(),
            stop_name: new.stop_name.clone(),
            days: new.days,
            time: new.time,
            created_at,
        })
    }

    /// An owner's reminders, ordered by sequence number.
    pub fn list(&self, owner_id: i64) -> Result<Vec<Reminder>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM {} WHERE owner_id = ?1 ORDER BY seq ASC",
            self.table
        ))?;
        let rows = stmt.query_map(params![owner_id], RawReminder::from_row)?;
        collect_reminders(rows)
    }

    /// Delete by per-owner sequence number, returning the removed reminder.
    pub fn delete(&self, owner_id: i64, seq: i64) -> Result<Reminder, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM {} WHERE owner_id = ?1 AND seq = ?2",
                    self.table
                ),
                params![owner_id, seq],
                RawReminder::from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { seq })?;

        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.table),
            params![existing.id],
        )?;
        tx.commit()?;

        debug!("Deleted reminder #{} for {}", seq, owner_id);
        existing.into_reminder()
    }

    /// Every stored reminder. Used by the scheduler.
    pub fn scan_all(&self) -> Result<Vec<Reminder>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM {} ORDER BY owner_id, seq",
            self.table
        ))?;
        let rows = stmt.query_map([], RawReminder::from_row)?;
        collect_reminders(rows)
    }
}

const COLUMNS: &str =
    "id, owner_id, seq, service_no, stop_code, stop_name, days, trigger_time, created_at";

/// Row as stored; text columns are decoded separately so a bad row reports
/// which reminder it was.
struct RawReminder {
    id: i64,
    owner_id: i64,
    seq: i64,
    service_no: String,
    stop_code: String,
    stop_name: String,
    days: String,
    trigger_time: String,
    created_at: String,
}

impl RawReminder {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            seq: row.get(2)?,
            service_no: row.get(3)?,
            stop_code: row.get(4)?,
            stop_name: row.get(5)?,
            days: row.get(6)?,
            trigger_time: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_reminder(self) -> Result<Reminder, StoreError> {
        let id = self.id;
        let corrupt = move |reason: String| StoreError::Corrupt { id, reason };
        let days: DaysMode = self.days.parse().map_err(corrupt)?;
        let time = parse_trigger_time(&self.trigger_time).map_err(corrupt)?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Reminder {
            id: self.id,
            owner_id: self.owner_id,
            seq: self.seq,
            service_no: self.service_no,
            stop_code: self.stop_code,
            stop_name: self.stop_name,
            days,
            time,
            created_at,
        })
    }
}

/// Undecodable rows are logged and skipped so one bad reminder cannot hide
/// the rest.
fn collect_reminders(
    rows: impl Iterator<Item = rusqlite::Result<RawReminder>>,
) -> Result<Vec<Reminder>, StoreError> {
    let mut reminders = Vec::new();
    for row in rows {
        match row?.into_reminder() {
            Ok(reminder) => reminders.push(reminder),
            Err(e) => warn!("Skipping reminder: {}", e),
        }
    }
    Ok(reminders)
}
