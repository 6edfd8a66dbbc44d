//! User directory and attendance ledger backed by SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id       TEXT PRIMARY KEY,
    username      TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id           TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('present', 'absent'))
);

CREATE INDEX IF NOT EXISTS idx_attendance_user ON attendance(user_id, timestamp_us);
CREATE INDEX IF NOT EXISTS idx_attendance_status_time ON attendance(status, timestamp_us);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i32, supported: i32 },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(tokio_rusqlite::Error::Rusqlite(e))
    }
}

/// Persistence credential bundle, supplied as JSON at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreCredentials {
    pub database_path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status {other:?}")),
        }
    }
}

/// One append-only ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub user_id: String,
    /// Server-assigned, RFC 3339 on the wire.
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
}

impl AttendanceRecord {
    pub fn new(user_id: &str, timestamp: DateTime<Utc>, status: AttendanceStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            timestamp,
            status,
        }
    }
}

/// Read-only view of registered users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn username_of(&self, user_id: &str) -> Result<Option<String>, StoreError>;
    async fn all_user_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn username_exists(&self, username: &str) -> Result<bool, StoreError>;
}

/// Append-only attendance record store.
#[async_trait]
pub trait AttendanceLedger: Send + Sync {
    async fn write_present(&self, user_id: &str, at: DateTime<Utc>) -> Result<AttendanceRecord, StoreError>;
    async fn write_absent(&self, user_id: &str, at: DateTime<Utc>) -> Result<AttendanceRecord, StoreError>;
    /// All records of one user in timestamp order.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<AttendanceRecord>, StoreError>;
    /// Users with a present record at or after `since`.
    async fn list_present_since(&self, since: DateTime<Utc>) -> Result<HashSet<String>, StoreError>;
    async fn has_present_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<bool, StoreError>;
}

fn row_to_record(row: &Row) -> rusqlite::Result<(String, String, i64, String)> {
    Ok((row.get("id")?, row.get("user_id")?, row.get("timestamp_us")?, row.get("status")?))
}

fn decode_record((id, user_id, ts, status): (String, String, i64, String)) -> Result<AttendanceRecord, StoreError> {
    Ok(AttendanceRecord {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("id {id:?}: {e}")))?,
        user_id,
        timestamp: DateTime::from_timestamp_micros(ts)
            .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ts} out of range")))?,
        status: status.parse().map_err(StoreError::Corrupt)?,
    })
}

/// SQLite-backed [`UserDirectory`] and [`AttendanceLedger`].
///
/// All statements run on the `tokio-rusqlite` background thread.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database named by the credential bundle.
    pub async fn open(credentials: &StoreCredentials) -> Result<Self, StoreError> {
        if let Some(parent) = credentials.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(credentials.database_path.clone()).await?;
        let store = Self { conn };
        store.init(Some(credentials.busy_timeout_ms)).await?;
        tracing::info!(path = %credentials.database_path.display(), "attendance store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init(None).await?;
        Ok(store)
    }

    async fn init(&self, busy_timeout_ms: Option<u64>) -> Result<(), StoreError> {
        let version = self
            .conn
            .call(move |conn| {
                if let Some(ms) = busy_timeout_ms {
                    conn.busy_timeout(Duration::from_millis(ms))?;
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
                }
                let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
                if version < SCHEMA_VERSION {
                    let tx = conn.transaction()?;
                    tx.execute_batch(SCHEMA_V1)?;
                    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                    tx.commit()?;
                }
                Ok(version)
            })
            .await?;

        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// Register a user. Account management lives elsewhere; this seeds the directory.
    pub async fn insert_user(&self, user_id: &str, username: &str, password_hash: &str) -> Result<(), StoreError> {
        let (user_id, username, password_hash) =
            (user_id.to_string(), username.to_string(), password_hash.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (user_id, username, password_hash) VALUES (?1, ?2, ?3)",
                    params![user_id, username, password_hash],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn append(&self, record: AttendanceRecord) -> Result<AttendanceRecord, StoreError> {
        let row = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (id, user_id, timestamp_us, status) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        row.id.to_string(),
                        row.user_id,
                        row.timestamp.timestamp_micros(),
                        row.status.as_str()
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(record)
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn username_of(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let user_id = user_id.to_string();
        let username = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT username FROM users WHERE user_id = ?1",
                        params![user_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(username)
    }

    async fn all_user_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT user_id FROM users ORDER BY user_id")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        let username = username.to_string();
        let exists = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                    params![username],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl AttendanceLedger for SqliteStore {
    async fn write_present(&self, user_id: &str, at: DateTime<Utc>) -> Result<AttendanceRecord, StoreError> {
        self.append(AttendanceRecord::new(user_id, at, AttendanceStatus::Present)).await
    }

    async fn write_absent(&self, user_id: &str, at: DateTime<Utc>) -> Result<AttendanceRecord, StoreError> {
        self.append(AttendanceRecord::new(user_id, at, AttendanceStatus::Absent)).await
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        let user_id = user_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, timestamp_us, status FROM attendance
                     WHERE user_id = ?1
                     ORDER BY timestamp_us, rowid",
                )?;
                let rows = stmt
                    .query_map(params![user_id], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_record).collect()
    }

    async fn list_present_since(&self, since: DateTime<Utc>) -> Result<HashSet<String>, StoreError> {
        let since = since.timestamp_micros();
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT user_id FROM attendance
                     WHERE status = 'present' AND timestamp_us >= ?1",
                )?;
                let ids = stmt
                    .query_map(params![since], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<String>>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn has_present_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        let since = since.timestamp_micros();
        let exists = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM attendance
                     WHERE user_id = ?1 AND status = 'present' AND timestamp_us >= ?2)",
                    params![user_id, since],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(exists)
    }
}

/// Await a store call, failing with [`StoreError::Timeout`] instead of hanging.
///
/// A timeout only abandons the wait: the closure already queued on the
/// connection thread still runs, so a timed-out write may yet commit. Keep
/// `busy_timeout_ms` below `limit` so lock waits fail inside SQLite first.
pub async fn timed<T>(
    limit: Duration,
    call: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}
