use std::sync::{Arc, RwLock};

use sqlx::prelude::FromRow;
use sqlx::SqlitePool;

use crate::error::Error;
use crate::model::{format_ts, parse_ts, LogEntry};

/// Append-only audit log of store mutations, indexed by message id. Written
/// only when `ENABLE_LOGS` is on.
#[derive(Clone)]
pub enum LogStore {
    Relational(SqlitePool),
    KeyValue(KvLogs),
}

#[derive(FromRow)]
struct LogRow {
    id: String,
    #[sqlx(rename = "type")]
    kind: String,
    object: String,
    message_id: String,
    before_data: Option<String>,
    after_data: Option<String>,
    created_at: String,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = Error;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let parse_data = |raw: Option<String>| -> Result<Option<serde_json::Value>, Error> {
            raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Error::from)
        };

        Ok(LogEntry {
            id: row.id,
            kind: row.kind.parse()?,
            object: row.object,
            message_id: row.message_id,
            before_data: parse_data(row.before_data)?,
            after_data: parse_data(row.after_data)?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

impl LogStore {
    pub async fn create(&self, entry: LogEntry) -> Result<LogEntry, Error> {
        match self {
            LogStore::Relational(pool) => {
                sqlx::query(
                    "
                    INSERT INTO logs (id, type, object, message_id, before_data, after_data, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ",
                )
                .bind(&entry.id)
                .bind(entry.kind.as_str())
                .bind(&entry.object)
                .bind(&entry.message_id)
                .bind(entry.before_data.as_ref().map(|v| v.to_string()))
                .bind(entry.after_data.as_ref().map(|v| v.to_string()))
                .bind(format_ts(&entry.created_at))
                .execute(pool)
                .await?;
            }
            LogStore::KeyValue(logs) => {
                logs.0.write().expect("log lock").push(entry.clone());
            }
        }
        Ok(entry)
    }

    /// Chronological history of one message.
    pub async fn fetch_by_message_id(&self, message_id: &str) -> Result<Vec<LogEntry>, Error> {
        match self {
            LogStore::Relational(pool) => {
                // rowid breaks same-millisecond ties in insertion order
                let rows: Vec<LogRow> = sqlx::query_as(
                    "SELECT * FROM logs WHERE message_id = $1 ORDER BY created_at ASC, rowid ASC",
                )
                .bind(message_id)
                .fetch_all(pool)
                .await?;
                rows.into_iter().map(LogEntry::try_from).collect()
            }
            LogStore::KeyValue(logs) => {
                let guard = logs.0.read().expect("log lock");
                Ok(guard
                    .iter()
                    .filter(|e| e.message_id == message_id)
                    .cloned()
                    .collect())
            }
        }
    }

    /// Newest entries first.
    pub async fn fetch_all(&self, limit: u32) -> Result<Vec<LogEntry>, Error> {
        match self {
            LogStore::Relational(pool) => {
                let rows: Vec<LogRow> = sqlx::query_as(
                    "SELECT * FROM logs ORDER BY created_at DESC, rowid DESC LIMIT $1",
                )
                .bind(limit as i64)
                .fetch_all(pool)
                .await?;
                rows.into_iter().map(LogEntry::try_from).collect()
            }
            LogStore::KeyValue(logs) => {
                let guard = logs.0.read().expect("log lock");
                let entries: Vec<LogEntry> = guard
                    .iter()
                    .rev()
                    .take(limit as usize)
                    .cloned()
                    .collect();
                Ok(entries)
            }
        }
    }

    pub async fn reset(&self) -> Result<(), Error> {
        match self {
            LogStore::Relational(pool) => {
                sqlx::query("DELETE FROM logs").execute(pool).await?;
            }
            LogStore::KeyValue(logs) => {
                logs.0.write().expect("log lock").clear();
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct KvLogs(Arc<RwLock<Vec<LogEntry>>>);
