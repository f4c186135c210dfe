use chrono::NaiveDate;
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;

use crate::error::Error;
use crate::model::{format_ts, parse_ts, Message, Status};

/// Relational message backend. Rows hold the payload and error list as JSON
/// text and all timestamps as ISO-8601 UTC strings, so lexicographic ORDER BY
/// matches chronological order.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct MessageRow {
    id: String,
    payload: String,
    publish_at: String,
    delivered_at: Option<String>,
    retry_at: Option<String>,
    retried: i64,
    status: String,
    last_errors: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            payload: serde_json::from_str(&row.payload)?,
            publish_at: parse_ts(&row.publish_at)?,
            delivered_at: row.delivered_at.as_deref().map(parse_ts).transpose()?,
            retry_at: row.retry_at.as_deref().map(parse_ts).transpose()?,
            retried: row.retried.max(0) as u32,
            status: row.status.parse()?,
            last_errors: row
                .last_errors
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default(),
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, message: &Message) -> Result<(), Error> {
        let result = sqlx::query(
            "
            INSERT INTO messages
                (id, payload, publish_at, delivered_at, retry_at, retried, status, last_errors, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(&message.id)
        .bind(serde_json::to_string(&message.payload)?)
        .bind(format_ts(&message.publish_at))
        .bind(message.delivered_at.as_ref().map(format_ts))
        .bind(message.retry_at.as_ref().map(format_ts))
        .bind(message.retried as i64)
        .bind(message.status.as_str())
        .bind(serde_json::to_string(&message.last_errors)?)
        .bind(format_ts(&message.created_at))
        .bind(format_ts(&message.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Err(Error::DuplicateId {
                    id: message.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn fetch_one(&self, id: &str) -> Result<Message, Error> {
        let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| Error::message_not_found(id))?.try_into()
    }

    pub async fn fetch_by_status(&self, status: Status) -> Result<Vec<Message>, Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM messages WHERE status = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    pub async fn fetch_by_date(&self, date: NaiveDate) -> Result<Vec<Message>, Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM messages WHERE date(publish_at) = $1 ORDER BY publish_at ASC, id ASC",
        )
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    pub async fn fetch_all(&self) -> Result<Vec<Message>, Error> {
        let rows: Vec<MessageRow> =
            sqlx::query_as("SELECT * FROM messages ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    /// Full-row write of a merged message. The consumer serializes events, so
    /// read-modify-write through here is the per-id write path.
    pub async fn replace(&self, message: &Message) -> Result<(), Error> {
        let result = sqlx::query(
            "
            UPDATE messages
            SET payload = $2, publish_at = $3, delivered_at = $4, retry_at = $5,
                retried = $6, status = $7, last_errors = $8, updated_at = $9
            WHERE id = $1
            ",
        )
        .bind(&message.id)
        .bind(serde_json::to_string(&message.payload)?)
        .bind(format_ts(&message.publish_at))
        .bind(message.delivered_at.as_ref().map(format_ts))
        .bind(message.retry_at.as_ref().map(format_ts))
        .bind(message.retried as i64)
        .bind(message.status.as_str())
        .bind(serde_json::to_string(&message.last_errors)?)
        .bind(format_ts(&message.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::message_not_found(&message.id));
        }

        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<Option<Message>, Error> {
        let row: Option<MessageRow> =
            sqlx::query_as("DELETE FROM messages WHERE id = $1 RETURNING *")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Message::try_from).transpose()
    }

    pub async fn count(&self) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn reset(&self) -> Result<(), Error> {
        sqlx::query("DELETE FROM messages").execute(&self.pool).await?;
        Ok(())
    }
}
