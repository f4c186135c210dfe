use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;

use crate::error::Error;
use crate::model::SystemEvent;

/// A claimed event is invisible to further claims for this long; if the
/// consumer dies mid-processing the event becomes claimable again.
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide, single-consumer FIFO of system events with a native delay
/// facility. Records survive restarts on the relational backing; consumption
/// is at-least-once, so event handling must stay idempotent.
#[derive(Clone)]
pub enum DurableQueue {
    Outbox(SqliteOutbox),
    Memory(MemoryQueue),
}

/// Receipt for an in-flight event; pass back to `mark_done` or `release`.
pub struct ClaimedEvent {
    pub event: SystemEvent,
}

impl DurableQueue {
    /// The record becomes visible to the consumer once `delay` has elapsed.
    pub async fn enqueue(
        &self,
        event: &SystemEvent,
        delay: Option<Duration>,
    ) -> Result<(), Error> {
        let visible_at = Utc::now()
            + chrono::Duration::from_std(delay.unwrap_or_default())
                .unwrap_or_else(|_| chrono::Duration::zero());

        tracing::debug!(
            event = event.kind.as_str(),
            id = %event.id,
            delay_ms = delay.unwrap_or_default().as_millis() as u64,
            "enqueue"
        );

        match self {
            DurableQueue::Outbox(outbox) => outbox.enqueue(event, visible_at).await,
            DurableQueue::Memory(queue) => {
                queue.enqueue(event, visible_at);
                Ok(())
            }
        }
    }

    /// Claims the oldest visible event, if any, locking it against further
    /// claims for [`VISIBILITY_TIMEOUT`].
    pub async fn claim(&self) -> Result<Option<ClaimedEvent>, Error> {
        match self {
            DurableQueue::Outbox(outbox) => outbox.claim().await,
            DurableQueue::Memory(queue) => Ok(queue.claim()),
        }
    }

    pub async fn mark_done(&self, claimed: &ClaimedEvent) -> Result<(), Error> {
        match self {
            DurableQueue::Outbox(outbox) => outbox.mark_done(&claimed.event.id).await,
            DurableQueue::Memory(queue) => {
                queue.mark_done(&claimed.event.id);
                Ok(())
            }
        }
    }

    /// Returns the event to the queue immediately for another attempt.
    pub async fn release(&self, claimed: &ClaimedEvent) -> Result<(), Error> {
        match self {
            DurableQueue::Outbox(outbox) => outbox.release(&claimed.event.id).await,
            DurableQueue::Memory(queue) => {
                queue.release(&claimed.event.id);
                Ok(())
            }
        }
    }

    pub async fn reset(&self) -> Result<(), Error> {
        match self {
            DurableQueue::Outbox(outbox) => {
                sqlx::query("DELETE FROM queue_events")
                    .execute(&outbox.pool)
                    .await?;
                Ok(())
            }
            DurableQueue::Memory(queue) => {
                queue.inner.lock().expect("queue lock").pending.clear();
                Ok(())
            }
        }
    }

    pub async fn dump(&self) -> Result<serde_json::Value, Error> {
        match self {
            DurableQueue::Outbox(outbox) => outbox.dump().await,
            DurableQueue::Memory(queue) => Ok(queue.dump()),
        }
    }
}

/// Relational outbox: events are rows, claimed by an atomic
/// update-where-select, and deleted once processed.
#[derive(Clone)]
pub struct SqliteOutbox {
    pool: SqlitePool,
    visibility: Duration,
}

#[derive(FromRow, serde::Serialize)]
struct OutboxRow {
    id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    kind: String,
    object: String,
    data: String,
    visible_at: i64,
    locked_at: Option<i64>,
    created_at: i64,
}

impl TryFrom<OutboxRow> for SystemEvent {
    type Error = Error;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(SystemEvent {
            id: row.id,
            kind: row.kind.parse()?,
            object: row.object,
            data: serde_json::from_str(&row.data)?,
            created_at: Utc
                .timestamp_millis_opt(row.created_at)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

impl SqliteOutbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            visibility: VISIBILITY_TIMEOUT,
        }
    }

    async fn enqueue(&self, event: &SystemEvent, visible_at: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO queue_events (id, type, object, data, visible_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(&event.id)
        .bind(event.kind.as_str())
        .bind(&event.object)
        .bind(event.data.to_string())
        .bind(visible_at.timestamp_millis())
        .bind(event.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim(&self) -> Result<Option<ClaimedEvent>, Error> {
        let now = Utc::now().timestamp_millis();
        let lock_expired = now - self.visibility.as_millis() as i64;

        let row: Option<OutboxRow> = sqlx::query_as(
            "
            UPDATE queue_events
            SET locked_at = $1
            WHERE id IN (
                SELECT id FROM queue_events
                WHERE visible_at <= $1
                AND (locked_at IS NULL OR locked_at <= $2)
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            ",
        )
        .bind(now)
        .bind(lock_expired)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ClaimedEvent {
                event: row.try_into()?,
            })
        })
        .transpose()
    }

    async fn mark_done(&self, id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM queue_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<(), Error> {
        sqlx::query("UPDATE queue_events SET locked_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dump(&self) -> Result<serde_json::Value, Error> {
        let rows: Vec<OutboxRow> =
            sqlx::query_as("SELECT * FROM queue_events ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(serde_json::json!(rows))
    }
}

/// In-process queue for the key-value profile. Same visibility semantics,
/// no restart durability.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    pending: HashMap<String, PendingEvent>,
}

struct PendingEvent {
    event: SystemEvent,
    visible_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
}

impl MemoryQueue {
    fn enqueue(&self, event: &SystemEvent, visible_at: DateTime<Utc>) {
        self.inner.lock().expect("queue lock").pending.insert(
            event.id.clone(),
            PendingEvent {
                event: event.clone(),
                visible_at,
                locked_at: None,
            },
        );
    }

    fn claim(&self) -> Option<ClaimedEvent> {
        let now = Utc::now();
        let lock_expired =
            now - chrono::Duration::from_std(VISIBILITY_TIMEOUT).expect("visibility fits chrono");

        let mut inner = self.inner.lock().expect("queue lock");
        let id = inner
            .pending
            .values()
            .filter(|p| {
                p.visible_at <= now && p.locked_at.map_or(true, |locked| locked <= lock_expired)
            })
            .min_by(|a, b| {
                (a.event.created_at, &a.event.id).cmp(&(b.event.created_at, &b.event.id))
            })
            .map(|p| p.event.id.clone())?;

        let pending = inner.pending.get_mut(&id).expect("claimed event exists");
        pending.locked_at = Some(now);
        Some(ClaimedEvent {
            event: pending.event.clone(),
        })
    }

    fn mark_done(&self, id: &str) {
        self.inner.lock().expect("queue lock").pending.remove(id);
    }

    fn release(&self, id: &str) {
        if let Some(pending) = self.inner.lock().expect("queue lock").pending.get_mut(id) {
            pending.locked_at = None;
        }
    }

    fn dump(&self) -> serde_json::Value {
        let inner = self.inner.lock().expect("queue lock");
        let mut rows: Vec<serde_json::Value> = inner
            .pending
            .values()
            .map(|p| {
                serde_json::json!({
                    "event": p.event,
                    "visible_at": p.visible_at,
                    "locked": p.locked_at.is_some(),
                })
            })
            .collect();
        rows.sort_by_key(|row| row["event"]["id"].as_str().map(str::to_owned));
        serde_json::json!(rows)
    }
}
