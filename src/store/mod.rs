use chrono::{NaiveDate, Utc};

use crate::error::Error;
use crate::logs::LogStore;
use crate::model::{
    message_id, CreateMessage, LogEntry, Message, MessagePatch, Status, SystemEvent,
};
use crate::stats::Stats;

pub mod kv;
pub mod sqlite;

use kv::KvBackend;
use sqlite::SqliteBackend;

#[derive(Clone)]
enum Backend {
    Relational(SqliteBackend),
    KeyValue(KvBackend),
}

/// Durable CRUD over messages with status and publish-date lookups.
///
/// Every write adjusts the stats counters, appends an audit log entry when
/// logging is enabled, and returns the corresponding `STORE_*_EVENT` as a
/// value; the caller decides where to enqueue it.
#[derive(Clone)]
pub struct MessageStore {
    backend: Backend,
    stats: Stats,
    logs: LogStore,
    audit: bool,
}

impl MessageStore {
    pub fn relational(backend: SqliteBackend, stats: Stats, logs: LogStore, audit: bool) -> Self {
        Self {
            backend: Backend::Relational(backend),
            stats,
            logs,
            audit,
        }
    }

    pub fn key_value(backend: KvBackend, stats: Stats, logs: LogStore, audit: bool) -> Self {
        Self {
            backend: Backend::KeyValue(backend),
            stats,
            logs,
            audit,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub async fn create(&self, request: CreateMessage) -> Result<(Message, SystemEvent), Error> {
        let now = Utc::now();
        let message = Message {
            id: request.id.unwrap_or_else(message_id),
            payload: request.payload,
            publish_at: request.publish_at,
            delivered_at: None,
            retry_at: None,
            retried: 0,
            status: request.status.unwrap_or(Status::Created),
            last_errors: vec![],
            // seeded writes carry their own timestamps, the normal path
            // derives them here
            created_at: request.created_at.unwrap_or(now),
            updated_at: request.updated_at.unwrap_or(now),
        };

        match &self.backend {
            Backend::Relational(b) => b.insert(&message).await?,
            Backend::KeyValue(b) => b.insert(&message)?,
        }

        self.stats.increment(message.status, message.created_at).await?;
        if message.status == Status::Created {
            self.stats.bump_total();
        }

        if self.audit {
            self.logs.create(LogEntry::created(&message)).await?;
        }

        Ok((message.clone(), SystemEvent::store_create(&message)))
    }

    pub async fn fetch_one(&self, id: &str) -> Result<Message, Error> {
        match &self.backend {
            Backend::Relational(b) => b.fetch_one(id).await,
            Backend::KeyValue(b) => b.fetch_one(id),
        }
    }

    /// Ordered by `created_at` descending.
    pub async fn fetch_by_status(&self, status: Status) -> Result<Vec<Message>, Error> {
        match &self.backend {
            Backend::Relational(b) => b.fetch_by_status(status).await,
            Backend::KeyValue(b) => Ok(b.fetch_by_status(status)),
        }
    }

    /// Matches on `publish_at`'s UTC calendar day, ordered ascending.
    pub async fn fetch_by_date(&self, date: NaiveDate) -> Result<Vec<Message>, Error> {
        match &self.backend {
            Backend::Relational(b) => b.fetch_by_date(date).await,
            Backend::KeyValue(b) => Ok(b.fetch_by_date(date)),
        }
    }

    pub async fn fetch_all(&self) -> Result<Vec<Message>, Error> {
        match &self.backend {
            Backend::Relational(b) => b.fetch_all().await,
            Backend::KeyValue(b) => Ok(b.fetch_all()),
        }
    }

    /// Applies a partial patch; absent fields are preserved. A patch that
    /// leaves the status unchanged still emits an update event and log entry.
    pub async fn update(
        &self,
        id: &str,
        patch: MessagePatch,
    ) -> Result<(Message, SystemEvent), Error> {
        let now = Utc::now();
        let before = self.fetch_one(id).await?;

        let mut after = before.clone();
        if let Some(status) = patch.status {
            after.status = status;
        }
        if let Some(retried) = patch.retried {
            after.retried = retried;
        }
        if let Some(retry_at) = patch.retry_at {
            after.retry_at = Some(retry_at);
        }
        if let Some(delivered_at) = patch.delivered_at {
            after.delivered_at = Some(delivered_at);
        }
        if let Some(last_errors) = patch.last_errors {
            after.last_errors = last_errors;
        }
        after.updated_at = now;

        match &self.backend {
            Backend::Relational(b) => b.replace(&after).await?,
            Backend::KeyValue(b) => b.replace(&after)?,
        }

        if before.status != after.status {
            self.stats.decrement(before.status, now).await?;
            self.stats.increment(after.status, now).await?;
        }

        if self.audit {
            self.logs.create(LogEntry::updated(&before, &after)).await?;
        }

        Ok((after.clone(), SystemEvent::store_update(&before, &after)))
    }

    pub async fn delete(&self, id: &str) -> Result<(bool, Option<SystemEvent>), Error> {
        let prior = match &self.backend {
            Backend::Relational(b) => b.delete(id).await?,
            Backend::KeyValue(b) => b.delete(id),
        };

        let Some(before) = prior else {
            return Ok((false, None));
        };

        self.stats.decrement(before.status, Utc::now()).await?;
        self.stats.drop_total();

        if self.audit {
            self.logs.create(LogEntry::deleted(&before)).await?;
        }

        Ok((true, Some(SystemEvent::store_delete(&before))))
    }

    pub async fn count(&self) -> Result<u64, Error> {
        match &self.backend {
            Backend::Relational(b) => b.count().await,
            Backend::KeyValue(b) => Ok(b.count()),
        }
    }

    pub async fn reset(&self) -> Result<(), Error> {
        match &self.backend {
            Backend::Relational(b) => b.reset().await?,
            Backend::KeyValue(b) => b.reset(),
        }
        self.stats.reset().await
    }

    pub fn raw_dump(&self) -> Option<serde_json::Value> {
        match &self.backend {
            Backend::Relational(_) => None,
            Backend::KeyValue(b) => Some(b.dump()),
        }
    }

    /// Recovery path: rebuild every counter from the stored messages.
    pub async fn reconcile_stats(&self) -> Result<(), Error> {
        let messages = self.fetch_all().await?;
        self.stats.initialize_from_messages(&messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{KvLogs, LogStore};
    use crate::model::{EventType, MessagePayload, PayloadHeaders};
    use crate::stats::{KvStats, Stats};

    fn store() -> MessageStore {
        MessageStore::key_value(
            KvBackend::default(),
            Stats::KeyValue(KvStats::default()),
            LogStore::KeyValue(KvLogs::default()),
            true,
        )
    }

    fn payload() -> MessagePayload {
        MessagePayload {
            headers: PayloadHeaders::default(),
            url: "https://example.com/hook".to_owned(),
            data: Some(serde_json::json!({ "x": 1 })),
        }
    }

    #[tokio::test]
    async fn create_returns_event_and_counts() {
        let store = store();
        let (msg, event) = store
            .create(CreateMessage::new(message_id(), payload(), Utc::now()))
            .await
            .unwrap();

        assert_eq!(msg.status, Status::Created);
        assert_eq!(event.kind, EventType::StoreCreateEvent);
        assert_eq!(event.data["after"]["id"], serde_json::json!(msg.id));

        let snapshot = store.stats().get().await.unwrap();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.by_status.get(&Status::Created), Some(&1));

        let logs = store.logs().fetch_by_message_id(&msg.id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn update_moves_counters_between_buckets() {
        let store = store();
        let (msg, _) = store
            .create(CreateMessage::new(message_id(), payload(), Utc::now()))
            .await
            .unwrap();

        let (updated, event) = store
            .update(&msg.id, MessagePatch::status(Status::Deliver))
            .await
            .unwrap();

        assert_eq!(updated.status, Status::Deliver);
        assert_eq!(event.kind, EventType::StoreUpdateEvent);
        assert_eq!(
            event.data["before"]["status"],
            serde_json::json!("CREATED")
        );

        let snapshot = store.stats().get().await.unwrap();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.by_status.get(&Status::Created), None);
        assert_eq!(snapshot.by_status.get(&Status::Deliver), Some(&1));
    }

    #[tokio::test]
    async fn patch_preserves_absent_fields() {
        let store = store();
        let (msg, _) = store
            .create(CreateMessage::new(message_id(), payload(), Utc::now()))
            .await
            .unwrap();

        let (updated, _) = store
            .update(&msg.id, MessagePatch::status(Status::Queued))
            .await
            .unwrap();

        assert_eq!(updated.payload, msg.payload);
        assert_eq!(updated.publish_at, msg.publish_at);
        assert_eq!(updated.retried, 0);
        assert_eq!(updated.created_at, msg.created_at);
        assert!(updated.updated_at >= msg.updated_at);
    }

    #[tokio::test]
    async fn delete_drops_counters_and_emits_before() {
        let store = store();
        let (msg, _) = store
            .create(CreateMessage::new(message_id(), payload(), Utc::now()))
            .await
            .unwrap();

        let (deleted, event) = store.delete(&msg.id).await.unwrap();
        assert!(deleted);
        let event = event.unwrap();
        assert_eq!(event.kind, EventType::StoreDeleteEvent);
        assert_eq!(event.data["before"]["id"], serde_json::json!(msg.id));

        let snapshot = store.stats().get().await.unwrap();
        assert_eq!(snapshot.total, 0);
        assert!(snapshot.by_status.is_empty());

        let (deleted_again, event) = store.delete(&msg.id).await.unwrap();
        assert!(!deleted_again);
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn seeded_create_preserves_supplied_timestamps() {
        let store = store();
        let stamp = Utc::now() - chrono::Duration::days(3);
        let request = CreateMessage {
            payload: payload(),
            publish_at: stamp,
            id: Some("msg_seeded".to_owned()),
            status: Some(Status::Sent),
            created_at: Some(stamp),
            updated_at: Some(stamp),
        };

        let (msg, _) = store.create(request).await.unwrap();
        assert_eq!(msg.id, "msg_seeded");
        assert_eq!(msg.created_at, stamp);
        assert_eq!(msg.status, Status::Sent);

        // a seeded non-CREATED row is not a genuine creation
        let snapshot = store.stats().get().await.unwrap();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.by_status.get(&Status::Sent), Some(&1));
    }
}
