use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
    SqlitePoolOptions,
};
use tokio::sync::watch;

use crate::activator::run_activator;
use crate::config::{Config, StorageType};
use crate::deliver::DeliveryWorker;
use crate::error::Error;
use crate::logs::{KvLogs, LogStore};
use crate::model::{
    message_id, CreateMessage, LogEntry, Message, MessagePayload, Status, SystemEvent,
};
use crate::queue::{DurableQueue, MemoryQueue, SqliteOutbox};
use crate::state::{run_consumer, StateManager};
use crate::stats::{KvStats, SqlStats, Stats, StatsSnapshot};
use crate::store::kv::KvBackend;
use crate::store::sqlite::SqliteBackend;
use crate::store::MessageStore;

const RAW_SECTIONS: [&str; 4] = ["messages", "logs", "message_stats", "queue_events"];

/// Wires the store, stats, logs, queue and workers together and carries the
/// operations the HTTP surface calls into.
#[derive(Clone)]
pub struct Service {
    config: Arc<Config>,
    store: MessageStore,
    queue: DurableQueue,
    manager: StateManager,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        let (store, queue) = match config.storage_type() {
            StorageType::Turso => {
                let url = config.db_url();

                if config.turso_db_auth_token.is_some() {
                    tracing::info!("TURSO_DB_AUTH_TOKEN set; embedded engine ignores it");
                }

                let memory = url == ":memory:";
                let opts = if memory {
                    SqliteConnectOptions::new().in_memory(true)
                } else {
                    SqliteConnectOptions::new()
                        .filename(url.strip_prefix("file:").unwrap_or(url))
                        .create_if_missing(true)
                        .journal_mode(SqliteJournalMode::Wal)
                        .locking_mode(SqliteLockingMode::Normal)
                        .optimize_on_close(true, None)
                        .auto_vacuum(SqliteAutoVacuum::Full)
                }
                .foreign_keys(true);

                // a pooled :memory: database is per-connection, keep it single
                let pool = SqlitePoolOptions::new()
                    .max_connections(if memory { 1 } else { 5 })
                    .connect_with(opts)
                    .await?;

                sqlx::migrate!("./migrations").run(&pool).await?;

                let stats = Stats::Relational(SqlStats::new(pool.clone()));
                let logs = LogStore::Relational(pool.clone());
                let store = MessageStore::relational(
                    SqliteBackend::new(pool.clone()),
                    stats,
                    logs,
                    config.audit_logs_enabled(),
                );
                let queue = DurableQueue::Outbox(SqliteOutbox::new(pool));
                (store, queue)
            }
            StorageType::Kv => {
                let stats = Stats::KeyValue(KvStats::default());
                let logs = LogStore::KeyValue(KvLogs::default());
                let store = MessageStore::key_value(
                    KvBackend::default(),
                    stats,
                    logs,
                    config.audit_logs_enabled(),
                );
                let queue = DurableQueue::Memory(MemoryQueue::default());
                (store, queue)
            }
        };

        let manager = StateManager::new(
            store.clone(),
            queue.clone(),
            DeliveryWorker::new()?,
            config.retry_delay(),
        );

        let (shutdown, _) = watch::channel(false);

        let svc = Self {
            config: Arc::new(config),
            store,
            queue,
            manager,
            shutdown: Arc::new(shutdown),
        };

        // counters missing while messages exist means a crash got between a
        // message write and a counter write
        if svc.store.count().await? > 0 && svc.store.stats().cells().await?.is_empty() {
            tracing::info!("rebuilding stats counters from the message store");
            svc.store.reconcile_stats().await?;
        }

        Ok(svc)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    /// Starts the queue consumer and the daily activator.
    pub fn spawn_workers(&self) {
        tokio::spawn(run_consumer(
            self.manager.clone(),
            self.queue.clone(),
            self.config.queue_poll_interval(),
            self.shutdown.subscribe(),
        ));
        tokio::spawn(run_activator(
            self.store.clone(),
            self.queue.clone(),
            self.shutdown.subscribe(),
        ));
    }

    /// Signals every worker to finish its current event and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Ingress: assigns the id, enqueues `MESSAGE_RECEIVED`, and answers
    /// before the message is persisted. The consumer does the rest.
    pub async fn submit(
        &self,
        payload: MessagePayload,
        publish_at: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), Error> {
        let id = message_id();
        let request = CreateMessage::new(id.clone(), payload, publish_at);

        self.queue
            .enqueue(&SystemEvent::received(&request), None)
            .await?;

        Ok((id, publish_at))
    }

    pub async fn get_message(&self, id: &str) -> Result<Message, Error> {
        self.store.fetch_one(id).await
    }

    pub async fn list_by_status(&self, status: Status) -> Result<Vec<Message>, Error> {
        self.store.fetch_by_status(status).await
    }

    pub async fn stats_snapshot(&self) -> Result<StatsSnapshot, Error> {
        self.store.stats().get().await
    }

    pub async fn recent_logs(&self, limit: u32) -> Result<Vec<LogEntry>, Error> {
        self.store.logs().fetch_all(limit).await
    }

    pub async fn message_logs(&self, message_id: &str) -> Result<Vec<LogEntry>, Error> {
        self.store.logs().fetch_by_message_id(message_id).await
    }

    async fn raw_section(&self, name: &str) -> Result<serde_json::Value, Error> {
        match name {
            "messages" => match self.store.raw_dump() {
                Some(dump) => Ok(dump),
                None => Ok(serde_json::json!(self.store.fetch_all().await?)),
            },
            "logs" => Ok(serde_json::json!(self.store.logs().fetch_all(u32::MAX).await?)),
            "message_stats" => Ok(serde_json::json!(self.store.stats().cells().await?)),
            "queue_events" => self.queue.dump().await,
            other => Err(Error::InvalidTable {
                name: other.to_owned(),
            }),
        }
    }

    /// Dump of the underlying rows/keys, optionally restricted to one table.
    pub async fn raw(&self, matcher: Option<&str>) -> Result<serde_json::Value, Error> {
        match matcher {
            Some(name) => self.raw_section(name).await,
            None => {
                let mut all = serde_json::Map::new();
                for section in RAW_SECTIONS {
                    all.insert(section.to_owned(), self.raw_section(section).await?);
                }
                Ok(serde_json::Value::Object(all))
            }
        }
    }

    /// Truncates stores. `migrations` is refused; `messages` cascades into
    /// logs, counters and pending events; `logs` clears the audit trail only;
    /// no matcher clears everything.
    pub async fn reset(&self, matcher: Option<&str>) -> Result<(), Error> {
        match matcher {
            Some(name) if name == "migrations" || name.starts_with("_sqlx") => {
                Err(Error::ProtectedTable {
                    name: name.to_owned(),
                })
            }
            Some("messages") | None => {
                self.store.reset().await?;
                self.store.logs().reset().await?;
                self.queue.reset().await?;
                Ok(())
            }
            Some("logs") => self.store.logs().reset().await,
            Some(other) => Err(Error::InvalidTable {
                name: other.to_owned(),
            }),
        }
    }
}
