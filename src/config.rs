use std::str::FromStr;

use serde::Deserialize;

use crate::error::Error;

pub mod defaults {
    pub const BIND_ADDR: &str = "127.0.0.1:8080";
    pub const DB_URL: &str = "done-light.db";
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_DELAY_SECS: u64 = 60;
    pub const DELIVERY_TIMEOUT_SECS: u64 = 8;
    pub const CONNECT_TIMEOUT_SECS: u64 = 4;
    pub const QUEUE_POLL_MS: u64 = 500;
}

/// Storage backend selector. `Turso` is the durable SQL profile; `Kv` keeps
/// everything in process with explicit secondary indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum StorageType {
    Kv,
    #[default]
    Turso,
}

impl FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KV" => Ok(StorageType::Kv),
            "TURSO" => Ok(StorageType::Turso),
            other => Err(Error::internal(eyre::eyre!(
                "unknown storage type {other}, expected KV or TURSO"
            ))),
        }
    }
}

impl TryFrom<String> for StorageType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Process configuration, read once at startup and passed down. Values come
/// from the environment; none of the workers consult the environment again.
#[derive(Clone, Deserialize, Default)]
pub struct Config {
    pub auth_token: Option<String>,
    pub storage_type: Option<StorageType>,
    pub turso_db_url: Option<String>,
    pub turso_db_auth_token: Option<String>,
    pub enable_logs: Option<bool>,

    pub bind_addr: Option<String>,
    pub retry_delay_secs: Option<u64>,
    pub queue_poll_ms: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::from_env::<Self>()?)
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type.unwrap_or_default()
    }

    pub fn db_url(&self) -> &str {
        self.turso_db_url
            .as_deref()
            .unwrap_or(defaults::DB_URL)
    }

    pub fn audit_logs_enabled(&self) -> bool {
        self.enable_logs.unwrap_or(false)
    }

    pub fn bind_addr(&self) -> &str {
        self.bind_addr.as_deref().unwrap_or(defaults::BIND_ADDR)
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.retry_delay_secs.unwrap_or(defaults::RETRY_DELAY_SECS),
        )
    }

    pub fn queue_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.queue_poll_ms.unwrap_or(defaults::QUEUE_POLL_MS))
    }

    /// Bearer token for the API. Generated fresh on startup when unset, so an
    /// unconfigured instance is never left open.
    pub fn auth_token_or_generate(&self) -> String {
        match &self.auth_token {
            Some(token) => token.clone(),
            None => {
                let token = uuid::Uuid::new_v4().simple().to_string();
                tracing::warn!("AUTH_TOKEN not set, generated token: {token}");
                token
            }
        }
    }
}
