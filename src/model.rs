use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Delivery lifecycle of a message.
///
/// `SENT` and `ARCHIVED` are terminal. `DLQ` is terminal for delivery but may
/// still trigger a single failure-callback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Created,
    Queued,
    Deliver,
    Sent,
    Retry,
    Dlq,
    Archived,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Created,
        Status::Queued,
        Status::Deliver,
        Status::Sent,
        Status::Retry,
        Status::Dlq,
        Status::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "CREATED",
            Status::Queued => "QUEUED",
            Status::Deliver => "DELIVER",
            Status::Sent => "SENT",
            Status::Retry => "RETRY",
            Status::Dlq => "DLQ",
            Status::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Status::Created),
            "QUEUED" => Ok(Status::Queued),
            "DELIVER" => Ok(Status::Deliver),
            "SENT" => Ok(Status::Sent),
            "RETRY" => Ok(Status::Retry),
            "DLQ" => Ok(Status::Dlq),
            "ARCHIVED" => Ok(Status::Archived),
            other => Err(Error::InvalidStatus {
                value: other.to_owned(),
            }),
        }
    }
}

/// Headers captured at ingress. `forward` entries are relayed on the outbound
/// callback; `command` entries steer the system (e.g. `failure-callback`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadHeaders {
    #[serde(default)]
    pub forward: HashMap<String, String>,
    #[serde(default)]
    pub command: HashMap<String, String>,
}

pub const FAILURE_CALLBACK_KEY: &str = "failure-callback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub headers: PayloadHeaders,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// One failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: MessagePayload,
    #[serde(alias = "publishAt")]
    pub publish_at: DateTime<Utc>,
    #[serde(default, alias = "deliveredAt", skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "retryAt", skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retried: u32,
    pub status: Status,
    #[serde(default)]
    pub last_errors: Vec<LastError>,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(alias = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied by [`crate::store::MessageStore::update`]. Absent
/// fields are preserved.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub status: Option<Status>,
    pub retried: Option<u32>,
    pub retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_errors: Option<Vec<LastError>>,
}

impl MessagePatch {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Creation request for the message store. The optional fields exist for the
/// seeding path; the default path derives id and timestamps server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessage {
    pub payload: MessagePayload,
    #[serde(alias = "publishAt")]
    pub publish_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CreateMessage {
    pub fn new(id: String, payload: MessagePayload, publish_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            publish_at,
            id: Some(id),
            status: None,
            created_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    Create,
    Update,
    Delete,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Create => "CREATE",
            LogType::Update => "UPDATE",
            LogType::Delete => "DELETE",
        }
    }
}

impl FromStr for LogType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(LogType::Create),
            "UPDATE" => Ok(LogType::Update),
            "DELETE" => Ok(LogType::Delete),
            other => Err(Error::internal(eyre::eyre!("unknown log type {other}"))),
        }
    }
}

/// Audit record of a single store mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: LogType,
    pub object: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    fn record(
        kind: LogType,
        message_id: &str,
        before: Option<&Message>,
        after: Option<&Message>,
    ) -> Self {
        Self {
            id: log_id(),
            kind,
            object: OBJECT_MESSAGES.to_owned(),
            message_id: message_id.to_owned(),
            before_data: before.map(|m| serde_json::json!(m)),
            after_data: after.map(|m| serde_json::json!(m)),
            created_at: Utc::now(),
        }
    }

    pub fn created(after: &Message) -> Self {
        Self::record(LogType::Create, &after.id, None, Some(after))
    }

    pub fn updated(before: &Message, after: &Message) -> Self {
        Self::record(LogType::Update, &after.id, Some(before), Some(after))
    }

    pub fn deleted(before: &Message) -> Self {
        Self::record(LogType::Delete, &before.id, Some(before), None)
    }
}

pub const OBJECT_MESSAGES: &str = "messages";

/// Internal record on the durable queue. Distinct from a [`Message`]: events
/// drive the state machine, messages are what gets delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MessageReceived,
    MessageQueued,
    MessageRetry,
    StoreCreateEvent,
    StoreUpdateEvent,
    StoreDeleteEvent,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageReceived => "MESSAGE_RECEIVED",
            EventType::MessageQueued => "MESSAGE_QUEUED",
            EventType::MessageRetry => "MESSAGE_RETRY",
            EventType::StoreCreateEvent => "STORE_CREATE_EVENT",
            EventType::StoreUpdateEvent => "STORE_UPDATE_EVENT",
            EventType::StoreDeleteEvent => "STORE_DELETE_EVENT",
        }
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MESSAGE_RECEIVED" => Ok(EventType::MessageReceived),
            "MESSAGE_QUEUED" => Ok(EventType::MessageQueued),
            "MESSAGE_RETRY" => Ok(EventType::MessageRetry),
            "STORE_CREATE_EVENT" => Ok(EventType::StoreCreateEvent),
            "STORE_UPDATE_EVENT" => Ok(EventType::StoreUpdateEvent),
            "STORE_DELETE_EVENT" => Ok(EventType::StoreDeleteEvent),
            other => Err(Error::internal(eyre::eyre!("unknown event type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub object: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SystemEvent {
    fn new(kind: EventType, data: serde_json::Value) -> Self {
        Self {
            id: event_id(),
            kind,
            object: OBJECT_MESSAGES.to_owned(),
            data,
            created_at: Utc::now(),
        }
    }

    pub fn received(request: &CreateMessage) -> Self {
        Self::new(EventType::MessageReceived, serde_json::json!(request))
    }

    pub fn queued(message: &Message) -> Self {
        Self::new(EventType::MessageQueued, serde_json::json!(message))
    }

    pub fn retry(message: &Message) -> Self {
        Self::new(EventType::MessageRetry, serde_json::json!(message))
    }

    pub fn store_create(after: &Message) -> Self {
        Self::new(
            EventType::StoreCreateEvent,
            serde_json::json!({ "after": after }),
        )
    }

    pub fn store_update(before: &Message, after: &Message) -> Self {
        Self::new(
            EventType::StoreUpdateEvent,
            serde_json::json!({ "before": before, "after": after }),
        )
    }

    pub fn store_delete(before: &Message) -> Self {
        Self::new(
            EventType::StoreDeleteEvent,
            serde_json::json!({ "before": before }),
        )
    }
}

pub fn message_id() -> String {
    format!("msg_{}", Uuid::now_v7().simple())
}

pub fn log_id() -> String {
    format!("log_{}", Uuid::now_v7().simple())
}

pub fn event_id() -> String {
    format!("evt_{}", Uuid::now_v7().simple())
}

/// Canonical on-disk timestamp form: ISO-8601 UTC with millisecond precision.
/// A fixed width keeps lexicographic order equal to chronological order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::internal(eyre::eyre!("malformed timestamp {raw:?}: {e}")))
}
