use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;

use crate::error::Error;
use crate::model::{Message, Status};

fn publish_date_key(message: &Message) -> String {
    message.publish_at.date_naive().to_string()
}

/// Key-value message backend. The primary map is keyed by message id; the
/// `BY_STATUS` and `BY_PUBLISH_DATE` secondary indexes are explicit data
/// structures and every mutation updates them under the same write lock as
/// the primary record.
#[derive(Clone, Default)]
pub struct KvBackend {
    inner: Arc<RwLock<KvInner>>,
}

#[derive(Default)]
struct KvInner {
    messages: BTreeMap<String, Message>,
    by_status: HashMap<Status, BTreeSet<String>>,
    by_publish_date: BTreeMap<String, BTreeSet<String>>,
}

impl KvInner {
    fn index(&mut self, message: &Message) {
        self.by_status
            .entry(message.status)
            .or_default()
            .insert(message.id.clone());
        self.by_publish_date
            .entry(publish_date_key(message))
            .or_default()
            .insert(message.id.clone());
    }

    fn unindex(&mut self, message: &Message) {
        if let Some(ids) = self.by_status.get_mut(&message.status) {
            ids.remove(&message.id);
            if ids.is_empty() {
                self.by_status.remove(&message.status);
            }
        }
        let date_key = publish_date_key(message);
        if let Some(ids) = self.by_publish_date.get_mut(&date_key) {
            ids.remove(&message.id);
            if ids.is_empty() {
                self.by_publish_date.remove(&date_key);
            }
        }
    }
}

impl KvBackend {
    pub fn insert(&self, message: &Message) -> Result<(), Error> {
        let mut inner = self.inner.write().expect("kv lock");
        if inner.messages.contains_key(&message.id) {
            return Err(Error::DuplicateId {
                id: message.id.clone(),
            });
        }
        inner.messages.insert(message.id.clone(), message.clone());
        inner.index(message);
        Ok(())
    }

    pub fn fetch_one(&self, id: &str) -> Result<Message, Error> {
        self.inner
            .read()
            .expect("kv lock")
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| Error::message_not_found(id))
    }

    pub fn fetch_by_status(&self, status: Status) -> Vec<Message> {
        let inner = self.inner.read().expect("kv lock");
        let mut messages: Vec<Message> = inner
            .by_status
            .get(&status)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect();
        messages.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        messages
    }

    pub fn fetch_by_date(&self, date: NaiveDate) -> Vec<Message> {
        let inner = self.inner.read().expect("kv lock");
        let mut messages: Vec<Message> = inner
            .by_publish_date
            .get(&date.to_string())
            .into_iter()
            .flatten()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect();
        messages.sort_by(|a, b| (a.publish_at, &a.id).cmp(&(b.publish_at, &b.id)));
        messages
    }

    pub fn fetch_all(&self) -> Vec<Message> {
        let inner = self.inner.read().expect("kv lock");
        let mut messages: Vec<Message> = inner.messages.values().cloned().collect();
        messages.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        messages
    }

    pub fn replace(&self, message: &Message) -> Result<(), Error> {
        let mut inner = self.inner.write().expect("kv lock");
        let prior = inner
            .messages
            .get(&message.id)
            .cloned()
            .ok_or_else(|| Error::message_not_found(&message.id))?;

        inner.unindex(&prior);
        inner.messages.insert(message.id.clone(), message.clone());
        inner.index(message);
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Option<Message> {
        let mut inner = self.inner.write().expect("kv lock");
        let prior = inner.messages.remove(id)?;
        inner.unindex(&prior);
        Some(prior)
    }

    pub fn count(&self) -> u64 {
        self.inner.read().expect("kv lock").messages.len() as u64
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write().expect("kv lock");
        inner.messages.clear();
        inner.by_status.clear();
        inner.by_publish_date.clear();
    }

    /// Raw key dump for the admin surface, mirroring the on-disk layout
    /// `[stores, messages, …]` / `[…, secondaries, …]`.
    pub fn dump(&self) -> serde_json::Value {
        let inner = self.inner.read().expect("kv lock");
        let messages: serde_json::Map<String, serde_json::Value> = inner
            .messages
            .iter()
            .map(|(id, msg)| (id.clone(), serde_json::json!(msg)))
            .collect();
        let by_status: serde_json::Map<String, serde_json::Value> = inner
            .by_status
            .iter()
            .map(|(status, ids)| (status.to_string(), serde_json::json!(ids)))
            .collect();
        let by_publish_date: serde_json::Map<String, serde_json::Value> = inner
            .by_publish_date
            .iter()
            .map(|(date, ids)| (date.clone(), serde_json::json!(ids)))
            .collect();

        serde_json::json!({
            "messages": messages,
            "secondaries": {
                "BY_STATUS": by_status,
                "BY_PUBLISH_DATE": by_publish_date,
            },
        })
    }
}
