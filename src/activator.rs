use std::time::Duration;

use chrono::{NaiveTime, TimeZone, Utc};
use tokio::sync::watch;

use crate::model::{MessagePatch, Status};
use crate::queue::DurableQueue;
use crate::store::MessageStore;

/// Time until the next UTC midnight.
fn until_next_midnight() -> Duration {
    let now = Utc::now();
    let tomorrow = now.date_naive() + chrono::Duration::days(1);
    let midnight = Utc.from_utc_datetime(
        &tomorrow.and_time(NaiveTime::from_hms_opt(0, 0, 0).expect("midnight exists")),
    );
    (midnight - now).to_std().unwrap_or(Duration::from_secs(1))
}

/// Promotes today's `CREATED` messages to `QUEUED`. The update event re-enters
/// the state machine, which then schedules the delayed wake-up.
pub async fn sweep(store: &MessageStore, queue: &DurableQueue) {
    let today = Utc::now().date_naive();

    let messages = match store.fetch_by_date(today).await {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(error = %e, "daily sweep fetch failed");
            return;
        }
    };

    let mut promoted = 0usize;
    for message in messages {
        if message.status != Status::Created {
            continue;
        }

        match store
            .update(&message.id, MessagePatch::status(Status::Queued))
            .await
        {
            Ok((_, event)) => {
                if let Err(e) = queue.enqueue(&event, None).await {
                    tracing::warn!(message_id = %message.id, error = %e, "daily sweep enqueue failed");
                } else {
                    promoted += 1;
                }
            }
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "daily sweep update failed");
            }
        }
    }

    if promoted > 0 {
        tracing::info!(promoted, date = %today, "daily sweep promoted messages");
    }
}

/// Wall-clock worker: sleeps until midnight UTC, sweeps, repeats.
pub async fn run_activator(
    store: MessageStore,
    queue: DurableQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let wait = until_next_midnight();
        tracing::debug!(wait_secs = wait.as_secs(), "daily activator sleeping");

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(wait) => sweep(&store, &queue).await,
        }
    }

    tracing::info!("daily activator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{KvLogs, LogStore};
    use crate::model::{message_id, CreateMessage, MessagePayload, PayloadHeaders};
    use crate::queue::MemoryQueue;
    use crate::stats::{KvStats, Stats};
    use crate::store::kv::KvBackend;
    use chrono::Duration as ChronoDuration;

    fn fixtures() -> (MessageStore, DurableQueue) {
        let store = MessageStore::key_value(
            KvBackend::default(),
            Stats::KeyValue(KvStats::default()),
            LogStore::KeyValue(KvLogs::default()),
            false,
        );
        (store, DurableQueue::Memory(MemoryQueue::default()))
    }

    fn request(publish_at: chrono::DateTime<Utc>) -> CreateMessage {
        CreateMessage::new(
            message_id(),
            MessagePayload {
                headers: PayloadHeaders::default(),
                url: "https://example.invalid/hook".to_owned(),
                data: None,
            },
            publish_at,
        )
    }

    #[test]
    fn next_midnight_is_within_a_day() {
        let wait = until_next_midnight();
        assert!(wait <= Duration::from_secs(24 * 60 * 60));
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test]
    async fn sweep_promotes_only_todays_created() {
        let (store, queue) = fixtures();

        let (today_msg, _) = store.create(request(Utc::now())).await.unwrap();
        let (future_msg, _) = store
            .create(request(Utc::now() + ChronoDuration::days(4)))
            .await
            .unwrap();
        let (sent_msg, _) = store.create(request(Utc::now())).await.unwrap();
        store
            .update(&sent_msg.id, MessagePatch::status(Status::Sent))
            .await
            .unwrap();

        sweep(&store, &queue).await;

        assert_eq!(
            store.fetch_one(&today_msg.id).await.unwrap().status,
            Status::Queued
        );
        assert_eq!(
            store.fetch_one(&future_msg.id).await.unwrap().status,
            Status::Created
        );
        assert_eq!(
            store.fetch_one(&sent_msg.id).await.unwrap().status,
            Status::Sent
        );

        // exactly one update event queued, for the promoted message
        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(
            claimed.event.data["after"]["id"],
            serde_json::json!(today_msg.id)
        );
        assert!(queue.claim().await.unwrap().is_none());
    }
}
