use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::deliver::{DeliveryOutcome, DeliveryWorker};
use crate::error::Error;
use crate::model::{
    CreateMessage, EventType, Message, MessagePatch, Status, SystemEvent, FAILURE_CALLBACK_KEY,
};
use crate::queue::DurableQueue;
use crate::store::MessageStore;

pub const MAX_RETRIES: u32 = 3;

/// Sole consumer of the durable queue. Each event either creates the subject
/// message, forces it to `DELIVER`, or advances it through the state machine
/// based on its current status. All transitions are status-driven and
/// idempotent, which is what makes at-least-once event delivery safe.
#[derive(Clone)]
pub struct StateManager {
    store: MessageStore,
    queue: DurableQueue,
    worker: DeliveryWorker,
    retry_delay: Duration,
}

impl StateManager {
    pub fn new(
        store: MessageStore,
        queue: DurableQueue,
        worker: DeliveryWorker,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            worker,
            retry_delay,
        }
    }

    /// The subject model of an event: `data.before` for deletes,
    /// `data.after` for creates/updates, `data` itself otherwise.
    fn subject(event: &SystemEvent) -> Result<Option<Message>, Error> {
        let value = match event.kind {
            EventType::StoreDeleteEvent => event.data.get("before"),
            EventType::StoreCreateEvent | EventType::StoreUpdateEvent => event.data.get("after"),
            _ => Some(&event.data),
        };

        value
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(Error::from)
    }

    pub async fn handle(&self, event: &SystemEvent) -> Result<(), Error> {
        tracing::debug!(event = event.kind.as_str(), id = %event.id, "processing event");

        match event.kind {
            EventType::MessageReceived => {
                let request: CreateMessage = serde_json::from_value(event.data.clone())?;
                let (message, store_event) = self.store.create(request).await?;
                tracing::info!(message_id = %message.id, publish_at = %message.publish_at, "message created");
                // the create event re-enters the machine and drives scheduling
                self.queue.enqueue(&store_event, None).await
            }

            EventType::MessageQueued | EventType::MessageRetry => {
                let Some(subject) = Self::subject(event)? else {
                    return Ok(());
                };
                let (_, store_event) = self
                    .store
                    .update(&subject.id, MessagePatch::status(Status::Deliver))
                    .await?;
                self.queue.enqueue(&store_event, None).await
            }

            // a deleted message has no further work to drive
            EventType::StoreDeleteEvent => Ok(()),

            EventType::StoreCreateEvent | EventType::StoreUpdateEvent => {
                let Some(message) = Self::subject(event)? else {
                    return Ok(());
                };
                self.advance(message).await
            }
        }
    }

    async fn advance(&self, message: Message) -> Result<(), Error> {
        match message.status {
            Status::Created => self.on_created(message).await,
            Status::Queued => self.on_queued(message).await,
            Status::Deliver => self.on_deliver(message).await,
            Status::Retry => self.on_retry(message).await,
            Status::Dlq => self.on_dlq(message).await,
            Status::Sent | Status::Archived => Ok(()),
        }
    }

    async fn on_created(&self, message: Message) -> Result<(), Error> {
        let now = Utc::now();

        if message.publish_at <= now {
            let (_, event) = self
                .store
                .update(&message.id, MessagePatch::status(Status::Deliver))
                .await?;
            return self.queue.enqueue(&event, None).await;
        }

        if message.publish_at.date_naive() == now.date_naive() {
            let (_, event) = self
                .store
                .update(&message.id, MessagePatch::status(Status::Queued))
                .await?;
            return self.queue.enqueue(&event, None).await;
        }

        // scheduled for a later day; the daily activator will pick it up
        Ok(())
    }

    /// Entering `QUEUED` schedules the delayed wake-up. Both the ingress path
    /// and the daily activator funnel through here via the update event.
    async fn on_queued(&self, message: Message) -> Result<(), Error> {
        let delay = (message.publish_at - Utc::now()).to_std().unwrap_or_default();
        self.queue
            .enqueue(&SystemEvent::queued(&message), Some(delay))
            .await
    }

    async fn on_retry(&self, message: Message) -> Result<(), Error> {
        let delay = message
            .retry_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or_default();
        self.queue
            .enqueue(&SystemEvent::retry(&message), Some(delay))
            .await
    }

    async fn on_deliver(&self, message: Message) -> Result<(), Error> {
        match self.worker.deliver(&message).await {
            DeliveryOutcome::Delivered { status } => {
                tracing::info!(message_id = %message.id, status, "delivered");
                let patch = MessagePatch {
                    status: Some(Status::Sent),
                    delivered_at: Some(Utc::now()),
                    ..MessagePatch::default()
                };
                let (_, event) = self.store.update(&message.id, patch).await?;
                self.queue.enqueue(&event, None).await
            }

            DeliveryOutcome::Failed(failure) => {
                tracing::warn!(
                    message_id = %message.id,
                    status = ?failure.status,
                    error = %failure.message,
                    retried = message.retried,
                    "delivery failed"
                );

                if message.retried < MAX_RETRIES {
                    let now = Utc::now();
                    let retry_at = now
                        + chrono::Duration::from_std(self.retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());

                    let mut last_errors = message.last_errors.clone();
                    last_errors.push(failure.into_last_error());

                    let patch = MessagePatch {
                        status: Some(Status::Retry),
                        retried: Some(message.retried + 1),
                        retry_at: Some(retry_at),
                        last_errors: Some(last_errors),
                        ..MessagePatch::default()
                    };
                    let (_, event) = self.store.update(&message.id, patch).await?;
                    self.queue.enqueue(&event, None).await
                } else {
                    let (_, event) = self
                        .store
                        .update(&message.id, MessagePatch::status(Status::Dlq))
                        .await?;
                    self.queue.enqueue(&event, None).await
                }
            }
        }
    }

    /// Dead-lettered. One failure-callback attempt if the client asked for
    /// it; the outcome never changes state.
    async fn on_dlq(&self, message: Message) -> Result<(), Error> {
        if let Some(url) = message.payload.headers.command.get(FAILURE_CALLBACK_KEY) {
            tracing::info!(message_id = %message.id, url = %url, "invoking failure callback");
            if let Err(e) = self.worker.failure_callback(&message, url).await {
                tracing::warn!(message_id = %message.id, error = %e, "failure callback failed");
            }
        }
        Ok(())
    }
}

/// Single-threaded consumer loop: claim, process, mark done. Processing one
/// event at a time serializes state transitions; a `NotFound` drops the event
/// instead of poisoning the queue, any other failure releases it for a
/// redelivery.
pub async fn run_consumer(
    manager: StateManager,
    queue: DurableQueue,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue.claim().await {
            Ok(Some(claimed)) => {
                let result = match manager.handle(&claimed.event).await {
                    Ok(()) => queue.mark_done(&claimed).await,
                    Err(e) if e.is_not_found() => {
                        tracing::warn!(
                            event = claimed.event.kind.as_str(),
                            id = %claimed.event.id,
                            error = %e,
                            "dropping event for missing message"
                        );
                        queue.mark_done(&claimed).await
                    }
                    Err(e) => {
                        tracing::warn!(
                            event = claimed.event.kind.as_str(),
                            id = %claimed.event.id,
                            error = %e,
                            "event processing failed, releasing"
                        );
                        queue.release(&claimed).await
                    }
                };

                if let Err(e) = result {
                    tracing::warn!(error = %e, "queue bookkeeping failed");
                }
            }

            Ok(None) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }

            Err(e) => {
                tracing::warn!(error = %e, "queue claim failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }

    tracing::info!("event consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{KvLogs, LogStore};
    use crate::model::{message_id, MessagePayload, PayloadHeaders};
    use crate::queue::MemoryQueue;
    use crate::stats::{KvStats, Stats};
    use crate::store::kv::KvBackend;
    use chrono::Duration as ChronoDuration;

    fn manager() -> (StateManager, MessageStore, DurableQueue) {
        let store = MessageStore::key_value(
            KvBackend::default(),
            Stats::KeyValue(KvStats::default()),
            LogStore::KeyValue(KvLogs::default()),
            false,
        );
        let queue = DurableQueue::Memory(MemoryQueue::default());
        let manager = StateManager::new(
            store.clone(),
            queue.clone(),
            DeliveryWorker::new().unwrap(),
            Duration::from_millis(100),
        );
        (manager, store, queue)
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

    /// Drive every currently visible event to completion.
    async fn drain(manager: &StateManager, queue: &DurableQueue) {
        while let Some(claimed) = queue.claim().await.unwrap() {
            manager.handle(&claimed.event).await.unwrap();
            queue.mark_done(&claimed).await.unwrap();
        }
    }

    #[tokio::test]
    async fn received_event_creates_the_message() {
        let (manager, store, queue) = manager();
        let request = request(Utc::now() + ChronoDuration::days(3));
        let id = request.id.clone().unwrap();

        manager
            .handle(&SystemEvent::received(&request))
            .await
            .unwrap();

        let message = store.fetch_one(&id).await.unwrap();
        assert_eq!(message.status, Status::Created);

        // the create event is on the queue, ready to drive scheduling
        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(claimed.event.kind, EventType::StoreCreateEvent);
    }

    #[tokio::test]
    async fn future_day_messages_stay_created() {
        let (manager, store, queue) = manager();
        let request = request(Utc::now() + ChronoDuration::days(3));
        let id = request.id.clone().unwrap();

        manager
            .handle(&SystemEvent::received(&request))
            .await
            .unwrap();
        drain(&manager, &queue).await;

        assert_eq!(store.fetch_one(&id).await.unwrap().status, Status::Created);
    }

    #[tokio::test]
    async fn same_day_messages_are_queued_with_delay() {
        let (manager, store, queue) = manager();
        // close enough that it is still today in UTC, far enough not to fire
        let request = request(Utc::now() + ChronoDuration::milliseconds(800));
        let id = request.id.clone().unwrap();

        manager
            .handle(&SystemEvent::received(&request))
            .await
            .unwrap();
        drain(&manager, &queue).await;

        let message = store.fetch_one(&id).await.unwrap();
        // midnight rollover between now and publish_at makes CREATED legal
        assert!(matches!(message.status, Status::Queued | Status::Created));
    }

    #[tokio::test]
    async fn queued_wakeup_forces_deliver() {
        let (manager, store, _) = manager();
        let (message, _) = store
            .create(CreateMessage::new(
                message_id(),
                MessagePayload {
                    headers: PayloadHeaders::default(),
                    url: "https://example.invalid/hook".to_owned(),
                    data: None,
                },
                Utc::now(),
            ))
            .await
            .unwrap();

        manager
            .handle(&SystemEvent::queued(&message))
            .await
            .unwrap();

        assert_eq!(
            store.fetch_one(&message.id).await.unwrap().status,
            Status::Deliver
        );
    }

    #[tokio::test]
    async fn missing_subject_surfaces_not_found() {
        let (manager, store, _) = manager();
        let (message, _) = store.create(request(Utc::now())).await.unwrap();
        store.delete(&message.id).await.unwrap();

        let err = manager
            .handle(&SystemEvent::queued(&message))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_events_are_inert() {
        let (manager, store, queue) = manager();
        let (message, _) = store.create(request(Utc::now())).await.unwrap();
        let (_, delete_event) = store.delete(&message.id).await.unwrap();

        manager.handle(&delete_event.unwrap()).await.unwrap();
        assert!(queue.claim().await.unwrap().is_none());
    }
}
