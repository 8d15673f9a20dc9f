//! Pipeline worker: drains the ingestion queue into durable storage and
//! fans out delivery notifications.
//!
//! A single ticker-driven loop pops up to a bounded batch per tick, so one
//! busy conversation cannot starve other background work. Failures retry at
//! the queue tail; a record that exhausts its budget is dead-lettered and
//! its sender receives MESSAGE_FAILED. Exactly one of DELIVERED/FAILED is
//! emitted per server id. Running a single worker preserves
//! per-conversation FIFO; adding workers would demote that to best-effort.

use crate::apns::{ApnsBridge, PushKind};
use crate::cache::{keys, Cache, Lookup};
use crate::config::Config;
use crate::hub::{conversation_topic, Hub};
use crate::models::*;
use crate::queue::MessageQueue;
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a record could not be ingested this round.
#[derive(Debug, thiserror::Error)]
enum IngestError {
    #[error("conversation {0} not found")]
    ConversationMissing(Uuid),
    #[error("conversation {0} is not active")]
    ConversationDead(Uuid),
}

pub struct PipelineWorker {
    store: Arc<Store>,
    cache: Arc<Cache>,
    queue: MessageQueue,
    hub: Arc<Hub>,
    apns: Arc<ApnsBridge>,
    config: Arc<Config>,
    shutdown: watch::Receiver<bool>,
}

impl PipelineWorker {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<Cache>,
        queue: MessageQueue,
        hub: Arc<Hub>,
        apns: Arc<ApnsBridge>,
        config: Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            hub,
            apns,
            config,
            shutdown,
        }
    }

    /// Run the drain loop until shutdown. In-flight records finish before
    /// the loop exits; queued records stay queued.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let worker = self;
        tokio::spawn(async move {
            info!(
                interval_ms = worker.config.queue_interval.as_millis() as u64,
                batch = worker.config.queue_batch_size,
                "Started pipeline worker"
            );
            let mut ticker = tokio::time::interval(worker.config.queue_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *worker.shutdown.borrow() {
                    info!("Pipeline worker draining stopped");
                    return;
                }
                ticker.tick().await;
                worker.drain_once().await;
            }
        })
    }

    /// Drain one bounded batch. Returns how many records were taken off the
    /// queue (including retried and dead-lettered ones).
    ///
    /// The budget is also capped at the queue depth seen at entry, so a
    /// record requeued for retry waits for the next tick instead of
    /// spinning inside this one.
    pub async fn drain_once(&self) -> usize {
        let budget = self.config.queue_batch_size.min(self.queue.len());
        let mut drained = 0;
        for _ in 0..budget {
            if *self.shutdown.borrow() {
                break;
            }
            let record = match self.queue.dequeue() {
                Lookup::Hit(record) => record,
                Lookup::Miss => break,
                Lookup::Unavailable => {
                    warn!("Queue unavailable, skipping tick");
                    break;
                }
            };
            drained += 1;
            self.process(record).await;
        }
        drained
    }

    /// Ingest one record end-to-end, or schedule its retry/DLQ.
    async fn process(&self, record: BufferedMessage) {
        match self.ingest(&record).await {
            Ok(message) => {
                let delivered_at = Utc::now();
                self.hub.send_to_user(
                    &record.device_id,
                    &PushEvent::MessageDelivered {
                        server_id: record.server_id,
                        message_id: message.id,
                        delivered_at,
                    },
                );
                self.hub.publish_topic(
                    &conversation_topic(&record.conversation_id),
                    &PushEvent::NewMessage {
                        conversation_id: record.conversation_id,
                        message_id: message.id,
                    },
                );

                let recipients: Vec<DeviceId> = self
                    .store
                    .active_participants(&record.conversation_id)
                    .await
                    .into_iter()
                    .map(|p| p.device_id)
                    .filter(|d| *d != record.device_id)
                    .collect();
                self.apns
                    .notify(record.conversation_id, recipients, PushKind::Silent);

                debug!(
                    server_id = %record.server_id,
                    message = %message.id,
                    "Buffered message ingested"
                );
            }
            Err(e) => self.retry_or_dead_letter(record, &e),
        }
    }

    /// Persist the record as a durable Message.
    async fn ingest(&self, record: &BufferedMessage) -> Result<Message, IngestError> {
        let mut tx = self.store.begin().await;
        let conversation = tx
            .conversation(&record.conversation_id)
            .ok_or(IngestError::ConversationMissing(record.conversation_id))?;
        if conversation.status != ConversationStatus::Active {
            return Err(IngestError::ConversationDead(record.conversation_id));
        }

        let message = Message {
            id: record.server_id,
            conversation_id: Some(record.conversation_id),
            ciphertext: record.ciphertext.clone(),
            nonce: record.nonce.clone(),
            tag: record.tag.clone(),
            message_type: record.message_type,
            created_at: Utc::now(),
            // Pipeline messages live exactly as long as their conversation.
            expires_at: conversation.expires_at,
            read_at: None,
            consumed: false,
            sender_device_id: Some(record.device_id.clone()),
            file_ref: None,
            file: record.file.clone(),
        };
        tx.insert_message(message.clone());
        drop(tx);

        // The cached listing predates this message.
        let _ = self
            .cache
            .del(&keys::conversation_messages(&record.conversation_id));

        Ok(message)
    }

    fn retry_or_dead_letter(&self, mut record: BufferedMessage, error: &IngestError) {
        record.retry_count += 1;
        if record.retry_count < self.config.queue_retry_limit {
            warn!(
                server_id = %record.server_id,
                retry = record.retry_count,
                error = %error,
                "Ingestion failed, requeueing at tail"
            );
            if self.queue.enqueue(&record).is_err() {
                warn!(server_id = %record.server_id, "Requeue failed, dead-lettering");
                self.fail_terminally(&record);
            }
            return;
        }
        warn!(
            server_id = %record.server_id,
            error = %error,
            "Retry budget exhausted"
        );
        self.fail_terminally(&record);
    }

    fn fail_terminally(&self, record: &BufferedMessage) {
        let _ = self.queue.dead_letter(record);
        self.hub.send_to_user(
            &record.device_id,
            &PushEvent::MessageFailed {
                server_id: record.server_id,
                failed_at: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::USER_QUEUE;

    struct Fixture {
        worker: PipelineWorker,
        store: Arc<Store>,
        queue: MessageQueue,
        hub: Arc<Hub>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::new());
        let cache = Arc::new(Cache::new());
        let config = Arc::new(Config::from_env());
        let hub = Arc::new(Hub::new(64));
        let apns = Arc::new(ApnsBridge::new(&config, store.clone(), cache.clone()).await);
        let queue = MessageQueue::new(cache.clone());
        let (_tx, shutdown) = watch::channel(false);
        let worker = PipelineWorker::new(
            store.clone(),
            cache,
            queue.clone(),
            hub.clone(),
            apns,
            config,
            shutdown,
        );
        Fixture {
            worker,
            store,
            queue,
            hub,
        }
    }

    async fn seed_conversation(store: &Store, initiator: &str) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            initiator_device_id: initiator.to_string(),
            status: ConversationStatus::Active,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
        };
        let mut tx = store.begin().await;
        tx.insert_conversation(conversation.clone());
        tx.insert_participant(Participant {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            device_id: initiator.to_string(),
            is_initiator: true,
            joined_at: now,
            departed_at: None,
            link_consumed_at: None,
        });
        drop(tx);
        conversation
    }

    fn record(conversation_id: Uuid, device_id: &str) -> BufferedMessage {
        BufferedMessage {
            server_id: Uuid::new_v4(),
            conversation_id,
            device_id: device_id.to_string(),
            ciphertext: b"payload".to_vec(),
            nonce: b"nonce".to_vec(),
            tag: Some(b"tag".to_vec()),
            message_type: MessageType::Text,
            file: None,
            queued_at: Utc::now(),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn success_persists_and_emits_delivered_and_new_message() {
        let f = fixture().await;
        let conversation = seed_conversation(&f.store, "device-a").await;

        let (sender_conn, sender_outbox) = f.hub.connect("device-a".into());
        let (recipient_conn, recipient_outbox) = f.hub.connect("device-b".into());
        let topic = conversation_topic(&conversation.id);
        assert!(f.hub.subscribe(recipient_conn, &topic));
        assert!(f.hub.subscribe(sender_conn, USER_QUEUE));

        let r = record(conversation.id, "device-a");
        f.queue.enqueue(&r).unwrap();
        assert_eq!(f.worker.drain_once().await, 1);

        // Message durable with the conversation's expiry and the server id.
        let stored = f.store.message(&r.server_id).await.unwrap();
        assert_eq!(stored.expires_at, conversation.expires_at);
        assert_eq!(stored.sender_device_id.as_deref(), Some("device-a"));

        // Sender ACK on the user queue.
        let frames = sender_outbox.drain();
        assert_eq!(frames.len(), 1);
        let ack: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(ack["type"], "MESSAGE_DELIVERED");
        assert_eq!(ack["serverId"], r.server_id.to_string());

        // Recipient broadcast on the topic.
        let frames = recipient_outbox.drain();
        assert_eq!(frames.len(), 1);
        let broadcast: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(broadcast["type"], "NEW_MESSAGE");
        assert_eq!(broadcast["conversationId"], conversation.id.to_string());
    }

    #[tokio::test]
    async fn missing_conversation_retries_then_dead_letters_exactly_once() {
        let f = fixture().await;
        let (_conn, sender_outbox) = f.hub.connect("device-a".into());

        let r = record(Uuid::new_v4(), "device-a");
        f.queue.enqueue(&r).unwrap();

        // Retry budget is 3: two requeues, then DLQ on the third attempt.
        assert_eq!(f.worker.drain_once().await, 1);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.worker.drain_once().await, 1);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.worker.drain_once().await, 1);
        assert_eq!(f.queue.len(), 0);
        assert_eq!(f.queue.dead_letter_len(), 1);

        // Exactly one MESSAGE_FAILED, no MESSAGE_DELIVERED.
        let frames = sender_outbox.drain();
        assert_eq!(frames.len(), 1);
        let failed: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(failed["type"], "MESSAGE_FAILED");
        assert_eq!(failed["serverId"], r.server_id.to_string());

        // Nothing was persisted under that server id.
        assert!(f.store.message(&r.server_id).await.is_none());
    }

    #[tokio::test]
    async fn batch_is_bounded_per_tick() {
        let f = fixture().await;
        let conversation = seed_conversation(&f.store, "device-a").await;

        let over_batch = f.worker.config.queue_batch_size + 5;
        for _ in 0..over_batch {
            f.queue.enqueue(&record(conversation.id, "device-a")).unwrap();
        }

        assert_eq!(f.worker.drain_once().await, f.worker.config.queue_batch_size);
        assert_eq!(f.queue.len(), 5);
        assert_eq!(f.worker.drain_once().await, 5);
    }

    #[tokio::test]
    async fn per_conversation_fifo_under_single_worker() {
        let f = fixture().await;
        let conversation = seed_conversation(&f.store, "device-a").await;

        let first = record(conversation.id, "device-a");
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = record(conversation.id, "device-a");
        f.queue.enqueue(&first).unwrap();
        f.queue.enqueue(&second).unwrap();
        f.worker.drain_once().await;

        let listed = f
            .store
            .active_messages_by_conversation(&conversation.id, Utc::now())
            .await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.server_id);
        assert_eq!(listed[1].id, second.server_id);
    }

    #[tokio::test]
    async fn shutdown_stops_draining() {
        let store = Arc::new(Store::new());
        let cache = Arc::new(Cache::new());
        let config = Arc::new(Config::from_env());
        let hub = Arc::new(Hub::new(64));
        let apns = Arc::new(ApnsBridge::new(&config, store.clone(), cache.clone()).await);
        let queue = MessageQueue::new(cache.clone());
        let (tx, shutdown) = watch::channel(false);
        let worker = PipelineWorker::new(
            store.clone(),
            cache,
            queue.clone(),
            hub,
            apns,
            config,
            shutdown,
        );

        let conversation = seed_conversation(&store, "device-a").await;
        queue.enqueue(&record(conversation.id, "device-a")).unwrap();

        tx.send(true).unwrap();
        assert_eq!(worker.drain_once().await, 0);
        assert_eq!(queue.len(), 1);
    }
}
