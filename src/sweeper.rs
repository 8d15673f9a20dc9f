//! Lifecycle sweeper.
//!
//! Periodic task that expires conversations, purges consumed and expired
//! messages, reclaims storage, and emits expiry notifications. A failing
//! step is logged and never aborts the steps after it.

use crate::apns::{ApnsBridge, PushKind};
use crate::cache::{keys, Cache};
use crate::config::Config;
use crate::files::FileStaging;
use crate::models::*;
use crate::queue::MessageQueue;
use crate::store::Store;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Sweeper {
    store: Arc<Store>,
    cache: Arc<Cache>,
    apns: Arc<ApnsBridge>,
    files: Arc<FileStaging>,
    queue: MessageQueue,
    config: Arc<Config>,
}

impl Sweeper {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<Cache>,
        apns: Arc<ApnsBridge>,
        files: Arc<FileStaging>,
        queue: MessageQueue,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            cache,
            apns,
            files,
            queue,
            config,
        }
    }

    /// Start the periodic sweep task.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sweeper = self;
        tokio::spawn(async move {
            info!(
                interval_secs = sweeper.config.sweeper_interval.as_secs(),
                "Started lifecycle sweeper"
            );
            let mut ticker = tokio::time::interval(sweeper.config.sweeper_interval);
            // The first tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweeper.sweep().await;
            }
        })
    }

    /// Run one full sweep. Public so deployments and tests can trigger
    /// sweeps on demand.
    pub async fn sweep(&self) {
        let now = Utc::now();

        // 1. Expired messages.
        {
            let mut tx = self.store.begin().await;
            let removed = tx.delete_expired_messages(now);
            drop(tx);
            if removed > 0 {
                debug!(removed, "Purged expired messages");
            }
        }

        // 2. Consumed messages past the read-retention window.
        {
            let cutoff = now
                - Duration::from_std(self.config.consumed_retention)
                    .unwrap_or_else(|_| Duration::hours(1));
            let mut tx = self.store.begin().await;
            let removed = tx.delete_consumed_read_before(cutoff);
            drop(tx);
            if removed > 0 {
                debug!(removed, "Purged consumed messages");
            }
        }

        // 3. Messages orphaned by terminal conversations.
        {
            let mut tx = self.store.begin().await;
            let removed = tx.delete_messages_of_dead_conversations(now);
            drop(tx);
            if removed > 0 {
                debug!(removed, "Purged messages of ended conversations");
            }
        }

        // 4. ACTIVE -> EXPIRED transitions, with expiry notifications to
        //    everyone who ever joined.
        let expiring = self.store.conversations_to_expire(now).await;
        for conversation in expiring {
            let mut tx = self.store.begin().await;
            let transitioned =
                tx.set_conversation_status(&conversation.id, ConversationStatus::Expired);
            drop(tx);
            if !transitioned {
                continue;
            }

            let _ = self.cache.del(&keys::conversation(&conversation.id));
            let _ = self.cache.del(&keys::conversation_messages(&conversation.id));
            let _ = self
                .cache
                .del(&keys::device_conversations(&conversation.initiator_device_id));

            let recipients: Vec<DeviceId> = self
                .store
                .participants_by_conversation(&conversation.id)
                .await
                .into_iter()
                .map(|p| p.device_id)
                .collect();
            self.apns
                .notify(conversation.id, recipients, PushKind::ConversationExpired);
            debug!(conversation = %conversation.id, "Conversation expired");
        }

        // 5. Hard-delete conversations past the deleted-retention window.
        {
            let cutoff = now
                - Duration::from_std(self.config.deleted_retention)
                    .unwrap_or_else(|_| Duration::hours(1));
            let doomed = self.store.deleted_conversations_before(cutoff).await;
            for conversation in doomed {
                let mut tx = self.store.begin().await;
                let (participants, messages) = tx.delete_conversation_cascade(&conversation.id);
                drop(tx);
                let _ = self.cache.del(&keys::conversation(&conversation.id));
                debug!(
                    conversation = %conversation.id,
                    participants,
                    messages,
                    "Hard-deleted conversation"
                );
            }
        }

        // 6. Stale file folders.
        {
            let cutoff = (now - Duration::days(self.config.file_retention_days)).date_naive();
            match self.files.cleanup_directories(cutoff).await {
                Ok(removed) if removed > 0 => debug!(removed, "Reaped file folders"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "File folder cleanup failed"),
            }
        }

        // Dead-letter records past their retention.
        let pruned = self.queue.prune_dead_letters(self.config.dlq_ttl);
        if pruned > 0 {
            debug!(pruned, "Pruned dead-letter records");
        }

        // Reclaim lazily expired cache entries while we are here.
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::FreeTierGate;
    use uuid::Uuid;

    struct Fixture {
        sweeper: Sweeper,
        store: Arc<Store>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.file_base_path = dir.path().to_str().unwrap().to_string();
        let config = Arc::new(config);
        let store = Arc::new(Store::new());
        let cache = Arc::new(Cache::new());
        let apns = Arc::new(ApnsBridge::new(&config, store.clone(), cache.clone()).await);
        let files = Arc::new(FileStaging::new(
            store.clone(),
            cache.clone(),
            Arc::new(FreeTierGate),
            config.clone(),
        ));
        let sweeper = Sweeper::new(
            store.clone(),
            cache.clone(),
            apns,
            files,
            MessageQueue::new(cache),
            config,
        );
        Fixture {
            sweeper,
            store,
            _dir: dir,
        }
    }

    async fn seed_conversation(store: &Store, status: ConversationStatus, expires_in: Duration) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            initiator_device_id: "device-a".into(),
            status,
            created_at: now - Duration::hours(2),
            expires_at: now + expires_in,
        };
        let mut tx = store.begin().await;
        tx.insert_conversation(conversation.clone());
        tx.insert_participant(Participant {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            device_id: "device-a".into(),
            is_initiator: true,
            joined_at: now - Duration::hours(2),
            departed_at: None,
            link_consumed_at: None,
        });
        drop(tx);
        conversation
    }

    fn message(conversation_id: Uuid, expires_in: Duration) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            conversation_id: Some(conversation_id),
            ciphertext: b"blob".to_vec(),
            nonce: b"n".to_vec(),
            tag: None,
            message_type: MessageType::Text,
            created_at: now - Duration::hours(1),
            expires_at: now + expires_in,
            read_at: None,
            consumed: false,
            sender_device_id: None,
            file_ref: None,
            file: None,
        }
    }

    #[tokio::test]
    async fn overdue_active_conversation_becomes_expired_within_one_sweep() {
        let f = fixture().await;
        let overdue =
            seed_conversation(&f.store, ConversationStatus::Active, Duration::seconds(-1)).await;
        let fresh =
            seed_conversation(&f.store, ConversationStatus::Active, Duration::hours(1)).await;

        f.sweeper.sweep().await;

        let swept = f.store.conversation(&overdue.id).await.unwrap();
        assert_eq!(swept.status, ConversationStatus::Expired);
        let untouched = f.store.conversation(&fresh.id).await.unwrap();
        assert_eq!(untouched.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn expired_and_stale_consumed_messages_are_purged() {
        let f = fixture().await;
        let conversation =
            seed_conversation(&f.store, ConversationStatus::Active, Duration::hours(1)).await;

        let mut tx = f.store.begin().await;
        tx.insert_message(message(conversation.id, Duration::seconds(-1)));
        let mut consumed = message(conversation.id, Duration::hours(1));
        consumed.consumed = true;
        consumed.read_at = Some(Utc::now() - Duration::hours(2));
        tx.insert_message(consumed);
        let keeper = message(conversation.id, Duration::hours(1));
        let keeper_id = keeper.id;
        tx.insert_message(keeper);
        drop(tx);

        f.sweeper.sweep().await;

        assert_eq!(f.store.message_count().await, 1);
        assert!(f.store.message(&keeper_id).await.is_some());
    }

    #[tokio::test]
    async fn deleted_conversations_are_hard_deleted_after_retention() {
        let f = fixture().await;
        let deleted =
            seed_conversation(&f.store, ConversationStatus::Deleted, Duration::hours(1)).await;
        let mut tx = f.store.begin().await;
        tx.insert_message(message(deleted.id, Duration::hours(1)));
        drop(tx);

        f.sweeper.sweep().await;

        assert!(f.store.conversation(&deleted.id).await.is_none());
        assert!(f
            .store
            .participants_by_conversation(&deleted.id)
            .await
            .is_empty());
        assert_eq!(f.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_is_reentrant() {
        let f = fixture().await;
        seed_conversation(&f.store, ConversationStatus::Active, Duration::seconds(-1)).await;

        f.sweeper.sweep().await;
        // A second sweep finds nothing new to do and must not fail.
        f.sweeper.sweep().await;
    }
}
