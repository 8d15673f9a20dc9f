//! Conversation service: room lifecycle and participant admission.
//!
//! Rooms are two-party and time-limited. The share link is one-shot: across
//! a conversation's whole lifetime at most one non-initiator device may
//! consume it, enforced by a uniqueness check inside the join transaction.
//! Only the initiator may delete; leaving never tears a room down.

use crate::apns::{ApnsBridge, PushKind};
use crate::cache::{keys, Cache, Lookup};
use crate::config::Config;
use crate::error::ApiError;
use crate::models::*;
use crate::store::Store;
use crate::tier::SubscriptionGate;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Conversation and participant operations.
#[derive(Clone)]
pub struct Conversations {
    store: Arc<Store>,
    cache: Arc<Cache>,
    apns: Arc<ApnsBridge>,
    gate: Arc<dyn SubscriptionGate>,
    config: Arc<Config>,
}

impl Conversations {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<Cache>,
        apns: Arc<ApnsBridge>,
        gate: Arc<dyn SubscriptionGate>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            cache,
            apns,
            gate,
            config,
        }
    }

    /// Create a conversation with the caller as initiator.
    pub async fn create(
        &self,
        device_id: &DeviceId,
        ttl_hours: Option<i64>,
    ) -> Result<Conversation, ApiError> {
        let ttl_hours = ttl_hours.unwrap_or(self.config.default_ttl_hours);
        if ttl_hours < 1 || ttl_hours > self.config.max_ttl_hours {
            return Err(ApiError::Validation("ttlHours out of range"));
        }

        // Advisory policy hook; the answer currently only shapes logs.
        let tier = self.gate.tier(device_id);

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            initiator_device_id: device_id.clone(),
            status: ConversationStatus::Active,
            created_at: now,
            expires_at: now + Duration::hours(ttl_hours),
        };
        let initiator = Participant {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            device_id: device_id.clone(),
            is_initiator: true,
            joined_at: now,
            departed_at: None,
            link_consumed_at: None,
        };

        let mut tx = self.store.begin().await;
        tx.insert_conversation(conversation.clone());
        tx.insert_participant(initiator);
        drop(tx);

        self.cache_conversation(&conversation);
        let _ = self.cache.del(&keys::device_conversations(device_id));

        info!(
            conversation = %conversation.id,
            ttl_hours,
            tier = ?tier,
            "Conversation created"
        );
        Ok(conversation)
    }

    /// Fetch one conversation, cache-first.
    pub async fn get(&self, id: &Uuid) -> Option<Conversation> {
        match self.cache.get_json::<Conversation>(&keys::conversation(id)) {
            Lookup::Hit(conversation) => return Some(conversation),
            Lookup::Unavailable => {
                debug!("Cache unavailable, reading conversation from store");
            }
            Lookup::Miss => {}
        }

        let conversation = self.store.conversation(id).await?;
        self.cache_conversation(&conversation);
        Some(conversation)
    }

    /// Conversations the device initiated that are still ACTIVE and live.
    pub async fn list_for_initiator(&self, device_id: &DeviceId) -> Vec<Conversation> {
        let now = Utc::now();
        let key = keys::device_conversations(device_id);

        if let Lookup::Hit(mut cached) = self.cache.get_json::<Vec<Conversation>>(&key) {
            // The cached list may predate expiries; re-filter liveness.
            cached.retain(|c| c.is_live(now));
            return cached;
        }

        let conversations = self
            .store
            .active_conversations_by_initiator(device_id, now)
            .await;
        if let Err(e) = self.cache.set_json(
            &key,
            &conversations,
            Some(self.config.conversation_cache_ttl),
        ) {
            warn!(error = %e, "Failed to cache conversation listing");
        }
        conversations
    }

    /// Initiator-only teardown: departs everyone, cascades messages, and
    /// notifies the other participants out-of-band.
    pub async fn delete(&self, id: &Uuid, device_id: &DeviceId) -> Result<(), ApiError> {
        let now = Utc::now();

        let mut tx = self.store.begin().await;
        let conversation = tx.conversation(id).ok_or(ApiError::NotFound("conversation not found"))?;
        if conversation.initiator_device_id != *device_id {
            return Err(ApiError::Forbidden("only the initiator may delete"));
        }
        tx.depart_all_participants(id, now);
        tx.set_conversation_status(id, ConversationStatus::Deleted);
        let removed = tx.delete_messages_by_conversation(id);
        drop(tx);

        self.invalidate_conversation(id, &conversation.initiator_device_id);

        // Vendor push to everyone who ever joined, except the caller.
        let recipients: Vec<DeviceId> = self
            .store
            .participants_by_conversation(id)
            .await
            .into_iter()
            .map(|p| p.device_id)
            .filter(|d| d != device_id)
            .collect();
        self.apns.notify(*id, recipients, PushKind::ConversationDeleted);

        info!(conversation = %id, messages_removed = removed, "Conversation deleted");
        Ok(())
    }

    /// Consume the share link, or rejoin.
    ///
    /// The one-shot rule: once any non-initiator device has consumed the
    /// link, new devices are refused for the rest of the conversation's
    /// lifetime. The same device rejoining after a leave does not consume a
    /// second slot. Runs entirely inside one transaction so concurrent join
    /// attempts cannot both pass the uniqueness check.
    pub async fn join(&self, id: &Uuid, device_id: &DeviceId) -> Result<Participant, ApiError> {
        let now = Utc::now();

        let mut tx = self.store.begin().await;
        let conversation = tx.conversation(id).ok_or(ApiError::NotFound("conversation not found"))?;
        if !conversation.is_live(now) {
            return Err(ApiError::Conflict("conversation is not active"));
        }

        if let Some(existing) = tx.participant(id, device_id) {
            if existing.is_active() {
                return Ok(existing);
            }
            tx.clear_departure(&existing.id);
            let rejoined = tx
                .participant(id, device_id)
                .ok_or(ApiError::Internal)?;
            debug!(conversation = %id, "Participant rejoined");
            return Ok(rejoined);
        }

        if tx.has_consumed_secondary(id) {
            return Err(ApiError::Conflict("link already used"));
        }

        let participant = Participant {
            id: Uuid::new_v4(),
            conversation_id: *id,
            device_id: device_id.clone(),
            is_initiator: false,
            joined_at: now,
            departed_at: None,
            link_consumed_at: Some(now),
        };
        tx.insert_participant(participant.clone());
        drop(tx);

        info!(conversation = %id, "Share link consumed");
        Ok(participant)
    }

    /// Depart a conversation. Idempotent; never changes conversation status,
    /// even when the initiator leaves.
    pub async fn leave(&self, id: &Uuid, device_id: &DeviceId) -> Result<(), ApiError> {
        let now = Utc::now();

        let mut tx = self.store.begin().await;
        if tx.conversation(id).is_none() {
            return Err(ApiError::NotFound("conversation not found"));
        }
        let departed = tx.depart_participant(id, device_id, now);
        drop(tx);

        if departed {
            debug!(conversation = %id, "Participant departed");
        }
        Ok(())
    }

    pub async fn active_participants(&self, id: &Uuid) -> Result<Vec<Participant>, ApiError> {
        if self.store.conversation(id).await.is_none() {
            return Err(ApiError::NotFound("conversation not found"));
        }
        Ok(self.store.active_participants(id).await)
    }

    pub async fn participants(&self, id: &Uuid) -> Result<Vec<Participant>, ApiError> {
        if self.store.conversation(id).await.is_none() {
            return Err(ApiError::NotFound("conversation not found"));
        }
        Ok(self.store.participants_by_conversation(id).await)
    }

    pub async fn is_active_participant(&self, id: &Uuid, device_id: &DeviceId) -> bool {
        self.store.is_active_participant(id, device_id).await
    }

    /// Share URL for the join endpoint.
    pub fn share_url(&self, id: &Uuid) -> String {
        format!("{}/join/{id}", self.config.share_base_url.trim_end_matches('/'))
    }

    fn cache_conversation(&self, conversation: &Conversation) {
        if let Err(e) = self.cache.set_json(
            &keys::conversation(&conversation.id),
            conversation,
            Some(self.config.conversation_cache_ttl),
        ) {
            warn!(error = %e, "Failed to cache conversation");
        }
    }

    /// Drop every cache entry a conversation mutation can invalidate.
    pub fn invalidate_conversation(&self, id: &Uuid, initiator_device_id: &str) {
        let _ = self.cache.del(&keys::conversation(id));
        let _ = self.cache.del(&keys::conversation_messages(id));
        let _ = self.cache.del(&keys::device_conversations(initiator_device_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::FreeTierGate;

    async fn service() -> (Conversations, Arc<Store>, Arc<Cache>) {
        let store = Arc::new(Store::new());
        let cache = Arc::new(Cache::new());
        let config = Arc::new(Config::from_env());
        let apns = Arc::new(ApnsBridge::new(&config, store.clone(), cache.clone()).await);
        let service = Conversations::new(
            store.clone(),
            cache.clone(),
            apns,
            Arc::new(FreeTierGate),
            config,
        );
        (service, store, cache)
    }

    #[tokio::test]
    async fn create_inserts_initiator_participant() {
        let (service, store, _) = service().await;
        let conversation = service.create(&"device-a".to_string(), Some(1)).await.unwrap();

        let participants = store.participants_by_conversation(&conversation.id).await;
        assert_eq!(participants.len(), 1);
        assert!(participants[0].is_initiator);
        assert!(participants[0].link_consumed_at.is_none());
        assert_eq!(conversation.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn create_rejects_out_of_range_ttl() {
        let (service, _, _) = service().await;
        let device = "device-a".to_string();
        assert!(matches!(
            service.create(&device, Some(0)).await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            service.create(&device, Some(10_000)).await,
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn link_is_one_shot() {
        let (service, _, _) = service().await;
        let a = "device-a".to_string();
        let b = "device-b".to_string();
        let c = "device-c".to_string();
        let conversation = service.create(&a, Some(1)).await.unwrap();

        let joined = service.join(&conversation.id, &b).await.unwrap();
        assert!(joined.is_secondary());

        let refused = service.join(&conversation.id, &c).await;
        assert!(matches!(refused, Err(ApiError::Conflict("link already used"))));
    }

    #[tokio::test]
    async fn rejoin_after_leave_does_not_consume_second_slot() {
        let (service, _, _) = service().await;
        let a = "device-a".to_string();
        let b = "device-b".to_string();
        let conversation = service.create(&a, Some(1)).await.unwrap();

        service.join(&conversation.id, &b).await.unwrap();
        service.leave(&conversation.id, &b).await.unwrap();
        assert!(!service.is_active_participant(&conversation.id, &b).await);

        let rejoined = service.join(&conversation.id, &b).await.unwrap();
        assert!(rejoined.is_active());

        // Still exactly one secondary slot consumed.
        let refused = service.join(&conversation.id, &"device-c".to_string()).await;
        assert!(matches!(refused, Err(ApiError::Conflict("link already used"))));
    }

    #[tokio::test]
    async fn leave_is_idempotent_and_keeps_room_active() {
        let (service, _, _) = service().await;
        let a = "device-a".to_string();
        let conversation = service.create(&a, Some(1)).await.unwrap();

        service.leave(&conversation.id, &a).await.unwrap();
        service.leave(&conversation.id, &a).await.unwrap();

        let current = service.get(&conversation.id).await.unwrap();
        assert_eq!(current.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn delete_requires_initiator() {
        let (service, store, _) = service().await;
        let a = "device-a".to_string();
        let b = "device-b".to_string();
        let conversation = service.create(&a, Some(1)).await.unwrap();
        service.join(&conversation.id, &b).await.unwrap();

        assert!(matches!(
            service.delete(&conversation.id, &b).await,
            Err(ApiError::Forbidden(_))
        ));

        service.delete(&conversation.id, &a).await.unwrap();
        let deleted = store.conversation(&conversation.id).await.unwrap();
        assert!(deleted.is_deleted());
        assert!(store.active_participants(&conversation.id).await.is_empty());
    }

    #[tokio::test]
    async fn join_refused_when_not_live() {
        let (service, store, _) = service().await;
        let a = "device-a".to_string();
        let conversation = service.create(&a, Some(1)).await.unwrap();
        service.delete(&conversation.id, &a).await.unwrap();

        let result = service.join(&conversation.id, &"device-b".to_string()).await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));

        // Unknown conversation is NotFound, not Conflict.
        let mut tx = store.begin().await;
        tx.delete_conversation_cascade(&conversation.id);
        drop(tx);
        service.invalidate_conversation(&conversation.id, &a);
        let result = service.join(&conversation.id, &"device-b".to_string()).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn listing_filters_liveness() {
        let (service, store, _) = service().await;
        let a = "device-a".to_string();
        let live = service.create(&a, Some(2)).await.unwrap();
        let doomed = service.create(&a, Some(1)).await.unwrap();

        let mut tx = store.begin().await;
        tx.set_conversation_status(&doomed.id, ConversationStatus::Expired);
        drop(tx);
        service.invalidate_conversation(&doomed.id, &a);

        let listed = service.list_for_initiator(&a).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, live.id);
    }

    #[tokio::test]
    async fn get_survives_cache_outage() {
        let (service, _, cache) = service().await;
        let a = "device-a".to_string();
        let conversation = service.create(&a, Some(1)).await.unwrap();

        cache.set_available(false);
        let fetched = service.get(&conversation.id).await.unwrap();
        assert_eq!(fetched.id, conversation.id);
    }

    #[tokio::test]
    async fn share_url_shape() {
        let (service, _, _) = service().await;
        let conversation = service.create(&"device-a".to_string(), Some(1)).await.unwrap();
        let url = service.share_url(&conversation.id);
        assert!(url.ends_with(&format!("/join/{}", conversation.id)));
    }
}
