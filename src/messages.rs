//! Message service: the two creation paths, the read paths, and single-shot
//! consumption.
//!
//! The pipeline path buffers into the ingestion queue and returns a
//! server-assigned id before durability; the worker later persists and the
//! sender learns the outcome over the push channel. The direct path writes
//! durably before responding. Reads are cache-first except the incremental
//! fetch, which always hits the store.

use crate::apns::{ApnsBridge, PushKind};
use crate::cache::{keys, Cache, Lookup};
use crate::config::Config;
use crate::error::ApiError;
use crate::models::*;
use crate::queue::MessageQueue;
use crate::store::Store;
use crate::tier::SubscriptionGate;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status string returned by the pipeline path before durability.
pub const QUEUED_STATUS: &str = "QUEUED_FOR_PROCESSING";

/// Decoded message payload, validated at the HTTP edge.
#[derive(Debug, Clone)]
pub struct MessagePayload {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Option<Vec<u8>>,
    pub message_type: MessageType,
}

impl MessagePayload {
    /// Decode the base64 transport encoding.
    pub fn decode(req: &SendMessageRequest) -> Result<Self, ApiError> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let ciphertext = b64
            .decode(&req.ciphertext)
            .map_err(|_| ApiError::Validation("invalid base64 ciphertext"))?;
        let nonce = b64
            .decode(&req.nonce)
            .map_err(|_| ApiError::Validation("invalid base64 nonce"))?;
        let tag = match &req.tag {
            Some(tag) => Some(
                b64.decode(tag)
                    .map_err(|_| ApiError::Validation("invalid base64 tag"))?,
            ),
            None => None,
        };
        Ok(Self {
            ciphertext,
            nonce,
            tag,
            message_type: req.message_type,
        })
    }

    pub fn size(&self) -> usize {
        self.ciphertext.len() + self.nonce.len() + self.tag.as_ref().map_or(0, Vec::len)
    }
}

/// Message operations.
#[derive(Clone)]
pub struct Messages {
    store: Arc<Store>,
    cache: Arc<Cache>,
    queue: MessageQueue,
    apns: Arc<ApnsBridge>,
    gate: Arc<dyn SubscriptionGate>,
    config: Arc<Config>,
}

impl Messages {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<Cache>,
        queue: MessageQueue,
        apns: Arc<ApnsBridge>,
        gate: Arc<dyn SubscriptionGate>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            apns,
            gate,
            config,
        }
    }

    /// Pipeline path: enqueue and return the server id immediately.
    ///
    /// The 202 response is tentative; the sender must treat the message as
    /// in flight until MESSAGE_DELIVERED or MESSAGE_FAILED arrives.
    pub async fn send_buffered(
        &self,
        conversation_id: &Uuid,
        device_id: &DeviceId,
        payload: MessagePayload,
    ) -> Result<BufferedAcceptedResponse, ApiError> {
        self.authorize_write(conversation_id, device_id, &payload).await?;

        let now = Utc::now();
        let record = BufferedMessage {
            server_id: Uuid::new_v4(),
            conversation_id: *conversation_id,
            device_id: device_id.clone(),
            ciphertext: payload.ciphertext,
            nonce: payload.nonce,
            tag: payload.tag,
            message_type: payload.message_type,
            file: None,
            queued_at: now,
            retry_count: 0,
        };

        self.queue
            .enqueue(&record)
            .map_err(|_| ApiError::ServiceUnavailable("message queue unavailable"))?;

        debug!(
            conversation = %conversation_id,
            server_id = %record.server_id,
            "Message queued for processing"
        );
        Ok(BufferedAcceptedResponse {
            server_id: record.server_id,
            status: QUEUED_STATUS,
            queued_at: now,
        })
    }

    /// Direct path: durable write, then caches and vendor push.
    pub async fn create_direct(
        &self,
        conversation_id: &Uuid,
        device_id: &DeviceId,
        payload: MessagePayload,
    ) -> Result<Message, ApiError> {
        let conversation = self
            .authorize_write(conversation_id, device_id, &payload)
            .await?;

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Some(*conversation_id),
            ciphertext: payload.ciphertext,
            nonce: payload.nonce,
            tag: payload.tag,
            message_type: payload.message_type,
            created_at: now,
            expires_at: conversation.expires_at,
            read_at: None,
            consumed: false,
            sender_device_id: Some(device_id.clone()),
            file_ref: None,
            file: None,
        };

        let mut tx = self.store.begin().await;
        tx.insert_message(message.clone());
        drop(tx);

        // The cached listing is stale now; the single-row cache is fresh.
        let _ = self.cache.del(&keys::conversation_messages(conversation_id));
        if let Err(e) = self.cache.set_json(
            &keys::message(&message.id),
            &message,
            Some(self.config.message_cache_ttl),
        ) {
            warn!(error = %e, "Failed to cache message");
        }

        let recipients: Vec<DeviceId> = self
            .store
            .active_participants(conversation_id)
            .await
            .into_iter()
            .map(|p| p.device_id)
            .filter(|d| d != device_id)
            .collect();
        self.apns
            .notify(*conversation_id, recipients, PushKind::Silent);

        info!(conversation = %conversation_id, message = %message.id, "Message stored");
        Ok(message)
    }

    /// Full listing, cache-first. Not a consuming read.
    pub async fn list(&self, conversation_id: &Uuid) -> Result<Vec<Message>, ApiError> {
        if self.store.conversation(conversation_id).await.is_none() {
            return Err(ApiError::NotFound("conversation not found"));
        }

        let key = keys::conversation_messages(conversation_id);
        if let Lookup::Hit(cached) = self.cache.get_json::<Vec<Message>>(&key) {
            return Ok(cached);
        }

        let now = Utc::now();
        let messages = self
            .store
            .active_messages_by_conversation(conversation_id, now)
            .await;
        if let Err(e) = self
            .cache
            .set_json(&key, &messages, Some(self.config.message_cache_ttl))
        {
            warn!(error = %e, "Failed to cache message listing");
        }
        Ok(messages)
    }

    /// Incremental fetch; always bypasses the cache.
    pub async fn list_since(
        &self,
        conversation_id: &Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>, ApiError> {
        if self.store.conversation(conversation_id).await.is_none() {
            return Err(ApiError::NotFound("conversation not found"));
        }
        let now = Utc::now();
        Ok(self
            .store
            .active_messages_since(conversation_id, since, now)
            .await)
    }

    /// Single-shot read: returns the payload exactly once, then Gone.
    pub async fn consume(
        &self,
        conversation_id: &Uuid,
        message_id: &Uuid,
    ) -> Result<Message, ApiError> {
        let now = Utc::now();

        let mut tx = self.store.begin().await;
        let message = tx.message(message_id).ok_or(ApiError::NotFound("message not found"))?;
        if message.conversation_id.as_ref() != Some(conversation_id) {
            return Err(ApiError::NotFound("message not found"));
        }
        if message.consumed {
            return Err(ApiError::Gone("message already consumed"));
        }
        if message.is_expired(now) {
            return Err(ApiError::Gone("message expired"));
        }
        tx.mark_consumed(message_id, now);
        let consumed = tx.message(message_id).ok_or(ApiError::Internal)?;
        drop(tx);

        // Cached copies now carry a stale consumed flag.
        let _ = self.cache.del(&keys::message(message_id));
        let _ = self.cache.del(&keys::conversation_messages(conversation_id));

        debug!(conversation = %conversation_id, message = %message_id, "Message consumed");
        Ok(consumed)
    }

    /// Common write-path gate: conversation exists, is live, the caller is
    /// an active participant, and the payload fits the caller's tier.
    async fn authorize_write(
        &self,
        conversation_id: &Uuid,
        device_id: &DeviceId,
        payload: &MessagePayload,
    ) -> Result<Conversation, ApiError> {
        let now = Utc::now();
        let conversation = self
            .store
            .conversation(conversation_id)
            .await
            .ok_or(ApiError::NotFound("conversation not found"))?;
        if !conversation.is_live(now) {
            return Err(ApiError::Conflict("conversation is not active"));
        }
        if !self
            .store
            .is_active_participant(conversation_id, device_id)
            .await
        {
            return Err(ApiError::Forbidden("not a participant of this conversation"));
        }
        let limit = self.gate.tier(device_id).max_payload_bytes();
        if payload.size() > limit {
            return Err(ApiError::PayloadTooLarge);
        }
        Ok(conversation)
    }
}
