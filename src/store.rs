//! Durable record store for conversations, participants, messages, and
//! device tokens.
//!
//! The API is record-oriented with the indexed finders the services need.
//! Multi-entity mutations run inside a transaction scope: `begin()` takes
//! the single write guard, so every check-then-write sequence under it is
//! atomic (this is what makes the one-shot link rule race-free). Plain
//! finders take the read guard and never block each other.
//!
//! The backing is in-process tables; the interface is what the service
//! layer programs against, so a SQL backing can replace it without touching
//! callers.

use crate::models::*;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{RwLock, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    conversations: HashMap<Uuid, Conversation>,
    participants: HashMap<Uuid, Participant>,
    messages: HashMap<Uuid, Message>,
    device_tokens: HashMap<Uuid, DeviceToken>,
}

/// Transactional record store.
#[derive(Default)]
pub struct Store {
    tables: RwLock<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction scope. Mutations and the reads that gate them go
    /// through the returned guard; it serializes all writers.
    pub async fn begin(&self) -> StoreTx<'_> {
        StoreTx {
            tables: self.tables.write().await,
        }
    }

    // === Conversation finders ===

    pub async fn conversation(&self, id: &Uuid) -> Option<Conversation> {
        self.tables.read().await.conversations.get(id).cloned()
    }

    /// Conversations the device initiated that are ACTIVE and live.
    pub async fn active_conversations_by_initiator(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<Conversation> {
        let tables = self.tables.read().await;
        let mut found: Vec<Conversation> = tables
            .conversations
            .values()
            .filter(|c| c.initiator_device_id == device_id && c.is_live(now))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        found
    }

    /// ACTIVE conversations whose expiry has passed (sweeper input).
    pub async fn conversations_to_expire(&self, now: DateTime<Utc>) -> Vec<Conversation> {
        self.tables
            .read()
            .await
            .conversations
            .values()
            .filter(|c| c.status == ConversationStatus::Active && c.expires_at <= now)
            .cloned()
            .collect()
    }

    /// DELETED conversations created before the cutoff (hard-delete input).
    pub async fn deleted_conversations_before(&self, cutoff: DateTime<Utc>) -> Vec<Conversation> {
        self.tables
            .read()
            .await
            .conversations
            .values()
            .filter(|c| c.is_deleted() && c.created_at < cutoff)
            .cloned()
            .collect()
    }

    pub async fn conversation_count(&self) -> usize {
        self.tables.read().await.conversations.len()
    }

    // === Message finders ===

    pub async fn message(&self, id: &Uuid) -> Option<Message> {
        self.tables.read().await.messages.get(id).cloned()
    }

    /// Unexpired messages of a conversation, ascending by creation time.
    /// Consumed messages are still listed; only expiry hides them.
    pub async fn active_messages_by_conversation(
        &self,
        conversation_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Vec<Message> {
        let tables = self.tables.read().await;
        let mut found: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.conversation_id.as_ref() == Some(conversation_id) && !m.is_expired(now))
            .cloned()
            .collect();
        found.sort_by_key(|m| m.created_at);
        found
    }

    /// Incremental variant: only messages created strictly after `since`.
    pub async fn active_messages_since(
        &self,
        conversation_id: &Uuid,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Message> {
        let mut found = self
            .active_messages_by_conversation(conversation_id, now)
            .await;
        found.retain(|m| m.created_at > since);
        found
    }

    pub async fn message_by_file_ref(&self, file_id: &Uuid) -> Option<Message> {
        self.tables
            .read()
            .await
            .messages
            .values()
            .find(|m| m.file_ref.as_ref() == Some(file_id))
            .cloned()
    }

    pub async fn message_count(&self) -> usize {
        self.tables.read().await.messages.len()
    }

    // === Participant finders ===

    pub async fn participants_by_conversation(&self, conversation_id: &Uuid) -> Vec<Participant> {
        let tables = self.tables.read().await;
        let mut found: Vec<Participant> = tables
            .participants
            .values()
            .filter(|p| p.conversation_id == *conversation_id)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.joined_at);
        found
    }

    pub async fn active_participants(&self, conversation_id: &Uuid) -> Vec<Participant> {
        let mut found = self.participants_by_conversation(conversation_id).await;
        found.retain(Participant::is_active);
        found
    }

    pub async fn participant(&self, conversation_id: &Uuid, device_id: &str) -> Option<Participant> {
        self.tables
            .read()
            .await
            .participants
            .values()
            .find(|p| p.conversation_id == *conversation_id && p.device_id == device_id)
            .cloned()
    }

    pub async fn is_active_participant(&self, conversation_id: &Uuid, device_id: &str) -> bool {
        self.participant(conversation_id, device_id)
            .await
            .is_some_and(|p| p.is_active())
    }

    pub async fn count_active_participants(&self, conversation_id: &Uuid) -> usize {
        self.active_participants(conversation_id).await.len()
    }

    // === Device token finders ===

    pub async fn token_by_value(&self, token: &str) -> Option<DeviceToken> {
        self.tables
            .read()
            .await
            .device_tokens
            .values()
            .find(|t| t.token == token)
            .cloned()
    }

    pub async fn tokens_by_device(&self, device_id: &str) -> Vec<DeviceToken> {
        self.tables
            .read()
            .await
            .device_tokens
            .values()
            .filter(|t| t.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Active tokens for a set of devices (push fan-out input).
    pub async fn active_tokens_by_devices(&self, device_ids: &[DeviceId]) -> Vec<DeviceToken> {
        self.tables
            .read()
            .await
            .device_tokens
            .values()
            .filter(|t| t.active && device_ids.iter().any(|d| *d == t.device_id))
            .cloned()
            .collect()
    }
}

/// Transaction scope over the store. Holding this guard serializes all
/// other writers; reads through it observe the in-flight state.
pub struct StoreTx<'a> {
    tables: RwLockWriteGuard<'a, Tables>,
}

impl StoreTx<'_> {
    // === Reads inside the transaction ===

    pub fn conversation(&self, id: &Uuid) -> Option<Conversation> {
        self.tables.conversations.get(id).cloned()
    }

    pub fn message(&self, id: &Uuid) -> Option<Message> {
        self.tables.messages.get(id).cloned()
    }

    pub fn participant(&self, conversation_id: &Uuid, device_id: &str) -> Option<Participant> {
        self.tables
            .participants
            .values()
            .find(|p| p.conversation_id == *conversation_id && p.device_id == device_id)
            .cloned()
    }

    /// Uniqueness predicate behind the one-shot link rule: true if any
    /// non-initiator participant has ever consumed the link.
    pub fn has_consumed_secondary(&self, conversation_id: &Uuid) -> bool {
        self.tables
            .participants
            .values()
            .any(|p| p.conversation_id == *conversation_id && p.is_secondary())
    }

    pub fn token_by_value(&self, token: &str) -> Option<DeviceToken> {
        self.tables
            .device_tokens
            .values()
            .find(|t| t.token == token)
            .cloned()
    }

    // === Conversation mutations ===

    pub fn insert_conversation(&mut self, conversation: Conversation) {
        self.tables
            .conversations
            .insert(conversation.id, conversation);
    }

    pub fn set_conversation_status(&mut self, id: &Uuid, status: ConversationStatus) -> bool {
        match self.tables.conversations.get_mut(id) {
            Some(c) => {
                c.status = status;
                true
            }
            None => false,
        }
    }

    /// Hard-delete a conversation and everything it owns.
    /// Returns (participants removed, messages removed).
    pub fn delete_conversation_cascade(&mut self, id: &Uuid) -> (usize, usize) {
        self.tables.conversations.remove(id);
        let before_p = self.tables.participants.len();
        self.tables
            .participants
            .retain(|_, p| p.conversation_id != *id);
        let removed_p = before_p - self.tables.participants.len();
        let removed_m = self.delete_messages_by_conversation(id);
        (removed_p, removed_m)
    }

    // === Participant mutations ===

    pub fn insert_participant(&mut self, participant: Participant) {
        self.tables.participants.insert(participant.id, participant);
    }

    /// Mark one participant departed; no-op when already departed or absent.
    pub fn depart_participant(
        &mut self,
        conversation_id: &Uuid,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        for p in self.tables.participants.values_mut() {
            if p.conversation_id == *conversation_id && p.device_id == device_id {
                if p.departed_at.is_none() {
                    p.departed_at = Some(now);
                    return true;
                }
                return false;
            }
        }
        false
    }

    pub fn depart_all_participants(&mut self, conversation_id: &Uuid, now: DateTime<Utc>) -> usize {
        let mut departed = 0;
        for p in self.tables.participants.values_mut() {
            if p.conversation_id == *conversation_id && p.departed_at.is_none() {
                p.departed_at = Some(now);
                departed += 1;
            }
        }
        departed
    }

    /// Rejoin: clear the departure marker on an existing row.
    pub fn clear_departure(&mut self, participant_id: &Uuid) -> bool {
        match self.tables.participants.get_mut(participant_id) {
            Some(p) => {
                p.departed_at = None;
                true
            }
            None => false,
        }
    }

    // === Message mutations ===

    pub fn insert_message(&mut self, message: Message) {
        self.tables.messages.insert(message.id, message);
    }

    /// Single-shot consumption: set-once `consumed` together with `read_at`.
    pub fn mark_consumed(&mut self, id: &Uuid, now: DateTime<Utc>) -> bool {
        match self.tables.messages.get_mut(id) {
            Some(m) if !m.consumed => {
                m.consumed = true;
                m.read_at = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn set_message_storage_ref(&mut self, id: &Uuid, storage_ref: String) -> bool {
        match self.tables.messages.get_mut(id) {
            Some(m) => {
                if let Some(file) = m.file.as_mut() {
                    file.storage_ref = Some(storage_ref);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn delete_messages_by_conversation(&mut self, conversation_id: &Uuid) -> usize {
        let before = self.tables.messages.len();
        self.tables
            .messages
            .retain(|_, m| m.conversation_id.as_ref() != Some(conversation_id));
        before - self.tables.messages.len()
    }

    pub fn delete_expired_messages(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.tables.messages.len();
        self.tables.messages.retain(|_, m| !m.is_expired(now));
        before - self.tables.messages.len()
    }

    pub fn delete_consumed_read_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tables.messages.len();
        self.tables
            .messages
            .retain(|_, m| !(m.consumed && m.read_at.is_some_and(|at| at < cutoff)));
        before - self.tables.messages.len()
    }

    /// Purge messages whose parent conversation reached a terminal state
    /// past the cutoff.
    pub fn delete_messages_of_dead_conversations(&mut self, cutoff: DateTime<Utc>) -> usize {
        let dead: Vec<Uuid> = self
            .tables
            .conversations
            .values()
            .filter(|c| c.status != ConversationStatus::Active && c.expires_at <= cutoff)
            .map(|c| c.id)
            .collect();
        let before = self.tables.messages.len();
        self.tables.messages.retain(|_, m| {
            m.conversation_id
                .map_or(true, |conv| !dead.contains(&conv))
        });
        before - self.tables.messages.len()
    }

    // === Device token mutations ===

    pub fn insert_token(&mut self, token: DeviceToken) {
        self.tables.device_tokens.insert(token.id, token);
    }

    /// Deactivate every active token a device holds; returns the token
    /// values so callers can invalidate their cache entries.
    pub fn deactivate_device_tokens(&mut self, device_id: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut deactivated = Vec::new();
        for t in self.tables.device_tokens.values_mut() {
            if t.device_id == device_id && t.active {
                t.active = false;
                t.updated_at = now;
                deactivated.push(t.token.clone());
            }
        }
        deactivated
    }

    /// Move ownership of an existing token value to another device.
    pub fn reassign_token(&mut self, token: &str, device_id: &str, now: DateTime<Utc>) -> bool {
        for t in self.tables.device_tokens.values_mut() {
            if t.token == token {
                t.device_id = device_id.to_string();
                t.active = true;
                t.updated_at = now;
                return true;
            }
        }
        false
    }

    /// Mark a single token inactive (vendor rejection path).
    pub fn deactivate_token(&mut self, token: &str, now: DateTime<Utc>) -> Option<DeviceToken> {
        for t in self.tables.device_tokens.values_mut() {
            if t.token == token && t.active {
                t.active = false;
                t.updated_at = now;
                return Some(t.clone());
            }
        }
        None
    }

    /// Remove every token row a device holds (logout). Returns the values.
    pub fn delete_tokens_for_device(&mut self, device_id: &str) -> Vec<String> {
        let removed: Vec<String> = self
            .tables
            .device_tokens
            .values()
            .filter(|t| t.device_id == device_id)
            .map(|t| t.token.clone())
            .collect();
        self.tables
            .device_tokens
            .retain(|_, t| t.device_id != device_id);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conversation(initiator: &str, ttl: Duration) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            initiator_device_id: initiator.to_string(),
            status: ConversationStatus::Active,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    fn participant(conversation_id: Uuid, device_id: &str, initiator: bool) -> Participant {
        Participant {
            id: Uuid::new_v4(),
            conversation_id,
            device_id: device_id.to_string(),
            is_initiator: initiator,
            joined_at: Utc::now(),
            departed_at: None,
            link_consumed_at: if initiator { None } else { Some(Utc::now()) },
        }
    }

    fn message(conversation_id: Uuid, created_at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Some(conversation_id),
            ciphertext: b"blob".to_vec(),
            nonce: b"n".to_vec(),
            tag: None,
            message_type: MessageType::Text,
            created_at,
            expires_at: created_at + Duration::hours(1),
            read_at: None,
            consumed: false,
            sender_device_id: Some("device-a".into()),
            file_ref: None,
            file: None,
        }
    }

    fn token(device_id: &str, value: &str, active: bool) -> DeviceToken {
        let now = Utc::now();
        DeviceToken {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            token: value.to_string(),
            active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn messages_sorted_ascending_and_expired_hidden() {
        let store = Store::new();
        let conv = conversation("device-a", Duration::hours(1));
        let conv_id = conv.id;
        let now = Utc::now();

        let mut tx = store.begin().await;
        tx.insert_conversation(conv);
        let later = message(conv_id, now + Duration::seconds(10));
        let earlier = message(conv_id, now);
        let mut expired = message(conv_id, now - Duration::hours(2));
        expired.expires_at = now - Duration::hours(1);
        tx.insert_message(later.clone());
        tx.insert_message(earlier.clone());
        tx.insert_message(expired);
        drop(tx);

        let listed = store.active_messages_by_conversation(&conv_id, now).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, earlier.id);
        assert_eq!(listed[1].id, later.id);

        let since = store
            .active_messages_since(&conv_id, now, now + Duration::seconds(1))
            .await;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, later.id);
    }

    #[tokio::test]
    async fn consumed_messages_stay_listed() {
        let store = Store::new();
        let conv = conversation("device-a", Duration::hours(1));
        let conv_id = conv.id;
        let now = Utc::now();

        let mut tx = store.begin().await;
        tx.insert_conversation(conv);
        let m = message(conv_id, now);
        let m_id = m.id;
        tx.insert_message(m);
        assert!(tx.mark_consumed(&m_id, now));
        // Set-once: second consume attempt fails.
        assert!(!tx.mark_consumed(&m_id, now));
        drop(tx);

        let listed = store.active_messages_by_conversation(&conv_id, now).await;
        assert_eq!(listed.len(), 1);
        assert!(listed[0].consumed);
        assert!(listed[0].read_at.is_some());
    }

    #[tokio::test]
    async fn consumed_secondary_uniqueness_check() {
        let store = Store::new();
        let conv = conversation("device-a", Duration::hours(1));
        let conv_id = conv.id;

        let mut tx = store.begin().await;
        tx.insert_conversation(conv);
        tx.insert_participant(participant(conv_id, "device-a", true));
        assert!(!tx.has_consumed_secondary(&conv_id));

        tx.insert_participant(participant(conv_id, "device-b", false));
        assert!(tx.has_consumed_secondary(&conv_id));

        // Departure does not release the slot.
        let now = Utc::now();
        assert!(tx.depart_participant(&conv_id, "device-b", now));
        assert!(tx.has_consumed_secondary(&conv_id));
    }

    #[tokio::test]
    async fn cascade_delete_removes_owned_rows() {
        let store = Store::new();
        let conv = conversation("device-a", Duration::hours(1));
        let conv_id = conv.id;
        let now = Utc::now();

        let mut tx = store.begin().await;
        tx.insert_conversation(conv);
        tx.insert_participant(participant(conv_id, "device-a", true));
        tx.insert_participant(participant(conv_id, "device-b", false));
        tx.insert_message(message(conv_id, now));
        let (participants, messages) = tx.delete_conversation_cascade(&conv_id);
        drop(tx);

        assert_eq!((participants, messages), (2, 1));
        assert!(store.conversation(&conv_id).await.is_none());
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn one_active_token_per_device() {
        let store = Store::new();
        let now = Utc::now();

        let mut tx = store.begin().await;
        tx.insert_token(token("device-a", "tok-1", true));
        let deactivated = tx.deactivate_device_tokens("device-a", now);
        assert_eq!(deactivated, vec!["tok-1".to_string()]);
        tx.insert_token(token("device-a", "tok-2", true));
        drop(tx);

        let active = store
            .active_tokens_by_devices(&["device-a".to_string()])
            .await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].token, "tok-2");
    }

    #[tokio::test]
    async fn token_reassignment_moves_ownership() {
        let store = Store::new();
        let now = Utc::now();

        let mut tx = store.begin().await;
        tx.insert_token(token("device-a", "tok-1", true));
        assert!(tx.reassign_token("tok-1", "device-b", now));
        drop(tx);

        assert!(store.tokens_by_device("device-a").await.is_empty());
        let moved = store.token_by_value("tok-1").await.unwrap();
        assert_eq!(moved.device_id, "device-b");
        assert!(moved.active);
    }

    #[tokio::test]
    async fn sweeper_deleters() {
        let store = Store::new();
        let now = Utc::now();

        let live = conversation("device-a", Duration::hours(1));
        let live_id = live.id;
        let mut dead = conversation("device-a", Duration::hours(1));
        dead.status = ConversationStatus::Expired;
        dead.expires_at = now - Duration::hours(2);
        let dead_id = dead.id;

        let mut tx = store.begin().await;
        tx.insert_conversation(live);
        tx.insert_conversation(dead);
        tx.insert_message(message(live_id, now));
        let mut stale = message(live_id, now - Duration::hours(3));
        stale.expires_at = now - Duration::hours(2);
        tx.insert_message(stale);
        let mut consumed = message(live_id, now);
        consumed.consumed = true;
        consumed.read_at = Some(now - Duration::hours(2));
        tx.insert_message(consumed);
        tx.insert_message(message(dead_id, now));

        assert_eq!(tx.delete_expired_messages(now), 1);
        assert_eq!(tx.delete_consumed_read_before(now - Duration::hours(1)), 1);
        assert_eq!(tx.delete_messages_of_dead_conversations(now), 1);
        drop(tx);

        assert_eq!(store.message_count().await, 1);
    }
}
