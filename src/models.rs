//! Data models for the Wisp server core.
//!
//! Entities are persisted ciphertext-and-metadata only: the server never
//! interprets message content. All time comparisons are UTC.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Type Aliases
// =============================================================================

/// Opaque device identifier supplied by clients via `X-Device-ID`.
pub type DeviceId = String;

// =============================================================================
// Entities
// =============================================================================

/// Lifecycle status of a conversation.
///
/// Status is monotonic: `Active` may move to `Expired` or `Deleted`;
/// neither terminal state ever reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationStatus {
    Active,
    Expired,
    Deleted,
}

/// Time-limited two-party room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Device that created the conversation; sole delete authority.
    pub initiator_device_id: DeviceId,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Conversation {
    /// A conversation is live iff it is ACTIVE and not past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ConversationStatus::Active && now < self.expires_at
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ConversationStatus::Deleted
    }
}

/// Membership record binding a device to a conversation.
///
/// `(conversation_id, device_id)` is unique. A conversation has at most one
/// participant with `is_initiator == false` and a consumed link across its
/// whole lifetime; rejoining the same device clears `departed_at` without
/// consuming a second link slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub device_id: DeviceId,
    pub is_initiator: bool,
    pub joined_at: DateTime<Utc>,
    pub departed_at: Option<DateTime<Utc>>,
    /// Set when this participant consumed the one-shot share link.
    pub link_consumed_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.departed_at.is_none()
    }

    /// The one device that consumed the share link.
    pub fn is_secondary(&self) -> bool {
        !self.is_initiator && self.link_consumed_at.is_some()
    }
}

/// Content type of a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    #[default]
    Text,
    Sticker,
    Image,
    File,
}

impl MessageType {
    pub const fn carries_file(self) -> bool {
        matches!(self, Self::Image | Self::File)
    }
}

/// Metadata for staged file payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Relative path under the file base directory, set after promotion.
    pub storage_ref: Option<String>,
}

/// Stored message: ciphertext blob plus routing and delivery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identifier.
    pub id: Uuid,
    pub conversation_id: Option<Uuid>,
    /// Opaque client-side ciphertext. Empty for FILE/IMAGE messages, whose
    /// content lives behind `file_ref`.
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Option<Vec<u8>>,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    /// Set once, together with `read_at`, by the single-shot read path.
    pub consumed: bool,
    pub sender_device_id: Option<DeviceId>,
    /// Staged file identifier for FILE/IMAGE messages.
    pub file_ref: Option<Uuid>,
    pub file: Option<FileMetadata>,
}

impl Message {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the single-shot read path may still return the payload.
    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.is_expired(now)
    }

    /// Combined payload size used for tier limits.
    pub fn payload_size(&self) -> usize {
        self.ciphertext.len() + self.nonce.len() + self.tag.as_ref().map_or(0, Vec::len)
    }
}

/// Registered vendor push token for a device.
///
/// At most one active token per device; re-registering a token under a
/// different device moves ownership rather than duplicating the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceToken {
    pub id: Uuid,
    pub device_id: DeviceId,
    /// Opaque vendor token, unique across all rows.
    pub token: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transient queue record for the pipeline create path.
///
/// Lives in the ingestion queue from enqueue until the worker either persists
/// a `Message` or routes the record to the dead-letter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// Server-assigned id returned to the sender before durability.
    pub server_id: Uuid,
    pub conversation_id: Uuid,
    pub device_id: DeviceId,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Option<Vec<u8>>,
    pub message_type: MessageType,
    pub file: Option<FileMetadata>,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
}

// =============================================================================
// Push Channel Events
// =============================================================================

/// Events delivered over the bidirectional push channel.
///
/// `MessageDelivered` and `MessageFailed` go to the sender's user queue;
/// `NewMessage` is broadcast on the conversation topic. Exactly one of
/// DELIVERED/FAILED is emitted per server id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushEvent {
    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        server_id: Uuid,
        message_id: Uuid,
        delivered_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    MessageFailed {
        server_id: Uuid,
        failed_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    NewMessage {
        conversation_id: Uuid,
        message_id: Uuid,
    },
}

// =============================================================================
// API Request Models
// =============================================================================

/// Create conversation request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    /// Lifetime in hours; server default applies when omitted.
    pub ttl_hours: Option<i64>,
}

/// Message creation body, shared by the direct and pipeline paths.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
    /// Base64-encoded nonce.
    pub nonce: String,
    /// Base64-encoded authentication tag.
    pub tag: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
}

/// Query parameters for the message listing endpoint.
#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    /// When present, return only messages created strictly after this time.
    pub since: Option<DateTime<Utc>>,
}

/// Two-phase file upload body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileRequest {
    /// Base64-encoded encrypted file content.
    pub ciphertext: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default = "default_file_type")]
    pub message_type: MessageType,
}

fn default_file_type() -> MessageType {
    MessageType::File
}

/// Register vendor push token.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTokenRequest {
    pub token: String,
}

// =============================================================================
// API Response Models
// =============================================================================

/// Conversation in API responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: Uuid,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub initiator: bool,
}

impl ConversationView {
    pub fn from_entity(conversation: &Conversation, caller: &str) -> Self {
        Self {
            id: conversation.id,
            status: conversation.status,
            created_at: conversation.created_at,
            expires_at: conversation.expires_at,
            initiator: conversation.initiator_device_id == caller,
        }
    }
}

/// Participant in API responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub device_id: DeviceId,
    pub is_initiator: bool,
    pub joined_at: DateTime<Utc>,
    pub active: bool,
}

impl From<&Participant> for ParticipantView {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id,
            conversation_id: p.conversation_id,
            device_id: p.device_id.clone(),
            is_initiator: p.is_initiator,
            joined_at: p.joined_at,
            active: p.is_active(),
        }
    }
}

/// Message in API responses. Binary fields are base64-encoded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub ciphertext: String,
    pub nonce: String,
    pub tag: Option<String>,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMetadata>,
}

impl From<&Message> for MessageView {
    fn from(m: &Message) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            ciphertext: b64.encode(&m.ciphertext),
            nonce: b64.encode(&m.nonce),
            tag: m.tag.as_ref().map(|t| b64.encode(t)),
            message_type: m.message_type,
            created_at: m.created_at,
            expires_at: m.expires_at,
            consumed: m.consumed,
            file_ref: m.file_ref,
            file: m.file.clone(),
        }
    }
}

/// Pipeline path acceptance (HTTP 202).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedAcceptedResponse {
    pub server_id: Uuid,
    pub status: &'static str,
    pub queued_at: DateTime<Utc>,
}

/// Share link response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareLinkResponse {
    pub share_url: String,
}

/// Conversation liveness probe response.
#[derive(Debug, Serialize)]
pub struct AccessibleResponse {
    pub accessible: bool,
}

/// Active-participant probe response.
#[derive(Debug, Serialize)]
pub struct ParticipantStatusResponse {
    pub active: bool,
}

/// File upload acceptance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileResponse {
    pub file_id: Uuid,
    pub message_id: Uuid,
}

/// Generic success envelope.
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub cache: bool,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conversation(status: ConversationStatus, expires_in: Duration) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            initiator_device_id: "device-a".into(),
            status,
            created_at: now,
            expires_at: now + expires_in,
        }
    }

    #[test]
    fn conversation_liveness() {
        let now = Utc::now();

        let live = conversation(ConversationStatus::Active, Duration::hours(1));
        assert!(live.is_live(now));

        let past = conversation(ConversationStatus::Active, Duration::seconds(-1));
        assert!(!past.is_live(now));

        let deleted = conversation(ConversationStatus::Deleted, Duration::hours(1));
        assert!(!deleted.is_live(now));
        assert!(deleted.is_deleted());

        let expired = conversation(ConversationStatus::Expired, Duration::hours(1));
        assert!(!expired.is_live(now));
    }

    #[test]
    fn participant_predicates() {
        let now = Utc::now();
        let mut p = Participant {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            device_id: "device-b".into(),
            is_initiator: false,
            joined_at: now,
            departed_at: None,
            link_consumed_at: Some(now),
        };

        assert!(p.is_active());
        assert!(p.is_secondary());

        p.departed_at = Some(now);
        assert!(!p.is_active());
        // Departing does not un-consume the link slot.
        assert!(p.is_secondary());

        p.is_initiator = true;
        assert!(!p.is_secondary());
    }

    #[test]
    fn message_consumability() {
        let now = Utc::now();
        let mut m = Message {
            id: Uuid::new_v4(),
            conversation_id: Some(Uuid::new_v4()),
            ciphertext: b"blob".to_vec(),
            nonce: b"n".to_vec(),
            tag: Some(b"t".to_vec()),
            message_type: MessageType::Text,
            created_at: now,
            expires_at: now + Duration::hours(1),
            read_at: None,
            consumed: false,
            sender_device_id: None,
            file_ref: None,
            file: None,
        };

        assert!(!m.is_expired(now));
        assert!(m.is_consumable(now));
        assert_eq!(m.payload_size(), 6);

        m.consumed = true;
        m.read_at = Some(now);
        assert!(!m.is_consumable(now));

        m.consumed = false;
        m.expires_at = now - Duration::seconds(1);
        assert!(m.is_expired(now));
        assert!(!m.is_consumable(now));
    }

    #[test]
    fn push_event_wire_format() {
        let event = PushEvent::NewMessage {
            conversation_id: Uuid::nil(),
            message_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "NEW_MESSAGE");
        assert!(json["conversationId"].is_string());
        assert!(json["messageId"].is_string());

        let event = PushEvent::MessageDelivered {
            server_id: Uuid::nil(),
            message_id: Uuid::nil(),
            delivered_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MESSAGE_DELIVERED");
        assert!(json["serverId"].is_string());
        assert!(json["deliveredAt"].is_string());
    }

    #[test]
    fn buffered_message_roundtrip() {
        let record = BufferedMessage {
            server_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            device_id: "device-a".into(),
            ciphertext: b"payload".to_vec(),
            nonce: b"nonce".to_vec(),
            tag: None,
            message_type: MessageType::Sticker,
            file: None,
            queued_at: Utc::now(),
            retry_count: 2,
        };

        let json = serde_json::to_vec(&record).unwrap();
        let back: BufferedMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.server_id, record.server_id);
        assert_eq!(back.retry_count, 2);
        assert_eq!(back.message_type, MessageType::Sticker);
    }
}
