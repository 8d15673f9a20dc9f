//! Apple Push Notification Service (APNS) bridge.
//!
//! Sends silent and alert notifications to offline devices. The only
//! conversation identifier that ever leaves the process is a routing hash:
//! the first 32 hex characters of SHA-256 over the lowercase UUID string.
//! Best-effort delivery: a failure for one device never affects others, and
//! no failure ever propagates to the originating request.

use crate::cache::{keys, Cache};
use crate::config::Config;
use crate::models::DeviceId;
use crate::store::Store;
use a2::{
    Client, ClientConfig, DefaultNotificationBuilder, Endpoint, ErrorReason, NotificationBuilder,
    NotificationOptions, Priority, PushType,
};
use chrono::Utc;
use ring::digest::{digest, SHA256};
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Privacy-preserving conversation routing hash.
///
/// SHA-256 over the lowercase hyphenated UUID string, truncated to the
/// first 32 hex characters. Lowercase canonicalization is mandatory so
/// independent client implementations agree byte-for-byte.
pub fn routing_hash(conversation_id: &Uuid) -> String {
    let canonical = conversation_id.as_hyphenated().to_string().to_lowercase();
    let hash = digest(&SHA256, canonical.as_bytes());
    hex::encode(hash.as_ref())[..32].to_string()
}

/// Notification kinds the bridge can dispatch.
#[derive(Debug, Clone)]
pub enum PushKind {
    /// Wake-only notification with `content-available=1`.
    Silent,
    /// User-visible alert.
    Alert { title: String, body: String },
    /// Typed alert carrying `type: "deleted"`.
    ConversationDeleted,
    /// Typed alert carrying `type: "expired"`.
    ConversationExpired,
}

impl PushKind {
    /// The `type` custom field, where applicable.
    const fn type_tag(&self) -> Option<&'static str> {
        match self {
            Self::ConversationDeleted => Some("deleted"),
            Self::ConversationExpired => Some("expired"),
            Self::Silent | Self::Alert { .. } => None,
        }
    }
}

/// APNS client wrapper with token lifecycle handling.
pub struct ApnsBridge {
    client: Option<Client>,
    topic: String,
    store: Arc<Store>,
    cache: Arc<Cache>,
}

impl ApnsBridge {
    /// Create a bridge from configuration. Missing or broken APNS
    /// configuration yields a disabled bridge whose sends are no-ops.
    pub async fn new(config: &Config, store: Arc<Store>, cache: Arc<Cache>) -> Self {
        let disabled = |topic: String| Self {
            client: None,
            topic,
            store: store.clone(),
            cache: cache.clone(),
        };

        if !config.apns_configured() {
            warn!("APNS not configured - push notifications disabled");
            return disabled(String::new());
        }

        let team_id = config.apns_team_id.as_ref().unwrap();
        let key_id = config.apns_key_id.as_ref().unwrap();
        let key_path = config.apns_key_path.as_ref().unwrap();
        let topic = config.apns_topic.as_ref().unwrap().clone();

        let mut key_file = match File::open(key_path) {
            Ok(f) => f,
            Err(e) => {
                error!(path = %key_path, error = %e, "Failed to open APNS key file");
                return disabled(topic);
            }
        };

        let mut key_pem = Vec::new();
        if let Err(e) = key_file.read_to_end(&mut key_pem) {
            error!(error = %e, "Failed to read APNS key file");
            return disabled(topic);
        }

        let endpoint = if config.apns_sandbox {
            Endpoint::Sandbox
        } else {
            Endpoint::Production
        };

        let client = match Client::token(
            &mut &key_pem[..],
            key_id,
            team_id,
            ClientConfig::new(endpoint),
        ) {
            Ok(c) => Some(c),
            Err(e) => {
                error!(error = %e, "Failed to create APNS client");
                None
            }
        };

        if client.is_some() {
            debug!(sandbox = config.apns_sandbox, "APNS client initialized");
        }

        Self {
            client,
            topic,
            store,
            cache,
        }
    }

    /// Check if APNS is enabled
    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Fire-and-forget fan-out: resolve active tokens for the given devices
    /// and dispatch on a detached task. Callers never observe the outcome.
    pub fn notify(self: &Arc<Self>, conversation_id: Uuid, device_ids: Vec<DeviceId>, kind: PushKind) {
        if self.client.is_none() || device_ids.is_empty() {
            return;
        }
        let bridge = self.clone();
        tokio::spawn(async move {
            bridge
                .send_to_devices(&conversation_id, &device_ids, &kind)
                .await;
        });
    }

    /// Resolve active tokens and dispatch to all of them in parallel.
    pub async fn send_to_devices(
        &self,
        conversation_id: &Uuid,
        device_ids: &[DeviceId],
        kind: &PushKind,
    ) {
        if self.client.is_none() || device_ids.is_empty() {
            return;
        }

        let tokens = self.store.active_tokens_by_devices(device_ids).await;
        if tokens.is_empty() {
            return;
        }

        let sends: Vec<_> = tokens
            .iter()
            .map(|t| self.dispatch(&t.token, conversation_id, kind))
            .collect();
        let results = futures::future::join_all(sends).await;

        let delivered = results.iter().filter(|&&ok| ok).count();
        debug!(
            total = tokens.len(),
            delivered,
            "Dispatched push notifications"
        );
    }

    /// Send one notification. Returns whether the gateway accepted it.
    async fn dispatch(&self, device_token: &str, conversation_id: &Uuid, kind: &PushKind) -> bool {
        let client = match &self.client {
            Some(c) => c,
            None => return false,
        };

        let (priority, push_type) = match kind {
            PushKind::Silent => (Priority::Normal, PushType::Background),
            _ => (Priority::High, PushType::Alert),
        };

        let options = NotificationOptions {
            apns_priority: Some(priority),
            apns_topic: Some(&self.topic),
            apns_push_type: Some(push_type),
            ..Default::default()
        };

        let builder = match kind {
            PushKind::Silent => DefaultNotificationBuilder::new().set_content_available(),
            PushKind::Alert { title, body } => DefaultNotificationBuilder::new()
                .set_title(title)
                .set_body(body),
            PushKind::ConversationDeleted => DefaultNotificationBuilder::new()
                .set_title("Conversation ended")
                .set_body("This conversation has been deleted"),
            PushKind::ConversationExpired => DefaultNotificationBuilder::new()
                .set_title("Conversation expired")
                .set_body("This conversation has reached its time limit"),
        };

        let mut payload = builder.build(device_token, options);

        let hash = routing_hash(conversation_id);
        if let Err(e) = payload.add_custom_data("c", &hash) {
            debug!(error = %e, "Failed to add routing hash to payload");
        }
        if let Some(tag) = kind.type_tag() {
            if let Err(e) = payload.add_custom_data("type", &tag) {
                debug!(error = %e, "Failed to add type tag to payload");
            }
        }

        match client.send(payload).await {
            Ok(response) => {
                debug!(status = ?response.code, "Sent push notification");
                response.code == 200
            }
            Err(a2::Error::ResponseError(response)) => {
                let reason = response.error.as_ref().map(|e| &e.reason);
                if matches!(
                    reason,
                    Some(ErrorReason::BadDeviceToken | ErrorReason::Unregistered)
                ) {
                    self.retire_token(device_token).await;
                } else {
                    debug!(status = response.code, reason = ?reason, "Push rejected");
                }
                false
            }
            Err(e) => {
                debug!(error = %e, "Failed to send push notification");
                false
            }
        }
    }

    /// Deactivate a token the gateway reported as dead and drop its cache
    /// entries.
    async fn retire_token(&self, token: &str) {
        let mut tx = self.store.begin().await;
        let retired = tx.deactivate_token(token, Utc::now());
        drop(tx);

        if let Some(retired) = retired {
            let _ = self.cache.del(&keys::device_token(token));
            let _ = self.cache.del(&keys::device_id_tokens(&retired.device_id));
            debug!("Retired rejected device token");
        }
    }
}

/// Create a shared APNS bridge
pub async fn create_bridge(config: &Config, store: Arc<Store>, cache: Arc<Cache>) -> Arc<ApnsBridge> {
    Arc::new(ApnsBridge::new(config, store, cache).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_hash_is_truncated_sha256_of_lowercase_uuid() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(routing_hash(&id), "a3a9e1ed9732cab28868127be00f1ce9");
    }

    #[test]
    fn routing_hash_shape_and_determinism() {
        let id = Uuid::new_v4();
        let hash = routing_hash(&id);
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, routing_hash(&id));
    }

    #[test]
    fn routing_hash_distinguishes_conversations() {
        assert_ne!(routing_hash(&Uuid::new_v4()), routing_hash(&Uuid::new_v4()));
    }

    #[test]
    fn type_tags() {
        assert_eq!(PushKind::Silent.type_tag(), None);
        assert_eq!(PushKind::ConversationDeleted.type_tag(), Some("deleted"));
        assert_eq!(PushKind::ConversationExpired.type_tag(), Some("expired"));
    }
}
