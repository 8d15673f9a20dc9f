//! Two-phase file staging.
//!
//! Phase one stores the base64 ciphertext in the cache under a fresh file id
//! and records a FILE/IMAGE message pointing at it, returning immediately.
//! Phase two runs asynchronously: decode, write the binary under a dated
//! folder, update the message's storage reference, drop the cache entry.
//! Downloads read the filesystem first and fall back to the cache for the
//! window where a download races promotion.

use crate::cache::{keys, Cache, Lookup};
use crate::config::Config;
use crate::error::ApiError;
use crate::models::*;
use crate::store::Store;
use crate::tier::SubscriptionGate;
use base64::Engine;
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct FileStaging {
    store: Arc<Store>,
    cache: Arc<Cache>,
    gate: Arc<dyn SubscriptionGate>,
    config: Arc<Config>,
}

impl FileStaging {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<Cache>,
        gate: Arc<dyn SubscriptionGate>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            cache,
            gate,
            config,
        }
    }

    /// Phase one: stage the upload and record the message.
    ///
    /// The staged ciphertext has no degraded path, so a cache outage here
    /// surfaces as 503.
    pub async fn upload(
        self: &Arc<Self>,
        conversation_id: &Uuid,
        device_id: &DeviceId,
        req: &UploadFileRequest,
    ) -> Result<UploadFileResponse, ApiError> {
        if !req.message_type.carries_file() {
            return Err(ApiError::Validation("messageType must be FILE or IMAGE"));
        }
        if req.name.is_empty() || req.name.len() > 255 {
            return Err(ApiError::Validation("invalid file name"));
        }

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

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&req.ciphertext)
            .map_err(|_| ApiError::Validation("invalid base64 ciphertext"))?;
        if decoded.len() > self.gate.tier(device_id).max_payload_bytes() {
            return Err(ApiError::PayloadTooLarge);
        }

        let file_id = Uuid::new_v4();
        self.cache
            .set(
                &keys::file_upload(&file_id),
                bytes::Bytes::from(req.ciphertext.clone().into_bytes()),
                Some(self.config.file_staging_ttl),
            )
            .map_err(|_| ApiError::ServiceUnavailable("file staging unavailable"))?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Some(*conversation_id),
            ciphertext: Vec::new(),
            nonce: Vec::new(),
            tag: None,
            message_type: req.message_type,
            created_at: now,
            expires_at: conversation.expires_at,
            read_at: None,
            consumed: false,
            sender_device_id: Some(device_id.clone()),
            file_ref: Some(file_id),
            file: Some(FileMetadata {
                name: req.name.clone(),
                size: decoded.len() as u64,
                mime_type: req.mime_type.clone(),
                storage_ref: None,
            }),
        };
        let message_id = message.id;

        let mut tx = self.store.begin().await;
        tx.insert_message(message);
        drop(tx);

        let _ = self.cache.del(&keys::conversation_messages(conversation_id));

        // Phase two runs detached; the upload response does not wait for it.
        let staging = self.clone();
        tokio::spawn(async move {
            if let Err(e) = staging.promote(&file_id).await {
                warn!(file = %file_id, error = %e, "File promotion failed");
            }
        });

        info!(conversation = %conversation_id, file = %file_id, "File staged");
        Ok(UploadFileResponse {
            file_id,
            message_id,
        })
    }

    /// Phase two: decode the staged base64, write the binary to the dated
    /// folder, update the message, and drop the staging entry.
    pub async fn promote(&self, file_id: &Uuid) -> Result<(), std::io::Error> {
        let staged = match self.cache.get(&keys::file_upload(file_id)) {
            Lookup::Hit(bytes) => bytes,
            Lookup::Miss | Lookup::Unavailable => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "staged upload missing",
                ));
            }
        };
        let binary = base64::engine::general_purpose::STANDARD
            .decode(staged.as_ref())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let folder = Utc::now().format("%Y-%m-%d").to_string();
        let storage_ref = format!("{folder}/{file_id}.enc");
        let dir = Path::new(&self.config.file_base_path).join(&folder);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(format!("{file_id}.enc")), &binary).await?;

        let message = self.store.message_by_file_ref(file_id).await;
        if let Some(message) = message {
            let mut tx = self.store.begin().await;
            tx.set_message_storage_ref(&message.id, storage_ref.clone());
            drop(tx);
            let _ = self.cache.del(&keys::message(&message.id));
        }

        let _ = self.cache.del(&keys::file_upload(file_id));
        debug!(file = %file_id, storage_ref, "File promoted");
        Ok(())
    }

    /// Download a staged or promoted file.
    pub async fn download(&self, file_id: &Uuid) -> Result<(Vec<u8>, Message), ApiError> {
        let message = self
            .store
            .message_by_file_ref(file_id)
            .await
            .ok_or(ApiError::NotFound("file not found"))?;
        if message.is_expired(Utc::now()) {
            return Err(ApiError::Gone("file expired"));
        }

        if let Some(storage_ref) = message.file.as_ref().and_then(|f| f.storage_ref.as_ref()) {
            let path = Path::new(&self.config.file_base_path).join(storage_ref);
            match tokio::fs::read(&path).await {
                Ok(binary) => return Ok((binary, message)),
                Err(e) => {
                    warn!(file = %file_id, error = %e, "Promoted file unreadable, trying cache");
                }
            }
        }

        // Pre-promotion race: the staged base64 may still be in the cache.
        if let Lookup::Hit(staged) = self.cache.get(&keys::file_upload(file_id)) {
            let binary = base64::engine::general_purpose::STANDARD
                .decode(staged.as_ref())
                .map_err(|_| ApiError::Internal)?;
            return Ok((binary, message));
        }

        Err(ApiError::NotFound("file content not found"))
    }

    /// Remove whole date folders at or before the cutoff. Returns how many
    /// folders were deleted.
    pub async fn cleanup_directories(&self, cutoff: NaiveDate) -> Result<usize, std::io::Error> {
        let base = PathBuf::from(&self.config.file_base_path);
        let mut entries = match tokio::fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(date) = NaiveDate::parse_from_str(name, "%Y-%m-%d") else {
                continue;
            };
            if date <= cutoff {
                if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                    warn!(folder = name, error = %e, "Failed to remove file folder");
                } else {
                    removed += 1;
                    debug!(folder = name, "Removed file folder");
                }
            }
        }
        Ok(removed)
    }
}
