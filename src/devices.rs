//! Device token lifecycle: registration, ownership moves, and logout.
//!
//! A device holds at most one active token. Re-registering a token value
//! under a different device moves ownership; the old row is rewritten, not
//! duplicated. All mutations invalidate the token cache entries.

use crate::cache::{keys, Cache};
use crate::error::ApiError;
use crate::models::{DeviceId, DeviceToken};
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct Devices {
    store: Arc<Store>,
    cache: Arc<Cache>,
}

impl Devices {
    pub fn new(store: Arc<Store>, cache: Arc<Cache>) -> Self {
        Self { store, cache }
    }

    /// Register an opaque vendor push token for a device.
    pub async fn register_token(
        &self,
        device_id: &DeviceId,
        token: &str,
    ) -> Result<DeviceToken, ApiError> {
        if token.is_empty() || token.len() > 512 {
            return Err(ApiError::Validation("invalid device token"));
        }

        let now = Utc::now();
        let mut invalidate_devices: Vec<DeviceId> = vec![device_id.clone()];

        let mut tx = self.store.begin().await;
        let registered = match tx.token_by_value(token) {
            Some(existing) if existing.device_id == *device_id => {
                // Idempotent refresh: one active row, possibly reactivated.
                for other in tx.deactivate_device_tokens(device_id, now) {
                    let _ = self.cache.del(&keys::device_token(&other));
                }
                tx.reassign_token(token, device_id, now);
                tx.token_by_value(token).ok_or(ApiError::Internal)?
            }
            Some(existing) => {
                // Token moved to a new device: rewrite ownership.
                invalidate_devices.push(existing.device_id.clone());
                for other in tx.deactivate_device_tokens(device_id, now) {
                    let _ = self.cache.del(&keys::device_token(&other));
                }
                tx.reassign_token(token, device_id, now);
                debug!("Device token ownership moved");
                tx.token_by_value(token).ok_or(ApiError::Internal)?
            }
            None => {
                for other in tx.deactivate_device_tokens(device_id, now) {
                    let _ = self.cache.del(&keys::device_token(&other));
                }
                let row = DeviceToken {
                    id: Uuid::new_v4(),
                    device_id: device_id.clone(),
                    token: token.to_string(),
                    active: true,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert_token(row.clone());
                row
            }
        };
        drop(tx);

        let _ = self.cache.del(&keys::device_token(token));
        for device in &invalidate_devices {
            let _ = self.cache.del(&keys::device_id_tokens(device));
        }

        info!("Device token registered");
        Ok(registered)
    }

    /// Remove every token the device holds.
    pub async fn logout(&self, device_id: &DeviceId) -> usize {
        let mut tx = self.store.begin().await;
        let removed = tx.delete_tokens_for_device(device_id);
        drop(tx);

        for token in &removed {
            let _ = self.cache.del(&keys::device_token(token));
        }
        let _ = self.cache.del(&keys::device_id_tokens(device_id));

        debug!(count = removed.len(), "Device logged out");
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (Devices, Arc<Store>) {
        let store = Arc::new(Store::new());
        let cache = Arc::new(Cache::new());
        (Devices::new(store.clone(), cache), store)
    }

    #[tokio::test]
    async fn re_registration_is_idempotent() {
        let (devices, store) = service();
        let d = "device-a".to_string();

        devices.register_token(&d, "tok-1").await.unwrap();
        devices.register_token(&d, "tok-1").await.unwrap();

        let rows = store.tokens_by_device(&d).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].active);
    }

    #[tokio::test]
    async fn one_active_token_per_device() {
        let (devices, store) = service();
        let d = "device-a".to_string();

        devices.register_token(&d, "tok-1").await.unwrap();
        devices.register_token(&d, "tok-2").await.unwrap();

        let active = store.active_tokens_by_devices(&[d.clone()]).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].token, "tok-2");
        assert_eq!(store.tokens_by_device(&d).await.len(), 2);
    }

    #[tokio::test]
    async fn token_moves_between_devices_without_duplication() {
        let (devices, store) = service();
        let d1 = "device-a".to_string();
        let d2 = "device-b".to_string();

        devices.register_token(&d1, "tok-1").await.unwrap();
        devices.register_token(&d2, "tok-1").await.unwrap();

        assert!(store.tokens_by_device(&d1).await.is_empty());
        let owned = store.token_by_value("tok-1").await.unwrap();
        assert_eq!(owned.device_id, d2);
        assert!(owned.active);
    }

    #[tokio::test]
    async fn logout_removes_all_rows() {
        let (devices, store) = service();
        let d = "device-a".to_string();

        devices.register_token(&d, "tok-1").await.unwrap();
        devices.register_token(&d, "tok-2").await.unwrap();
        let removed = devices.logout(&d).await;

        assert_eq!(removed, 2);
        assert!(store.tokens_by_device(&d).await.is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_tokens() {
        let (devices, _) = service();
        let d = "device-a".to_string();
        assert!(matches!(
            devices.register_token(&d, "").await,
            Err(ApiError::Validation(_))
        ));
        let oversized = "x".repeat(513);
        assert!(matches!(
            devices.register_token(&d, &oversized).await,
            Err(ApiError::Validation(_))
        ));
    }
}
