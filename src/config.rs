//! Configuration for the Wisp server core.
//!
//! All configuration is loaded from environment variables with defaults in
//! code. No secrets are logged.

use std::time::Duration;

/// Queue drain cadence (100 ms).
pub const QUEUE_INTERVAL_MS: u64 = 100;

/// Bounded drain batch per tick.
pub const QUEUE_BATCH_SIZE: usize = 100;

/// Retry budget before a record is dead-lettered.
pub const QUEUE_RETRY_LIMIT: u32 = 3;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: String,

    /// Server port
    pub port: u16,

    /// Base URL used when generating share links.
    pub share_base_url: String,

    // === Conversation lifecycle ===
    /// Default conversation TTL in hours when the client omits one.
    pub default_ttl_hours: i64,

    /// Maximum accepted conversation TTL in hours.
    pub max_ttl_hours: i64,

    // === Pipeline ===
    /// Worker tick interval.
    pub queue_interval: Duration,

    /// Max records drained per tick.
    pub queue_batch_size: usize,

    /// Retry budget before DLQ.
    pub queue_retry_limit: u32,

    /// TTL on the dead-letter list.
    pub dlq_ttl: Duration,

    // === Sweeper ===
    /// Sweep cadence (default: hourly).
    pub sweeper_interval: Duration,

    /// Consumed messages are purged once read longer ago than this.
    pub consumed_retention: Duration,

    /// DELETED conversations are hard-deleted after this grace period.
    pub deleted_retention: Duration,

    // === Cache TTLs ===
    /// TTL for cached conversation rows (default: 7 days).
    pub conversation_cache_ttl: Duration,

    /// TTL for cached message lists and rows (default: 24 hours).
    pub message_cache_ttl: Duration,

    // === File staging ===
    /// TTL for staged uploads awaiting promotion (default: 1 hour).
    pub file_staging_ttl: Duration,

    /// Base directory for promoted file storage.
    pub file_base_path: String,

    /// Date folders older than this many days are reaped.
    pub file_retention_days: i64,

    // === Push channel ===
    /// Per-connection outbox depth; overflow drops the oldest event.
    pub outbox_capacity: usize,

    // === APNS Configuration ===
    /// APNS team ID
    pub apns_team_id: Option<String>,

    /// APNS key ID
    pub apns_key_id: Option<String>,

    /// Path to APNS private key (.p8 file)
    pub apns_key_path: Option<String>,

    /// APNS topic (app bundle identifier)
    pub apns_topic: Option<String>,

    /// Use APNS sandbox (development) environment
    pub apns_sandbox: bool,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            share_base_url: std::env::var("SHARE_BASE_URL")
                .unwrap_or_else(|_| "https://localhost:8080".to_string()),

            default_ttl_hours: env_i64("DEFAULT_TTL_HOURS", 24),
            max_ttl_hours: env_i64("MAX_TTL_HOURS", 7 * 24),

            queue_interval: Duration::from_millis(env_u64(
                "QUEUE_INTERVAL_MS",
                QUEUE_INTERVAL_MS,
            )),
            queue_batch_size: env_u64("QUEUE_BATCH_SIZE", QUEUE_BATCH_SIZE as u64) as usize,
            queue_retry_limit: env_u64("QUEUE_RETRY_LIMIT", u64::from(QUEUE_RETRY_LIMIT)) as u32,
            dlq_ttl: Duration::from_secs(env_u64("DLQ_TTL_SECS", 24 * 3600)),

            sweeper_interval: Duration::from_secs(env_u64("SWEEPER_INTERVAL_SECS", 3600)),
            consumed_retention: Duration::from_secs(env_u64("CONSUMED_RETENTION_SECS", 3600)),
            deleted_retention: Duration::from_secs(env_u64("DELETED_RETENTION_SECS", 3600)),

            conversation_cache_ttl: Duration::from_secs(
                env_u64("CONVERSATION_CACHE_TTL_DAYS", 7) * 24 * 3600,
            ),
            message_cache_ttl: Duration::from_secs(env_u64("MESSAGE_CACHE_TTL_SECS", 24 * 3600)),

            file_staging_ttl: Duration::from_secs(env_u64("FILE_STAGING_TTL_SECS", 3600)),
            file_base_path: std::env::var("FILE_BASE_PATH")
                .unwrap_or_else(|_| "data/files".to_string()),
            file_retention_days: env_i64("FILE_RETENTION_DAYS", 2),

            outbox_capacity: env_u64("OUTBOX_CAPACITY", 256) as usize,

            apns_team_id: std::env::var("APNS_TEAM_ID").ok(),
            apns_key_id: std::env::var("APNS_KEY_ID").ok(),
            apns_key_path: std::env::var("APNS_KEY_PATH").ok(),
            apns_topic: std::env::var("APNS_TOPIC").ok(),
            apns_sandbox: std::env::var("APNS_SANDBOX")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true), // Default to sandbox for safety
        }
    }

    /// Check if APNS is configured
    pub fn apns_configured(&self) -> bool {
        self.apns_team_id.is_some()
            && self.apns_key_id.is_some()
            && self.apns_key_path.is_some()
            && self.apns_topic.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
