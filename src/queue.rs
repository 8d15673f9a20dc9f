//! Ingestion queue for the pipeline create path.
//!
//! A single FIFO list in the cache under `message_queue`. Enqueue is a
//! right-push of a JSON-serialized `BufferedMessage`; the worker drains with
//! left-pops. Records that exhaust their retry budget land on the
//! dead-letter list. Queue unavailability is NOT recoverable on the enqueue
//! path: the pipeline has no degraded mode, so the caller surfaces 503.

use crate::cache::{keys, Cache, CacheError, Lookup};
use crate::models::BufferedMessage;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// FIFO queue over the cache list capability.
#[derive(Clone)]
pub struct MessageQueue {
    cache: Arc<Cache>,
}

impl MessageQueue {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    /// Append a record at the tail. Used for both first enqueue and
    /// retry-at-tail.
    pub fn enqueue(&self, record: &BufferedMessage) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(record).map_err(|e| {
            // Serialization of our own record type failing means a bug, but
            // the queue contract stays "optional error".
            warn!(server_id = %record.server_id, error = %e, "Failed to encode queue record");
            CacheError::Unavailable
        })?;
        let depth = self.cache.push_right(keys::MESSAGE_QUEUE, Bytes::from(bytes))?;
        debug!(server_id = %record.server_id, depth, "Enqueued buffered message");
        Ok(())
    }

    /// Pop the head record, if any. Undecodable records are dropped with a
    /// log rather than wedging the queue.
    pub fn dequeue(&self) -> Lookup<BufferedMessage> {
        loop {
            match self.cache.pop_left(keys::MESSAGE_QUEUE) {
                Lookup::Hit(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => return Lookup::Hit(record),
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable queue record");
                    }
                },
                Lookup::Miss => return Lookup::Miss,
                Lookup::Unavailable => return Lookup::Unavailable,
            }
        }
    }

    /// Observable depth for backpressure decisions.
    pub fn len(&self) -> usize {
        self.cache.list_len(keys::MESSAGE_QUEUE).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a terminally failed record to the dead-letter list.
    pub fn dead_letter(&self, record: &BufferedMessage) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(record).map_err(|_| CacheError::Unavailable)?;
        self.cache
            .push_right(keys::MESSAGE_QUEUE_DLQ, Bytes::from(bytes))?;
        warn!(
            server_id = %record.server_id,
            retries = record.retry_count,
            "Routed record to dead-letter queue"
        );
        Ok(())
    }

    /// Dead-letter depth (observability).
    pub fn dead_letter_len(&self) -> usize {
        self.cache.list_len(keys::MESSAGE_QUEUE_DLQ).unwrap_or(0)
    }

    /// Drop dead-letter records older than `ttl`. The list is FIFO, so the
    /// head is the oldest record and pruning stops at the first fresh one.
    pub fn prune_dead_letters(&self, ttl: std::time::Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = chrono::Utc::now() - ttl;
        let mut pruned = 0;
        loop {
            let head = match self.cache.list_range(keys::MESSAGE_QUEUE_DLQ, 0, 0) {
                Ok(head) => head,
                Err(_) => break,
            };
            let Some(bytes) = head.first() else { break };
            match serde_json::from_slice::<BufferedMessage>(bytes) {
                Ok(record) if record.queued_at < cutoff => {
                    let _ = self.cache.pop_left(keys::MESSAGE_QUEUE_DLQ);
                    pruned += 1;
                }
                Ok(_) => break,
                Err(_) => {
                    // Undecodable head would wedge pruning forever.
                    let _ = self.cache.pop_left(keys::MESSAGE_QUEUE_DLQ);
                    pruned += 1;
                }
            }
        }
        pruned
    }
}
