//! Push channel hub: per-device subscriptions, topic broadcast, and
//! user-queue fan-out over the bidirectional socket at `/ws`.
//!
//! Each connection owns a bounded outbox. Publishing never blocks: a full
//! outbox drops its OLDEST frame with a warning, so one slow consumer can
//! never stall publishers or other subscribers. Frames are FIFO per
//! (destination, connection). Nothing is persisted; disconnected clients
//! reconcile through the incremental message fetch on reconnect.

use crate::models::{DeviceId, PushEvent};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnectionId = u64;

/// Topic destination for a conversation.
pub fn conversation_topic(conversation_id: &Uuid) -> String {
    format!("/topic/conversation/{conversation_id}")
}

/// Per-device queue destination. Implicitly subscribed on connect.
pub const USER_QUEUE: &str = "/user/queue/notifications";

/// Frames clients send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Subscribe { destination: String },
    Unsubscribe { destination: String },
}

/// Bounded per-connection outbound queue.
pub struct Outbox {
    frames: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame, dropping the oldest on overflow.
    fn push(&self, frame: String) {
        {
            let mut frames = self.frames.lock().expect("outbox lock poisoned");
            if frames.len() >= self.capacity {
                frames.pop_front();
                warn!(capacity = self.capacity, "Outbox full, dropped oldest frame");
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Await the next frame; `None` once the connection is closed and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<String> {
        loop {
            if let Some(frame) = self.frames.lock().expect("outbox lock poisoned").pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking drain (test and shutdown helper).
    pub fn drain(&self) -> Vec<String> {
        self.frames
            .lock()
            .expect("outbox lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().expect("outbox lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ConnectionHandle {
    device_id: DeviceId,
    outbox: Arc<Outbox>,
}

/// Connection and subscription registry.
pub struct Hub {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    topics: DashMap<String, HashSet<ConnectionId>>,
    outbox_capacity: usize,
}

impl Hub {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: DashMap::new(),
            topics: DashMap::new(),
            outbox_capacity,
        }
    }

    /// Register a connection authenticated as `device_id`. The user queue
    /// subscription is implicit.
    pub fn connect(&self, device_id: DeviceId) -> (ConnectionId, Arc<Outbox>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox::new(self.outbox_capacity));
        self.connections.insert(
            id,
            ConnectionHandle {
                device_id,
                outbox: outbox.clone(),
            },
        );
        debug!(connection = id, "Push channel connected");
        (id, outbox)
    }

    /// Drop a connection: unsubscribe everywhere and close its outbox.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some((_, handle)) = self.connections.remove(&id) {
            handle.outbox.close();
        }
        for mut subscribers in self.topics.iter_mut() {
            subscribers.remove(&id);
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
        debug!(connection = id, "Push channel disconnected");
    }

    /// Subscribe a connection to a topic destination. Only conversation
    /// topics are subscribable; the user queue is implicit.
    pub fn subscribe(&self, id: ConnectionId, destination: &str) -> bool {
        if !self.connections.contains_key(&id) {
            return false;
        }
        if destination == USER_QUEUE {
            // Already bound through the connection's device identity.
            return true;
        }
        if !is_conversation_topic(destination) {
            warn!(destination, "Rejected subscription to unknown destination");
            return false;
        }
        self.topics
            .entry(destination.to_string())
            .or_default()
            .insert(id);
        debug!(connection = id, destination, "Subscribed");
        true
    }

    pub fn unsubscribe(&self, id: ConnectionId, destination: &str) {
        if let Some(mut subscribers) = self.topics.get_mut(destination) {
            subscribers.remove(&id);
        }
    }

    /// Broadcast to every subscriber of a topic.
    pub fn publish_topic(&self, destination: &str, event: &PushEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "Failed to encode push event");
                return;
            }
        };
        let Some(subscribers) = self.topics.get(destination) else {
            return;
        };
        for id in subscribers.iter() {
            if let Some(handle) = self.connections.get(id) {
                handle.outbox.push(frame.clone());
            }
        }
    }

    /// Deliver to every socket authenticated as `device_id`.
    pub fn send_to_user(&self, device_id: &str, event: &PushEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "Failed to encode push event");
                return;
            }
        };
        for handle in self.connections.iter() {
            if handle.device_id == device_id {
                handle.outbox.push(frame.clone());
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn is_conversation_topic(destination: &str) -> bool {
    destination
        .strip_prefix("/topic/conversation/")
        .is_some_and(|rest| Uuid::parse_str(rest).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn new_message_event(conversation_id: Uuid) -> PushEvent {
        PushEvent::NewMessage {
            conversation_id,
            message_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn topic_broadcast_reaches_subscribers_only() {
        let hub = Hub::new(16);
        let conv = Uuid::new_v4();
        let topic = conversation_topic(&conv);

        let (a, outbox_a) = hub.connect("device-a".into());
        let (_b, outbox_b) = hub.connect("device-b".into());

        assert!(hub.subscribe(a, &topic));
        hub.publish_topic(&topic, &new_message_event(conv));

        assert_eq!(outbox_a.len(), 1);
        assert!(outbox_b.is_empty());

        let frame = outbox_a.drain().pop().unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "NEW_MESSAGE");
    }

    #[test]
    fn user_queue_targets_device_connections() {
        let hub = Hub::new(16);
        let (_a1, outbox_a1) = hub.connect("device-a".into());
        let (_a2, outbox_a2) = hub.connect("device-a".into());
        let (_b, outbox_b) = hub.connect("device-b".into());

        hub.send_to_user(
            "device-a",
            &PushEvent::MessageDelivered {
                server_id: Uuid::new_v4(),
                message_id: Uuid::new_v4(),
                delivered_at: Utc::now(),
            },
        );

        assert_eq!(outbox_a1.len(), 1);
        assert_eq!(outbox_a2.len(), 1);
        assert!(outbox_b.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let hub = Hub::new(2);
        let conv = Uuid::new_v4();
        let topic = conversation_topic(&conv);
        let (a, outbox) = hub.connect("device-a".into());
        hub.subscribe(a, &topic);

        for _ in 0..3 {
            hub.publish_topic(&topic, &new_message_event(conv));
        }
        assert_eq!(outbox.len(), 2);

        // The first frame is gone; the remaining two are the newest, in order.
        let frames = outbox.drain();
        let first: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_ne!(first["messageId"], second["messageId"]);
    }

    #[test]
    fn disconnect_unsubscribes_and_closes() {
        let hub = Hub::new(16);
        let conv = Uuid::new_v4();
        let topic = conversation_topic(&conv);
        let (a, outbox) = hub.connect("device-a".into());
        hub.subscribe(a, &topic);

        hub.disconnect(a);
        hub.publish_topic(&topic, &new_message_event(conv));
        assert!(outbox.is_empty());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn recv_returns_none_after_close() {
        let hub = Hub::new(16);
        let (a, outbox) = hub.connect("device-a".into());

        hub.send_to_user("device-a", &new_message_event(Uuid::new_v4()));
        assert!(outbox.recv().await.is_some());

        hub.disconnect(a);
        assert!(outbox.recv().await.is_none());
    }

    #[test]
    fn rejects_malformed_destinations() {
        let hub = Hub::new(16);
        let (a, _outbox) = hub.connect("device-a".into());

        assert!(!hub.subscribe(a, "/topic/conversation/not-a-uuid"));
        assert!(!hub.subscribe(a, "/topic/other"));
        assert!(hub.subscribe(a, USER_QUEUE));
    }

    #[test]
    fn client_frame_decoding() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"SUBSCRIBE","destination":"/topic/conversation/550e8400-e29b-41d4-a716-446655440000"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { .. }));
    }
}
