//! Subscription hub.
//!
//! Fan-out of JSON events to named rooms. Every connection gets a bounded
//! outbound queue; broadcasts use a non-blocking enqueue and drop the
//! message for slow consumers rather than ever blocking the publisher. A
//! slow consumer may observe gaps but never reordering.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Outbound queue capacity per connection.
pub const SEND_QUEUE_CAPACITY: usize = 256;

pub type ConnId = Uuid;

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnId, mpsc::Sender<String>>,
    rooms: HashMap<String, HashSet<ConnId>>,
    conn_rooms: HashMap<ConnId, HashSet<String>>,
}

#[derive(Default)]
pub struct SubscriptionHub {
    state: RwLock<HubState>,
    dropped: AtomicU64,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns its id and the receive half of its
    /// outbound queue.
    pub fn attach(&self) -> (ConnId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let conn_id = Uuid::new_v4();
        let mut state = self.state.write();
        state.connections.insert(conn_id, tx);
        state.conn_rooms.insert(conn_id, HashSet::new());
        (conn_id, rx)
    }

    /// Remove a connection and clean up its room memberships.
    pub fn detach(&self, conn_id: ConnId) {
        let mut state = self.state.write();
        state.connections.remove(&conn_id);
        if let Some(rooms) = state.conn_rooms.remove(&conn_id) {
            for room in rooms {
                if let Some(members) = state.rooms.get_mut(&room) {
                    members.remove(&conn_id);
                    if members.is_empty() {
                        state.rooms.remove(&room);
                    }
                }
            }
        }
    }

    pub fn subscribe(&self, conn_id: ConnId, room: &str) {
        let mut state = self.state.write();
        if !state.connections.contains_key(&conn_id) {
            return;
        }
        state.rooms.entry(room.to_string()).or_default().insert(conn_id);
        state.conn_rooms.entry(conn_id).or_default().insert(room.to_string());
    }

    pub fn unsubscribe(&self, conn_id: ConnId, room: &str) {
        let mut state = self.state.write();
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
        if let Some(rooms) = state.conn_rooms.get_mut(&conn_id) {
            rooms.remove(room);
        }
    }

    /// Drop all of one connection's subscriptions.
    pub fn unsubscribe_all(&self, conn_id: ConnId) {
        let mut state = self.state.write();
        if let Some(rooms) = state.conn_rooms.get_mut(&conn_id) {
            let rooms: Vec<String> = rooms.drain().collect();
            for room in rooms {
                if let Some(members) = state.rooms.get_mut(&room) {
                    members.remove(&conn_id);
                    if members.is_empty() {
                        state.rooms.remove(&room);
                    }
                }
            }
        }
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.state.read().rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Active room names starting with `prefix`. Lets publishers tailor
    /// payloads to parameterized rooms (`depth:{id}:{levels}`).
    pub fn rooms_matching(&self, prefix: &str) -> Vec<String> {
        self.state
            .read()
            .rooms
            .keys()
            .filter(|room| room.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Messages dropped so far because of slow consumers.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Send to every member of a room. Never blocks: a full queue means the
    /// message is dropped for that connection and counted.
    pub fn broadcast(&self, room: &str, message: &serde_json::Value) {
        let payload = message.to_string();
        let state = self.state.read();
        let Some(members) = state.rooms.get(room) else { return };

        for conn_id in members {
            let Some(tx) = state.connections.get(conn_id) else { continue };
            if tx.try_send(payload.clone()).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(room, conn = %conn_id, "Dropped message for slow consumer");
            }
        }
    }

    /// Direct message to one connection; same non-blocking discipline.
    pub fn send(&self, conn_id: ConnId, message: &serde_json::Value) {
        let state = self.state.read();
        let Some(tx) = state.connections.get(&conn_id) else { return };
        if tx.try_send(message.to_string()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(conn = %conn_id, "Dropped direct message for slow consumer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_in_order() {
        let hub = SubscriptionHub::new();
        let (conn, mut rx) = hub.attach();
        hub.subscribe(conn, "trades:abc");

        hub.broadcast("trades:abc", &json!({"seq": 1}));
        hub.broadcast("trades:abc", &json!({"seq": 2}));

        assert_eq!(rx.recv().await.unwrap(), r#"{"seq":1}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"seq":2}"#);
    }

    #[tokio::test]
    async fn test_broadcast_skips_other_rooms() {
        let hub = SubscriptionHub::new();
        let (conn, mut rx) = hub.attach();
        hub.subscribe(conn, "quote:a");

        hub.broadcast("quote:b", &json!({"x": 1}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_not_blocks() {
        let hub = SubscriptionHub::new();
        let (conn, _rx) = hub.attach();
        hub.subscribe(conn, "quote:a");

        // Fill the queue past capacity; broadcast must not block.
        for i in 0..(SEND_QUEUE_CAPACITY + 10) {
            hub.broadcast("quote:a", &json!({"i": i}));
        }
        assert_eq!(hub.dropped_count(), 10);
    }

    #[tokio::test]
    async fn test_detach_cleans_rooms() {
        let hub = SubscriptionHub::new();
        let (conn, _rx) = hub.attach();
        hub.subscribe(conn, "quote:a");
        assert_eq!(hub.room_size("quote:a"), 1);

        hub.detach(conn);
        assert_eq!(hub.room_size("quote:a"), 0);
        // Broadcast to an empty room is a no-op.
        hub.broadcast("quote:a", &json!({}));
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let hub = SubscriptionHub::new();
        let (conn, _rx) = hub.attach();
        hub.subscribe(conn, "quote:a");
        hub.subscribe(conn, "depth:a:5");

        hub.unsubscribe_all(conn);
        assert_eq!(hub.room_size("quote:a"), 0);
        assert_eq!(hub.room_size("depth:a:5"), 0);
    }

    #[tokio::test]
    async fn test_rooms_matching() {
        let hub = SubscriptionHub::new();
        let (conn, _rx) = hub.attach();
        hub.subscribe(conn, "depth:abc:5");
        hub.subscribe(conn, "depth:abc:10");
        hub.subscribe(conn, "quote:abc");

        let mut rooms = hub.rooms_matching("depth:abc");
        rooms.sort();
        assert_eq!(rooms, vec!["depth:abc:10", "depth:abc:5"]);
    }
}
