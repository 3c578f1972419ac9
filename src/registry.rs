//! Connection registry: the process-wide map from client identity to the
//! live writer for its duplex channel, plus room membership.
//!
//! One RW lock guards both maps. Payload marshalling happens before the lock
//! is taken and network writes happen after it is released; the only thing a
//! read path does under the lock is clone the writer handle. Writes to a
//! single connection are serialised by the per-connection writer task that
//! owns the receiving end of the handle.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::ChatError;

/// Frame handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A complete text frame, already encoded.
    Frame(String),
    /// Close the connection cleanly with an application code and reason.
    Close { code: u16, reason: String },
}

/// Cloneable sending half of a connection's serialised writer.
#[derive(Debug, Clone)]
pub struct ClientWriter {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientWriter {
    /// Create a writer together with its receiving end, for tests and for
    /// the transport's writer task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientWriter { tx }, rx)
    }

    /// Queue a pre-encoded frame on this connection's serialised writer.
    pub fn send_frame(&self, frame: String) -> Result<(), ChatError> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| ChatError::UserNotConnected("writer task gone".into()))
    }

    /// Ask the writer task to close the connection cleanly.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn same_channel(&self, other: &ClientWriter) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

struct ConnectionRecord {
    writer: ClientWriter,
    joined_rooms: HashSet<String>,
    opened_at: Instant,
}

#[derive(Default)]
struct Inner {
    by_client: HashMap<String, ConnectionRecord>,
    by_room: HashMap<String, HashSet<String>>,
}

/// Concurrent client-id → connection mapping with room fan-out.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

/// Close code used when a new connection displaces an old one.
pub const CLOSE_DISPLACED: u16 = 4000;

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. An existing connection for the same client is
    /// closed cleanly and removed from all of its rooms first.
    pub fn add(&self, client_id: &str, writer: ClientWriter) -> Result<(), ChatError> {
        if client_id.is_empty() {
            return Err(ChatError::InvalidParameter("empty client id".into()));
        }

        let displaced = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let displaced = inner.by_client.remove(client_id);
            if let Some(old) = &displaced {
                let rooms: Vec<String> = old.joined_rooms.iter().cloned().collect();
                for room in rooms {
                    drop_room_member(&mut inner, &room, client_id);
                }
            }
            inner.by_client.insert(
                client_id.to_string(),
                ConnectionRecord {
                    writer,
                    joined_rooms: HashSet::new(),
                    opened_at: Instant::now(),
                },
            );
            displaced
        };

        if let Some(old) = displaced {
            info!(client_id, "displacing previous connection");
            old.writer.close(CLOSE_DISPLACED, "connection displaced");
        }
        Ok(())
    }

    /// Remove a connection and all of its room memberships. Idempotent.
    pub fn remove(&self, client_id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(record) = inner.by_client.remove(client_id) {
            let rooms: Vec<String> = record.joined_rooms.into_iter().collect();
            for room in rooms {
                drop_room_member(&mut inner, &room, client_id);
            }
        }
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.by_client.contains_key(client_id)
    }

    pub fn connection_count(&self) -> usize {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.by_client.len()
    }

    /// Age of a connection, if present.
    pub fn connected_since(&self, client_id: &str) -> Option<Instant> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.by_client.get(client_id).map(|r| r.opened_at)
    }

    /// Send a pre-encoded frame to one client.
    pub fn send(&self, client_id: &str, frame: String) -> Result<(), ChatError> {
        let writer = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .by_client
                .get(client_id)
                .map(|record| record.writer.clone())
        };
        match writer {
            Some(writer) => writer.send_frame(frame),
            None => Err(ChatError::UserNotConnected(client_id.to_string())),
        }
    }

    /// Remove a connection only while `writer` is still the registered one.
    ///
    /// A displaced connection's cleanup path must not tear down the
    /// connection that displaced it; the transport calls this instead of
    /// [`remove`](Self::remove) on read-loop exit.
    pub fn remove_if_current(&self, client_id: &str, writer: &ClientWriter) {
        let still_current = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .by_client
                .get(client_id)
                .map(|record| record.writer.same_channel(writer))
                .unwrap_or(false)
        };
        if still_current {
            self.remove(client_id);
        }
    }

    /// Best-effort fan-out to an explicit recipient list. Individual
    /// failures are logged and do not short-circuit; the first error is
    /// returned after every recipient has been attempted.
    pub fn broadcast(&self, client_ids: &[String], frame: &str) -> Result<(), ChatError> {
        let mut first_err = None;
        for client_id in client_ids {
            if let Err(err) = self.send(client_id, frame.to_string()) {
                warn!(%client_id, %err, "broadcast recipient failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fan a frame out to the current membership of a room. Membership is
    /// snapshotted under the lock; writes happen after release so a slow
    /// writer cannot block room mutation.
    pub fn broadcast_to_room(&self, room_id: &str, frame: &str) -> Result<(), ChatError> {
        let members: Vec<String> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .by_room
                .get(room_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        self.broadcast(&members, frame)
    }

    /// Join a room, creating it lazily. The client must be connected.
    pub fn join(&self, client_id: &str, room_id: &str) -> Result<(), ChatError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(record) = inner.by_client.get_mut(client_id) else {
            return Err(ChatError::UserNotConnected(client_id.to_string()));
        };
        record.joined_rooms.insert(room_id.to_string());
        inner
            .by_room
            .entry(room_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        Ok(())
    }

    /// Leave a room; empty rooms are collected eagerly. Idempotent.
    pub fn leave(&self, client_id: &str, room_id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(record) = inner.by_client.get_mut(client_id) {
            record.joined_rooms.remove(room_id);
        }
        drop_room_member(&mut inner, room_id, client_id);
    }

    /// Current membership snapshot, for diagnostics and tests.
    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .by_room
            .get(room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Close every connection, used on shutdown.
    pub fn close_all(&self, code: u16, reason: &str) {
        let writers: Vec<ClientWriter> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .by_client
                .values()
                .map(|record| record.writer.clone())
                .collect()
        };
        for writer in writers {
            writer.close(code, reason);
        }
    }
}

fn drop_room_member(inner: &mut Inner, room_id: &str, client_id: &str) {
    if let Some(members) = inner.by_room.get_mut(room_id) {
        members.remove(client_id);
        if members.is_empty() {
            inner.by_room.remove(room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_rejects_empty_client_id() {
        let registry = ConnectionRegistry::new();
        let (writer, _rx) = ClientWriter::channel();
        assert!(registry.add("", writer).is_err());
    }

    #[tokio::test]
    async fn send_reaches_registered_writer() {
        let registry = ConnectionRegistry::new();
        let (writer, mut rx) = ClientWriter::channel();
        registry.add("c-1", writer).unwrap();

        registry.send("c-1", "4hello".into()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Outbound::Frame("4hello".into()));
    }

    #[tokio::test]
    async fn send_to_absent_client_fails() {
        let registry = ConnectionRegistry::new();
        let err = registry.send("c-missing", "x".into()).unwrap_err();
        assert!(matches!(err, ChatError::UserNotConnected(_)));
    }

    #[tokio::test]
    async fn second_add_displaces_and_closes_first() {
        let registry = ConnectionRegistry::new();
        let (w1, mut rx1) = ClientWriter::channel();
        let (w2, mut rx2) = ClientWriter::channel();

        registry.add("c-1", w1).unwrap();
        registry.join("c-1", "lobby").unwrap();
        registry.add("c-1", w2).unwrap();

        // Old writer got a clean close and lost its room membership.
        assert_eq!(
            rx1.recv().await.unwrap(),
            Outbound::Close {
                code: CLOSE_DISPLACED,
                reason: "connection displaced".into()
            }
        );
        assert!(registry.room_members("lobby").is_empty());

        // Exactly one connection remains and it is the new writer.
        assert_eq!(registry.connection_count(), 1);
        registry.send("c-1", "ping".into()).unwrap();
        assert_eq!(rx2.recv().await.unwrap(), Outbound::Frame("ping".into()));
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_collects_rooms() {
        let registry = ConnectionRegistry::new();
        let (writer, _rx) = ClientWriter::channel();
        registry.add("c-1", writer).unwrap();
        registry.join("c-1", "lobby").unwrap();

        registry.remove("c-1");
        registry.remove("c-1");

        assert!(!registry.is_connected("c-1"));
        assert!(registry.room_members("lobby").is_empty());
    }

    #[tokio::test]
    async fn room_members_are_always_connected() {
        let registry = ConnectionRegistry::new();
        let (w1, _rx1) = ClientWriter::channel();
        let (w2, _rx2) = ClientWriter::channel();
        registry.add("c-1", w1).unwrap();
        registry.add("c-2", w2).unwrap();
        registry.join("c-1", "lobby").unwrap();
        registry.join("c-2", "lobby").unwrap();

        registry.remove("c-1");

        for member in registry.room_members("lobby") {
            assert!(registry.is_connected(&member));
        }
        assert_eq!(registry.room_members("lobby"), vec!["c-2".to_string()]);
    }

    #[tokio::test]
    async fn join_requires_connection() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(
            registry.join("c-ghost", "lobby"),
            Err(ChatError::UserNotConnected(_))
        ));
        assert!(registry.room_members("lobby").is_empty());
    }

    #[tokio::test]
    async fn broadcast_attempts_every_recipient() {
        let registry = ConnectionRegistry::new();
        let (w1, mut rx1) = ClientWriter::channel();
        let (w3, mut rx3) = ClientWriter::channel();
        registry.add("c-1", w1).unwrap();
        registry.add("c-3", w3).unwrap();

        let ids = vec!["c-1".to_string(), "c-2".to_string(), "c-3".to_string()];
        let err = registry.broadcast(&ids, "fanout").unwrap_err();
        assert!(matches!(err, ChatError::UserNotConnected(_)));

        // Both live recipients still received the frame.
        assert_eq!(rx1.recv().await.unwrap(), Outbound::Frame("fanout".into()));
        assert_eq!(rx3.recv().await.unwrap(), Outbound::Frame("fanout".into()));
    }

    #[tokio::test]
    async fn room_broadcast_uses_membership_snapshot() {
        let registry = ConnectionRegistry::new();
        let (w1, mut rx1) = ClientWriter::channel();
        let (w2, mut rx2) = ClientWriter::channel();
        registry.add("c-1", w1).unwrap();
        registry.add("c-2", w2).unwrap();
        registry.join("c-1", "lobby").unwrap();
        registry.join("c-2", "lobby").unwrap();

        registry.broadcast_to_room("lobby", "hi room").unwrap();
        assert_eq!(rx1.recv().await.unwrap(), Outbound::Frame("hi room".into()));
        assert_eq!(rx2.recv().await.unwrap(), Outbound::Frame("hi room".into()));

        // Broadcasting to an unknown room is a no-op.
        registry.broadcast_to_room("nowhere", "x").unwrap();
    }

    #[tokio::test]
    async fn displaced_cleanup_does_not_remove_successor() {
        let registry = ConnectionRegistry::new();
        let (w1, _rx1) = ClientWriter::channel();
        let (w2, _rx2) = ClientWriter::channel();
        registry.add("c-1", w1.clone()).unwrap();
        registry.add("c-1", w2.clone()).unwrap();

        // The displaced connection's exit path is a no-op...
        registry.remove_if_current("c-1", &w1);
        assert!(registry.is_connected("c-1"));

        // ...while the live connection's exit path still cleans up.
        registry.remove_if_current("c-1", &w2);
        assert!(!registry.is_connected("c-1"));
    }

    #[tokio::test]
    async fn leave_collects_empty_rooms() {
        let registry = ConnectionRegistry::new();
        let (writer, _rx) = ClientWriter::channel();
        registry.add("c-1", writer).unwrap();
        registry.join("c-1", "lobby").unwrap();

        registry.leave("c-1", "lobby");
        registry.leave("c-1", "lobby");
        assert!(registry.room_members("lobby").is_empty());
    }
}
