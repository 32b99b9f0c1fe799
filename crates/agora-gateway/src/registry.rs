use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use agora_types::events::ServerEvent;

/// A broadcast scope: either a conversation or one user's notification inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomId {
    Conversation(Uuid),
    Inbox(Uuid),
}

/// Process-local handle for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<RoomId>,
}

struct Inner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    users: HashMap<Uuid, HashSet<ConnectionId>>,
}

/// Authoritative map of rooms to live connections, and identities to live
/// connections. The only state shared across connection tasks; every
/// operation is a single critical section under one lock.
///
/// Delivery is message-passing: each connection owns an unbounded channel and
/// `broadcast` enqueues onto it, so a slow consumer never blocks the producer
/// or its room peers. Operations on unknown connections or rooms are no-ops,
/// since a disconnect can race an in-flight broadcast.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                connections: HashMap::new(),
                rooms: HashMap::new(),
                users: HashMap::new(),
            })),
        }
    }

    /// Add a connection under its identity. Joins no rooms.
    pub async fn register(&self, user_id: Uuid, tx: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let conn_id = ConnectionId::new();
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        inner.users.entry(user_id).or_default().insert(conn_id);
        conn_id
    }

    /// Idempotent: re-subscribing an already-subscribed connection is a no-op.
    pub async fn subscribe(&self, conn_id: ConnectionId, room: RoomId) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&conn_id) else {
            return;
        };
        entry.rooms.insert(room);
        inner.rooms.entry(room).or_default().insert(conn_id);
    }

    pub async fn unsubscribe(&self, conn_id: ConnectionId, room: RoomId) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.connections.get_mut(&conn_id) {
            entry.rooms.remove(&room);
        }
        if let Some(members) = inner.rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                inner.rooms.remove(&room);
            }
        }
    }

    /// Remove the connection from every room it joined and from the identity
    /// map. Leaves no residual references.
    pub async fn deregister(&self, conn_id: ConnectionId) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.remove(&conn_id) else {
            return;
        };
        for room in &entry.rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        if let Some(conns) = inner.users.get_mut(&entry.user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                inner.users.remove(&entry.user_id);
            }
        }
    }

    /// Enqueue `event` to every connection subscribed to `room` at the moment
    /// of the call. Connections joining afterwards do not receive it.
    pub async fn broadcast(&self, room: RoomId, event: ServerEvent) {
        self.broadcast_inner(room, None, event).await;
    }

    /// Broadcast to a room, skipping one connection (read receipts are not
    /// echoed back to their sender).
    pub async fn broadcast_except(&self, room: RoomId, except: ConnectionId, event: ServerEvent) {
        self.broadcast_inner(room, Some(except), event).await;
    }

    async fn broadcast_inner(&self, room: RoomId, except: Option<ConnectionId>, event: ServerEvent) {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(&room) else {
            return;
        };
        for conn_id in members {
            if Some(*conn_id) == except {
                continue;
            }
            if let Some(entry) = inner.connections.get(conn_id) {
                // A dead receiver is cleaned up by its own disconnect path.
                let _ = entry.tx.send(event.clone());
            }
        }
    }

    /// Private event to a single connection (error reporting).
    pub async fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(entry) = inner.connections.get(&conn_id) {
            let _ = entry.tx.send(event);
        }
    }

    /// Live connections for a user. Used to decide whether a notification can
    /// be pushed immediately or only persisted.
    pub async fn connections_for(&self, user_id: Uuid) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .users
            .get(&user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn event() -> ServerEvent {
        ServerEvent::MessageRead {
            conversation_id: Uuid::nil(),
            user_id: Uuid::nil(),
        }
    }

    async fn connect(registry: &Registry) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.register(Uuid::new_v4(), tx).await;
        (conn, rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_only_room_members() {
        let registry = Registry::new();
        let room_a = RoomId::Conversation(Uuid::new_v4());
        let room_b = RoomId::Conversation(Uuid::new_v4());

        let (conn1, mut rx1) = connect(&registry).await;
        let (conn2, mut rx2) = connect(&registry).await;
        registry.subscribe(conn1, room_a).await;
        registry.subscribe(conn2, room_b).await;

        registry.broadcast(room_a, event()).await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let registry = Registry::new();
        let room = RoomId::Conversation(Uuid::new_v4());
        let (conn, mut rx) = connect(&registry).await;

        registry.subscribe(conn, room).await;
        registry.subscribe(conn, room).await;
        registry.broadcast(room, event()).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "double subscription duplicated delivery");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let registry = Registry::new();
        let room = RoomId::Conversation(Uuid::new_v4());
        let (conn, mut rx) = connect(&registry).await;

        registry.subscribe(conn, room).await;
        registry.unsubscribe(conn, room).await;
        registry.broadcast(room, event()).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deregister_removes_every_membership() {
        let registry = Registry::new();
        let user_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = registry.register(user_id, tx).await;

        let rooms: Vec<RoomId> = (0..8).map(|_| RoomId::Conversation(Uuid::new_v4())).collect();
        for room in &rooms {
            registry.subscribe(conn, *room).await;
        }
        registry.subscribe(conn, RoomId::Inbox(user_id)).await;

        registry.deregister(conn).await;

        for room in &rooms {
            registry.broadcast(*room, event()).await;
        }
        registry.broadcast(RoomId::Inbox(user_id), event()).await;
        assert!(rx.try_recv().is_err(), "deregistered connection still receives events");
        assert!(registry.connections_for(user_id).await.is_empty());

        // No residual per-room or per-user entries either.
        let inner = registry.inner.read().await;
        assert!(inner.connections.is_empty());
        assert!(inner.rooms.is_empty());
        assert!(inner.users.is_empty());
    }

    #[tokio::test]
    async fn operations_on_unknown_ids_are_noops() {
        let registry = Registry::new();
        let ghost = ConnectionId::new();
        let room = RoomId::Conversation(Uuid::new_v4());

        registry.subscribe(ghost, room).await;
        registry.unsubscribe(ghost, room).await;
        registry.deregister(ghost).await;
        registry.broadcast(room, event()).await;
        registry.send_to(ghost, event()).await;

        // Speculative subscribe of an unknown connection must not create a
        // room entry that would never be cleaned up.
        let inner = registry.inner.read().await;
        assert!(inner.rooms.is_empty());
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_sender() {
        let registry = Registry::new();
        let room = RoomId::Conversation(Uuid::new_v4());
        let (conn1, mut rx1) = connect(&registry).await;
        let (conn2, mut rx2) = connect(&registry).await;
        registry.subscribe(conn1, room).await;
        registry.subscribe(conn2, room).await;

        registry.broadcast_except(room, conn1, event()).await;

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn connections_for_tracks_multiple_connections_per_user() {
        let registry = Registry::new();
        let user_id = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let conn1 = registry.register(user_id, tx1).await;
        let _conn2 = registry.register(user_id, tx2).await;

        assert_eq!(registry.connections_for(user_id).await.len(), 2);
        registry.deregister(conn1).await;
        assert_eq!(registry.connections_for(user_id).await.len(), 1);
    }
}
