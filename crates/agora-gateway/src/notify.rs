use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use agora_db::Database;
use agora_types::events::ServerEvent;
use agora_types::models::{Notification, NotificationKind};

use crate::connection::wait_for_identify;
use crate::registry::{Registry, RoomId};

const CLOSE_AUTH_FAILURE: u16 = 4401;

/// Handle a single WebSocket connection on the notification gateway.
///
/// Much simpler than the message gateway: after the handshake the connection
/// is auto-subscribed to exactly one room (its own inbox) and accepts no
/// further commands. The single task selects between pushed events and the
/// socket so a disconnect is noticed while idle.
pub async fn handle_connection(socket: WebSocket, registry: Registry, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let identity = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("Notification client failed to identify, closing");
            let _ = sender
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CLOSE_AUTH_FAILURE,
                    reason: "authentication failed".into(),
                })))
                .await;
            return;
        }
    };

    info!("{} connected to notification gateway", identity.id);

    let (tx, mut inbox_rx) = tokio::sync::mpsc::unbounded_channel();
    let conn_id = registry.register(identity.id, tx).await;
    registry.subscribe(conn_id, RoomId::Inbox(identity.id)).await;

    let ready = ServerEvent::Ready { user_id: identity.id };
    if sender
        .send(WsMessage::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                event = inbox_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                msg = receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        // No inbound commands on this gateway.
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    registry.deregister(conn_id).await;
    info!("{} disconnected from notification gateway", identity.id);
}

/// Producer-side capability for the rest of the system: persist a
/// notification and, if the recipient has a live connection, push it to
/// their inbox room immediately. The push is purely a delivery optimization
/// layered on top of the store, which is always written.
#[derive(Clone)]
pub struct Notifier {
    db: Arc<Database>,
    registry: Registry,
}

impl Notifier {
    pub fn new(db: Arc<Database>, registry: Registry) -> Self {
        Self { db, registry }
    }

    pub async fn notify(
        &self,
        recipient_id: Uuid,
        kind: NotificationKind,
        title: &str,
        body: &str,
        link: Option<String>,
    ) -> anyhow::Result<Notification> {
        let notification = Notification {
            id: Uuid::new_v4(),
            recipient_id,
            kind,
            title: title.to_string(),
            body: body.to_string(),
            link,
            is_read: false,
            created_at: Utc::now(),
        };

        let db = self.db.clone();
        let row = notification.clone();
        tokio::task::spawn_blocking(move || {
            db.create_notification(
                &row.id.to_string(),
                &row.recipient_id.to_string(),
                row.kind.as_str(),
                &row.title,
                &row.body,
                row.link.as_deref(),
                &agora_db::format_ts(row.created_at),
            )
        })
        .await??;

        self.push(recipient_id, &notification).await;
        Ok(notification)
    }

    pub async fn push(&self, user_id: Uuid, notification: &Notification) {
        if self.registry.connections_for(user_id).await.is_empty() {
            return;
        }
        self.registry
            .broadcast(
                RoomId::Inbox(user_id),
                ServerEvent::Notification {
                    notification: notification.clone(),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn notifier() -> Notifier {
        let db = Arc::new(Database::open_in_memory().unwrap());
        Notifier::new(db, Registry::new())
    }

    fn seed_user(n: &Notifier, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        n.db.create_user(
            &id.to_string(),
            username,
            "hash",
            "USER",
            &agora_db::format_ts(Utc::now()),
        )
        .unwrap();
        id
    }

    #[tokio::test]
    async fn notify_persists_even_with_nobody_connected() {
        let n = notifier();
        let alice = seed_user(&n, "alice");

        let created = n
            .notify(alice, NotificationKind::ForumReply, "Reply", "someone replied", None)
            .await
            .unwrap();

        let stored = n.db.get_notification(&created.id.to_string()).unwrap().unwrap();
        assert_eq!(stored.kind, "FORUM_REPLY");
        assert!(!stored.is_read);
    }

    #[tokio::test]
    async fn notify_pushes_to_live_inbox_connections() {
        let n = notifier();
        let alice = seed_user(&n, "alice");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = n.registry.register(alice, tx).await;
        n.registry.subscribe(conn, RoomId::Inbox(alice)).await;

        let created = n
            .notify(alice, NotificationKind::System, "Hello", "welcome", Some("/home".into()))
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            ServerEvent::Notification { notification } => {
                assert_eq!(notification.id, created.id);
                assert_eq!(notification.link.as_deref(), Some("/home"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn notify_does_not_cross_inboxes() {
        let n = notifier();
        let alice = seed_user(&n, "alice");
        let bob = seed_user(&n, "bob");

        let (tx, mut bob_rx) = mpsc::unbounded_channel();
        let conn = n.registry.register(bob, tx).await;
        n.registry.subscribe(conn, RoomId::Inbox(bob)).await;

        n.notify(alice, NotificationKind::TeamInvite, "Invite", "join us", None)
            .await
            .unwrap();

        assert!(bob_rx.try_recv().is_err());
    }
}
