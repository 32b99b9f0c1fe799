use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agora_db::Database;
use agora_types::api::Claims;
use agora_types::events::{ClientCommand, ServerEvent};
use agora_types::models::{Identity, Message};

use crate::error::CommandError;
use crate::registry::{ConnectionId, Registry, RoomId};

/// The handshake must complete within this window; a connection that never
/// authenticates is forcibly closed.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// WebSocket close code for a failed or missing credential.
const CLOSE_AUTH_FAILURE: u16 = 4401;

/// Message content bounds, matching the platform's validation rules.
const MAX_MESSAGE_CHARS: usize = 5000;

/// Shared state of the message gateway. One instance per process,
/// dependency-injected into every connection task.
pub struct MessageGateway {
    pub db: Arc<Database>,
    pub registry: Registry,
    pub jwt_secret: String,
    /// Per-conversation send serialization: persistence and broadcast happen
    /// under this lock so fan-out order always matches persisted order.
    send_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MessageGateway {
    pub fn new(db: Arc<Database>, registry: Registry, jwt_secret: String) -> Self {
        Self {
            db,
            registry,
            jwt_secret,
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn conversation_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.send_locks.lock().await;
        locks.entry(conversation_id).or_default().clone()
    }
}

/// Decode and validate an opaque credential. This is the identity-verifier
/// boundary: beyond this point the identity is trusted for the connection's
/// lifetime.
pub fn verify_credential(jwt_secret: &str, token: &str) -> Option<Identity> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    Some(Identity {
        id: token_data.claims.sub,
        role: token_data.claims.role,
    })
}

/// Handle a single WebSocket connection on the message gateway.
///
/// State machine: Connecting -> Authenticated -> Closed. The first frame must
/// be an `identify` command carrying the credential; anything else closes the
/// socket before any command is processed.
pub async fn handle_connection(socket: WebSocket, gateway: Arc<MessageGateway>) {
    let (mut sender, mut receiver) = socket.split();

    let identity = match wait_for_identify(&mut receiver, &gateway.jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            let _ = sender
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CLOSE_AUTH_FAILURE,
                    reason: "authentication failed".into(),
                })))
                .await;
            return;
        }
    };

    info!("{} connected to message gateway", identity.id);

    let (tx, mut user_rx) = tokio::sync::mpsc::unbounded_channel();
    let conn_id = gateway.registry.register(identity.id, tx).await;

    let ready = ServerEvent::Ready { user_id: identity.id };
    if sender
        .send(WsMessage::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        gateway.registry.deregister(conn_id).await;
        return;
    }

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward registry events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let gateway_recv = gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&gateway_recv, conn_id, identity, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            identity.id,
                            e,
                            &text[..text.len().min(200)]
                        );
                        gateway_recv
                            .registry
                            .send_to(
                                conn_id,
                                ServerEvent::Error {
                                    message: "malformed command".into(),
                                },
                            )
                            .await;
                    }
                },
                WsMessage::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Deregistration happens before this handler returns, so a dead
    // connection can no longer be targeted by a broadcast.
    gateway.registry.deregister(conn_id).await;
    info!("{} disconnected from message gateway", identity.id);
}

/// Wait for the credential that is part of the handshake. The first text
/// frame must be `identify`; a missing, malformed, or rejected credential
/// fails the handshake. Pings and pongs are allowed through.
pub(crate) async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<Identity> {
    let result = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    return match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(ClientCommand::Identify { token }) => {
                            verify_credential(jwt_secret, &token)
                        }
                        _ => None,
                    };
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                _ => return None,
            }
        }
        None
    });

    result.await.ok().flatten()
}

pub(crate) async fn handle_command(
    gateway: &Arc<MessageGateway>,
    conn_id: ConnectionId,
    identity: Identity,
    cmd: ClientCommand,
) {
    let result = match cmd {
        ClientCommand::Identify { .. } => Ok(()), // Already handled

        ClientCommand::JoinAll => join_all(gateway, conn_id, identity).await,

        ClientCommand::JoinOne { conversation_id } => {
            // No membership check at subscribe time: the registry only ever
            // delivers to subscribed connections, and membership is enforced
            // at the data layer on send and history fetch.
            gateway
                .registry
                .subscribe(conn_id, RoomId::Conversation(conversation_id))
                .await;
            Ok(())
        }

        ClientCommand::Send {
            conversation_id,
            content,
        } => send_message(gateway, identity.id, conversation_id, content)
            .await
            .map(|_| ()),

        ClientCommand::MarkRead { conversation_id } => {
            mark_read(gateway, conn_id, identity.id, conversation_id).await
        }
    };

    if let Err(e) = result {
        if let CommandError::Store(ref source) = e {
            warn!("{} command failed against store: {:#}", identity.id, source);
        }
        gateway
            .registry
            .send_to(
                conn_id,
                ServerEvent::Error {
                    message: e.user_message(),
                },
            )
            .await;
    }
}

/// Subscribe the connection to the room of every conversation the identity
/// participates in. Issued once at connect time so the client need not
/// enumerate its conversations.
async fn join_all(
    gateway: &Arc<MessageGateway>,
    conn_id: ConnectionId,
    identity: Identity,
) -> Result<(), CommandError> {
    let db = gateway.db.clone();
    let uid = identity.id.to_string();
    let ids = run_blocking(move || db.conversation_ids_for_user(&uid)).await?;

    debug!("{} joining {} conversation rooms", identity.id, ids.len());
    for id in ids {
        let Ok(conversation_id) = id.parse::<Uuid>() else {
            warn!("Corrupt conversation id '{}' for user {}", id, identity.id);
            continue;
        };
        gateway
            .registry
            .subscribe(conn_id, RoomId::Conversation(conversation_id))
            .await;
    }
    Ok(())
}

/// Validate, persist, and fan out one message. Persist-before-broadcast,
/// serialized per conversation: a message is never announced unless it is
/// already durable, and fan-out order matches persisted order.
pub(crate) async fn send_message(
    gateway: &Arc<MessageGateway>,
    sender_id: Uuid,
    conversation_id: Uuid,
    content: String,
) -> Result<Message, CommandError> {
    if content.is_empty() {
        return Err(CommandError::Validation("message must not be empty".into()));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(CommandError::Validation(format!(
            "message must not exceed {} characters",
            MAX_MESSAGE_CHARS
        )));
    }

    let lock = gateway.conversation_lock(conversation_id).await;
    let _guard = lock.lock().await;

    let db = gateway.db.clone();
    let cid = conversation_id.to_string();
    let conversation = run_blocking(move || db.get_conversation(&cid)).await?;
    if conversation.is_none() {
        return Err(CommandError::NotFound);
    }

    let db = gateway.db.clone();
    let cid = conversation_id.to_string();
    let uid = sender_id.to_string();
    if !run_blocking(move || db.is_participant(&cid, &uid)).await? {
        return Err(CommandError::Forbidden);
    }

    let message = Message {
        id: Uuid::new_v4(),
        conversation_id,
        sender_id,
        content,
        created_at: Utc::now(),
    };

    let db = gateway.db.clone();
    let row = message.clone();
    run_blocking(move || {
        let ts = agora_db::format_ts(row.created_at);
        db.append_message(
            &row.id.to_string(),
            &row.conversation_id.to_string(),
            &row.sender_id.to_string(),
            &row.content,
            &ts,
        )?;
        db.touch_updated_at(&row.conversation_id.to_string(), &ts)
    })
    .await?;

    gateway
        .registry
        .broadcast(
            RoomId::Conversation(conversation_id),
            ServerEvent::NewMessage {
                message: message.clone(),
            },
        )
        .await;

    Ok(message)
}

/// Move the caller's last-read marker and tell the other participants.
/// The receipt is not echoed back to the marking connection.
async fn mark_read(
    gateway: &Arc<MessageGateway>,
    conn_id: ConnectionId,
    user_id: Uuid,
    conversation_id: Uuid,
) -> Result<(), CommandError> {
    let db = gateway.db.clone();
    let cid = conversation_id.to_string();
    let uid = user_id.to_string();
    let changed = run_blocking(move || {
        let ts = agora_db::format_ts(Utc::now());
        db.set_last_read(&cid, &uid, &ts)
    })
    .await?;

    // Zero rows means the caller is not a participant; nothing to announce.
    if changed > 0 {
        gateway
            .registry
            .broadcast_except(
                RoomId::Conversation(conversation_id),
                conn_id,
                ServerEvent::MessageRead {
                    conversation_id,
                    user_id,
                },
            )
            .await;
    }
    Ok(())
}

/// Run a blocking store call off the async runtime, folding both the join
/// error and the store error into the command taxonomy.
async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> Result<T, CommandError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CommandError::Store(anyhow::anyhow!("spawn_blocking join error: {}", e)))?
        .map_err(CommandError::Store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::models::Role;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn test_gateway() -> Arc<MessageGateway> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        Arc::new(MessageGateway::new(db, Registry::new(), "test-secret".into()))
    }

    fn seed_user(gateway: &MessageGateway, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        gateway
            .db
            .create_user(
                &id.to_string(),
                username,
                "hash",
                "USER",
                &agora_db::format_ts(Utc::now()),
            )
            .unwrap();
        id
    }

    fn seed_conversation(gateway: &MessageGateway, kind: &str, participants: &[Uuid]) -> Uuid {
        let id = Uuid::new_v4();
        let ids: Vec<String> = participants.iter().map(|p| p.to_string()).collect();
        gateway
            .db
            .create_conversation(&id.to_string(), kind, &ids, &agora_db::format_ts(Utc::now()))
            .unwrap();
        id
    }

    async fn connect(
        gateway: &Arc<MessageGateway>,
        user_id: Uuid,
    ) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = gateway.registry.register(user_id, tx).await;
        (conn, rx)
    }

    fn identity(id: Uuid) -> Identity {
        Identity { id, role: Role::User }
    }

    #[tokio::test]
    async fn send_persists_then_broadcasts_in_order() {
        let gateway = test_gateway();
        let alice = seed_user(&gateway, "alice");
        let bob = seed_user(&gateway, "bob");
        let conv = seed_conversation(&gateway, "DIRECT", &[alice, bob]);

        let (bob_conn, mut bob_rx) = connect(&gateway, bob).await;
        gateway
            .registry
            .subscribe(bob_conn, RoomId::Conversation(conv))
            .await;

        let first = send_message(&gateway, alice, conv, "first".into()).await.unwrap();
        let second = send_message(&gateway, bob, conv, "second".into()).await.unwrap();

        // Both persisted, and observed in persistence order.
        assert!(gateway.db.get_message(&first.id.to_string()).unwrap().is_some());
        assert!(gateway.db.get_message(&second.id.to_string()).unwrap().is_some());

        match bob_rx.try_recv().unwrap() {
            ServerEvent::NewMessage { message } => assert_eq!(message.id, first.id),
            other => panic!("unexpected event: {:?}", other),
        }
        match bob_rx.try_recv().unwrap() {
            ServerEvent::NewMessage { message } => assert_eq!(message.id, second.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_from_non_participant_is_private_error() {
        let gateway = test_gateway();
        let alice = seed_user(&gateway, "alice");
        let bob = seed_user(&gateway, "bob");
        let mallory = seed_user(&gateway, "mallory");
        let conv = seed_conversation(&gateway, "DIRECT", &[alice, bob]);

        let (bob_conn, mut bob_rx) = connect(&gateway, bob).await;
        gateway
            .registry
            .subscribe(bob_conn, RoomId::Conversation(conv))
            .await;
        let (mallory_conn, mut mallory_rx) = connect(&gateway, mallory).await;

        handle_command(
            &gateway,
            mallory_conn,
            identity(mallory),
            ClientCommand::Send {
                conversation_id: conv,
                content: "hi".into(),
            },
        )
        .await;

        // Sender sees a private error; the room sees nothing.
        assert!(matches!(
            mallory_rx.try_recv().unwrap(),
            ServerEvent::Error { .. }
        ));
        assert!(bob_rx.try_recv().is_err());
        assert!(gateway.db.latest_message(&conv.to_string()).unwrap().is_none());
    }

    #[tokio::test]
    async fn send_into_missing_conversation_reports_not_found() {
        let gateway = test_gateway();
        let alice = seed_user(&gateway, "alice");
        let (conn, mut rx) = connect(&gateway, alice).await;

        handle_command(
            &gateway,
            conn,
            identity(alice),
            ClientCommand::Send {
                conversation_id: Uuid::new_v4(),
                content: "into the void".into(),
            },
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerEvent::Error { message } => assert_eq!(message, "conversation not found"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let gateway = test_gateway();
        let alice = seed_user(&gateway, "alice");
        let bob = seed_user(&gateway, "bob");
        let conv = seed_conversation(&gateway, "DIRECT", &[alice, bob]);

        let err = send_message(&gateway, alice, conv, "".into()).await.unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[tokio::test]
    async fn join_all_scopes_delivery_to_own_conversations() {
        let gateway = test_gateway();
        let alice = seed_user(&gateway, "alice");
        let bob = seed_user(&gateway, "bob");
        let carol = seed_user(&gateway, "carol");
        let c1 = seed_conversation(&gateway, "DIRECT", &[alice, bob]);
        let _c2 = seed_conversation(&gateway, "DIRECT", &[bob, carol]);

        // Bob joins all his rooms; Carol joins hers.
        let (bob_conn, mut bob_rx) = connect(&gateway, bob).await;
        handle_command(&gateway, bob_conn, identity(bob), ClientCommand::JoinAll).await;
        let (carol_conn, mut carol_rx) = connect(&gateway, carol).await;
        handle_command(&gateway, carol_conn, identity(carol), ClientCommand::JoinAll).await;

        send_message(&gateway, alice, c1, "only for c1".into()).await.unwrap();

        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::NewMessage { .. }
        ));
        assert!(carol_rx.try_recv().is_err(), "event leaked into an unrelated room");
    }

    #[tokio::test]
    async fn mark_read_notifies_everyone_but_the_marker() {
        let gateway = test_gateway();
        let alice = seed_user(&gateway, "alice");
        let bob = seed_user(&gateway, "bob");
        let conv = seed_conversation(&gateway, "DIRECT", &[alice, bob]);

        let (alice_conn, mut alice_rx) = connect(&gateway, alice).await;
        let (bob_conn, mut bob_rx) = connect(&gateway, bob).await;
        gateway.registry.subscribe(alice_conn, RoomId::Conversation(conv)).await;
        gateway.registry.subscribe(bob_conn, RoomId::Conversation(conv)).await;

        handle_command(
            &gateway,
            alice_conn,
            identity(alice),
            ClientCommand::MarkRead { conversation_id: conv },
        )
        .await;

        match bob_rx.try_recv().unwrap() {
            ServerEvent::MessageRead { user_id, .. } => assert_eq!(user_id, alice),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(alice_rx.try_recv().is_err(), "read receipt echoed to its sender");
    }

    #[tokio::test]
    async fn mark_read_from_outsider_is_silent() {
        let gateway = test_gateway();
        let alice = seed_user(&gateway, "alice");
        let bob = seed_user(&gateway, "bob");
        let mallory = seed_user(&gateway, "mallory");
        let conv = seed_conversation(&gateway, "DIRECT", &[alice, bob]);

        let (bob_conn, mut bob_rx) = connect(&gateway, bob).await;
        gateway.registry.subscribe(bob_conn, RoomId::Conversation(conv)).await;
        let (mallory_conn, _mallory_rx) = connect(&gateway, mallory).await;

        handle_command(
            &gateway,
            mallory_conn,
            identity(mallory),
            ClientCommand::MarkRead { conversation_id: conv },
        )
        .await;

        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn credential_verification_rejects_garbage() {
        assert!(verify_credential("secret", "not-a-token").is_none());
    }
}
