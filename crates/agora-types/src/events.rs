use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Notification};

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Authenticate the WebSocket connection. Must be the first frame.
    Identify { token: String },

    /// Subscribe to the room of every conversation the caller participates in.
    JoinAll,

    /// Subscribe to a single conversation room.
    JoinOne { conversation_id: Uuid },

    /// Persist a message and fan it out to the conversation room.
    Send { conversation_id: Uuid, content: String },

    /// Move the caller's last-read marker to now and notify other participants.
    MarkRead { conversation_id: Uuid },
}

/// Events sent FROM server TO clients over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid },

    /// A message was persisted and is being fanned out to its conversation
    NewMessage { message: Message },

    /// A participant moved their last-read marker
    MessageRead { conversation_id: Uuid, user_id: Uuid },

    /// A notification was delivered to the caller's inbox
    Notification { notification: Notification },

    /// Command failed; sent only to the originating connection
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"send","data":{"conversation_id":"00000000-0000-0000-0000-000000000001","content":"hi"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Send { content, .. } => assert_eq!(content, "hi"),
            other => panic!("unexpected command: {:?}", other),
        }

        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"join-all"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::JoinAll));
    }

    #[test]
    fn event_wire_format() {
        let event = ServerEvent::MessageRead {
            conversation_id: Uuid::nil(),
            user_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"message-read""#));
    }
}
