use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationKind, Message, NotificationKind, Role};

// -- JWT Claims --

/// JWT claims shared across agora-api (REST middleware) and agora-gateway
/// (WebSocket handshake). Canonical definition lives here in agora-types
/// to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub kind: ConversationKind,
    /// Peer for a direct conversation.
    pub user_id: Option<Uuid>,
    /// Other members for a group conversation.
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub participant_ids: Vec<Uuid>,
    pub last_message: Option<Message>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct UnreadMessagesResponse {
    pub unread_count: usize,
}

// -- Notifications --

#[derive(Debug, Serialize)]
pub struct NotificationListResponse {
    pub notifications: Vec<crate::models::Notification>,
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct UnreadNotificationsResponse {
    pub count: u64,
}

/// Producer-side payload for pushing a notification into a user's inbox.
/// Accepted from other subsystems (admin surface), not from end-user clients.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushNotificationRequest {
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
}
