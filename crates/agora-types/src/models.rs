use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform role carried in the access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Moderator => "MODERATOR",
            Role::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "USER" => Some(Role::User),
            "MODERATOR" => Some(Role::Moderator),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Verified identity of a connection or request.
/// Established once at handshake and immutable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "DIRECT",
            ConversationKind::Group => "GROUP",
        }
    }

    pub fn parse(s: &str) -> Option<ConversationKind> {
        match s {
            "DIRECT" => Some(ConversationKind::Direct),
            "GROUP" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    ProjectStar,
    ProjectComment,
    ForumReply,
    Message,
    CourseEnrollment,
    TeamInvite,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ProjectStar => "PROJECT_STAR",
            NotificationKind::ProjectComment => "PROJECT_COMMENT",
            NotificationKind::ForumReply => "FORUM_REPLY",
            NotificationKind::Message => "MESSAGE",
            NotificationKind::CourseEnrollment => "COURSE_ENROLLMENT",
            NotificationKind::TeamInvite => "TEAM_INVITE",
            NotificationKind::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<NotificationKind> {
        match s {
            "PROJECT_STAR" => Some(NotificationKind::ProjectStar),
            "PROJECT_COMMENT" => Some(NotificationKind::ProjectComment),
            "FORUM_REPLY" => Some(NotificationKind::ForumReply),
            "MESSAGE" => Some(NotificationKind::Message),
            "COURSE_ENROLLMENT" => Some(NotificationKind::CourseEnrollment),
            "TEAM_INVITE" => Some(NotificationKind::TeamInvite),
            "SYSTEM" => Some(NotificationKind::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
