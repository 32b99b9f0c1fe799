/// Database row types; these map directly to SQLite rows.
/// Distinct from agora-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub role: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
}

pub struct NotificationRow {
    pub id: String,
    pub recipient_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

/// One conversation's read state for a given participant, joined with the
/// latest message (if any). Input to the unread accounting computation.
pub struct ConversationReadState {
    pub conversation_id: String,
    pub last_read_at: Option<String>,
    pub latest_sender_id: Option<String>,
    pub latest_sent_at: Option<String>,
}
