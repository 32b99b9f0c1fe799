use crate::Database;
use crate::models::{ConversationReadState, ConversationRow, MessageRow, NotificationRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str, role: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, role, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, username, password_hash, role, now),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Conversations --

    /// Insert a conversation together with its participant rows.
    pub fn create_conversation(
        &self,
        id: &str,
        kind: &str,
        participant_ids: &[String],
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, kind, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                (id, kind, now),
            )?;
            for user_id in participant_ids {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
                    (id, user_id),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Find the direct conversation between two users, if one exists with
    /// exactly those two participants. Direct conversations that have drifted
    /// to a different participant count are not reused.
    pub fn find_direct_between(&self, a: &str, b: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.created_at, c.updated_at
                 FROM conversations c
                 WHERE c.kind = 'DIRECT'
                   AND EXISTS (SELECT 1 FROM conversation_participants
                               WHERE conversation_id = c.id AND user_id = ?1)
                   AND EXISTS (SELECT 1 FROM conversation_participants
                               WHERE conversation_id = c.id AND user_id = ?2)
                   AND (SELECT COUNT(*) FROM conversation_participants
                        WHERE conversation_id = c.id) = 2
                 LIMIT 1",
            )?;

            stmt.query_row((a, b), conversation_from_row).optional()
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            conn.prepare("SELECT id, kind, created_at, updated_at FROM conversations WHERE id = ?1")?
                .query_row([id], conversation_from_row)
                .optional()
        })
    }

    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM conversation_participants WHERE user_id = ?1",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn participant_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1",
            )?;
            let ids = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversation_participants
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id),
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn touch_updated_at(&self, conversation_id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                (conversation_id, now),
            )?;
            Ok(())
        })
    }

    /// Move a participant's last-read marker. Returns the number of rows
    /// touched; 0 means the caller is not a participant.
    pub fn set_last_read(&self, conversation_id: &str, user_id: &str, now: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversation_participants SET last_read_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id, now),
            )?;
            Ok(changed)
        })
    }

    /// Per-conversation read state for a user, joined with the latest message.
    /// The unread computation itself is a pure function over these rows.
    pub fn read_states_for_user(&self, user_id: &str) -> Result<Vec<ConversationReadState>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.conversation_id, p.last_read_at, m.sender_id, m.created_at
                 FROM conversation_participants p
                 LEFT JOIN messages m ON m.id = (
                     SELECT id FROM messages
                     WHERE conversation_id = p.conversation_id
                     ORDER BY created_at DESC LIMIT 1)
                 WHERE p.user_id = ?1",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationReadState {
                        conversation_id: row.get(0)?,
                        last_read_at: row.get(1)?,
                        latest_sender_id: row.get(2)?,
                        latest_sent_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn append_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, conversation_id, sender_id, content, now),
            )?;
            Ok(())
        })
    }

    /// Newest-first page of messages. Cursor-based pagination: pass the
    /// `created_at` of the oldest message from the previous page as `before`
    /// to fetch older messages.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| match before {
            Some(cursor) => {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, sender_id, content, created_at
                     FROM messages
                     WHERE conversation_id = ?1 AND created_at < ?2
                     ORDER BY created_at DESC
                     LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map((conversation_id, cursor, limit), message_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, sender_id, content, created_at
                     FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map((conversation_id, limit), message_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            }
        })
    }

    pub fn latest_message(&self, conversation_id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT id, conversation_id, sender_id, content, created_at
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
            )?
            .query_row([conversation_id], message_from_row)
            .optional()
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT id, conversation_id, sender_id, content, created_at
                 FROM messages WHERE id = ?1",
            )?
            .query_row([id], message_from_row)
            .optional()
        })
    }

    pub fn update_message(&self, id: &str, content: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE messages SET content = ?2 WHERE id = ?1", (id, content))?;
            Ok(())
        })
    }

    pub fn delete_message(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    // -- Notifications --

    pub fn create_notification(
        &self,
        id: &str,
        recipient_id: &str,
        kind: &str,
        title: &str,
        body: &str,
        link: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, recipient_id, kind, title, body, link, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                (id, recipient_id, kind, title, body, link, now),
            )?;
            Ok(())
        })
    }

    pub fn list_notifications(&self, recipient_id: &str, limit: u32) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, recipient_id, kind, title, body, link, is_read, created_at
                 FROM notifications
                 WHERE recipient_id = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map((recipient_id, limit), notification_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_notification(&self, id: &str) -> Result<Option<NotificationRow>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT id, recipient_id, kind, title, body, link, is_read, created_at
                 FROM notifications WHERE id = ?1",
            )?
            .query_row([id], notification_from_row)
            .optional()
        })
    }

    pub fn mark_notification_read(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE notifications SET is_read = 1 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    pub fn mark_all_notifications_read(&self, recipient_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id],
            )?;
            Ok(())
        })
    }

    pub fn delete_notification(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM notifications WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    pub fn count_unread_notifications(&self, recipient_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, password, role, created_at FROM users WHERE {} = ?1",
        column
    );
    conn.prepare(&sql)?
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                role: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn notification_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        kind: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        link: row.get(5)?,
        is_read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
