use axum::{Extension, Json, extract::State, response::IntoResponse};

use agora_db::models::ConversationReadState;
use agora_types::api::UnreadMessagesResponse;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::middleware::Claims;
use crate::run_blocking;

/// Count conversations with unread activity for a user. Pure function over
/// already-fetched read states, no hidden I/O.
///
/// A conversation is unread iff its latest message exists, is newer than the
/// participant's last-read marker (or the marker is unset), and was not
/// authored by the user. Several unread messages in one conversation still
/// count as a single unread conversation.
pub fn unread_conversation_count(user_id: &str, states: &[ConversationReadState]) -> usize {
    states.iter().filter(|s| is_unread(user_id, s)).count()
}

fn is_unread(user_id: &str, state: &ConversationReadState) -> bool {
    let (Some(sender), Some(sent_at)) = (&state.latest_sender_id, &state.latest_sent_at) else {
        return false; // no messages yet
    };
    if sender == user_id {
        return false;
    }
    match &state.last_read_at {
        None => true,
        // Timestamps are stored as fixed-width RFC 3339 UTC, so string order
        // is chronological order.
        Some(read_at) => sent_at.as_str() > read_at.as_str(),
    }
}

pub async fn get_unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let states = run_blocking(move || db.read_states_for_user(&uid)).await?;

    let unread_count = unread_conversation_count(&claims.sub.to_string(), &states);
    Ok(Json(UnreadMessagesResponse { unread_count }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_db::{Database, format_ts};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn state(
        last_read_at: Option<&str>,
        latest: Option<(&str, &str)>,
    ) -> ConversationReadState {
        ConversationReadState {
            conversation_id: Uuid::new_v4().to_string(),
            last_read_at: last_read_at.map(str::to_string),
            latest_sender_id: latest.map(|(s, _)| s.to_string()),
            latest_sent_at: latest.map(|(_, t)| t.to_string()),
        }
    }

    #[test]
    fn empty_conversation_is_not_unread() {
        assert_eq!(unread_conversation_count("me", &[state(None, None)]), 0);
    }

    #[test]
    fn own_latest_message_is_not_unread() {
        let states = [state(None, Some(("me", "2026-08-01T10:00:00.000000+00:00")))];
        assert_eq!(unread_conversation_count("me", &states), 0);
    }

    #[test]
    fn never_read_with_foreign_message_is_unread() {
        let states = [state(None, Some(("them", "2026-08-01T10:00:00.000000+00:00")))];
        assert_eq!(unread_conversation_count("me", &states), 1);
    }

    #[test]
    fn read_marker_newer_than_latest_clears_unread() {
        let states = [state(
            Some("2026-08-01T11:00:00.000000+00:00"),
            Some(("them", "2026-08-01T10:00:00.000000+00:00")),
        )];
        assert_eq!(unread_conversation_count("me", &states), 0);
    }

    #[test]
    fn multiple_unread_messages_collapse_into_one_conversation() {
        // Only the latest message is consulted; the count is per conversation.
        let states = [state(None, Some(("them", "2026-08-01T10:00:00.000000+00:00")))];
        assert_eq!(unread_conversation_count("me", &states), 1);
    }

    /// End-to-end against the store: B messages A, A reads, B messages again.
    #[test]
    fn mark_read_then_new_message_cycle() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let a = Uuid::new_v4().to_string();
        let b = Uuid::new_v4().to_string();
        db.create_user(&a, "a", "hash", "USER", &format_ts(now)).unwrap();
        db.create_user(&b, "b", "hash", "USER", &format_ts(now)).unwrap();

        let conv = Uuid::new_v4().to_string();
        db.create_conversation(&conv, "DIRECT", &[a.clone(), b.clone()], &format_ts(now))
            .unwrap();

        // B sends at t1; A has never read.
        db.append_message(
            &Uuid::new_v4().to_string(),
            &conv,
            &b,
            "hello",
            &format_ts(now + Duration::seconds(1)),
        )
        .unwrap();
        let states = db.read_states_for_user(&a).unwrap();
        assert_eq!(unread_conversation_count(&a, &states), 1);

        // A marks read.
        db.set_last_read(&conv, &a, &format_ts(now + Duration::seconds(2))).unwrap();
        let states = db.read_states_for_user(&a).unwrap();
        assert_eq!(unread_conversation_count(&a, &states), 0);

        // B sends again at t2 > t1; unread without A doing anything.
        db.append_message(
            &Uuid::new_v4().to_string(),
            &conv,
            &b,
            "are you there?",
            &format_ts(now + Duration::seconds(3)),
        )
        .unwrap();
        let states = db.read_states_for_user(&a).unwrap();
        assert_eq!(unread_conversation_count(&a, &states), 1);

        // B's own view is never unread: B authored the latest message.
        let states = db.read_states_for_user(&b).unwrap();
        assert_eq!(unread_conversation_count(&b, &states), 0);
    }
}
