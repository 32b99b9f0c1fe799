use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use agora_db::models::MessageRow;
use agora_types::api::{ConversationResponse, CreateConversationRequest, UpdateMessageRequest};
use agora_types::models::{ConversationKind, Message};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::middleware::Claims;
use crate::run_blocking;

const MAX_MESSAGE_CHARS: usize = 5000;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination: pass the `created_at` timestamp of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<String>,
}

fn default_limit() -> u32 {
    50
}

/// Create a conversation. Direct creation is idempotent: re-requesting a
/// direct conversation with the same peer returns the existing one, as long
/// as it still has exactly two participants.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let creator = claims.sub;

    let participant_ids: Vec<Uuid> = match req.kind {
        ConversationKind::Direct => {
            let peer = req.user_id.ok_or_else(|| {
                ApiError::Validation("direct conversation requires user_id".into())
            })?;
            if peer == creator {
                return Err(ApiError::Validation(
                    "direct conversation requires two distinct users".into(),
                ));
            }

            let db = state.db.clone();
            let a = creator.to_string();
            let b = peer.to_string();
            if let Some(existing) = run_blocking(move || db.find_direct_between(&a, &b)).await? {
                let response = conversation_response(&state, existing).await?;
                return Ok((StatusCode::OK, Json(response)));
            }

            vec![creator, peer]
        }
        ConversationKind::Group => {
            let mut ids = vec![creator];
            for id in req.participant_ids {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            ids
        }
    };

    let conversation_id = Uuid::new_v4();
    let db = state.db.clone();
    let kind = req.kind;
    let ids: Vec<String> = participant_ids.iter().map(|id| id.to_string()).collect();
    let row = run_blocking(move || {
        let now = agora_db::format_ts(Utc::now());
        db.create_conversation(&conversation_id.to_string(), kind.as_str(), &ids, &now)?;
        db.get_conversation(&conversation_id.to_string())?
            .ok_or_else(|| anyhow::anyhow!("conversation vanished after insert"))
    })
    .await?;

    let response = conversation_response(&state, row).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// All conversations the caller participates in, most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let rows = run_blocking(move || db.list_for_user(&uid)).await?;

    let mut conversations = Vec::with_capacity(rows.len());
    for row in rows {
        conversations.push(conversation_response(&state, row).await?);
    }
    Ok(Json(conversations))
}

/// One page of history, oldest-first. Fetching history also moves the
/// caller's last-read marker, like reading the conversation in the client.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.min(200);
    let before = query.before;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    if run_blocking(move || db.get_conversation(&cid)).await?.is_none() {
        return Err(ApiError::NotFound("conversation"));
    }

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    if !run_blocking(move || db.is_participant(&cid, &uid)).await? {
        return Err(ApiError::Forbidden);
    }

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    let rows = run_blocking(move || {
        let rows = db.get_messages(&cid, limit, before.as_deref())?;
        db.set_last_read(&cid, &uid, &agora_db::format_ts(Utc::now()))?;
        Ok(rows)
    })
    .await?;

    let mut messages = rows
        .into_iter()
        .map(message_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;
    messages.reverse(); // chronological order
    Ok(Json(messages))
}

/// Edit a message. Only its author may do so.
pub async fn update_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.content.is_empty() {
        return Err(ApiError::Validation("message must not be empty".into()));
    }
    if req.content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::Validation(format!(
            "message must not exceed {} characters",
            MAX_MESSAGE_CHARS
        )));
    }

    let db = state.db.clone();
    let mid = message_id.to_string();
    let row = run_blocking(move || db.get_message(&mid))
        .await?
        .ok_or(ApiError::NotFound("message"))?;
    if row.sender_id != claims.sub.to_string() {
        return Err(ApiError::Forbidden);
    }

    let db = state.db.clone();
    let mid = message_id.to_string();
    let content = req.content;
    let updated = run_blocking(move || {
        db.update_message(&mid, &content)?;
        db.get_message(&mid)?
            .ok_or_else(|| anyhow::anyhow!("message vanished after update"))
    })
    .await?;

    Ok(Json(message_from_row(updated)?))
}

/// Delete a message. Only its author may do so.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let mid = message_id.to_string();
    let row = run_blocking(move || db.get_message(&mid))
        .await?
        .ok_or(ApiError::NotFound("message"))?;
    if row.sender_id != claims.sub.to_string() {
        return Err(ApiError::Forbidden);
    }

    let db = state.db.clone();
    let mid = message_id.to_string();
    run_blocking(move || db.delete_message(&mid)).await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn conversation_response(
    state: &AppState,
    row: agora_db::models::ConversationRow,
) -> Result<ConversationResponse, ApiError> {
    let kind = ConversationKind::parse(&row.kind)
        .ok_or_else(|| anyhow::anyhow!("corrupt conversation kind '{}'", row.kind))?;
    let id: Uuid = row
        .id
        .parse()
        .map_err(|e| anyhow::anyhow!("corrupt conversation id '{}': {}", row.id, e))?;
    let updated_at = agora_db::parse_ts(&row.updated_at)?;

    let db = state.db.clone();
    let cid = row.id.clone();
    let (participant_rows, latest) =
        run_blocking(move || Ok((db.participant_ids(&cid)?, db.latest_message(&cid)?))).await?;

    let participant_ids = participant_rows
        .iter()
        .map(|p| {
            p.parse()
                .map_err(|e| anyhow::anyhow!("corrupt participant id '{}': {}", p, e))
        })
        .collect::<anyhow::Result<Vec<Uuid>>>()?;
    let last_message = latest.map(message_from_row).transpose()?;

    Ok(ConversationResponse {
        id,
        kind,
        participant_ids,
        last_message,
        updated_at,
    })
}

pub(crate) fn message_from_row(row: MessageRow) -> anyhow::Result<Message> {
    Ok(Message {
        id: row
            .id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt message id '{}': {}", row.id, e))?,
        conversation_id: row
            .conversation_id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt conversation id '{}': {}", row.conversation_id, e))?,
        sender_id: row
            .sender_id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt sender id '{}': {}", row.sender_id, e))?,
        content: row.content,
        created_at: agora_db::parse_ts(&row.created_at)?,
    })
}
