use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use agora_db::models::NotificationRow;
use agora_types::api::{
    NotificationListResponse, PushNotificationRequest, UnreadNotificationsResponse,
};
use agora_types::models::{Notification, NotificationKind, Role};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::middleware::Claims;
use crate::run_blocking;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let limit = query.limit.min(100);
    let (rows, unread_count) = run_blocking(move || {
        Ok((
            db.list_notifications(&uid, limit)?,
            db.count_unread_notifications(&uid)?,
        ))
    })
    .await?;

    let notifications = rows
        .into_iter()
        .map(notification_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Json(NotificationListResponse {
        notifications,
        unread_count,
    }))
}

pub async fn get_unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let count = run_blocking(move || db.count_unread_notifications(&uid)).await?;
    Ok(Json(UnreadNotificationsResponse { count }))
}

/// Flip one notification to read. Only its recipient may do so.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let row = fetch_owned(&state, notification_id, claims.sub).await?;

    let db = state.db.clone();
    run_blocking(move || db.mark_notification_read(&row.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    run_blocking(move || db.mark_all_notifications_read(&uid)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Delete a notification. Only its recipient may do so.
pub async fn delete_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let row = fetch_owned(&state, notification_id, claims.sub).await?;

    let db = state.db.clone();
    run_blocking(move || db.delete_notification(&row.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Producer surface for other subsystems, restricted to admins: persist a
/// notification and push it to the recipient's inbox if they are online.
pub async fn push_notification(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PushNotificationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if claims.role != Role::Admin {
        return Err(ApiError::Forbidden);
    }
    if req.title.is_empty() {
        return Err(ApiError::Validation("title must not be empty".into()));
    }

    let notification = state
        .notifier
        .notify(req.recipient_id, req.kind, &req.title, &req.body, req.link)
        .await?;

    Ok((StatusCode::CREATED, Json(notification)))
}

async fn fetch_owned(
    state: &AppState,
    notification_id: Uuid,
    user_id: Uuid,
) -> Result<NotificationRow, ApiError> {
    let db = state.db.clone();
    let nid = notification_id.to_string();
    let row = run_blocking(move || db.get_notification(&nid))
        .await?
        .ok_or(ApiError::NotFound("notification"))?;
    if row.recipient_id != user_id.to_string() {
        return Err(ApiError::Forbidden);
    }
    Ok(row)
}

fn notification_from_row(row: NotificationRow) -> anyhow::Result<Notification> {
    Ok(Notification {
        id: row
            .id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt notification id '{}': {}", row.id, e))?,
        recipient_id: row
            .recipient_id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt recipient id '{}': {}", row.recipient_id, e))?,
        kind: NotificationKind::parse(&row.kind)
            .ok_or_else(|| anyhow::anyhow!("corrupt notification kind '{}'", row.kind))?,
        title: row.title,
        body: row.body,
        link: row.link,
        is_read: row.is_read,
        created_at: agora_db::parse_ts(&row.created_at)?,
    })
}
