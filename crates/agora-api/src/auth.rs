use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use agora_db::Database;
use agora_gateway::notify::Notifier;
use agora_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use agora_types::models::Role;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub notifier: Notifier,
    pub jwt_secret: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::Validation(
            "username must be 3-32 characters".into(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation(
            "password must be at least 8 characters".into(),
        ));
    }

    let db = state.db.clone();
    let username = req.username.clone();
    let existing = tokio::task::spawn_blocking(move || db.get_user_by_username(&username))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;
    if existing.is_some() {
        return Err(ApiError::Conflict("username"));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string();

    let user_id = Uuid::new_v4();
    let db = state.db.clone();
    let username = req.username.clone();
    tokio::task::spawn_blocking(move || {
        db.create_user(
            &user_id.to_string(),
            &username,
            &password_hash,
            Role::User.as_str(),
            &agora_db::format_ts(Utc::now()),
        )
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    let token = create_token(&state.jwt_secret, user_id, Role::User)?;

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let username = req.username.clone();
    let user = tokio::task::spawn_blocking(move || db.get_user_by_username(&username))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??
        .ok_or(ApiError::Unauthorized)?;

    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| anyhow::anyhow!("corrupt password hash: {}", e))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized)?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| anyhow::anyhow!("corrupt user id '{}': {}", user.id, e))?;
    let role = Role::parse(&user.role).unwrap_or(Role::User);

    let token = create_token(&state.jwt_secret, user_id, role)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}

pub fn create_token(secret: &str, user_id: Uuid, role: Role) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        role,
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_gateway::connection::verify_credential;

    #[test]
    fn issued_tokens_verify_at_the_gateway_boundary() {
        let user_id = Uuid::new_v4();
        let token = create_token("test-secret", user_id, Role::Moderator).unwrap();

        let identity = verify_credential("test-secret", &token).unwrap();
        assert_eq!(identity.id, user_id);
        assert_eq!(identity.role, Role::Moderator);

        assert!(verify_credential("other-secret", &token).is_none());
    }
}
