//! Session-cookie authentication (SPEC_FULL.md §4.10), grounded on
//! `auth/sessions.rs` and `auth/mod.rs`'s `session_auth_middleware`, slimmed
//! to the single principal kind this service has: there is no admin role,
//! no OIDC, and no bearer-token API surface to sit alongside it — the portal
//! user is the only caller, so the bootstrap/OIDC/tokens machinery those
//! files carried is dropped rather than generalized.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::AppState;

const SESSION_COOKIE_NAME: &str = "booking_session";
const SESSION_TTL_HOURS: i64 = 24 * 30;

pub fn generate_session_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

fn hash_session(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Creates a new session for `user_id`, returning the plaintext token to be
/// set as the session cookie. Only the hash is persisted.
pub async fn create_session(pool: &SqlitePool, user_id: &str) -> Result<String> {
    let token = generate_session_token();
    let token_hash = hash_session(&token);
    let id = uuid::Uuid::new_v4().to_string();

    sqlx::query(
        "INSERT INTO sessions (id, user_id, token_hash, expires_at) \
         VALUES (?, ?, ?, datetime('now', '+' || ? || ' hours'))",
    )
    .bind(&id)
    .bind(user_id)
    .bind(&token_hash)
    .bind(SESSION_TTL_HOURS)
    .execute(pool)
    .await
    .context("failed to create session")?;

    Ok(token)
}

/// The authenticated principal, populated from a JOIN of sessions + users
/// and inserted as a request extension by [`session_auth_middleware`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionUser {
    #[allow(dead_code)]
    pub session_id: String,
    pub user_id: String,
    pub email: String,
}

pub async fn validate_session(pool: &SqlitePool, token: &str) -> Result<SessionUser> {
    let token_hash = hash_session(token);

    let row = sqlx::query_as::<_, SessionUser>(
        "SELECT s.id as session_id, s.user_id, u.email FROM sessions s \
         JOIN users u ON u.id = s.user_id \
         WHERE s.token_hash = ? AND s.expires_at > datetime('now')",
    )
    .bind(&token_hash)
    .fetch_optional(pool)
    .await
    .context("failed to query session")?;

    match row {
        Some(r) => Ok(r),
        None => bail!("invalid or expired session"),
    }
}

pub async fn delete_session(pool: &SqlitePool, token: &str) -> Result<()> {
    let token_hash = hash_session(token);
    sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
        .bind(&token_hash)
        .execute(pool)
        .await
        .context("failed to delete session")?;
    Ok(())
}

pub async fn cleanup_expired(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < datetime('now')")
        .execute(pool)
        .await
        .context("failed to clean up sessions")?;
    Ok(result.rows_affected())
}

pub fn cookie_name() -> &'static str {
    SESSION_COOKIE_NAME
}

pub fn build_cookie(token: &str, max_age: i64, secure: bool) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}{secure_flag}"
    )
}

pub fn clear_cookie(secure: bool) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0{secure_flag}")
}

/// Request-extension payload for handlers behind [`session_auth_middleware`].
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub user_id: String,
    pub email: String,
}

/// Middleware: requires a valid session cookie on `/api/*` routes, 401 JSON
/// otherwise. There is one principal kind, so this has no bootstrap/Basic-auth
/// fallback and no admin flag to carry.
pub async fn session_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    let cookie_header = req
        .headers()
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let session_token = cookie_header
        .split(';')
        .filter_map(|c| c.trim().strip_prefix(&format!("{}=", cookie_name())))
        .next();

    let Some(session_token) = session_token else {
        return Err(unauthorized());
    };

    let session_user = validate_session(&state.db.pool, session_token)
        .await
        .map_err(|_| unauthorized())?;

    req.extensions_mut().insert(SessionAuth {
        user_id: session_user.user_id,
        email: session_user.email,
    });

    Ok(next.run(req).await)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "Authentication required" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn session_round_trips_through_create_and_validate() {
        let db = Database::test_db().await;
        sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
            .execute(&db.pool)
            .await
            .unwrap();

        let token = create_session(&db.pool, "u1").await.unwrap();
        let session = validate_session(&db.pool, &token).await.unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.email, "u1@example.com");
    }

    #[tokio::test]
    async fn deleted_session_no_longer_validates() {
        let db = Database::test_db().await;
        sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
            .execute(&db.pool)
            .await
            .unwrap();

        let token = create_session(&db.pool, "u1").await.unwrap();
        delete_session(&db.pool, &token).await.unwrap();
        assert!(validate_session(&db.pool, &token).await.is_err());
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let db = Database::test_db().await;
        assert!(validate_session(&db.pool, "not-a-real-token").await.is_err());
    }

    #[test]
    fn build_cookie_sets_secure_flag_only_when_requested() {
        assert!(build_cookie("tok", 60, true).contains("; Secure"));
        assert!(!build_cookie("tok", 60, false).contains("; Secure"));
    }
}
