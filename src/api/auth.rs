//! Session issuance (spec.md §6's out-of-scope "user login forms" still
//! needs *something* behind them to call): the administrative UI collects
//! the portal email/password itself, but this core is what actually proves
//! them against the portal and mints the local session cookie the rest of
//! `/api/*` requires. Not gated by [`crate::auth::session_auth_middleware`].

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::error::internal_error;
use crate::auth;
use crate::db::models::User;
use crate::error::BookingError;
use crate::portal::PortalClient;
use crate::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// `POST /api/auth/login` — verifies `email`/`password` against the portal,
/// creates (or updates) the local `User` row, clears `force_login`, and
/// issues a session cookie.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    let existing: Option<User> = match sqlx::query_as(
        "SELECT id, email, cookie, force_login, athlete_id, mail_success, mail_failure, \
         push_success, push_failure, push_remind_60, push_remind_30, push_remind_15, \
         push_enabled, created_at FROM users WHERE email = ?",
    )
    .bind(&body.email)
    .fetch_optional(&state.db.pool)
    .await
    {
        Ok(user) => user,
        Err(e) => return internal_error("login_load_user", e),
    };

    let portal = PortalClient::new(body.email.clone(), Some(body.password.clone()), None);
    if let Err(e) = portal.login().await {
        return match e {
            BookingError::InvalidCredentials | BookingError::PasswordRequired => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid email or password" })),
            )
                .into_response(),
            other => internal_error("login_portal", other),
        };
    }

    let cookie_blob = portal.cookie_blob();

    let user_id = match existing {
        Some(user) => {
            if let Err(e) = sqlx::query(
                "UPDATE users SET cookie = ?, force_login = 0 WHERE id = ?",
            )
            .bind(&cookie_blob)
            .bind(&user.id)
            .execute(&state.db.pool)
            .await
            {
                return internal_error("login_update_user", e);
            }
            user.id
        }
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            if let Err(e) = sqlx::query("INSERT INTO users (id, email, cookie) VALUES (?, ?, ?)")
                .bind(&id)
                .bind(&body.email)
                .bind(&cookie_blob)
                .execute(&state.db.pool)
                .await
            {
                return internal_error("login_insert_user", e);
            }
            id
        }
    };

    let token = match auth::create_session(&state.db.pool, &user_id).await {
        Ok(token) => token,
        Err(e) => return internal_error("login_create_session", e),
    };

    let cookie = auth::build_cookie(&token, 60 * 60 * 24 * 30, state.config.secure_cookies);
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "userId": user_id })),
    )
        .into_response()
}

/// `POST /api/auth/logout` — deletes the session and clears the cookie.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Some(token) = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            raw.split(';')
                .filter_map(|c| c.trim().strip_prefix(&format!("{}=", auth::cookie_name())))
                .next()
                .map(str::to_string)
        })
    {
        let _ = auth::delete_session(&state.db.pool, &token).await;
    }

    let cookie = auth::clear_cookie(state.config.secure_cookies);
    (StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)]).into_response()
}
