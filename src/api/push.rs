//! Web Push subscription endpoints (spec.md §6), grounded on
//! `api/user.rs`'s store-or-update handler style.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use super::error::internal_error;
use crate::auth::SessionAuth;
use crate::notify::push;
use crate::AppState;

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscribeKeys,
}

#[derive(Deserialize)]
pub struct SubscribeKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

/// `POST /api/push/subscribe` — store or refresh a push subscription for the
/// session user (spec.md §6).
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
    Json(body): Json<SubscribeRequest>,
) -> impl IntoResponse {
    let id = uuid::Uuid::new_v4().to_string();
    let result = sqlx::query(
        "INSERT INTO push_subscriptions (id, user_id, endpoint, p256dh, auth) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (user_id, endpoint) DO UPDATE SET p256dh = excluded.p256dh, auth = excluded.auth",
    )
    .bind(&id)
    .bind(&auth.user_id)
    .bind(&body.endpoint)
    .bind(&body.keys.p256dh)
    .bind(&body.keys.auth)
    .execute(&state.db.pool)
    .await;

    match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error("push_subscribe", e),
    }
}

/// `POST /api/push/unsubscribe` — remove a subscription by endpoint.
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
    Json(body): Json<UnsubscribeRequest>,
) -> impl IntoResponse {
    let result = sqlx::query("DELETE FROM push_subscriptions WHERE user_id = ? AND endpoint = ?")
        .bind(&auth.user_id)
        .bind(&body.endpoint)
        .execute(&state.db.pool)
        .await;

    match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error("push_unsubscribe", e),
    }
}

/// `POST /api/push/test` — send a test notification to every subscription
/// the session user has registered.
pub async fn test(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
) -> impl IntoResponse {
    let subs: Vec<crate::db::models::PushSubscription> = match sqlx::query_as(
        "SELECT id, user_id, endpoint, p256dh, auth, created_at FROM push_subscriptions WHERE user_id = ?",
    )
    .bind(&auth.user_id)
    .fetch_all(&state.db.pool)
    .await
    {
        Ok(subs) => subs,
        Err(e) => return internal_error("push_test_list", e),
    };

    let http = reqwest::Client::new();
    let mut sent = 0;
    for sub in &subs {
        let data = serde_json::json!({ "test": true });
        if push::send(&http, &state.config, sub, "WodBooker", "Notificación de prueba", data)
            .await
            .is_ok()
        {
            sent += 1;
        }
    }

    Json(serde_json::json!({ "sent": sent, "subscriptions": subs.len() })).into_response()
}
