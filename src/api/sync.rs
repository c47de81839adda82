//! `POST /api/wodbuster/sync` (spec.md §6), invoking the observed-booking
//! synchronizer (§4.8) for the session user.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use super::error::internal_error;
use crate::auth::SessionAuth;
use crate::db::models::User;
use crate::portal::PortalClient;
use crate::sync::sync_week;
use crate::AppState;

#[derive(Deserialize, Default)]
pub struct SyncRequest {
    /// Box URL to sync. Resolved from the portal when omitted (a user with
    /// access to exactly one box, per `PortalClient::get_box_url`).
    pub box_url: Option<String>,
}

pub async fn sync_now(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
    body: Option<Json<SyncRequest>>,
) -> impl IntoResponse {
    let user: Option<User> = match sqlx::query_as(
        "SELECT id, email, cookie, force_login, athlete_id, mail_success, mail_failure, \
         push_success, push_failure, push_remind_60, push_remind_30, push_remind_15, \
         push_enabled, created_at FROM users WHERE id = ?",
    )
    .bind(&auth.user_id)
    .fetch_optional(&state.db.pool)
    .await
    {
        Ok(user) => user,
        Err(e) => return internal_error("sync_load_user", e),
    };

    let Some(user) = user else {
        return internal_error("sync_load_user", "session user vanished");
    };

    let portal = PortalClient::new(user.email.clone(), None, user.cookie.clone());

    let box_url = match body.and_then(|Json(b)| b.box_url) {
        Some(url) => url,
        None => match portal.get_box_url().await {
            Ok(url) => url,
            Err(e) => {
                return Json(serde_json::json!({ "new": 0, "updated": 0, "cancelled": 0, "errors": [e.to_string()] }))
                    .into_response()
            }
        },
    };

    let report = sync_week(&state.db.pool, &portal, state.clock.as_ref(), &user.id, &box_url).await;
    Json(report).into_response()
}
