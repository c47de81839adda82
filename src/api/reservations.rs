//! Reservation CRUD (SPEC_FULL.md §6's "Reservation CRUD" supplement),
//! the seam the out-of-scope administrative UI calls into to drive the
//! Supervisor's create/update/delete/deactivate lifecycle hooks (§4.7).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use super::error::{internal_error, validate_len};
use crate::auth::SessionAuth;
use crate::db::models::{Reservation, ReservationRow};
use crate::events;
use crate::AppState;

const RESERVATION_COLUMNS: &str = "id, user_id, dow, local_time, url, window_open_offset_days, \
     window_open_local_time, class_kind, last_booked_date, booked_at, is_active, \
     booking_attempts, skip_current_week, created_at, updated_at";

#[derive(Deserialize)]
pub struct CreateReservation {
    pub dow: u32,
    pub local_time: String,
    pub url: String,
    pub window_open_offset_days: i64,
    pub window_open_local_time: String,
    pub class_kind: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateReservation {
    pub dow: u32,
    pub local_time: String,
    pub url: String,
    pub window_open_offset_days: i64,
    pub window_open_local_time: String,
    pub class_kind: Option<String>,
    pub is_active: bool,
}

/// `GET /api/reservations` — list the caller's reservations.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
) -> impl IntoResponse {
    let rows: Result<Vec<ReservationRow>, _> = sqlx::query_as(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE user_id = ? ORDER BY created_at"
    ))
    .bind(&auth.user_id)
    .fetch_all(&state.db.pool)
    .await;

    match rows {
        Ok(rows) => {
            let reservations: Vec<Reservation> = rows.into_iter().map(Reservation::from).collect();
            Json(serde_json::json!({ "reservations": reservations })).into_response()
        }
        Err(e) => internal_error("reservations_list", e),
    }
}

/// `POST /api/reservations` — create a reservation, triggering §4.7's
/// start-worker hook.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
    Json(body): Json<CreateReservation>,
) -> impl IntoResponse {
    if let Some(err) = validate_len("url", &body.url, super::error::MAX_URL) {
        return err;
    }
    if body.dow > 6 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "dow must be between 0 and 6" })),
        )
            .into_response();
    }

    let id = uuid::Uuid::new_v4().to_string();
    let class_kind = body.class_kind.as_deref().unwrap_or("regular");
    let result = sqlx::query(
        "INSERT INTO reservations \
         (id, user_id, dow, local_time, url, window_open_offset_days, window_open_local_time, class_kind) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&auth.user_id)
    .bind(body.dow)
    .bind(&body.local_time)
    .bind(&body.url)
    .bind(body.window_open_offset_days)
    .bind(&body.window_open_local_time)
    .bind(class_kind)
    .execute(&state.db.pool)
    .await;

    match result {
        Ok(_) => {
            state.supervisor.start(&id).await;
            (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response()
        }
        Err(e) => internal_error("reservations_create", e),
    }
}

/// `PUT /api/reservations/:id` — update a reservation, triggering §4.7's
/// restart hook.
pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
    Path(id): Path<String>,
    Json(body): Json<UpdateReservation>,
) -> impl IntoResponse {
    if body.dow > 6 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "dow must be between 0 and 6" })),
        )
            .into_response();
    }

    let class_kind = body.class_kind.as_deref().unwrap_or("regular");
    let result = sqlx::query(
        "UPDATE reservations SET dow = ?, local_time = ?, url = ?, window_open_offset_days = ?, \
         window_open_local_time = ?, class_kind = ?, is_active = ?, updated_at = datetime('now') \
         WHERE id = ? AND user_id = ?",
    )
    .bind(body.dow)
    .bind(&body.local_time)
    .bind(&body.url)
    .bind(body.window_open_offset_days)
    .bind(&body.window_open_local_time)
    .bind(class_kind)
    .bind(body.is_active)
    .bind(&id)
    .bind(&auth.user_id)
    .execute(&state.db.pool)
    .await;

    match result {
        Ok(r) if r.rows_affected() == 0 => StatusCode::NOT_FOUND.into_response(),
        Ok(_) => {
            state.supervisor.restart(&id).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => internal_error("reservations_update", e),
    }
}

/// `DELETE /api/reservations/:id` — delete, triggering §4.7's stop + cascade
/// hook (Events cascade-delete via the `ON DELETE CASCADE` foreign key).
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.supervisor.before_delete(&id).await;

    let result = sqlx::query("DELETE FROM reservations WHERE id = ? AND user_id = ?")
        .bind(&id)
        .bind(&auth.user_id)
        .execute(&state.db.pool)
        .await;

    match result {
        Ok(r) if r.rows_affected() == 0 => StatusCode::NOT_FOUND.into_response(),
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error("reservations_delete", e),
    }
}

/// `POST /api/reservations/:id/deactivate` — triggers §4.7's deactivate
/// hook (stop + PAUSED event).
pub async fn deactivate(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let owned: Option<(String,)> = sqlx::query_as("SELECT id FROM reservations WHERE id = ? AND user_id = ?")
        .bind(&id)
        .bind(&auth.user_id)
        .fetch_optional(&state.db.pool)
        .await
        .unwrap_or(None);

    if owned.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let result = sqlx::query("UPDATE reservations SET is_active = 0, updated_at = datetime('now') WHERE id = ?")
        .bind(&id)
        .execute(&state.db.pool)
        .await;

    match result {
        Ok(_) => {
            state.supervisor.deactivate(&id).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => internal_error("reservations_deactivate", e),
    }
}

/// `GET /api/reservations/:id/events` — the user-visible timeline (§4.4)
/// for one reservation.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<SessionAuth>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let owned: Option<(String,)> = sqlx::query_as("SELECT id FROM reservations WHERE id = ? AND user_id = ?")
        .bind(&id)
        .bind(&auth.user_id)
        .fetch_optional(&state.db.pool)
        .await
        .unwrap_or(None);

    if owned.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }

    match events::list_for_reservation(&state.db.pool, &id).await {
        Ok(events) => Json(serde_json::json!({ "events": events })).into_response(),
        Err(e) => internal_error("reservations_events", e),
    }
}
