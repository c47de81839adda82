pub mod auth;
pub mod error;
pub mod push;
pub mod reservations;
pub mod sync;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;

use crate::AppState;

/// `/auth/*` — session issuance (spec.md §6's login/logout seam). Not
/// gated by [`crate::auth::session_auth_middleware`]: these routes are how
/// a caller gets a session in the first place.
pub fn auth_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .with_state(state)
}

/// `/api/*` — everything else, gated by session auth (§4.10).
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/reservations", get(reservations::list).post(reservations::create))
        .route(
            "/reservations/{id}",
            put(reservations::update).delete(reservations::delete),
        )
        .route("/reservations/{id}/deactivate", post(reservations::deactivate))
        .route("/reservations/{id}/events", get(reservations::list_events))
        .route("/push/subscribe", post(push::subscribe))
        .route("/push/unsubscribe", post(push::unsubscribe))
        .route("/push/test", post(push::test))
        .route("/wodbuster/sync", post(sync::sync_now))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::session_auth_middleware,
        ))
        .with_state(state)
}
