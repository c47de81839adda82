use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Max length for user-provided string fields (e.g. a Reservation's `url`).
pub const MAX_URL: usize = 2048;

/// Validate that a string field does not exceed the given max length.
/// Returns `Some(Response)` with a 400 error if it does, `None` if OK.
pub fn validate_len(field: &str, value: &str, max: usize) -> Option<Response> {
    if value.len() > max {
        return Some(
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("{field} exceeds maximum length of {max} characters")
                })),
            )
                .into_response(),
        );
    }
    None
}

/// Return a generic 500 response, logging the real error server-side.
pub fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    error!(context = context, error = %err, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "Internal server error" })),
    )
        .into_response()
}
