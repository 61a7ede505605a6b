//! Legacy HTTP endpoint path.
//!
//! `POST /api/v1/<owner:name>` invokes a server-hosted endpoint with the
//! JSON request body, yielding the same result as the event path.  Peer
//! endpoints and `table:proxy` are only reachable over a session.

use crate::session::call_server_endpoint;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

pub async fn call_endpoint(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match call_server_endpoint(&state, None, &endpoint, body).await {
        Ok(value) => Json(value).into_response(),
        Err(message) => {
            let status = if message.starts_with("unknown endpoint") {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::BAD_REQUEST
            };
            (status, Json(json!({ "error": message }))).into_response()
        }
    }
}
