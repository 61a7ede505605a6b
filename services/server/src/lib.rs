//! The hub server: a WebSocket broker for application networks.
//!
//! Sessions connect at `/ws`, identify themselves with a `connect`
//! envelope, and from then on exchange events.  The server hosts the
//! shared halves of the extension protocols: endpoint routing between
//! sessions, table storage with mutation fan-out and the write-proxy
//! chain, and the value registry.

pub mod endpoint_host;
pub mod http;
pub mod registry_host;
pub mod session;
pub mod state;
pub mod store;
pub mod table_host;

pub use state::AppState;

use axum::Router;
use axum::routing::{get, post};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(session::ws_handler))
        .route("/api/v1/{endpoint}", post(http::call_endpoint))
        .with_state(state)
}
