//! The operator pages: a tiny HTTP surface for listing rooms, reloading
//! the configuration and destroying a room by code. Listens on its own
//! loopback address, separate from the game socket.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;

use protocol::GameCode;

use crate::config;
use crate::worker::Worker;

pub fn router(worker: Arc<Worker>) -> Router {
    Router::new()
        .route("/rooms", get(rooms_handler))
        .route("/reload", get(reload_handler))
        .route("/destroy/{code}", get(destroy_handler))
        .route("/saah/{code}/{enabled}", get(saah_handler))
        .with_state(worker)
}

/// Generates a list with the current rooms in the configured log format.
async fn rooms_handler(State(worker): State<Arc<Worker>>) -> String {
    let listing = worker.describe_rooms().await;
    if listing.is_empty() {
        "no rooms".to_string()
    } else {
        listing
    }
}

/// Forces a reload of the config file. New rooms pick the fresh values
/// up; running rooms keep what they started with.
async fn reload_handler(State(worker): State<Arc<Worker>>) -> String {
    match config::reload_config(&worker.config).await {
        Ok(fresh) => format!(
            "reloaded: serverAsHost={} createTimeout={}s",
            fresh.server_as_host, fresh.create_timeout
        ),
        Err(err) => format!("Config reload failed: {err}"),
    }
}

/// Flips a room between server-as-host and classic client hosting.
async fn saah_handler(
    Path((code, enabled)): Path<(String, bool)>,
    State(worker): State<Arc<Worker>>,
) -> String {
    let Some(code) = GameCode::parse(&code) else {
        return format!("{code} is not a valid room code");
    };
    if worker.set_server_as_host(code, enabled).await {
        format!("room {code} server-as-host={enabled}")
    } else {
        format!("room {code} not found")
    }
}

/// Destroys one room by its display code.
async fn destroy_handler(
    Path(code): Path<String>,
    State(worker): State<Arc<Worker>>,
) -> String {
    let Some(code) = GameCode::parse(&code) else {
        return format!("{code} is not a valid room code");
    };
    if worker.destroy_room(code).await {
        format!("room {code} destroyed")
    } else {
        format!("room {code} not found")
    }
}
