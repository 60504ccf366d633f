use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
};
use serde::Serialize;
use tokio_graceful::ShutdownGuard;

use lib_xml2bus::core::HandoffQueue;

#[derive(Clone)]
pub struct AdminState {
    pub xml_port: u16,
    pub queue: Arc<HandoffQueue>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub timestamp: String,
    pub listen_port: u16,
    pub queued: usize,
    pub queue_capacity: usize,
    pub enqueued_total: u64,
    pub dropped_total: u64,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// # Run Admin Server
///
/// Serves the administrative endpoints on `http_port` until shutdown. A bind
/// failure is logged and leaves the rest of the process running.
pub async fn run(http_port: u16, state: AdminState, shutdown_guard: ShutdownGuard) {
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Admin server failed to bind {}: {}", addr, e);
            return;
        }
    };
    tracing::info!("Admin server listening on {}", addr);

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_guard.cancelled().await;
            tracing::info!("Admin server shutting down.");
        })
        .await;
    if let Err(e) = served {
        tracing::error!("Admin server error: {}", e);
    }
}

fn now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

async fn index_handler() -> impl IntoResponse {
    Html(format!(
        "<html><head><title>xml2bus</title></head><body><h1>xml2bus</h1><p>{}</p></body></html>",
        now()
    ))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn status_handler(State(state): State<AdminState>) -> Json<StatusReport> {
    Json(StatusReport {
        timestamp: now(),
        listen_port: state.xml_port,
        queued: state.queue.len(),
        queue_capacity: state.queue.capacity(),
        enqueued_total: state.queue.enqueued_total(),
        dropped_total: state.queue.dropped_total(),
    })
}
