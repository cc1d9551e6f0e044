use crate::error::HandlerError;
use crate::handler::{handle_delivery, AppState};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Webhook deliveries are accepted on any path.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(handle_webhook))
        .route("/{*path}", post(handle_webhook))
        .with_state(state)
}

/// Bind on all interfaces and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server bound");
    axum::serve(listener, router(state)).await
}

/// Fixed response text per failure class. Details stay in the log.
fn failure_text(error: &HandlerError) -> &'static str {
    match error {
        HandlerError::Authentication(_) => "authentication failed",
        HandlerError::Validation(_) => "invalid delivery",
        HandlerError::Secret(_) => "internal error",
    }
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    match handle_delivery(state, &headers, body).await {
        Ok(_) => (StatusCode::OK, "OK".to_string()),
        Err(e) => {
            match &e {
                HandlerError::Authentication(_) => warn!(error = %e, "rejected delivery"),
                _ => error!(error = %e, "delivery failed"),
            }
            (StatusCode::INTERNAL_SERVER_ERROR, failure_text(&e).to_string())
        }
    }
}
