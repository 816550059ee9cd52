//! Read-only JSON view of the stored history.

use crate::model::{HistoryEntry, MeasurementResult};
use crate::storage::HistoryStore;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Store handle shared by the HTTP API and the scheduler.
pub type SharedStore<S> = Arc<Mutex<S>>;

#[derive(Serialize)]
struct ApiResponse {
    test_results: Vec<HistoryEntry<MeasurementResult>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn handle_api<S>(
    State(store): State<SharedStore<S>>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ErrorResponse>)>
where
    S: HistoryStore<MeasurementResult> + Send + 'static,
{
    let mut store = store.lock().await;
    match store.retrieve_all() {
        Ok(test_results) => Ok(Json(ApiResponse { test_results })),
        Err(e) => {
            tracing::error!("failed to retrieve test results: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("failed to retrieve test results: {e}"),
                }),
            ))
        }
    }
}

pub fn router<S>(store: SharedStore<S>) -> Router
where
    S: HistoryStore<MeasurementResult> + Send + 'static,
{
    Router::new()
        .route("/api", get(handle_api::<S>))
        .route("/health", get(|| async { "ok" }))
        .with_state(store)
}

/// `:4321` style addresses listen on every interface.
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Serves the API on `addr` until `shutdown` resolves.
pub async fn serve<S, F>(addr: &str, store: SharedStore<S>, shutdown: F) -> anyhow::Result<()>
where
    S: HistoryStore<MeasurementResult> + Send + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = listen_addr(addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to listen on {addr}: {e}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
