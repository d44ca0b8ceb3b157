use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::store::RecordStore;

#[derive(Clone)]
struct AppState {
    store: RecordStore,
    secret: String,
}

/// A record entry as submitted by the management API.
#[derive(Debug, Deserialize)]
pub struct NamedRecord {
    pub name: String,
    pub address: String,
}

/// Build the management API router.
///
/// Everything under `/api` requires the shared secret; `/health` does not.
pub fn management_router(store: RecordStore, secret: String) -> Router {
    let state = AppState { store, secret };

    let api = Router::new()
        .route("/records", get(list_records).post(create_record))
        .route(
            "/records/{name}",
            get(show_record).put(update_record).delete(delete_record),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), check_secret));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Run the management API until shutdown is signalled.
pub async fn run_http_server(
    listener: TcpListener,
    store: RecordStore,
    secret: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("management API listening on {}", listener.local_addr()?);

    let app = management_router(store, secret);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    info!("management API shutdown complete");
    Ok(())
}

/// Reject requests whose `Secret` header does not match the configured
/// shared secret.
async fn check_secret(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get("Secret")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if provided == state.secret {
        next.run(request).await
    } else {
        (StatusCode::FORBIDDEN, "Incorrect shared secret").into_response()
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "records": state.store.len()
        })),
    )
}

async fn list_records(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.list())
}

async fn create_record(
    State(state): State<AppState>,
    Json(record): Json<NamedRecord>,
) -> impl IntoResponse {
    state.store.put(record.name, record.address);
    StatusCode::CREATED
}

async fn show_record(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.store.get(&name) {
        Some(address) => Json(json!({ "name": name, "address": address })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn update_record(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(address): Json<String>,
) -> impl IntoResponse {
    state.store.put(name, address);
    StatusCode::NO_CONTENT
}

async fn delete_record(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.remove(&name) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}
