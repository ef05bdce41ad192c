//! Axum front door: on-demand sync trigger plus read-only snapshot views.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use forumsnap_core::ChannelTag;
use forumsnap_storage::StoredThread;
use forumsnap_sync::SyncService;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "forumsnap-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ThreadsQuery {
    parent_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ThreadsResponse {
    count: usize,
    threads: Vec<StoredThread>,
}

#[derive(Debug, Serialize)]
struct ChannelTagsResponse {
    parent_id: String,
    tags: Vec<ChannelTag>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync", post(sync_handler))
        .route("/threads", get(threads_handler))
        .route("/threads/{id}", get(thread_detail_handler))
        .route("/channels/{parent_id}/tags", get(channel_tags_handler))
        .with_state(state)
}

pub async fn serve(service: Arc<SyncService>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http front door listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.service.store().count_threads().await {
        Ok(threads) => Json(json!({ "status": "ok", "threads": threads })).into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

async fn sync_handler(State(state): State<AppState>) -> Response {
    match state.service.run_exclusive().await {
        Ok(Some(result)) => Json(result).into_response(),
        Ok(None) => error_response(StatusCode::CONFLICT, "a sync run is already in progress"),
        Err(err) => {
            error!(error = %err, "on-demand sync failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

async fn threads_handler(
    State(state): State<AppState>,
    Query(query): Query<ThreadsQuery>,
) -> Response {
    match state.service.store().list_threads(query.parent_id.as_deref()).await {
        Ok(threads) => Json(ThreadsResponse {
            count: threads.len(),
            threads,
        })
        .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn thread_detail_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.store().get_thread(&id).await {
        Ok(Some(thread)) => Json(thread).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("thread {id} not found")),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn channel_tags_handler(
    State(state): State<AppState>,
    Path(parent_id): Path<String>,
) -> Response {
    match state.service.store().list_channel_tags(&parent_id).await {
        Ok(tags) => Json(ChannelTagsResponse { parent_id, tags }).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

fn error_response(status: StatusCode, err: impl ToString) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
