use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::errors::{FsError, FsResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tasks))
        .route("/{id}", get(get_task))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<crate::models::Task>> {
    Json(state.queue.all_tasks())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> FsResult<impl axum::response::IntoResponse> {
    let task = state
        .queue
        .get_task(id)
        .ok_or_else(|| FsError::NotFound(format!("task {}", id)))?;
    Ok(Json(task))
}
