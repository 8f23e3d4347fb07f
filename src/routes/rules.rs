use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::errors::{FsError, FsResult};
use crate::models::{CreateRule, UpdateRule};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route("/{id}", get(get_rule).put(update_rule).delete(delete_rule))
}

fn validate_regex(pattern: Option<&str>) -> FsResult<()> {
    if let Some(pattern) = pattern.filter(|p| !p.is_empty()) {
        regex::Regex::new(pattern)
            .map_err(|e| FsError::InvalidArgument(format!("invalid filename regex: {}", e)))?;
    }
    Ok(())
}

fn validate_processor(state: &AppState, processor_type: &str) -> FsResult<()> {
    if state.processors.get(processor_type).is_none() {
        return Err(FsError::InvalidArgument(format!(
            "unknown processor type: {}",
            processor_type
        )));
    }
    Ok(())
}

async fn list_rules(State(state): State<Arc<AppState>>) -> FsResult<impl axum::response::IntoResponse> {
    let rules = state
        .db
        .list_rules()
        .await
        .map_err(|e| FsError::internal(e.to_string()))?;
    Ok(Json(rules))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> FsResult<impl axum::response::IntoResponse> {
    let rule = state
        .db
        .get_rule(id)
        .await
        .map_err(|e| FsError::internal(e.to_string()))?
        .ok_or_else(|| FsError::NotFound(format!("rule {}", id)))?;
    Ok(Json(rule))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRule>,
) -> FsResult<impl axum::response::IntoResponse> {
    validate_processor(&state, &body.processor_type)?;
    validate_regex(body.filename_regex.as_deref())?;
    let rule = state
        .db
        .create_rule(&body)
        .await
        .map_err(|e| FsError::internal(e.to_string()))?;
    Ok(Json(rule))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateRule>,
) -> FsResult<impl axum::response::IntoResponse> {
    if let Some(processor_type) = &body.processor_type {
        validate_processor(&state, processor_type)?;
    }
    validate_regex(body.filename_regex.as_deref())?;
    let rule = state
        .db
        .update_rule(id, &body)
        .await
        .map_err(|e| FsError::internal(e.to_string()))?
        .ok_or_else(|| FsError::NotFound(format!("rule {}", id)))?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> FsResult<impl axum::response::IntoResponse> {
    let removed = state
        .db
        .delete_rule(id)
        .await
        .map_err(|e| FsError::internal(e.to_string()))?;
    if !removed {
        return Err(FsError::NotFound(format!("rule {}", id)));
    }
    Ok(Json(json!({ "deleted": id })))
}
