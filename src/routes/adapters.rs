use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::errors::{FsError, FsResult};
use crate::models::{CreateAdapter, UpdateAdapter};
use crate::storage::registry::{backend_descriptors, descriptor_for};
use crate::vfs::normalize_path;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_adapters).post(create_adapter))
        .route("/types", get(list_types))
        .route("/{id}", get(get_adapter).put(update_adapter).delete(delete_adapter))
}

/// Validate an opaque config against the backend's declared schema: the type
/// must be registered and every required field present and non-empty.
fn validate_config(adapter_type: &str, config: &serde_json::Value) -> FsResult<()> {
    let descriptor = descriptor_for(adapter_type).ok_or_else(|| {
        FsError::InvalidArgument(format!("unknown adapter type: {}", adapter_type))
    })?;
    for field in (descriptor.schema)() {
        if !field.required {
            continue;
        }
        let present = match config.get(field.key) {
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            Some(serde_json::Value::Null) | None => false,
            Some(_) => true,
        };
        if !present {
            return Err(FsError::InvalidArgument(format!(
                "missing required config field '{}'",
                field.key
            )));
        }
    }
    Ok(())
}

fn map_db_error(e: anyhow::Error) -> FsError {
    let message = e.to_string();
    if message.contains("duplicate key") {
        FsError::AlreadyExists("adapter name or mount path already in use".into())
    } else {
        FsError::internal(message)
    }
}

async fn list_adapters(State(state): State<Arc<AppState>>) -> FsResult<impl axum::response::IntoResponse> {
    let adapters = state
        .db
        .list_adapters()
        .await
        .map_err(|e| FsError::internal(e.to_string()))?;
    Ok(Json(adapters))
}

async fn list_types() -> Json<serde_json::Value> {
    let types: Vec<serde_json::Value> = backend_descriptors()
        .iter()
        .map(|d| {
            json!({
                "type": d.type_tag,
                "config_schema": (d.schema)(),
            })
        })
        .collect();
    Json(json!(types))
}

async fn get_adapter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> FsResult<impl axum::response::IntoResponse> {
    let adapter = state
        .db
        .get_adapter(id)
        .await
        .map_err(|e| FsError::internal(e.to_string()))?
        .ok_or_else(|| FsError::NotFound(format!("adapter {}", id)))?;
    Ok(Json(adapter))
}

async fn create_adapter(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<CreateAdapter>,
) -> FsResult<impl axum::response::IntoResponse> {
    validate_config(&body.adapter_type, &body.config)?;
    body.mount_path = normalize_path(&body.mount_path)?;

    let record = state.db.create_adapter(&body).await.map_err(map_db_error)?;
    state.registry.upsert(&record);
    info!(
        "created adapter {} ({}) mounted at {}",
        record.name, record.adapter_type, record.mount_path
    );
    Ok(Json(record))
}

async fn update_adapter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(mut body): Json<UpdateAdapter>,
) -> FsResult<impl axum::response::IntoResponse> {
    let existing = state
        .db
        .get_adapter(id)
        .await
        .map_err(|e| FsError::internal(e.to_string()))?
        .ok_or_else(|| FsError::NotFound(format!("adapter {}", id)))?;

    if let Some(config) = &body.config {
        validate_config(&existing.adapter_type, config)?;
    }
    if let Some(mount_path) = &body.mount_path {
        body.mount_path = Some(normalize_path(mount_path)?);
    }

    let record = state
        .db
        .update_adapter(id, &body)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| FsError::NotFound(format!("adapter {}", id)))?;
    // The live registry must see every row change at the next routing.
    state.registry.upsert(&record);
    Ok(Json(record))
}

async fn delete_adapter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> FsResult<impl axum::response::IntoResponse> {
    let removed = state
        .db
        .delete_adapter(id)
        .await
        .map_err(|e| FsError::internal(e.to_string()))?;
    if !removed {
        return Err(FsError::NotFound(format!("adapter {}", id)));
    }
    state.registry.remove(id);
    Ok(Json(json!({ "deleted": id })))
}
