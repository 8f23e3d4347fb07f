use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod processors;
pub mod routes;
pub mod services;
pub mod storage;
pub mod vfs;

#[cfg(test)]
mod tests;

use config::Config;
use db::Database;
use processors::ProcessorRegistry;
use services::ai::AiClient;
use services::settings::SettingsCache;
use services::task_queue::TaskQueue;
use services::thumbnail::ThumbnailService;
use services::vector_store::VectorStore;
use storage::registry::AdapterRegistry;
use vfs::VirtualFs;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub registry: Arc<AdapterRegistry>,
    pub queue: Arc<TaskQueue>,
    pub vfs: Arc<VirtualFs>,
    pub processors: Arc<ProcessorRegistry>,
    pub thumbnails: Arc<ThumbnailService>,
    pub settings: Arc<SettingsCache>,
    pub vector_store: Arc<VectorStore>,
    pub ai: Arc<AiClient>,
}

impl AppState {
    /// Secret for temp-link signing: settings row or environment first, then
    /// the process-level configuration fallback.
    pub async fn temp_link_secret(&self) -> Vec<u8> {
        match self.settings.get("TEMP_LINK_SECRET_KEY").await {
            Ok(Some(value)) => value.into_bytes(),
            _ => self.config.temp_link_secret_key.clone().into_bytes(),
        }
    }
}

/// Health check endpoint for monitoring.
pub async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// The full application router over a prepared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body = state.config.max_upload_mb as usize * 1024 * 1024;
    Router::new()
        .route("/api/health", get(health_check))
        .nest("/api/fs", routes::fs::router())
        .nest("/api/adapters", routes::adapters::router())
        .nest("/api/rules", routes::rules::router())
        .nest("/api/search", routes::search::router())
        .nest("/api/tasks", routes::tasks::router())
        .nest("/api/processors", routes::processors::router())
        .merge(routes::webdav::router())
        .layer(DefaultBodyLimit::max(max_body))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
