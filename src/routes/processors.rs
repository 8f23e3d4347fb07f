use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use crate::processors::ProcessorDescriptor;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_processors))
}

async fn list_processors(State(state): State<Arc<AppState>>) -> Json<Vec<ProcessorDescriptor>> {
    Json(state.processors.descriptors())
}
