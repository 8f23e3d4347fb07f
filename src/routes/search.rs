use std::sync::Arc;

use axum::{extract::Query, extract::State, routing::get, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::errors::FsResult;
use crate::services::vector_store::DEFAULT_COLLECTION;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(search))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    5
}

/// Semantic search over the indexed namespace. The query is embedded and
/// matched against stored vectors; when no embedding provider is reachable
/// the search degrades to a plain path-substring match.
async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> FsResult<impl axum::response::IntoResponse> {
    let hits = match state.ai.embed_text(&query.q).await {
        Ok(embedding) => state
            .vector_store
            .search(DEFAULT_COLLECTION, &embedding, query.top_k),
        Err(e) => {
            debug!("embedding unavailable, falling back to path search: {}", e);
            state
                .vector_store
                .search_by_path(DEFAULT_COLLECTION, &query.q, query.top_k)
        }
    };
    Ok(Json(json!({ "query": query.q, "hits": hits })))
}
