use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{FsError, FsResult};
use crate::services::{temp_link, thumbnail::ThumbFit};
use crate::storage::{parse_range_header, ByteRange, ByteStream, ListOptions};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/list", get(list_dir))
        .route("/stat", get(stat_file))
        .route("/stream", get(stream_file))
        .route("/file", put(upload_file))
        .route("/mkdir", post(make_dir))
        .route("/", delete(delete_path))
        .route("/move", post(move_path))
        .route("/rename", post(rename_path))
        .route("/copy", post(copy_path))
        .route("/thumbnail", get(thumbnail))
        .route("/process", post(process_file))
        .route("/temp-link", post(create_temp_link))
        .route("/public/{token}", get(public_stream))
}

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Deserialize)]
struct ListQuery {
    path: String,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

fn range_from_headers(headers: &HeaderMap) -> FsResult<Option<ByteRange>> {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(parse_range_header)
        .transpose()
}

fn body_stream(body: Body) -> ByteStream {
    Box::pin(
        body.into_data_stream()
            .map_err(|e| std::io::Error::other(e)),
    )
}

async fn list_dir(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> FsResult<impl IntoResponse> {
    let opts = ListOptions::page(query.page, query.page_size);
    let listing = state.vfs.list_dir(&query.path, &opts).await?;
    Ok(Json(listing))
}

async fn stat_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> FsResult<impl IntoResponse> {
    let meta = state.vfs.stat_file(&query.path).await?;
    Ok(Json(meta))
}

async fn stream_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> FsResult<Response> {
    let range = range_from_headers(&headers)?;
    let body = state.vfs.stream_file(&query.path, range).await?;
    Ok(body.into_response())
}

#[derive(Deserialize)]
struct UploadQuery {
    path: String,
    #[serde(default = "default_true")]
    overwrite: bool,
}

fn default_true() -> bool {
    true
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> FsResult<impl IntoResponse> {
    let size = state
        .vfs
        .write_file_stream(&query.path, body_stream(body), query.overwrite)
        .await?;
    Ok(Json(json!({ "path": query.path, "size": size })))
}

#[derive(Deserialize)]
struct PathBody {
    path: String,
}

async fn make_dir(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PathBody>,
) -> FsResult<impl IntoResponse> {
    state.vfs.mkdir(&body.path).await?;
    Ok(Json(json!({ "created": body.path })))
}

async fn delete_path(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> FsResult<impl IntoResponse> {
    state.vfs.delete(&query.path).await?;
    Ok(Json(json!({ "deleted": query.path })))
}

#[derive(Deserialize)]
struct TransferBody {
    src: String,
    dst: String,
    #[serde(default)]
    overwrite: bool,
}

async fn move_path(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransferBody>,
) -> FsResult<impl IntoResponse> {
    let trace = state
        .vfs
        .move_path(&body.src, &body.dst, body.overwrite)
        .await?;
    Ok(Json(trace))
}

async fn rename_path(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransferBody>,
) -> FsResult<impl IntoResponse> {
    let trace = state
        .vfs
        .rename_path(&body.src, &body.dst, body.overwrite)
        .await?;
    Ok(Json(trace))
}

async fn copy_path(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransferBody>,
) -> FsResult<impl IntoResponse> {
    let trace = state
        .vfs
        .copy_path(&body.src, &body.dst, body.overwrite)
        .await?;
    Ok(Json(trace))
}

#[derive(Deserialize)]
struct ThumbQuery {
    path: String,
    #[serde(default = "default_thumb_dim")]
    w: u32,
    #[serde(default = "default_thumb_dim")]
    h: u32,
    #[serde(default = "default_fit")]
    fit: String,
}

fn default_thumb_dim() -> u32 {
    256
}

fn default_fit() -> String {
    "cover".to_string()
}

async fn thumbnail(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThumbQuery>,
) -> FsResult<Response> {
    let fit = ThumbFit::parse(&query.fit)?;
    let resolved = state.vfs.resolve(&query.path).await?;
    let (bytes, mime, key) = state
        .thumbnails
        .get_or_create(
            &resolved.backend,
            resolved.record.id,
            &resolved.root,
            &resolved.rel,
            query.w,
            query.h,
            fit,
        )
        .await?;
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::ETAG, format!("\"{}\"", key)),
            (header::CACHE_CONTROL, "public, max-age=86400".to_string()),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize)]
struct ProcessBody {
    path: String,
    processor_type: String,
    #[serde(default)]
    config: serde_json::Value,
    save_to: Option<String>,
}

async fn process_file(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProcessBody>,
) -> FsResult<impl IntoResponse> {
    if state.processors.get(&body.processor_type).is_none() {
        return Err(FsError::InvalidArgument(format!(
            "processor {} not found",
            body.processor_type
        )));
    }
    let task = state.queue.enqueue(
        "process_file",
        json!({
            "path": body.path,
            "processor_type": body.processor_type,
            "config": body.config,
            "save_to": body.save_to,
        }),
    );
    Ok(Json(json!({ "task_id": task.id })))
}

#[derive(Deserialize)]
struct TempLinkBody {
    path: String,
    /// Seconds until expiry; zero or negative means permanent.
    #[serde(default)]
    expires_in: i64,
}

async fn create_temp_link(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TempLinkBody>,
) -> FsResult<impl IntoResponse> {
    // The path must route somewhere before we sign it.
    state.vfs.resolve(&body.path).await?;
    let secret = state.temp_link_secret().await;
    let token = temp_link::generate(&secret, &body.path, body.expires_in);
    Ok(Json(json!({
        "token": token,
        "url": format!("/api/fs/public/{}", token),
    })))
}

async fn public_stream(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> FsResult<Response> {
    let secret = state.temp_link_secret().await;
    let path = temp_link::verify(&secret, &token)?;
    let range = range_from_headers(&headers)?;
    let body = state.vfs.stream_file(&path, range).await?;
    Ok(body.into_response())
}
