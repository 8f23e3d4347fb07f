use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    paginate, range_headers, sort_entries, ByteRange, ByteStream, ListOptions, StorageBackend,
    StreamBody,
};
use crate::errors::{FsError, FsResult};
use crate::models::{ConfigField, DirEntry, EntryKind, FieldType, FileMeta, StorageAdapter};

const MS_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
const MS_OAUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Refresh this long before the reported expiry.
const TOKEN_SAFETY_MARGIN_SECS: i64 = 300;

pub fn config_schema() -> Vec<ConfigField> {
    vec![
        ConfigField::required("client_id", "Client ID", FieldType::String),
        ConfigField::required("client_secret", "Client secret", FieldType::Password),
        ConfigField::required("refresh_token", "Refresh token", FieldType::Password),
        ConfigField::optional("root", "Root path", FieldType::String)
            .with_placeholder("defaults to the drive root"),
    ]
}

pub fn factory(record: &StorageAdapter) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(OneDriveBackend::new(record)?))
}

#[derive(Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// OneDrive backend over the Microsoft Graph API. Paths are addressed with
/// the `/me/drive/root:/path:` colon syntax; the access token is refreshed
/// from the configured refresh token with a safety margin, and the mutex
/// makes the refresh single-flight per instance.
pub struct OneDriveBackend {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    root: String,
    client: reqwest::Client,
    token: Mutex<TokenState>,
}

impl OneDriveBackend {
    pub fn new(record: &StorageAdapter) -> Result<Self> {
        let require = |key: &str| {
            record
                .config_str(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow::anyhow!("onedrive backend requires '{}'", key))
        };
        Ok(OneDriveBackend {
            client_id: require("client_id")?,
            client_secret: require("client_secret")?,
            refresh_token: require("refresh_token")?,
            root: record
                .config_str("root")
                .map(|r| r.trim_matches('/').to_string())
                .unwrap_or_default(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            token: Mutex::new(TokenState::default()),
        })
    }

    /// Graph path segment for a relative path, e.g. `:/docs/a.txt`. Empty for
    /// the drive root.
    fn api_path(&self, root: &str, rel: &str) -> String {
        let mut full = String::new();
        for part in [root, rel] {
            let part = part.trim_matches('/');
            if !part.is_empty() {
                if !full.is_empty() {
                    full.push('/');
                }
                full.push_str(part);
            }
        }
        if full.is_empty() {
            String::new()
        } else {
            format!(":/{}", full)
        }
    }

    async fn access_token(&self) -> FsResult<String> {
        let mut state = self.token.lock().await;
        if let (Some(token), Some(expires_at)) = (&state.access_token, state.expires_at) {
            if Utc::now() < expires_at {
                return Ok(token.clone());
            }
        }

        debug!("refreshing onedrive access token");
        let resp = self
            .client
            .post(MS_OAUTH_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FsError::upstream(
                resp.status().as_u16(),
                "onedrive token refresh failed",
            ));
        }
        let body: Value = resp.json().await?;
        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FsError::upstream(502, "token response missing access_token"))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);

        state.access_token = Some(token.clone());
        state.expires_at =
            Some(Utc::now() + chrono::Duration::seconds(expires_in - TOKEN_SAFETY_MARGIN_SECS));
        Ok(token)
    }

    async fn invalidate_token(&self) {
        let mut state = self.token.lock().await;
        state.access_token = None;
        state.expires_at = None;
    }

    /// Send one Graph request, retrying exactly once after a 401 with a fresh
    /// token.
    async fn request(
        &self,
        method: Method,
        target: RequestTarget<'_>,
        body: Option<Value>,
    ) -> FsResult<reqwest::Response> {
        for attempt in 0..2 {
            let token = self.access_token().await?;
            let url = match &target {
                RequestTarget::ApiPath(segment) => {
                    format!("{}/me/drive/root{}", MS_GRAPH_URL, segment)
                }
                RequestTarget::FullUrl(url) => url.to_string(),
            };
            let mut builder = self.client.request(method.clone(), &url).bearer_auth(&token);
            if let Some(body) = &body {
                builder = builder.json(body);
            }
            let resp = builder.send().await?;
            if resp.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!("onedrive returned 401, refreshing token and retrying once");
                self.invalidate_token().await;
                continue;
            }
            return Ok(resp);
        }
        unreachable!()
    }

    fn parse_item(item: &Value) -> Option<DirEntry> {
        let name = item.get("name")?.as_str()?.to_string();
        let is_dir = item.get("folder").is_some();
        let mtime = item
            .get("lastModifiedDateTime")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        Some(if is_dir {
            DirEntry::dir(name, mtime)
        } else {
            DirEntry::file(name, item.get("size").and_then(|v| v.as_u64()).unwrap_or(0), mtime)
        })
    }

    /// Fetch the parent folder's item id for move/copy destinations.
    async fn parent_item_id(&self, root: &str, parent_rel: &str) -> FsResult<String> {
        let api_path = self.api_path(root, parent_rel);
        let resp = self
            .request(Method::GET, RequestTarget::ApiPath(&api_path), None)
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(parent_rel.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FsError::upstream(resp.status().as_u16(), "item lookup failed"));
        }
        let item: Value = resp.json().await?;
        item.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| FsError::upstream(502, "item response missing id"))
    }
}

enum RequestTarget<'a> {
    ApiPath(&'a str),
    FullUrl(&'a str),
}

fn split_parent(rel: &str) -> (&str, &str) {
    let trimmed = rel.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}

#[async_trait]
impl StorageBackend for OneDriveBackend {
    fn resolve_root(&self, sub_path: Option<&str>) -> String {
        let mut full = self.root.clone();
        if let Some(sub) = sub_path.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
            if !full.is_empty() {
                full.push('/');
            }
            full.push_str(sub);
        }
        format!("/{}", full)
    }

    async fn list_dir(
        &self,
        root: &str,
        rel: &str,
        opts: &ListOptions,
    ) -> FsResult<(Vec<DirEntry>, usize)> {
        let api_path = self.api_path(root, rel);
        let children_path = if api_path.is_empty() {
            "/children?$top=999".to_string()
        } else {
            format!("{}:/children?$top=999", api_path)
        };

        let mut entries: Vec<DirEntry> = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let resp = match &next {
                Some(url) => {
                    self.request(Method::GET, RequestTarget::FullUrl(url), None)
                        .await?
                }
                None => {
                    self.request(Method::GET, RequestTarget::ApiPath(&children_path), None)
                        .await?
                }
            };
            if resp.status() == reqwest::StatusCode::NOT_FOUND && entries.is_empty() {
                return Ok((Vec::new(), 0));
            }
            if !resp.status().is_success() {
                return Err(FsError::upstream(resp.status().as_u16(), "children listing failed"));
            }
            let body: Value = resp.json().await?;
            if let Some(items) = body.get("value").and_then(|v| v.as_array()) {
                entries.extend(items.iter().filter_map(Self::parse_item));
            }
            match body.get("@odata.nextLink").and_then(|v| v.as_str()) {
                Some(link) => next = Some(link.to_string()),
                None => break,
            }
        }

        let total = entries.len();
        sort_entries(&mut entries, opts);
        Ok((paginate(entries, opts), total))
    }

    async fn read_file(&self, root: &str, rel: &str) -> FsResult<Vec<u8>> {
        let api_path = self.api_path(root, rel);
        if api_path.is_empty() {
            return Err(FsError::IsADirectory(rel.to_string()));
        }
        let content_path = format!("{}:/content", api_path);
        let resp = self
            .request(Method::GET, RequestTarget::ApiPath(&content_path), None)
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(rel.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FsError::upstream(resp.status().as_u16(), "content download failed"));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write_file(&self, root: &str, rel: &str, data: Bytes) -> FsResult<()> {
        let api_path = self.api_path(root, rel);
        if api_path.is_empty() {
            return Err(FsError::InvalidArgument("cannot write the drive root".into()));
        }
        let token = self.access_token().await?;
        let url = format!("{}/me/drive/root{}:/content", MS_GRAPH_URL, api_path);
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&token)
            .body(data)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FsError::upstream(resp.status().as_u16(), "content upload failed"));
        }
        Ok(())
    }

    async fn write_file_stream(&self, root: &str, rel: &str, data: ByteStream) -> FsResult<u64> {
        let api_path = self.api_path(root, rel);
        if api_path.is_empty() {
            return Err(FsError::InvalidArgument("cannot write the drive root".into()));
        }
        let token = self.access_token().await?;
        let url = format!("{}/me/drive/root{}:/content", MS_GRAPH_URL, api_path);
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&token)
            .body(reqwest::Body::wrap_stream(data))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FsError::upstream(resp.status().as_u16(), "content upload failed"));
        }
        let item: Value = resp.json().await?;
        Ok(item.get("size").and_then(|v| v.as_u64()).unwrap_or(0))
    }

    async fn mkdir(&self, root: &str, rel: &str) -> FsResult<()> {
        let (parent_rel, name) = split_parent(rel);
        if name.is_empty() {
            return Err(FsError::InvalidArgument("invalid directory name".into()));
        }
        let parent_api = self.api_path(root, parent_rel);
        let children_path = if parent_api.is_empty() {
            "/children".to_string()
        } else {
            format!("{}:/children", parent_api)
        };
        let payload = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        let resp = self
            .request(Method::POST, RequestTarget::ApiPath(&children_path), Some(payload))
            .await?;
        match resp.status().as_u16() {
            status if (200..300).contains(&status) => Ok(()),
            409 => Err(FsError::AlreadyExists(rel.to_string())),
            status => Err(FsError::upstream(status, "folder creation failed")),
        }
    }

    async fn delete(&self, root: &str, rel: &str) -> FsResult<()> {
        let api_path = self.api_path(root, rel);
        if api_path.is_empty() {
            return Err(FsError::InvalidArgument("cannot delete the drive root".into()));
        }
        let resp = self
            .request(Method::DELETE, RequestTarget::ApiPath(&api_path), None)
            .await?;
        match resp.status().as_u16() {
            204 | 404 => Ok(()),
            status if (200..300).contains(&status) => Ok(()),
            status => Err(FsError::upstream(status, "delete failed")),
        }
    }

    async fn stat_file(&self, root: &str, rel: &str) -> FsResult<FileMeta> {
        let api_path = self.api_path(root, rel);
        let resp = self
            .request(Method::GET, RequestTarget::ApiPath(&api_path), None)
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(rel.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FsError::upstream(resp.status().as_u16(), "item lookup failed"));
        }
        let item: Value = resp.json().await?;
        let entry = Self::parse_item(&item)
            .ok_or_else(|| FsError::upstream(502, "unparseable drive item"))?;
        Ok(FileMeta {
            name: entry.name,
            is_dir: entry.is_dir,
            size: entry.size,
            mtime: entry.mtime,
            kind: if entry.is_dir { EntryKind::Dir } else { EntryKind::File },
            extra: item
                .get("id")
                .and_then(|v| v.as_str())
                .map(|id| json!({ "item_id": id })),
        })
    }

    async fn move_path(&self, root: &str, src_rel: &str, dst_rel: &str) -> FsResult<()> {
        let src_api = self.api_path(root, src_rel);
        if src_api.is_empty() {
            return Err(FsError::InvalidArgument("cannot move the drive root".into()));
        }
        let (dst_parent, dst_name) = split_parent(dst_rel);
        let parent_id = self.parent_item_id(root, dst_parent).await?;
        // Move and rename are the same PATCH on Graph: new parent + new name.
        let payload = json!({
            "parentReference": { "id": parent_id },
            "name": dst_name,
        });
        let resp = self
            .request(Method::PATCH, RequestTarget::ApiPath(&src_api), Some(payload))
            .await?;
        match resp.status().as_u16() {
            status if (200..300).contains(&status) => Ok(()),
            404 => Err(FsError::NotFound(src_rel.to_string())),
            409 => Err(FsError::AlreadyExists(dst_rel.to_string())),
            status => Err(FsError::upstream(status, "move failed")),
        }
    }

    async fn copy(
        &self,
        root: &str,
        src_rel: &str,
        dst_rel: &str,
        _overwrite: bool,
    ) -> FsResult<()> {
        let src_api = self.api_path(root, src_rel);
        if src_api.is_empty() {
            return Err(FsError::InvalidArgument("cannot copy the drive root".into()));
        }
        let (dst_parent, dst_name) = split_parent(dst_rel);
        let parent_id = self.parent_item_id(root, dst_parent).await?;
        let payload = json!({
            "parentReference": { "id": parent_id },
            "name": dst_name,
        });
        let copy_path = format!("{}:/copy", src_api);
        let resp = self
            .request(Method::POST, RequestTarget::ApiPath(&copy_path), Some(payload))
            .await?;
        match resp.status().as_u16() {
            status if (200..300).contains(&status) => Ok(()),
            404 => Err(FsError::NotFound(src_rel.to_string())),
            status => Err(FsError::upstream(status, "copy failed")),
        }
    }

    async fn stream_file(
        &self,
        root: &str,
        rel: &str,
        range: Option<ByteRange>,
    ) -> FsResult<StreamBody> {
        let api_path = self.api_path(root, rel);
        if api_path.is_empty() {
            return Err(FsError::IsADirectory(rel.to_string()));
        }
        let resp = self
            .request(Method::GET, RequestTarget::ApiPath(&api_path), None)
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(rel.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FsError::upstream(resp.status().as_u16(), "item lookup failed"));
        }
        let item: Value = resp.json().await?;
        let download_url = item
            .get("@microsoft.graph.downloadUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FsError::upstream(502, "item has no download url"))?
            .to_string();
        let size = item.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
        let content_type = item
            .get("file")
            .and_then(|f| f.get("mimeType"))
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();

        let (status, start, end) = match range {
            Some(range) => {
                let (start, end) = range.clamp(size)?;
                (StatusCode::PARTIAL_CONTENT, start, end)
            }
            None if size == 0 => (StatusCode::OK, 0, 0),
            None => (StatusCode::OK, 0, size - 1),
        };
        let headers = range_headers(&content_type, status, start, end, Some(size));

        // The download URL is pre-authenticated; no bearer token needed.
        let client = self.client.clone();
        let range_header = format!("bytes={}-{}", start, end);
        let body = stream! {
            let resp = match client
                .get(&download_url)
                .header(reqwest::header::RANGE, &range_header)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    warn!("onedrive download returned {}", resp.status());
                    yield Err(std::io::Error::other("download failed"));
                    return;
                }
                Err(e) => {
                    warn!("onedrive download failed: {}", e);
                    yield Err(std::io::Error::other(e));
                    return;
                }
            };
            let mut upstream_body = resp.bytes_stream();
            while let Some(chunk) = upstream_body.next().await {
                match chunk {
                    Ok(chunk) => yield Ok(chunk),
                    Err(e) => {
                        warn!("onedrive stream error: {}", e);
                        yield Err(std::io::Error::other(e));
                        return;
                    }
                }
            }
        };

        Ok(StreamBody::new(status, headers, Box::pin(body)))
    }
}
