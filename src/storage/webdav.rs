use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Method;
use serde_json::json;
use tracing::{debug, warn};

use super::webdav_xml::{parse_multistatus, DavResource, PROPFIND_BODY};
use super::{
    guess_mime, paginate, range_headers, sort_entries, ByteRange, ByteStream, ListOptions,
    StorageBackend, StreamBody,
};
use crate::errors::{FsError, FsResult};
use crate::models::{ConfigField, DirEntry, EntryKind, FieldType, FileMeta, StorageAdapter};

const SEGMENT_SIZE: u64 = 5 * 1024 * 1024;
const MAX_RETRY_PER_SEGMENT: usize = 3;

pub fn config_schema() -> Vec<ConfigField> {
    vec![
        ConfigField::required("base_url", "Base URL", FieldType::String)
            .with_placeholder("https://example.com/dav/"),
        ConfigField::optional("username", "Username", FieldType::String),
        ConfigField::optional("password", "Password", FieldType::Password),
        ConfigField::optional("timeout", "Timeout (seconds)", FieldType::Number)
            .with_default(json!(15)),
    ]
}

pub fn factory(record: &StorageAdapter) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(WebDavBackend::new(record)?))
}

/// Backend for a remote WebDAV server. The resolved root is a base URL;
/// relative paths are percent-encoded segment by segment below it.
pub struct WebDavBackend {
    base_url: String,
    username: Option<String>,
    password: String,
    client: reqwest::Client,
}

impl WebDavBackend {
    pub fn new(record: &StorageAdapter) -> Result<Self> {
        let base_url = record
            .config_str("base_url")
            .filter(|u| u.starts_with("http"))
            .ok_or_else(|| anyhow::anyhow!("webdav backend requires an http(s) 'base_url'"))?;
        let timeout = record.config_u64("timeout").unwrap_or(15);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(WebDavBackend {
            base_url: format!("{}/", base_url.trim_end_matches('/')),
            username: record.config_str("username").filter(|u| !u.is_empty()),
            password: record.config_str("password").unwrap_or_default(),
            client,
        })
    }

    fn build_url(&self, root: &str, rel: &str) -> String {
        let base = if root.is_empty() { &self.base_url } else { root };
        let base = base.trim_end_matches('/');
        let rel = rel.trim_matches('/');
        if rel.is_empty() {
            return format!("{}/", base);
        }
        let encoded: Vec<String> = rel
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect();
        format!("{}/{}", base, encoded.join("/"))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, Some(&self.password)),
            None => builder,
        }
    }

    async fn propfind(&self, url: &str, depth: &str) -> FsResult<Vec<DavResource>> {
        let resp = self
            .request(Method::from_bytes(b"PROPFIND").unwrap(), url)
            .header("Depth", depth)
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(url.to_string()));
        }
        if !resp.status().is_success() && resp.status().as_u16() != 207 {
            return Err(FsError::upstream(
                resp.status().as_u16(),
                format!("PROPFIND {} failed", url),
            ));
        }
        let text = resp.text().await?;
        parse_multistatus(&text).map_err(|e| FsError::upstream(502, e.to_string()))
    }

    /// HEAD probe for total size and range support; some servers answer HEAD
    /// without a length, in which case a one-byte ranged GET learns the total
    /// from Content-Range.
    async fn probe_size(&self, url: &str) -> FsResult<(Option<u64>, bool)> {
        let mut total = None;
        let mut accept_ranges = false;
        match self.request(Method::HEAD, url).send().await {
            Ok(resp) => {
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Err(FsError::NotFound(url.to_string()));
                }
                if resp.status().is_success() {
                    total = resp
                        .headers()
                        .get(reqwest::header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok());
                    accept_ranges = resp
                        .headers()
                        .get(reqwest::header::ACCEPT_RANGES)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.to_lowercase().contains("bytes"))
                        .unwrap_or(false);
                }
            }
            Err(e) => debug!("HEAD {} failed: {}", url, e),
        }

        if total.is_none() {
            match self
                .request(Method::GET, url)
                .header(reqwest::header::RANGE, "bytes=0-0")
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    total = resp
                        .headers()
                        .get(reqwest::header::CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.rsplit('/').next())
                        .and_then(|v| v.parse().ok());
                    if resp.status() == reqwest::StatusCode::PARTIAL_CONTENT {
                        accept_ranges = true;
                    }
                }
                Ok(resp) => debug!("probe GET 0-0 {} returned {}", url, resp.status()),
                Err(e) => debug!("probe GET 0-0 {} failed: {}", url, e),
            }
        }

        Ok((total, accept_ranges))
    }
}

async fn fetch_segment(
    client: reqwest::Client,
    auth: Option<(String, String)>,
    url: String,
    start: u64,
    end: Option<u64>,
) -> FsResult<reqwest::Response> {
    let range = match end {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    };
    let mut builder = client.get(&url).header(reqwest::header::RANGE, range);
    if let Some((user, pass)) = auth {
        builder = builder.basic_auth(user, Some(pass));
    }
    let resp = builder.send().await?;
    match resp.status().as_u16() {
        200 | 206 => Ok(resp),
        404 => Err(FsError::NotFound(url)),
        status => Err(FsError::upstream(status, format!("segment GET {}", url))),
    }
}

#[async_trait]
impl StorageBackend for WebDavBackend {
    fn resolve_root(&self, sub_path: Option<&str>) -> String {
        match sub_path.filter(|s| !s.is_empty()) {
            Some(sub) => format!("{}{}/", self.base_url, sub.trim_matches('/')),
            None => self.base_url.clone(),
        }
    }

    async fn list_dir(
        &self,
        root: &str,
        rel: &str,
        opts: &ListOptions,
    ) -> FsResult<(Vec<DirEntry>, usize)> {
        let url = {
            let u = self.build_url(root, rel);
            if u.ends_with('/') {
                u
            } else {
                format!("{}/", u)
            }
        };
        let resources = self.propfind(&url, "1").await?;

        let base_path = url::Url::parse(&url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string());
        let base_path = if base_path.ends_with('/') {
            base_path
        } else {
            format!("{}/", base_path)
        };

        let mut entries: Vec<DirEntry> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for res in resources {
            let href_path = url::Url::parse(&res.href)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| res.href.clone());
            let Some(tail) = href_path.strip_prefix(&base_path) else {
                continue;
            };
            let tail = tail.trim_matches('/');
            if tail.is_empty() {
                // The listed collection itself.
                continue;
            }
            let name = urlencoding::decode(tail.split('/').next().unwrap_or(tail))
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| tail.to_string());
            if name.is_empty() || !seen.insert(name.clone()) {
                continue;
            }
            if res.is_collection {
                entries.push(DirEntry::dir(name, res.mtime));
            } else {
                entries.push(DirEntry::file(name, res.content_length.unwrap_or(0), res.mtime));
            }
        }

        let total = entries.len();
        sort_entries(&mut entries, opts);
        Ok((paginate(entries, opts), total))
    }

    async fn read_file(&self, root: &str, rel: &str) -> FsResult<Vec<u8>> {
        let url = self.build_url(root, rel);
        let resp = self.request(Method::GET, &url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(rel.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FsError::upstream(
                resp.status().as_u16(),
                format!("GET {} failed", url),
            ));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write_file(&self, root: &str, rel: &str, data: Bytes) -> FsResult<()> {
        let url = self.build_url(root, rel);
        let resp = self
            .request(Method::PUT, &url)
            .body(data.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FsError::upstream(
                resp.status().as_u16(),
                format!("PUT {} failed", url),
            ));
        }
        debug!("wrote {} bytes to {}", data.len(), url);
        Ok(())
    }

    async fn write_file_stream(&self, root: &str, rel: &str, data: ByteStream) -> FsResult<u64> {
        let url = self.build_url(root, rel);
        // Count bytes as they flow through so the caller gets a size even
        // though the body is forwarded untouched.
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let counting = {
            let counter = counter.clone();
            data.inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    counter.fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::Relaxed);
                }
            })
        };
        let resp = self
            .request(Method::PUT, &url)
            .body(reqwest::Body::wrap_stream(counting))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FsError::upstream(
                resp.status().as_u16(),
                format!("PUT {} failed", url),
            ));
        }
        Ok(counter.load(std::sync::atomic::Ordering::Relaxed))
    }

    async fn mkdir(&self, root: &str, rel: &str) -> FsResult<()> {
        let url = format!("{}/", self.build_url(root, rel).trim_end_matches('/'));
        let resp = self
            .request(Method::from_bytes(b"MKCOL").unwrap(), &url)
            .send()
            .await?;
        // 405 means the collection already exists, which we treat as done.
        match resp.status().as_u16() {
            201 | 405 => Ok(()),
            status => Err(FsError::upstream(status, format!("MKCOL {} failed", url))),
        }
    }

    async fn delete(&self, root: &str, rel: &str) -> FsResult<()> {
        let url = self.build_url(root, rel);
        let resp = self.request(Method::DELETE, &url).send().await?;
        match resp.status().as_u16() {
            200 | 204 | 404 => Ok(()),
            status => Err(FsError::upstream(status, format!("DELETE {} failed", url))),
        }
    }

    async fn stat_file(&self, root: &str, rel: &str) -> FsResult<FileMeta> {
        let url = self.build_url(root, rel);
        let resources = self.propfind(&url, "0").await.map_err(|e| match e {
            FsError::NotFound(_) => FsError::NotFound(rel.to_string()),
            other => other,
        })?;
        let res = resources
            .into_iter()
            .next()
            .ok_or_else(|| FsError::NotFound(rel.to_string()))?;
        let name = if res.display_name.is_empty() {
            rel.rsplit('/').next().unwrap_or(rel).to_string()
        } else {
            res.display_name
        };
        Ok(FileMeta {
            name,
            is_dir: res.is_collection,
            size: if res.is_collection {
                0
            } else {
                res.content_length.unwrap_or(0)
            },
            mtime: res.mtime,
            kind: if res.is_collection {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            extra: Some(json!({ "url": url })),
        })
    }

    async fn exists(&self, root: &str, rel: &str) -> FsResult<bool> {
        let url = self.build_url(root, rel);
        match self.request(Method::HEAD, &url).send().await {
            Ok(resp) => Ok(matches!(resp.status().as_u16(), 200 | 204)),
            Err(_) => Ok(false),
        }
    }

    async fn move_path(&self, root: &str, src_rel: &str, dst_rel: &str) -> FsResult<()> {
        let src_url = self.build_url(root, src_rel);
        let dst_url = self.build_url(root, dst_rel);
        let resp = self
            .request(Method::from_bytes(b"MOVE").unwrap(), &src_url)
            .header("Destination", &dst_url)
            .send()
            .await?;
        match resp.status().as_u16() {
            404 => Err(FsError::NotFound(src_rel.to_string())),
            status if (200..300).contains(&status) => Ok(()),
            status => Err(FsError::upstream(status, format!("MOVE {} failed", src_url))),
        }
    }

    async fn copy(
        &self,
        root: &str,
        src_rel: &str,
        dst_rel: &str,
        overwrite: bool,
    ) -> FsResult<()> {
        let src_url = self.build_url(root, src_rel);
        let dst_url = self.build_url(root, dst_rel);
        let resp = self
            .request(Method::from_bytes(b"COPY").unwrap(), &src_url)
            .header("Destination", &dst_url)
            .header("Overwrite", if overwrite { "T" } else { "F" })
            .send()
            .await?;
        match resp.status().as_u16() {
            412 => Err(FsError::AlreadyExists(dst_rel.to_string())),
            404 => Err(FsError::NotFound(src_rel.to_string())),
            status if (200..300).contains(&status) => Ok(()),
            status => Err(FsError::upstream(status, format!("COPY {} failed", src_url))),
        }
    }

    async fn stream_file(
        &self,
        root: &str,
        rel: &str,
        range: Option<ByteRange>,
    ) -> FsResult<StreamBody> {
        let url = self.build_url(root, rel);
        let content_type = guess_mime(rel);
        let (total, accept_ranges) = self.probe_size(&url).await.map_err(|e| match e {
            FsError::NotFound(_) => FsError::NotFound(rel.to_string()),
            other => other,
        })?;

        let client_start = range.map_or(0, |r| r.start);
        let mut client_end = range.and_then(|r| r.end);
        if let Some(total) = total {
            if client_start >= total {
                return Err(FsError::RangeNotSatisfiable);
            }
            client_end = Some(client_end.map_or(total - 1, |e| e.min(total - 1)));
        }
        if let Some(end) = client_end {
            if end < client_start {
                return Err(FsError::RangeNotSatisfiable);
            }
        }

        // No client range and an upstream that will not serve ranges:
        // pass the whole body straight through.
        if range.is_none() && !accept_ranges {
            let resp = self.request(Method::GET, &url).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(FsError::NotFound(rel.to_string()));
            }
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let upstream_ct = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(&content_type)
                .to_string();
            let headers = range_headers(&upstream_ct, StatusCode::OK, 0, 0, total);
            let body = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| std::io::Error::other(e)))
                .boxed();
            return Ok(StreamBody::new(status, headers, body));
        }

        let status = if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        let headers = range_headers(
            &content_type,
            status,
            client_start,
            client_end.unwrap_or(client_start),
            total,
        );

        let auth = self
            .username
            .clone()
            .map(|user| (user, self.password.clone()));
        let client = self.client.clone();

        // The first upstream segment is opened before the response exists so
        // a dead upstream surfaces as 502 instead of an empty body.
        let first_seg_end = Some(match client_end {
            Some(end) => end.min(client_start + SEGMENT_SIZE - 1),
            None => client_start + SEGMENT_SIZE - 1,
        });
        let mut first = None;
        let mut last_err = None;
        for _ in 0..MAX_RETRY_PER_SEGMENT {
            match fetch_segment(
                client.clone(),
                auth.clone(),
                url.clone(),
                client_start,
                first_seg_end,
            )
            .await
            {
                Ok(resp) => {
                    first = Some(resp);
                    break;
                }
                Err(FsError::NotFound(_)) => return Err(FsError::NotFound(rel.to_string())),
                Err(e) => last_err = Some(e),
            }
        }
        let first = match first {
            Some(resp) => resp,
            None => {
                return Err(FsError::upstream(
                    502,
                    format!(
                        "upstream failed before first byte: {}",
                        last_err.map(|e| e.to_string()).unwrap_or_default()
                    ),
                ))
            }
        };

        let rel_owned = rel.to_string();
        let body = stream! {
            let mut current = client_start;
            let mut seg_end = first_seg_end;
            let mut resp = Some(first);

            'segments: loop {
                // Connect errors and mid-body read errors share one attempt
                // budget per segment. A retried read re-requests the window
                // from `current`, past the bytes the client already has.
                let mut attempt = 0;
                let mut drained = false;
                while !drained {
                    let seg_resp = match resp.take() {
                        Some(resp) => resp,
                        None => {
                            attempt += 1;
                            match fetch_segment(client.clone(), auth.clone(), url.clone(), current, seg_end).await {
                                Ok(resp) => resp,
                                Err(e) if attempt < MAX_RETRY_PER_SEGMENT => {
                                    warn!("segment {}-{:?} of {} failed (attempt {}): {}", current, seg_end, rel_owned, attempt, e);
                                    continue;
                                }
                                Err(e) => {
                                    warn!("aborting stream of {} at {}: {}", rel_owned, current, e);
                                    break 'segments;
                                }
                            }
                        }
                    };

                    let mut upstream = seg_resp.bytes_stream();
                    let mut read_err = false;
                    while let Some(chunk) = upstream.next().await {
                        match chunk {
                            Ok(chunk) if chunk.is_empty() => {}
                            Ok(chunk) => {
                                current += chunk.len() as u64;
                                yield Ok(chunk);
                            }
                            Err(e) => {
                                warn!("stream error for {} at {} (attempt {}): {}", rel_owned, current, attempt, e);
                                read_err = true;
                                break;
                            }
                        }
                    }
                    if !read_err {
                        drained = true;
                    } else if attempt >= MAX_RETRY_PER_SEGMENT {
                        warn!("aborting stream of {} at {}", rel_owned, current);
                        break 'segments;
                    }
                }

                let next_start = match seg_end {
                    Some(end) => end + 1,
                    None => current,
                };
                if let Some(end) = client_end {
                    if next_start > end {
                        break;
                    }
                }
                if seg_end.is_none() {
                    // Open-ended upstream finished the body in one response.
                    break;
                }
                current = next_start;
                seg_end = Some(match client_end {
                    Some(end) => end.min(current + SEGMENT_SIZE - 1),
                    None => current + SEGMENT_SIZE - 1,
                });
            }
        };

        Ok(StreamBody::new(status, headers, Box::pin(body)))
    }
}
