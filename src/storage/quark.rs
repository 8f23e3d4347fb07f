use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use axum::http::StatusCode;
use base64::Engine;
use bytes::Bytes;
use futures_util::StreamExt;
use md5::Md5;
use reqwest::Method;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{
    guess_mime, paginate, range_headers, sort_entries, ByteRange, ByteStream, ListOptions,
    StorageBackend, StreamBody,
};
use crate::errors::{FsError, FsResult};
use crate::models::{ConfigField, DirEntry, EntryKind, FieldType, FileMeta, PathProbe,
    StorageAdapter};

const API_BASE: &str = "https://drive.quark.cn/1/clouddrive";
const REFERER: &str = "https://pan.quark.cn";
const PR: &str = "ucpro";

const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) quark-cloud-drive/2.5.20 Chrome/100.0.4896.160 \
Electron/18.3.5.4-b478491100 Safari/537.36 Channel/pckk_other_ch";
const OSS_UA: &str = "aliyun-sdk-js/6.6.1 Chrome 98.0.4758.80 on Windows 10 64-bit";

pub fn config_schema() -> Vec<ConfigField> {
    vec![
        ConfigField::required("cookie", "Cookie", FieldType::Password)
            .with_placeholder("copied from pan.quark.cn"),
        ConfigField::optional("root_fid", "Root FID", FieldType::String)
            .with_default(json!("0")),
        ConfigField::optional("settle_ms", "Upload settle delay (ms)", FieldType::Number)
            .with_default(json!(1000)),
    ]
}

pub fn factory(record: &StorageAdapter) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(QuarkBackend::new(record)?))
}

#[derive(Debug, Clone)]
struct QuarkItem {
    fid: String,
    name: String,
    is_dir: bool,
    size: u64,
    mtime: i64,
}

impl QuarkItem {
    fn entry(&self) -> DirEntry {
        if self.is_dir {
            DirEntry::dir(self.name.clone(), self.mtime)
        } else {
            DirEntry::file(self.name.clone(), self.size, self.mtime)
        }
    }
}

/// Quark cloud-drive backend, authenticated with a browser cookie. The drive
/// addresses everything by fid; relative paths are resolved by walking
/// directory listings, with two caches: `(base_fid, rel) -> fid` and
/// `parent_fid -> children`. Every mutation invalidates the parent listing.
pub struct QuarkBackend {
    cookie: RwLock<String>,
    root_fid: String,
    settle_ms: u64,
    client: reqwest::Client,
    dir_fid_cache: Mutex<HashMap<String, String>>,
    children_cache: Mutex<HashMap<String, Vec<QuarkItem>>>,
}

impl QuarkBackend {
    pub fn new(record: &StorageAdapter) -> Result<Self> {
        let cookie = record
            .config_str("cookie")
            .map(|c| sanitize_cookie(&c))
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("quark backend requires 'cookie'"))?;
        let root_fid = record
            .config_str("root_fid")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "0".to_string());
        Ok(QuarkBackend {
            cookie: RwLock::new(cookie),
            root_fid: root_fid.clone(),
            settle_ms: record.config_u64("settle_ms").unwrap_or(1000),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            dir_fid_cache: Mutex::new(HashMap::from([(format!("{}:", root_fid), root_fid)])),
            children_cache: Mutex::new(HashMap::new()),
        })
    }

    fn current_cookie(&self) -> String {
        self.cookie.read().unwrap().clone()
    }

    /// Fold a refreshed auth cookie value back into the live cookie string.
    fn set_cookie_kv(&self, key: &str, value: &str) {
        let mut cookie = self.cookie.write().unwrap();
        let mut parts: Vec<String> = cookie
            .split(';')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let mut found = false;
        for part in parts.iter_mut() {
            if part.starts_with(&format!("{}=", key)) {
                *part = format!("{}={}", key, value);
                found = true;
                break;
            }
        }
        if !found {
            parts.push(format!("{}={}", key, value));
        }
        *cookie = parts.join("; ");
    }

    fn absorb_response_cookies(&self, resp: &reqwest::Response) {
        for header in resp.headers().get_all(reqwest::header::SET_COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else { continue };
            let Some((key, value)) = pair.split_once('=') else { continue };
            let key = key.trim();
            if key == "__puus" || key == "__pus" {
                self.set_cookie_kv(key, value.trim());
            }
        }
    }

    async fn api(
        &self,
        method: Method,
        pathname: &str,
        body: Option<Value>,
        params: &[(&str, &str)],
    ) -> FsResult<Value> {
        let url = format!("{}{}", API_BASE, pathname);
        let mut query: Vec<(&str, &str)> = vec![("pr", PR), ("fr", "pc")];
        query.extend_from_slice(params);

        let mut builder = self
            .client
            .request(method, &url)
            .header(reqwest::header::COOKIE, self.current_cookie())
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .header(reqwest::header::REFERER, REFERER)
            .header(reqwest::header::USER_AGENT, DESKTOP_UA)
            .query(&query);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let resp = builder.send().await?;
        self.absorb_response_cookies(&resp);

        let http_status = resp.status().as_u16();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| FsError::upstream(http_status, format!("non-JSON quark response: {}", e)))?;

        let status = data.get("status").and_then(|v| v.as_i64());
        let code = data.get("code").and_then(|v| v.as_i64());
        if status.map(|s| s >= 400).unwrap_or(false) || code.map(|c| c != 0).unwrap_or(false) {
            let msg = data
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            return Err(FsError::upstream(
                502,
                format!("quark error status={:?} code={:?} msg={}", status, code, msg),
            ));
        }
        Ok(data)
    }

    fn map_item(item: &Value) -> Option<QuarkItem> {
        // file=true means file, false means directory.
        let is_dir = !item.get("file").and_then(|v| v.as_bool()).unwrap_or(false);
        let name = item
            .get("file_name")
            .or_else(|| item.get("filename"))
            .or_else(|| item.get("name"))
            .and_then(|v| v.as_str())?
            .to_string();
        let updated_ms = item.get("updated_at").and_then(|v| v.as_i64()).unwrap_or(0);
        Some(QuarkItem {
            fid: item.get("fid").and_then(|v| v.as_str())?.to_string(),
            name,
            is_dir,
            size: if is_dir {
                0
            } else {
                item.get("size").and_then(|v| v.as_u64()).unwrap_or(0)
            },
            mtime: if updated_ms > 0 { updated_ms / 1000 } else { 0 },
        })
    }

    async fn list_children(&self, parent_fid: &str) -> FsResult<Vec<QuarkItem>> {
        if let Some(children) = self.children_cache.lock().unwrap().get(parent_fid) {
            return Ok(children.clone());
        }

        let mut items: Vec<QuarkItem> = Vec::new();
        let mut page: u64 = 1;
        let size: u64 = 100;
        loop {
            let page_s = page.to_string();
            let size_s = size.to_string();
            let data = self
                .api(
                    Method::GET,
                    "/file/sort",
                    None,
                    &[
                        ("pdir_fid", parent_fid),
                        ("_size", &size_s),
                        ("_page", &page_s),
                        ("_fetch_total", "1"),
                    ],
                )
                .await?;
            let list = data
                .pointer("/data/list")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            items.extend(list.iter().filter_map(Self::map_item));
            let total = data
                .pointer("/metadata/_total")
                .or_else(|| data.pointer("/metadata/total"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if page * size >= total {
                break;
            }
            page += 1;
        }

        self.children_cache
            .lock()
            .unwrap()
            .insert(parent_fid.to_string(), items.clone());
        Ok(items)
    }

    fn dir_cache_key(&self, base_fid: &str, rel: &str) -> String {
        format!("{}:{}", base_fid, rel.trim_matches('/'))
    }

    async fn resolve_dir_fid(&self, base_fid: &str, rel: &str) -> FsResult<String> {
        let rel = rel.trim_matches('/');
        let cache_key = self.dir_cache_key(base_fid, rel);
        if let Some(fid) = self.dir_fid_cache.lock().unwrap().get(&cache_key) {
            return Ok(fid.clone());
        }
        if rel.is_empty() {
            return Ok(base_fid.to_string());
        }

        let mut parent_fid = base_fid.to_string();
        let mut walked: Vec<&str> = Vec::new();
        for segment in rel.split('/').filter(|s| !s.is_empty()) {
            walked.push(segment);
            let key = self.dir_cache_key(base_fid, &walked.join("/"));
            let cached = self.dir_fid_cache.lock().unwrap().get(&key).cloned();
            if let Some(fid) = cached {
                parent_fid = fid;
                continue;
            }
            let children = self.list_children(&parent_fid).await?;
            let found = children
                .iter()
                .find(|c| c.is_dir && c.name == segment)
                .ok_or_else(|| FsError::NotFound(format!("directory not found: {}", segment)))?;
            parent_fid = found.fid.clone();
            self.dir_fid_cache
                .lock()
                .unwrap()
                .insert(key, parent_fid.clone());
        }
        Ok(parent_fid)
    }

    async fn find_child(&self, parent_fid: &str, name: &str) -> FsResult<Option<QuarkItem>> {
        let children = self.list_children(parent_fid).await?;
        Ok(children.into_iter().find(|c| c.name == name))
    }

    fn invalidate_children(&self, parent_fid: &str) {
        self.children_cache.lock().unwrap().remove(parent_fid);
    }

    async fn locate_file(&self, root: &str, rel: &str) -> FsResult<QuarkItem> {
        if rel.is_empty() || rel.ends_with('/') {
            return Err(FsError::IsADirectory(rel.to_string()));
        }
        let base_fid = if root.is_empty() { &self.root_fid } else { root };
        let (parent_rel, name) = split_rel(rel);
        let parent_fid = self.resolve_dir_fid(base_fid, parent_rel).await?;
        let item = self
            .find_child(&parent_fid, name)
            .await?
            .filter(|item| !item.is_dir)
            .ok_or_else(|| FsError::NotFound(rel.to_string()))?;
        Ok(item)
    }

    async fn download_url(&self, fid: &str) -> FsResult<String> {
        let data = self
            .api(
                Method::POST,
                "/file/download",
                Some(json!({ "fids": [fid] })),
                &[],
            )
            .await?;
        data.pointer("/data/0/download_url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| FsError::upstream(502, "quark returned no download_url"))
    }

    fn download_headers(&self) -> Vec<(reqwest::header::HeaderName, String)> {
        vec![
            (reqwest::header::COOKIE, self.current_cookie()),
            (reqwest::header::USER_AGENT, DESKTOP_UA.to_string()),
            (reqwest::header::REFERER, REFERER.to_string()),
        ]
    }

    /// Ask the drive to sign one OSS request; returns the Authorization value.
    async fn upload_auth(&self, pre: &Value, auth_meta: &str) -> FsResult<String> {
        let body = json!({
            "auth_info": pre.pointer("/data/auth_info").cloned().unwrap_or(Value::Null),
            "auth_meta": auth_meta,
            "task_id": pre.pointer("/data/task_id").cloned().unwrap_or(Value::Null),
        });
        let resp = self
            .api(Method::POST, "/file/upload/auth", Some(body), &[])
            .await?;
        resp.pointer("/data/auth_key")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| FsError::upstream(502, "upload/auth missing auth_key"))
    }
}

fn sanitize_cookie(cookie: &str) -> String {
    cookie
        .replace(['\r', '\n'], "")
        .split(';')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .collect()
}

fn split_rel(rel: &str) -> (&str, &str) {
    let trimmed = rel.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}

fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[async_trait]
impl StorageBackend for QuarkBackend {
    fn resolve_root(&self, _sub_path: Option<&str>) -> String {
        self.root_fid.clone()
    }

    async fn list_dir(
        &self,
        root: &str,
        rel: &str,
        opts: &ListOptions,
    ) -> FsResult<(Vec<DirEntry>, usize)> {
        let base_fid = if root.is_empty() { &self.root_fid } else { root };
        let fid = self.resolve_dir_fid(base_fid, rel).await?;
        let items = self.list_children(&fid).await?;
        let mut entries: Vec<DirEntry> = items.iter().map(QuarkItem::entry).collect();
        let total = entries.len();
        sort_entries(&mut entries, opts);
        Ok((paginate(entries, opts), total))
    }

    async fn read_file(&self, root: &str, rel: &str) -> FsResult<Vec<u8>> {
        let item = self.locate_file(root, rel).await?;
        let url = self.download_url(&item.fid).await?;
        let mut builder = self.client.get(&url);
        for (name, value) in self.download_headers() {
            builder = builder.header(name, value);
        }
        let resp = builder.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(rel.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FsError::upstream(resp.status().as_u16(), "quark download failed"));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn stream_file(
        &self,
        root: &str,
        rel: &str,
        range: Option<ByteRange>,
    ) -> FsResult<StreamBody> {
        let item = self.locate_file(root, rel).await?;
        let url = self.download_url(&item.fid).await?;
        let size = item.size;
        let content_type = guess_mime(rel);

        let (status, start, end) = match range {
            Some(range) => {
                let (start, end) = range.clamp(size)?;
                (StatusCode::PARTIAL_CONTENT, start, end)
            }
            None if size == 0 => (StatusCode::OK, 0, 0),
            None => (StatusCode::OK, 0, size - 1),
        };
        let headers = range_headers(&content_type, status, start, end, Some(size));

        let client = self.client.clone();
        let dl_headers = self.download_headers();
        let ranged = status == StatusCode::PARTIAL_CONTENT;
        let body = stream! {
            let mut builder = client.get(&url);
            for (name, value) in dl_headers {
                builder = builder.header(name, value);
            }
            if ranged {
                builder = builder.header(
                    reqwest::header::RANGE,
                    format!("bytes={}-{}", start, end),
                );
            }
            let resp = match builder.send().await {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    warn!("quark download returned {}", resp.status());
                    yield Err(std::io::Error::other("quark download failed"));
                    return;
                }
                Err(e) => {
                    warn!("quark download failed: {}", e);
                    yield Err(std::io::Error::other(e));
                    return;
                }
            };
            let mut upstream_body = resp.bytes_stream();
            while let Some(chunk) = upstream_body.next().await {
                match chunk {
                    Ok(chunk) => {
                        if !chunk.is_empty() {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        warn!("quark stream error: {}", e);
                        yield Err(std::io::Error::other(e));
                        return;
                    }
                }
            }
        };

        Ok(StreamBody::new(status, headers, Box::pin(body)))
    }

    async fn write_file(&self, root: &str, rel: &str, data: Bytes) -> FsResult<()> {
        let chunk: ByteStream = Box::pin(futures::stream::once(async move { Ok(data) }));
        self.write_file_stream(root, rel, chunk).await?;
        Ok(())
    }

    async fn write_file_stream(
        &self,
        root: &str,
        rel: &str,
        mut data: ByteStream,
    ) -> FsResult<u64> {
        if rel.is_empty() || rel.ends_with('/') {
            return Err(FsError::InvalidArgument("invalid file path".into()));
        }
        let base_fid = if root.is_empty() { &self.root_fid } else { root };
        let (parent_rel, name) = split_rel(rel);
        let parent_fid = self.resolve_dir_fid(base_fid, parent_rel).await?;

        // Spool the body to a temp file while hashing; the drive needs the
        // exact size up front and the OSS endpoint re-reads parts.
        let tmp_path = std::env::temp_dir().join(format!("strata-upload-{}", uuid::Uuid::new_v4()));
        let mut md5 = Md5::new();
        let mut sha1 = Sha1::new();
        let mut total: u64 = 0;
        {
            let mut tmp = tokio::fs::File::create(&tmp_path).await?;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                total += chunk.len() as u64;
                md5.update(&chunk);
                sha1.update(&chunk);
                tmp.write_all(&chunk).await?;
            }
            tmp.flush().await?;
        }
        let md5_hex = format!("{:x}", md5.finalize());
        let sha1_hex = format!("{:x}", sha1.finalize());

        let result = self
            .upload_spooled(&tmp_path, name, total, &parent_fid, &md5_hex, &sha1_hex)
            .await;
        let _ = tokio::fs::remove_file(&tmp_path).await;
        self.invalidate_children(&parent_fid);
        result?;
        Ok(total)
    }

    async fn mkdir(&self, root: &str, rel: &str) -> FsResult<()> {
        let rel = rel.trim_end_matches('/');
        if rel.is_empty() {
            return Err(FsError::InvalidArgument("cannot create the mount root".into()));
        }
        let (parent_rel, name) = split_rel(rel);
        if name.is_empty() {
            return Err(FsError::InvalidArgument("invalid directory name".into()));
        }
        let base_fid = if root.is_empty() { &self.root_fid } else { root };
        let parent_fid = self.resolve_dir_fid(base_fid, parent_rel).await?;
        self.api(
            Method::POST,
            "/file",
            Some(json!({
                "dir_init_lock": false,
                "dir_path": "",
                "file_name": name,
                "pdir_fid": parent_fid,
            })),
            &[],
        )
        .await?;
        self.invalidate_children(&parent_fid);
        Ok(())
    }

    async fn delete(&self, root: &str, rel: &str) -> FsResult<()> {
        let base_fid = if root.is_empty() { &self.root_fid } else { root };
        let (target_fid, parent_fid) = if rel.is_empty() || rel.ends_with('/') {
            let dir_rel = rel.trim_end_matches('/');
            let target = self.resolve_dir_fid(base_fid, dir_rel).await?;
            let (parent_rel, _) = split_rel(dir_rel);
            (target, self.resolve_dir_fid(base_fid, parent_rel).await?)
        } else {
            let (parent_rel, name) = split_rel(rel);
            let parent_fid = self.resolve_dir_fid(base_fid, parent_rel).await?;
            match self.find_child(&parent_fid, name).await? {
                Some(item) => (item.fid, parent_fid),
                None => return Ok(()),
            }
        };
        self.api(
            Method::POST,
            "/file/delete",
            Some(json!({
                "action_type": 1,
                "exclude_fids": [],
                "filelist": [target_fid],
            })),
            &[],
        )
        .await?;
        self.invalidate_children(&parent_fid);
        Ok(())
    }

    async fn move_path(&self, root: &str, src_rel: &str, dst_rel: &str) -> FsResult<()> {
        let base_fid = if root.is_empty() { &self.root_fid } else { root };
        let (src_parent_rel, src_name) = split_rel(src_rel);
        let (dst_parent_rel, dst_name) = split_rel(dst_rel);

        let src_parent_fid = self.resolve_dir_fid(base_fid, src_parent_rel).await?;
        let item = self
            .find_child(&src_parent_fid, src_name)
            .await?
            .ok_or_else(|| FsError::NotFound(src_rel.to_string()))?;
        let dst_parent_fid = self.resolve_dir_fid(base_fid, dst_parent_rel).await?;

        if src_parent_fid != dst_parent_fid {
            self.api(
                Method::POST,
                "/file/move",
                Some(json!({
                    "action_type": 1,
                    "exclude_fids": [],
                    "filelist": [item.fid],
                    "to_pdir_fid": dst_parent_fid,
                })),
                &[],
            )
            .await?;
            self.invalidate_children(&src_parent_fid);
            self.invalidate_children(&dst_parent_fid);
        }
        if item.name != dst_name {
            self.api(
                Method::POST,
                "/file/rename",
                Some(json!({ "fid": item.fid, "file_name": dst_name })),
                &[],
            )
            .await?;
            self.invalidate_children(&dst_parent_fid);
        }
        Ok(())
    }

    async fn rename(&self, root: &str, src_rel: &str, dst_rel: &str) -> FsResult<()> {
        let base_fid = if root.is_empty() { &self.root_fid } else { root };
        let (src_parent_rel, src_name) = split_rel(src_rel);
        let src_parent_fid = self.resolve_dir_fid(base_fid, src_parent_rel).await?;
        let item = self
            .find_child(&src_parent_fid, src_name)
            .await?
            .ok_or_else(|| FsError::NotFound(src_rel.to_string()))?;
        let dst_name = dst_rel.rsplit('/').next().unwrap_or(dst_rel);
        self.api(
            Method::POST,
            "/file/rename",
            Some(json!({ "fid": item.fid, "file_name": dst_name })),
            &[],
        )
        .await?;
        self.invalidate_children(&src_parent_fid);
        Ok(())
    }

    async fn stat_file(&self, root: &str, rel: &str) -> FsResult<FileMeta> {
        let base_fid = if root.is_empty() { &self.root_fid } else { root };
        if rel.is_empty() || rel.ends_with('/') {
            let dir_rel = rel.trim_end_matches('/');
            let fid = self.resolve_dir_fid(base_fid, dir_rel).await?;
            return Ok(FileMeta {
                name: dir_rel.rsplit('/').next().unwrap_or("").to_string(),
                is_dir: true,
                size: 0,
                mtime: 0,
                kind: EntryKind::Dir,
                extra: Some(json!({ "fid": fid })),
            });
        }
        let (parent_rel, name) = split_rel(rel);
        let parent_fid = self.resolve_dir_fid(base_fid, parent_rel).await?;
        let item = self
            .find_child(&parent_fid, name)
            .await?
            .ok_or_else(|| FsError::NotFound(rel.to_string()))?;
        Ok(FileMeta {
            name: item.name.clone(),
            is_dir: item.is_dir,
            size: item.size,
            mtime: item.mtime,
            kind: if item.is_dir { EntryKind::Dir } else { EntryKind::File },
            extra: Some(json!({ "fid": item.fid })),
        })
    }

    async fn exists(&self, root: &str, rel: &str) -> FsResult<bool> {
        match self.stat_file(root, rel).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn stat_path(&self, root: &str, rel: &str) -> FsResult<PathProbe> {
        match self.stat_file(root, rel).await {
            Ok(meta) => Ok(PathProbe {
                exists: true,
                is_dir: Some(meta.is_dir),
                detail: meta
                    .extra
                    .as_ref()
                    .and_then(|e| e.get("fid"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            }),
            Err(FsError::NotFound(_)) => Ok(PathProbe::missing()),
            Err(e) => Err(e),
        }
    }
}

impl QuarkBackend {
    async fn upload_spooled(
        &self,
        tmp_path: &std::path::Path,
        name: &str,
        total: u64,
        parent_fid: &str,
        md5_hex: &str,
        sha1_hex: &str,
    ) -> FsResult<()> {
        let mime = guess_mime(name);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let pre = self
            .api(
                Method::POST,
                "/file/upload/pre",
                Some(json!({
                    "ccp_hash_update": true,
                    "dir_name": "",
                    "file_name": name,
                    "format_type": mime,
                    "l_created_at": now_ms,
                    "l_updated_at": now_ms,
                    "pdir_fid": parent_fid,
                    "size": total,
                })),
                &[],
            )
            .await?;

        // Server-side hash check: a known file completes instantly.
        let hash_resp = self
            .api(
                Method::POST,
                "/file/update/hash",
                Some(json!({
                    "md5": md5_hex,
                    "sha1": sha1_hex,
                    "task_id": pre.pointer("/data/task_id").cloned().unwrap_or(Value::Null),
                })),
                &[],
            )
            .await?;
        if hash_resp
            .pointer("/data/finish")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            debug!("quark instant upload hit for {}", name);
            return Ok(());
        }

        let part_size = pre
            .pointer("/metadata/part_size")
            .and_then(|v| v.as_u64())
            .filter(|&s| s > 0)
            .ok_or_else(|| FsError::upstream(502, "invalid part_size from quark"))?;

        let field = |ptr: &str| {
            pre.pointer(ptr)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| FsError::upstream(502, format!("upload pre missing {}", ptr)))
        };
        let bucket = field("/data/bucket")?;
        let obj_key = field("/data/obj_key")?;
        let upload_id = field("/data/upload_id")?;
        let upload_url = field("/data/upload_url")?;

        let upload_host = upload_url
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(&upload_url);
        let base_url = format!("https://{}.{}/{}", bucket, upload_host, obj_key);

        // Sequential part PUTs; the drive signs each OSS request on demand.
        let mut etags: Vec<String> = Vec::new();
        let mut file = tokio::fs::File::open(tmp_path).await?;
        let mut left = total;
        let mut part_number: u64 = 1;
        while left > 0 {
            let size = part_size.min(left) as usize;
            let mut part_data = vec![0u8; size];
            file.read_exact(&mut part_data).await?;

            let now_str = http_date_now();
            let auth_meta = format!(
                "PUT\n\n{}\n{}\nx-oss-date:{}\nx-oss-user-agent:{}\n/{}/{}?partNumber={}&uploadId={}",
                mime, now_str, now_str, OSS_UA, bucket, obj_key, part_number, upload_id
            );
            let auth_key = self.upload_auth(&pre, &auth_meta).await?;

            let put_url = format!("{}?partNumber={}&uploadId={}", base_url, part_number, upload_id);
            let resp = self
                .client
                .put(&put_url)
                .header(reqwest::header::AUTHORIZATION, auth_key)
                .header(reqwest::header::CONTENT_TYPE, &mime)
                .header(reqwest::header::REFERER, format!("{}/", REFERER))
                .header("x-oss-date", &now_str)
                .header("x-oss-user-agent", OSS_UA)
                .body(part_data)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(FsError::upstream(
                    resp.status().as_u16(),
                    format!("quark part {} upload failed", part_number),
                ));
            }
            let etag = resp
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            etags.push(etag);
            left -= size as u64;
            part_number += 1;
        }

        // OSS multipart commit, again with a drive-signed Authorization.
        let parts_xml: String = etags
            .iter()
            .enumerate()
            .map(|(i, etag)| {
                format!(
                    "<Part>\n<PartNumber>{}</PartNumber>\n<ETag>{}</ETag>\n</Part>\n",
                    i + 1,
                    etag
                )
            })
            .collect();
        let body_xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<CompleteMultipartUpload>\n{}</CompleteMultipartUpload>",
            parts_xml
        );
        let content_md5 = base64::engine::general_purpose::STANDARD
            .encode(Md5::digest(body_xml.as_bytes()));
        let callback = pre.pointer("/data/callback").cloned().unwrap_or(Value::Null);
        let callback_b64 = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&callback).unwrap_or_default());

        let now_str = http_date_now();
        let auth_meta_commit = format!(
            "POST\n{}\napplication/xml\n{}\nx-oss-callback:{}\nx-oss-date:{}\nx-oss-user-agent:{}\n/{}/{}?uploadId={}",
            content_md5, now_str, callback_b64, now_str, OSS_UA, bucket, obj_key, upload_id
        );
        let auth_key = self.upload_auth(&pre, &auth_meta_commit).await?;

        let commit_url = format!("{}?uploadId={}", base_url, upload_id);
        let resp = self
            .client
            .post(&commit_url)
            .header(reqwest::header::AUTHORIZATION, auth_key)
            .header("Content-MD5", content_md5)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .header(reqwest::header::REFERER, format!("{}/", REFERER))
            .header("x-oss-callback", callback_b64)
            .header("x-oss-date", &now_str)
            .header("x-oss-user-agent", OSS_UA)
            .body(body_xml)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FsError::upstream(
                resp.status().as_u16(),
                "quark multipart commit failed",
            ));
        }

        self.api(
            Method::POST,
            "/file/upload/finish",
            Some(json!({
                "obj_key": obj_key,
                "task_id": pre.pointer("/data/task_id").cloned().unwrap_or(Value::Null),
            })),
            &[],
        )
        .await?;

        // The drive merges parts asynchronously; wait before the listing
        // caches are considered trustworthy again.
        tokio::time::sleep(Duration::from_millis(self.settle_ms)).await;
        Ok(())
    }
}
