use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::warn;

use super::{
    guess_mime, range_headers, ByteRange, ListOptions, StorageBackend, StreamBody,
};
use crate::errors::{FsError, FsResult};
use crate::models::{ConfigField, DirEntry, EntryKind, FieldType, FileMeta, StorageAdapter};

const BOT_API_BASE: &str = "https://api.telegram.org";
const LIST_LIMIT: usize = 50;

pub fn config_schema() -> Vec<ConfigField> {
    vec![
        ConfigField::required("bot_token", "Bot token", FieldType::Password)
            .with_placeholder("from @BotFather"),
        ConfigField::required("chat_id", "Chat ID", FieldType::String)
            .with_placeholder("channel or group id, e.g. -100123456789"),
    ]
}

pub fn factory(record: &StorageAdapter) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(TelegramBackend::new(record)?))
}

#[derive(Debug, Clone)]
struct Attachment {
    message_id: i64,
    file_id: String,
    file_name: String,
    size: u64,
    mtime: i64,
}

impl Attachment {
    fn entry_name(&self) -> String {
        format!("{}_{}", self.message_id, self.file_name)
    }
}

/// Read-only backend over a Telegram chat. The listing is synthetic: recent
/// attachments named `<message_id>_<filename>`. Every write capability keeps
/// the `NotImplemented` default from the trait.
pub struct TelegramBackend {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
    /// message_id -> attachment, refilled on every listing.
    attachments: Mutex<HashMap<i64, Attachment>>,
}

impl TelegramBackend {
    pub fn new(record: &StorageAdapter) -> Result<Self> {
        let require = |key: &str| {
            record
                .config_str(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow::anyhow!("telegram backend requires '{}'", key))
        };
        Ok(TelegramBackend {
            bot_token: require("bot_token")?,
            chat_id: require("chat_id")?,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            attachments: Mutex::new(HashMap::new()),
        })
    }

    async fn api(&self, method: &str, params: &[(&str, String)]) -> FsResult<Value> {
        let url = format!("{}/bot{}/{}", BOT_API_BASE, self.bot_token, method);
        let resp = self.client.get(&url).query(params).send().await?;
        let status = resp.status().as_u16();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| FsError::upstream(status, format!("non-JSON bot response: {}", e)))?;
        if !body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            let description = body
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(FsError::upstream(
                status,
                format!("telegram {} failed: {}", method, description),
            ));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    fn parse_attachment(&self, update: &Value) -> Option<Attachment> {
        let message = update
            .get("channel_post")
            .or_else(|| update.get("message"))?;
        let chat_id = message.pointer("/chat/id")?;
        if chat_id.to_string() != self.chat_id
            && message.pointer("/chat/username").and_then(|v| v.as_str())
                != Some(self.chat_id.trim_start_matches('@'))
        {
            return None;
        }
        let media = message.get("document").or_else(|| message.get("video"))?;
        let file_name = media
            .get("file_name")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();
        Some(Attachment {
            message_id: message.get("message_id")?.as_i64()?,
            file_id: media.get("file_id")?.as_str()?.to_string(),
            file_name,
            size: media.get("file_size").and_then(|v| v.as_u64()).unwrap_or(0),
            mtime: message.get("date").and_then(|v| v.as_i64()).unwrap_or(0),
        })
    }

    /// Fetch recent updates for the chat and refresh the attachment cache.
    async fn recent_attachments(&self) -> FsResult<Vec<Attachment>> {
        let result = self
            .api("getUpdates", &[("limit", "100".to_string())])
            .await?;
        let mut items: Vec<Attachment> = result
            .as_array()
            .map(|updates| {
                updates
                    .iter()
                    .filter_map(|u| self.parse_attachment(u))
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by_key(|a| std::cmp::Reverse(a.message_id));
        items.truncate(LIST_LIMIT);

        let mut cache = self.attachments.lock().unwrap();
        for item in &items {
            cache.insert(item.message_id, item.clone());
        }
        Ok(items)
    }

    /// `rel` is `<message_id>_<filename>`; resolve it to a cached attachment,
    /// refreshing the listing once on a miss.
    async fn locate(&self, rel: &str) -> FsResult<Attachment> {
        let message_id: i64 = rel
            .split('_')
            .next()
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| FsError::InvalidArgument(format!("invalid file path: {}", rel)))?;
        if let Some(found) = self.attachments.lock().unwrap().get(&message_id) {
            return Ok(found.clone());
        }
        self.recent_attachments().await?;
        self.attachments
            .lock()
            .unwrap()
            .get(&message_id)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("no attachment for message {}", message_id)))
    }

    /// Resolve a file_id to the bot-file download URL.
    async fn download_url(&self, file_id: &str) -> FsResult<String> {
        let result = self
            .api("getFile", &[("file_id", file_id.to_string())])
            .await?;
        let file_path = result
            .get("file_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FsError::upstream(502, "getFile returned no file_path"))?;
        Ok(format!(
            "{}/file/bot{}/{}",
            BOT_API_BASE, self.bot_token, file_path
        ))
    }
}

#[async_trait]
impl StorageBackend for TelegramBackend {
    fn resolve_root(&self, _sub_path: Option<&str>) -> String {
        String::new()
    }

    async fn list_dir(
        &self,
        _root: &str,
        rel: &str,
        _opts: &ListOptions,
    ) -> FsResult<(Vec<DirEntry>, usize)> {
        // Single flat synthetic directory; subpaths do not exist.
        if !rel.trim_matches('/').is_empty() {
            return Ok((Vec::new(), 0));
        }
        let attachments = self.recent_attachments().await?;
        let entries: Vec<DirEntry> = attachments
            .iter()
            .map(|a| DirEntry::file(a.entry_name(), a.size, a.mtime))
            .collect();
        let total = entries.len();
        Ok((entries, total))
    }

    async fn read_file(&self, _root: &str, rel: &str) -> FsResult<Vec<u8>> {
        let attachment = self.locate(rel).await?;
        let url = self.download_url(&attachment.file_id).await?;
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FsError::NotFound(rel.to_string()));
        }
        if !resp.status().is_success() {
            return Err(FsError::upstream(
                resp.status().as_u16(),
                "telegram file download failed",
            ));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn stat_file(&self, _root: &str, rel: &str) -> FsResult<FileMeta> {
        let attachment = self.locate(rel).await?;
        Ok(FileMeta {
            name: attachment.entry_name(),
            is_dir: false,
            size: attachment.size,
            mtime: attachment.mtime,
            kind: EntryKind::File,
            extra: None,
        })
    }

    async fn stream_file(
        &self,
        _root: &str,
        rel: &str,
        range: Option<ByteRange>,
    ) -> FsResult<StreamBody> {
        let attachment = self.locate(rel).await?;
        let url = self.download_url(&attachment.file_id).await?;
        let size = attachment.size;
        let content_type = guess_mime(&attachment.file_name);

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
        let ranged = status == StatusCode::PARTIAL_CONTENT;
        let body = stream! {
            let mut builder = client.get(&url);
            if ranged {
                builder = builder.header(
                    reqwest::header::RANGE,
                    format!("bytes={}-{}", start, end),
                );
            }
            let resp = match builder.send().await {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    warn!("telegram download returned {}", resp.status());
                    yield Err(std::io::Error::other("telegram download failed"));
                    return;
                }
                Err(e) => {
                    warn!("telegram download failed: {}", e);
                    yield Err(std::io::Error::other(e));
                    return;
                }
            };

            // The file endpoint may ignore Range; enforce the window here.
            let limit = end - start + 1;
            let mut skipped: u64 = 0;
            let mut sent: u64 = 0;
            let honored_range = !ranged
                || resp.status() == reqwest::StatusCode::PARTIAL_CONTENT;
            let mut upstream_body = resp.bytes_stream();
            while let Some(chunk) = upstream_body.next().await {
                let mut chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("telegram stream error: {}", e);
                        yield Err(std::io::Error::other(e));
                        return;
                    }
                };
                if !honored_range && skipped < start {
                    let skip = ((start - skipped) as usize).min(chunk.len());
                    skipped += skip as u64;
                    chunk = chunk.slice(skip..);
                    if chunk.is_empty() {
                        continue;
                    }
                }
                let remaining = limit - sent;
                if (chunk.len() as u64) > remaining {
                    chunk = chunk.slice(..remaining as usize);
                }
                sent += chunk.len() as u64;
                yield Ok(chunk);
                if sent >= limit {
                    break;
                }
            }
        };

        Ok(StreamBody::new(status, headers, Box::pin(body)))
    }
}
