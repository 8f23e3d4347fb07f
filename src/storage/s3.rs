use std::sync::Arc;

use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_types::region::Region as AwsRegion;
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{
    guess_mime, paginate, range_headers, sort_entries, ByteRange, ByteStream, ListOptions,
    StorageBackend, StreamBody,
};
use crate::errors::{FsError, FsResult};
use crate::models::{ConfigField, DirEntry, EntryKind, FieldType, FileMeta, StorageAdapter};

/// S3 requires every part except the last to be at least 5 MiB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub fn config_schema() -> Vec<ConfigField> {
    vec![
        ConfigField::required("bucket_name", "Bucket name", FieldType::String),
        ConfigField::required("access_key_id", "Access key ID", FieldType::String),
        ConfigField::required("secret_access_key", "Secret access key", FieldType::Password),
        ConfigField::optional("region_name", "Region", FieldType::String)
            .with_placeholder("us-east-1"),
        ConfigField::optional("endpoint_url", "Endpoint URL", FieldType::String)
            .with_placeholder("https://minio.example.com for S3-compatible stores"),
        ConfigField::optional("root", "Root path", FieldType::String)
            .with_placeholder("key prefix inside the bucket"),
    ]
}

pub fn factory(record: &StorageAdapter) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(S3Backend::new(record)?))
}

fn upstream(op: &str, err: impl std::fmt::Display) -> FsError {
    FsError::upstream(502, format!("{}: {}", op, err))
}

/// S3-compatible object-store backend. The resolved root is a key prefix;
/// "directories" exist only as common prefixes or zero-length marker keys.
pub struct S3Backend {
    client: aws_sdk_s3::Client,
    bucket: String,
    root: String,
}

impl S3Backend {
    pub fn new(record: &StorageAdapter) -> Result<Self> {
        let bucket = record
            .config_str("bucket_name")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("s3 backend requires 'bucket_name'"))?;
        let access_key = record
            .config_str("access_key_id")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("s3 backend requires 'access_key_id'"))?;
        let secret_key = record
            .config_str("secret_access_key")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("s3 backend requires 'secret_access_key'"))?;

        let credentials = Credentials::new(&access_key, &secret_key, None, None, "strata-s3");
        let region = record
            .config_str("region_name")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut builder = aws_sdk_s3::config::Builder::new()
            .region(AwsRegion::new(region))
            .credentials_provider(credentials)
            .behavior_version_latest();
        if let Some(endpoint) = record.config_str("endpoint_url").filter(|v| !v.is_empty()) {
            info!("s3 backend using custom endpoint: {}", endpoint);
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(S3Backend {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket,
            root: record
                .config_str("root")
                .map(|r| r.trim_matches('/').to_string())
                .unwrap_or_default(),
        })
    }

    fn key(&self, root: &str, rel: &str) -> String {
        let rel = rel.trim_matches('/');
        if root.is_empty() {
            rel.to_string()
        } else if rel.is_empty() {
            root.to_string()
        } else {
            format!("{}/{}", root, rel)
        }
    }

    async fn head(&self, key: &str) -> FsResult<Option<(u64, i64, Option<String>)>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => Ok(Some((
                head.content_length().unwrap_or(0).max(0) as u64,
                head.last_modified().map(|t| t.secs()).unwrap_or(0),
                head.content_type().map(|s| s.to_string()),
            ))),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(upstream("HeadObject", aws_sdk_s3::error::DisplayErrorContext(&e)))
                }
            }
        }
    }

    /// A key that 404s on HEAD may still be a "directory": any object below
    /// `key/` makes it one.
    async fn prefix_occupied(&self, key: &str) -> FsResult<bool> {
        let dir_key = format!("{}/", key.trim_end_matches('/'));
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&dir_key)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| upstream("ListObjectsV2", aws_sdk_s3::error::DisplayErrorContext(&e)))?;
        Ok(resp.key_count().unwrap_or(0) > 0)
    }

    async fn delete_prefix(&self, key: &str) -> FsResult<()> {
        let dir_key = format!("{}/", key.trim_end_matches('/'));
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&dir_key);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| upstream("ListObjectsV2", aws_sdk_s3::error::DisplayErrorContext(&e)))?;

            let objects: Vec<ObjectIdentifier> = resp
                .contents()
                .iter()
                .filter_map(|obj| obj.key())
                .filter_map(|key| ObjectIdentifier::builder().key(key).build().ok())
                .collect();
            if !objects.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(objects))
                    .build()
                    .map_err(|e| FsError::internal(e.to_string()))?;
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| upstream("DeleteObjects", aws_sdk_s3::error::DisplayErrorContext(&e)))?;
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(|t| t.to_string());
            } else {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn resolve_root(&self, sub_path: Option<&str>) -> String {
        match sub_path.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
            Some(sub) if self.root.is_empty() => sub.to_string(),
            Some(sub) => format!("{}/{}", self.root, sub),
            None => self.root.clone(),
        }
    }

    async fn list_dir(
        &self,
        root: &str,
        rel: &str,
        opts: &ListOptions,
    ) -> FsResult<(Vec<DirEntry>, usize)> {
        let mut prefix = self.key(root, rel);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let mut entries: Vec<DirEntry> = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| upstream("ListObjectsV2", aws_sdk_s3::error::DisplayErrorContext(&e)))?;

            for common in resp.common_prefixes() {
                let Some(dir_name) = common
                    .prefix()
                    .and_then(|p| p.strip_prefix(prefix.as_str()))
                    .map(|p| p.trim_matches('/'))
                    .filter(|p| !p.is_empty())
                else {
                    continue;
                };
                entries.push(DirEntry::dir(dir_name, 0));
            }

            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                if key == prefix {
                    // The directory marker object itself.
                    continue;
                }
                let Some(name) = key.strip_prefix(prefix.as_str()).filter(|n| !n.is_empty())
                else {
                    continue;
                };
                entries.push(DirEntry::file(
                    name,
                    object.size().unwrap_or(0).max(0) as u64,
                    object.last_modified().map(|t| t.secs()).unwrap_or(0),
                ));
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(|t| t.to_string());
            } else {
                break;
            }
        }

        let total = entries.len();
        sort_entries(&mut entries, opts);
        Ok((paginate(entries, opts), total))
    }

    async fn read_file(&self, root: &str, rel: &str) -> FsResult<Vec<u8>> {
        let key = self.key(root, rel);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    FsError::NotFound(rel.to_string())
                } else {
                    upstream("GetObject", aws_sdk_s3::error::DisplayErrorContext(&e))
                }
            })?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| upstream("GetObject body", e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn write_file(&self, root: &str, rel: &str, data: Bytes) -> FsResult<()> {
        let key = self.key(root, rel);
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .map_err(|e| upstream("PutObject", aws_sdk_s3::error::DisplayErrorContext(&e)))?;
        debug!("put s3://{}/{} ({} bytes)", self.bucket, key, size);
        Ok(())
    }

    async fn write_file_stream(
        &self,
        root: &str,
        rel: &str,
        mut data: ByteStream,
    ) -> FsResult<u64> {
        let key = self.key(root, rel);
        let mpu = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| upstream("CreateMultipartUpload", aws_sdk_s3::error::DisplayErrorContext(&e)))?;
        let upload_id = mpu
            .upload_id()
            .ok_or_else(|| FsError::upstream(502, "multipart upload id missing"))?
            .to_string();

        let result: FsResult<u64> = async {
            let mut parts: Vec<CompletedPart> = Vec::new();
            let mut part_number: i32 = 1;
            let mut total: u64 = 0;
            let mut buffer = BytesMut::new();

            let upload_part = |data: Bytes, part_number: i32| {
                let client = self.client.clone();
                let bucket = self.bucket.clone();
                let key = key.clone();
                let upload_id = upload_id.clone();
                async move {
                    let part = client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .part_number(part_number)
                        .upload_id(&upload_id)
                        .body(aws_sdk_s3::primitives::ByteStream::from(data))
                        .send()
                        .await
                        .map_err(|e| upstream("UploadPart", aws_sdk_s3::error::DisplayErrorContext(&e)))?;
                    Ok::<CompletedPart, FsError>(
                        CompletedPart::builder()
                            .part_number(part_number)
                            .set_e_tag(part.e_tag().map(|t| t.to_string()))
                            .build(),
                    )
                }
            };

            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                buffer.extend_from_slice(&chunk);
                while buffer.len() >= MIN_PART_SIZE {
                    let part_data = buffer.split_to(MIN_PART_SIZE).freeze();
                    total += part_data.len() as u64;
                    parts.push(upload_part(part_data, part_number).await?);
                    part_number += 1;
                }
            }

            if !buffer.is_empty() || parts.is_empty() {
                let part_data = buffer.split().freeze();
                total += part_data.len() as u64;
                parts.push(upload_part(part_data, part_number).await?);
            }

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| upstream("CompleteMultipartUpload", aws_sdk_s3::error::DisplayErrorContext(&e)))?;
            Ok(total)
        }
        .await;

        match result {
            Ok(total) => {
                debug!(
                    "multipart upload of s3://{}/{} complete ({} bytes)",
                    self.bucket, key, total
                );
                Ok(total)
            }
            Err(e) => {
                warn!("aborting multipart upload of s3://{}/{}: {}", self.bucket, key, e);
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn mkdir(&self, root: &str, rel: &str) -> FsResult<()> {
        // Object stores have no directories; a zero-length marker key keeps
        // the prefix listable.
        let key = format!("{}/", self.key(root, rel).trim_end_matches('/'));
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(aws_sdk_s3::primitives::ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| upstream("PutObject", aws_sdk_s3::error::DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn delete(&self, root: &str, rel: &str) -> FsResult<()> {
        let key = self.key(root, rel);
        let is_file = self.head(&key).await?.is_some();
        if is_file {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| upstream("DeleteObject", aws_sdk_s3::error::DisplayErrorContext(&e)))?;
        }
        // Remove anything beneath the same name used as a prefix; a plain
        // key and a marker directory can coexist.
        self.delete_prefix(&key).await
    }

    async fn stat_file(&self, root: &str, rel: &str) -> FsResult<FileMeta> {
        let key = self.key(root, rel);
        let name = rel.rsplit('/').next().unwrap_or(rel).to_string();
        if let Some((size, mtime, content_type)) = self.head(&key).await? {
            return Ok(FileMeta {
                name,
                is_dir: false,
                size,
                mtime,
                kind: EntryKind::File,
                extra: content_type.map(|ct| json!({ "content_type": ct })),
            });
        }
        if self.prefix_occupied(&key).await? {
            return Ok(FileMeta {
                name,
                is_dir: true,
                size: 0,
                mtime: 0,
                kind: EntryKind::Dir,
                extra: None,
            });
        }
        Err(FsError::NotFound(rel.to_string()))
    }

    async fn move_path(&self, root: &str, src_rel: &str, dst_rel: &str) -> FsResult<()> {
        self.copy(root, src_rel, dst_rel, true).await?;
        self.delete(root, src_rel).await
    }

    async fn copy(
        &self,
        root: &str,
        src_rel: &str,
        dst_rel: &str,
        overwrite: bool,
    ) -> FsResult<()> {
        let src_key = self.key(root, src_rel);
        let dst_key = self.key(root, dst_rel);

        if !overwrite && self.head(&dst_key).await?.is_some() {
            return Err(FsError::AlreadyExists(dst_rel.to_string()));
        }

        self.client
            .copy_object()
            .copy_source(format!(
                "{}/{}",
                self.bucket,
                urlencoding::encode(&src_key)
            ))
            .bucket(&self.bucket)
            .key(&dst_key)
            .send()
            .await
            .map_err(|e| {
                let ctx = aws_sdk_s3::error::DisplayErrorContext(&e);
                let msg = format!("{}", ctx);
                if msg.contains("NoSuchKey") {
                    FsError::NotFound(src_rel.to_string())
                } else {
                    upstream("CopyObject", ctx)
                }
            })?;
        Ok(())
    }

    async fn stream_file(
        &self,
        root: &str,
        rel: &str,
        range: Option<ByteRange>,
    ) -> FsResult<StreamBody> {
        let key = self.key(root, rel);
        let (size, _, content_type) = self
            .head(&key)
            .await?
            .ok_or_else(|| FsError::NotFound(rel.to_string()))?;
        let content_type = content_type.unwrap_or_else(|| guess_mime(rel));

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
        let bucket = self.bucket.clone();
        let range_arg = format!("bytes={}-{}", start, end);
        let body = stream! {
            let resp = match client
                .get_object()
                .bucket(&bucket)
                .key(&key)
                .range(&range_arg)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("GetObject stream s3://{}/{} failed: {}", bucket, key,
                        aws_sdk_s3::error::DisplayErrorContext(&e));
                    yield Err(std::io::Error::other("upstream GetObject failed"));
                    return;
                }
            };
            let mut upstream_body = resp.body;
            loop {
                match upstream_body.try_next().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("GetObject body s3://{}/{} failed: {}", bucket, key, e);
                        yield Err(std::io::Error::other(e));
                        return;
                    }
                }
            }
        };

        Ok(StreamBody::new(status, headers, Box::pin(body)))
    }
}
