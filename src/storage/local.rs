use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{
    guess_mime, paginate, range_headers, sort_entries, ByteRange, ByteStream, ListOptions,
    StorageBackend, StreamBody,
};
use crate::errors::{FsError, FsResult};
use crate::models::{ConfigField, DirEntry, EntryKind, FieldType, FileMeta, PathProbe,
    StorageAdapter};

const STREAM_CHUNK: usize = 256 * 1024;

#[cfg(unix)]
const DEFAULT_DIR_MODE: u32 = 0o777;
#[cfg(unix)]
const DEFAULT_FILE_MODE: u32 = 0o666;

pub fn config_schema() -> Vec<ConfigField> {
    vec![ConfigField::required("root", "Root directory", FieldType::String)
        .with_placeholder("/data/storage")]
}

pub fn factory(record: &StorageAdapter) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(LocalBackend::new(record)?))
}

/// Local-disk backend. The resolved root is a filesystem directory; every
/// relative path is joined lexically and checked against root escapes.
pub struct LocalBackend {
    root: String,
}

impl LocalBackend {
    pub fn new(record: &StorageAdapter) -> Result<Self> {
        let root = record
            .config_str("root")
            .filter(|r| !r.is_empty())
            .ok_or_else(|| anyhow::anyhow!("local backend config requires 'root'"))?;
        std::fs::create_dir_all(&root)?;
        Ok(LocalBackend { root })
    }
}

/// Join `rel` onto `root` component by component, rejecting any traversal
/// that would climb above the root. Purely lexical so it also covers paths
/// that do not exist yet.
pub fn safe_join(root: &str, rel: &str) -> FsResult<PathBuf> {
    let mut depth: i64 = 0;
    let mut joined = PathBuf::from(root);
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => {
                depth += 1;
                joined.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(FsError::InvalidArgument(format!(
                        "path escapes the mount root: {}",
                        rel
                    )));
                }
                joined.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(FsError::InvalidArgument(format!(
                    "absolute segments are not allowed: {}",
                    rel
                )));
            }
        }
    }
    Ok(joined)
}

async fn create_parent_dirs(path: &Path) -> FsResult<()> {
    let Some(parent) = path.parent().map(Path::to_path_buf) else {
        return Ok(());
    };
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(DEFAULT_DIR_MODE)
                .create(&parent)
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(&parent)
    })
    .await
    .map_err(|e| FsError::internal(e.to_string()))??;
    Ok(())
}

#[cfg(unix)]
async fn apply_file_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(DEFAULT_FILE_MODE))
        .await;
}

#[cfg(not(unix))]
async fn apply_file_mode(_path: &Path) {}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn resolve_root(&self, sub_path: Option<&str>) -> String {
        match sub_path.filter(|s| !s.is_empty()) {
            Some(sub) => Path::new(&self.root)
                .join(sub.trim_matches('/'))
                .to_string_lossy()
                .to_string(),
            None => self.root.clone(),
        }
    }

    async fn list_dir(
        &self,
        root: &str,
        rel: &str,
        opts: &ListOptions,
    ) -> FsResult<(Vec<DirEntry>, usize)> {
        let base = safe_join(root, rel.trim_matches('/'))?;
        let meta = match tokio::fs::metadata(&base).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(rel.to_string()));
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&base).await?;
        while let Some(item) = reader.next_entry().await? {
            let name = item.file_name().to_string_lossy().to_string();
            // Entries may vanish between readdir and stat; skip them.
            let Ok(meta) = item.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                entries.push(DirEntry::dir(name, mtime_secs(&meta)));
            } else {
                entries.push(DirEntry::file(name, meta.len(), mtime_secs(&meta)));
            }
        }

        let total = entries.len();
        sort_entries(&mut entries, opts);
        Ok((paginate(entries, opts), total))
    }

    async fn read_file(&self, root: &str, rel: &str) -> FsResult<Vec<u8>> {
        let path = safe_join(root, rel)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| FsError::NotFound(rel.to_string()))?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory(rel.to_string()));
        }
        Ok(tokio::fs::read(&path).await?)
    }

    async fn write_file(&self, root: &str, rel: &str, data: Bytes) -> FsResult<()> {
        let path = safe_join(root, rel)?;
        let pre_exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        create_parent_dirs(&path).await?;
        tokio::fs::write(&path, &data).await?;
        if !pre_exists {
            apply_file_mode(&path).await;
        }
        debug!("wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    async fn write_file_stream(
        &self,
        root: &str,
        rel: &str,
        mut data: ByteStream,
    ) -> FsResult<u64> {
        let path = safe_join(root, rel)?;
        let pre_exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        create_parent_dirs(&path).await?;

        let mut file = tokio::fs::File::create(&path).await?;
        let mut size: u64 = 0;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if !pre_exists {
            apply_file_mode(&path).await;
        }
        debug!("streamed {} bytes to {}", size, path.display());
        Ok(size)
    }

    async fn mkdir(&self, root: &str, rel: &str) -> FsResult<()> {
        let path = safe_join(root, rel)?;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(DEFAULT_DIR_MODE)
                    .create(&path)
            }
            #[cfg(not(unix))]
            std::fs::create_dir_all(&path)
        })
        .await
        .map_err(|e| FsError::internal(e.to_string()))??;
        Ok(())
    }

    async fn delete(&self, root: &str, rel: &str) -> FsResult<()> {
        let path = safe_join(root, rel)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn stat_file(&self, root: &str, rel: &str) -> FsResult<FileMeta> {
        let path = safe_join(root, rel)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| FsError::NotFound(rel.to_string()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let is_dir = meta.is_dir();
        Ok(FileMeta {
            name,
            is_dir,
            size: if is_dir { 0 } else { meta.len() },
            mtime: mtime_secs(&meta),
            kind: if is_dir { EntryKind::Dir } else { EntryKind::File },
            extra: Some(json!({
                "path": path.to_string_lossy(),
                "mode": format!("{:o}", file_mode(&meta)),
            })),
        })
    }

    async fn exists(&self, root: &str, rel: &str) -> FsResult<bool> {
        let path = safe_join(root, rel)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn stat_path(&self, root: &str, rel: &str) -> FsResult<PathProbe> {
        let path = safe_join(root, rel)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(PathProbe {
                exists: true,
                is_dir: Some(meta.is_dir()),
                detail: Some(path.to_string_lossy().to_string()),
            }),
            Err(_) => Ok(PathProbe {
                exists: false,
                is_dir: None,
                detail: Some(path.to_string_lossy().to_string()),
            }),
        }
    }

    async fn move_path(&self, root: &str, src_rel: &str, dst_rel: &str) -> FsResult<()> {
        let src = safe_join(root, src_rel)?;
        let dst = safe_join(root, dst_rel)?;
        if src == dst {
            return Ok(());
        }
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(FsError::NotFound(src_rel.to_string()));
        }
        create_parent_dirs(&dst).await?;
        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => Ok(()),
            // A rename across filesystems fails; fall back to copy + delete
            // for plain files.
            Err(_) if src.is_file() => {
                tokio::fs::copy(&src, &dst).await?;
                tokio::fs::remove_file(&src).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn copy(
        &self,
        root: &str,
        src_rel: &str,
        dst_rel: &str,
        overwrite: bool,
    ) -> FsResult<()> {
        let src = safe_join(root, src_rel)?;
        let dst = safe_join(root, dst_rel)?;
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(FsError::NotFound(src_rel.to_string()));
        }
        if src == dst {
            return Ok(());
        }
        create_parent_dirs(&dst).await?;

        let dst_rel = dst_rel.to_string();
        tokio::task::spawn_blocking(move || -> FsResult<()> {
            if dst.exists() {
                if !overwrite {
                    return Err(FsError::AlreadyExists(dst_rel));
                }
                if dst.is_dir() {
                    std::fs::remove_dir_all(&dst)?;
                } else {
                    std::fs::remove_file(&dst)?;
                }
            }
            if src.is_dir() {
                copy_dir_recursive(&src, &dst)?;
            } else {
                std::fs::copy(&src, &dst)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| FsError::internal(e.to_string()))?
    }

    async fn stream_file(
        &self,
        root: &str,
        rel: &str,
        range: Option<ByteRange>,
    ) -> FsResult<StreamBody> {
        let path = safe_join(root, rel)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| FsError::NotFound(rel.to_string()))?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory(rel.to_string()));
        }

        let size = meta.len();
        let (status, start, end) = match range {
            Some(range) => {
                let (start, end) = range.clamp(size)?;
                (StatusCode::PARTIAL_CONTENT, start, end)
            }
            None if size == 0 => (StatusCode::OK, 0, 0),
            None => (StatusCode::OK, 0, size - 1),
        };

        let headers = range_headers(&guess_mime(rel), status, start, end, Some(size));
        let mut remaining = if size == 0 { 0 } else { end - start + 1 };

        let body = stream! {
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
                yield Err(e);
                return;
            }
            let mut buf = vec![0u8; STREAM_CHUNK];
            while remaining > 0 {
                let want = remaining.min(STREAM_CHUNK as u64) as usize;
                match file.read(&mut buf[..want]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        remaining -= n as u64;
                        yield Ok(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };

        Ok(StreamBody::new(status, headers, Box::pin(body)))
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> FsResult<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_keeps_paths_inside_the_root() {
        assert_eq!(
            safe_join("/srv/data", "a/b/c.txt").unwrap(),
            PathBuf::from("/srv/data/a/b/c.txt")
        );
        assert_eq!(
            safe_join("/srv/data", "a/../b").unwrap(),
            PathBuf::from("/srv/data/b")
        );
    }

    #[test]
    fn safe_join_rejects_escapes() {
        assert!(safe_join("/srv/data", "../etc/passwd").is_err());
        assert!(safe_join("/srv/data", "a/../../etc").is_err());
        assert!(safe_join("/srv/data", "/etc/passwd").is_err());
    }
}
