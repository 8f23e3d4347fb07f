use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::errors::{FsError, FsResult};
use crate::models::{DirEntry, FileMeta, PathProbe};

pub mod local;
pub mod onedrive;
pub mod quark;
pub mod registry;
pub mod s3;
pub mod telegram;
pub mod webdav;
pub mod webdav_xml;

/// Chunked bytes flowing between a backend and the HTTP edge, in either
/// direction. Errors after the first delivered chunk can only truncate.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// An adapter-produced streaming response: the backend decides status and
/// headers (Content-Range, Content-Length, Accept-Ranges) and the edge
/// forwards the body without buffering.
pub struct StreamBody {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl StreamBody {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        StreamBody {
            status,
            headers,
            body,
        }
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Common response headers for a (possibly partial) file body.
pub fn range_headers(
    content_type: &str,
    status: StatusCode,
    start: u64,
    end: u64,
    total: Option<u64>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(ct) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, ct);
    }
    if status == StatusCode::PARTIAL_CONTENT {
        if let Some(total) = total {
            if let Ok(cr) = HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total)) {
                headers.insert(header::CONTENT_RANGE, cr);
            }
        }
        if let Ok(cl) = HeaderValue::from_str(&(end - start + 1).to_string()) {
            headers.insert(header::CONTENT_LENGTH, cl);
        }
    } else if let Some(total) = total {
        if let Ok(cl) = HeaderValue::from_str(&total.to_string()) {
            headers.insert(header::CONTENT_LENGTH, cl);
        }
    }
    headers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end; `None` = to the end of the file.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Resolve against a known file size. Fails 416 when the range starts at
    /// or past EOF; an oversized end is clamped.
    pub fn clamp(&self, size: u64) -> FsResult<(u64, u64)> {
        if size == 0 || self.start >= size {
            return Err(FsError::RangeNotSatisfiable);
        }
        let end = self.end.map_or(size - 1, |e| e.min(size - 1));
        if end < self.start {
            return Err(FsError::RangeNotSatisfiable);
        }
        Ok((self.start, end))
    }
}

/// Parse a `Range: bytes=start-end` header. Only single ranges are accepted;
/// an empty start means 0 (suffix ranges are not supported upstream).
pub fn parse_range_header(header: &str) -> FsResult<ByteRange> {
    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| FsError::InvalidArgument(format!("invalid Range header: {}", header)))?;
    let (start_s, end_s) = spec
        .split_once('-')
        .ok_or_else(|| FsError::InvalidArgument(format!("invalid Range header: {}", header)))?;

    let parse = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| FsError::InvalidArgument(format!("invalid Range header: {}", header)))
    };
    let start = if start_s.trim().is_empty() {
        0
    } else {
        parse(start_s)?
    };
    let end = if end_s.trim().is_empty() {
        None
    } else {
        Some(parse(end_s)?)
    };
    if let Some(end) = end {
        if end < start {
            return Err(FsError::RangeNotSatisfiable);
        }
    }
    Ok(ByteRange { start, end })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Name,
    Size,
    Mtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
    pub sort_by: SortBy,
    pub order: SortOrder,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            page: 1,
            page_size: 50,
            sort_by: SortBy::Name,
            order: SortOrder::Asc,
        }
    }
}

impl ListOptions {
    pub fn page(page: usize, page_size: usize) -> Self {
        ListOptions {
            page,
            page_size,
            ..Default::default()
        }
    }
}

/// Directories first, then the requested sort key. Descending order flips the
/// key but keeps directories grouped before files.
pub fn sort_entries(entries: &mut [DirEntry], opts: &ListOptions) {
    entries.sort_by(|a, b| {
        let group = b.is_dir.cmp(&a.is_dir);
        if group != std::cmp::Ordering::Equal {
            return group;
        }
        let key = match opts.sort_by {
            SortBy::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortBy::Size => a.size.cmp(&b.size),
            SortBy::Mtime => a.mtime.cmp(&b.mtime),
        };
        match opts.order {
            SortOrder::Asc => key,
            SortOrder::Desc => key.reverse(),
        }
    });
}

/// In-memory pagination over an already sorted listing.
pub fn paginate(entries: Vec<DirEntry>, opts: &ListOptions) -> Vec<DirEntry> {
    let start = (opts.page.max(1) - 1) * opts.page_size;
    entries.into_iter().skip(start).take(opts.page_size).collect()
}

pub fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// The uniform capability surface every backend implements. Optional
/// capabilities keep their default `NotImplemented` body; callers branch on
/// that error instead of probing for methods.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend-specific handle for the mount's content root: a directory, a
    /// key prefix, a base URL, or a folder id.
    fn resolve_root(&self, sub_path: Option<&str>) -> String;

    async fn list_dir(
        &self,
        _root: &str,
        _rel: &str,
        _opts: &ListOptions,
    ) -> FsResult<(Vec<DirEntry>, usize)> {
        Err(FsError::NotImplemented("list_dir"))
    }

    async fn read_file(&self, _root: &str, _rel: &str) -> FsResult<Vec<u8>> {
        Err(FsError::NotImplemented("read_file"))
    }

    async fn stream_file(
        &self,
        _root: &str,
        _rel: &str,
        _range: Option<ByteRange>,
    ) -> FsResult<StreamBody> {
        Err(FsError::NotImplemented("stream_file"))
    }

    async fn write_file(&self, _root: &str, _rel: &str, _data: Bytes) -> FsResult<()> {
        Err(FsError::NotImplemented("write_file"))
    }

    /// Backends without a native streaming write fall back to buffering the
    /// whole body and writing it in one call.
    async fn write_file_stream(&self, root: &str, rel: &str, mut data: ByteStream) -> FsResult<u64> {
        use futures_util::StreamExt;
        let mut buf = Vec::new();
        while let Some(chunk) = data.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let size = buf.len() as u64;
        self.write_file(root, rel, Bytes::from(buf)).await?;
        Ok(size)
    }

    async fn mkdir(&self, _root: &str, _rel: &str) -> FsResult<()> {
        Err(FsError::NotImplemented("mkdir"))
    }

    /// Recursive removal; missing paths are a no-op.
    async fn delete(&self, _root: &str, _rel: &str) -> FsResult<()> {
        Err(FsError::NotImplemented("delete"))
    }

    async fn stat_file(&self, _root: &str, _rel: &str) -> FsResult<FileMeta> {
        Err(FsError::NotImplemented("stat_file"))
    }

    /// Cheap existence probe used by overwrite pre-checks.
    async fn exists(&self, root: &str, rel: &str) -> FsResult<bool> {
        match self.stat_file(root, rel).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Debug probe: never fails on a missing path.
    async fn stat_path(&self, root: &str, rel: &str) -> FsResult<PathProbe> {
        match self.stat_file(root, rel).await {
            Ok(meta) => Ok(PathProbe {
                exists: true,
                is_dir: Some(meta.is_dir),
                detail: None,
            }),
            Err(FsError::NotFound(_)) => Ok(PathProbe::missing()),
            Err(e) => Err(e),
        }
    }

    async fn move_path(&self, _root: &str, _src_rel: &str, _dst_rel: &str) -> FsResult<()> {
        Err(FsError::NotImplemented("move"))
    }

    async fn rename(&self, root: &str, src_rel: &str, dst_rel: &str) -> FsResult<()> {
        self.move_path(root, src_rel, dst_rel).await
    }

    async fn copy(
        &self,
        _root: &str,
        _src_rel: &str,
        _dst_rel: &str,
        _overwrite: bool,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented("copy"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_open_ranges() {
        assert_eq!(
            parse_range_header("bytes=0-99").unwrap(),
            ByteRange {
                start: 0,
                end: Some(99)
            }
        );
        assert_eq!(
            parse_range_header("bytes=500-").unwrap(),
            ByteRange {
                start: 500,
                end: None
            }
        );
        assert_eq!(
            parse_range_header("bytes=-200").unwrap(),
            ByteRange {
                start: 0,
                end: Some(200)
            }
        );
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!(matches!(
            parse_range_header("items=0-5"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            parse_range_header("bytes=abc-5"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            parse_range_header("bytes=9-5"),
            Err(FsError::RangeNotSatisfiable)
        ));
    }

    #[test]
    fn clamps_against_file_size() {
        let range = ByteRange {
            start: 10,
            end: Some(5000),
        };
        assert_eq!(range.clamp(100).unwrap(), (10, 99));

        let past_eof = ByteRange {
            start: 100,
            end: None,
        };
        assert!(matches!(
            past_eof.clamp(100),
            Err(FsError::RangeNotSatisfiable)
        ));
    }

    #[test]
    fn sorts_directories_first_case_insensitive() {
        let mut entries = vec![
            DirEntry::file("zeta.txt", 1, 0),
            DirEntry::dir("Beta", 0),
            DirEntry::file("Alpha.txt", 1, 0),
            DirEntry::dir("alpha", 0),
        ];
        sort_entries(&mut entries, &ListOptions::default());
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Beta", "Alpha.txt", "zeta.txt"]);
    }
}
