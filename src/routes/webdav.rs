use std::io::Cursor;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use chrono::TimeZone;
use futures_util::TryStreamExt;
use md5::{Digest, Md5};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::debug;

use crate::auth::verify_basic;
use crate::errors::{FsError, FsResult};
use crate::storage::{guess_mime, parse_range_header, ByteRange, ByteStream, ListOptions};
use crate::vfs::normalize_path;
use crate::AppState;

const DAV_PREFIX: &str = "/webdav";
const ALLOWED_VERBS: &str = "OPTIONS, PROPFIND, GET, HEAD, PUT, DELETE, MKCOL, MOVE, COPY";
/// Upper bound on children returned for one PROPFIND.
const PROPFIND_PAGE_SIZE: usize = 1000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(DAV_PREFIX, any(dispatch))
        .route("/webdav/{*path}", any(dispatch))
}

fn dav_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("DAV", HeaderValue::from_static("1"));
    headers.insert("MS-Author-Via", HeaderValue::from_static("DAV"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::ALLOW, HeaderValue::from_static(ALLOWED_VERBS));
    headers
}

fn etag(path: &str, size: Option<u64>, mtime: Option<i64>) -> String {
    let raw = format!("{}|{}|{}", path, size.unwrap_or(0), mtime.unwrap_or(0));
    format!("\"{:x}\"", Md5::digest(raw.as_bytes()))
}

fn http_date(mtime: i64) -> String {
    chrono::Utc
        .timestamp_opt(mtime, 0)
        .single()
        .unwrap_or_else(chrono::Utc::now)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn href_for(path: &str, is_dir: bool) -> String {
    let mut p = format!("{}{}", DAV_PREFIX, path);
    if is_dir && !p.ends_with('/') {
        p.push('/');
    }
    p.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

struct PropEntry {
    path: String,
    name: String,
    is_dir: bool,
    size: Option<u64>,
    mtime: Option<i64>,
}

fn multistatus_xml(entries: &[PropEntry]) -> FsResult<Vec<u8>> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let write_err = |e| FsError::internal(format!("multistatus write: {}", e));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(write_err)?;
    let mut root = BytesStart::new("d:multistatus");
    root.push_attribute(("xmlns:d", "DAV:"));
    writer.write_event(Event::Start(root)).map_err(write_err)?;

    for entry in entries {
        writer
            .write_event(Event::Start(BytesStart::new("d:response")))
            .map_err(write_err)?;

        text_element(&mut writer, "d:href", &href_for(&entry.path, entry.is_dir))?;

        writer
            .write_event(Event::Start(BytesStart::new("d:propstat")))
            .map_err(write_err)?;
        writer
            .write_event(Event::Start(BytesStart::new("d:prop")))
            .map_err(write_err)?;

        text_element(&mut writer, "d:displayname", &entry.name)?;

        if entry.is_dir {
            writer
                .write_event(Event::Start(BytesStart::new("d:resourcetype")))
                .map_err(write_err)?;
            writer
                .write_event(Event::Empty(BytesStart::new("d:collection")))
                .map_err(write_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("d:resourcetype")))
                .map_err(write_err)?;
        } else {
            writer
                .write_event(Event::Empty(BytesStart::new("d:resourcetype")))
                .map_err(write_err)?;
            if let Some(size) = entry.size {
                text_element(&mut writer, "d:getcontentlength", &size.to_string())?;
            }
            text_element(&mut writer, "d:getcontenttype", &guess_mime(&entry.name))?;
        }

        if let Some(mtime) = entry.mtime {
            text_element(&mut writer, "d:getlastmodified", &http_date(mtime))?;
        }
        text_element(
            &mut writer,
            "d:getetag",
            &etag(&entry.path, entry.size, entry.mtime),
        )?;

        writer
            .write_event(Event::End(BytesEnd::new("d:prop")))
            .map_err(write_err)?;
        text_element(&mut writer, "d:status", "HTTP/1.1 200 OK")?;
        writer
            .write_event(Event::End(BytesEnd::new("d:propstat")))
            .map_err(write_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("d:response")))
            .map_err(write_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("d:multistatus")))
        .map_err(write_err)?;
    Ok(writer.into_inner().into_inner())
}

fn text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> FsResult<()> {
    let write_err = |e| FsError::internal(format!("multistatus write: {}", e));
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(write_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(write_err)?;
    Ok(())
}

/// Virtual path for this request: the URI below the DAV prefix, decoded.
fn fs_path(req: &Request) -> FsResult<String> {
    let raw = req
        .uri()
        .path()
        .strip_prefix(DAV_PREFIX)
        .unwrap_or(req.uri().path());
    let decoded = urlencoding::decode(raw)
        .map_err(|_| FsError::InvalidArgument("invalid percent-encoding in path".into()))?;
    normalize_path(&decoded)
}

fn parse_destination(headers: &HeaderMap) -> FsResult<String> {
    let destination = headers
        .get("Destination")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| FsError::InvalidArgument("missing Destination header".into()))?;
    let path = match url::Url::parse(destination) {
        Ok(url) => url.path().to_string(),
        Err(_) => destination.to_string(),
    };
    let path = path.strip_prefix(DAV_PREFIX).unwrap_or(&path);
    let decoded = urlencoding::decode(path)
        .map_err(|_| FsError::InvalidArgument("invalid percent-encoding in Destination".into()))?;
    normalize_path(&decoded)
}

fn overwrite_flag(headers: &HeaderMap) -> bool {
    // Per RFC 4918 the default is overwrite.
    headers
        .get("Overwrite")
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.eq_ignore_ascii_case("F"))
        .unwrap_or(true)
}

fn range_from_headers(headers: &HeaderMap) -> FsResult<Option<ByteRange>> {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(parse_range_header)
        .transpose()
}

fn respond(status: StatusCode, extra: Option<(header::HeaderName, String)>) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    *response.headers_mut() = dav_headers();
    if let Some((name, value)) = extra {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match handle(state, req).await {
        Ok(response) => response,
        Err(FsError::Unauthorized) => {
            let mut response = FsError::Unauthorized.into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"webdav\""),
            );
            response
        }
        Err(e) => e.into_response(),
    }
}

async fn handle(state: Arc<AppState>, req: Request) -> FsResult<Response> {
    let method = req.method().clone();

    if method == Method::OPTIONS {
        return Ok(respond(StatusCode::OK, None));
    }
    verify_basic(&state.db, req.headers()).await?;

    match method.as_str() {
        "PROPFIND" => propfind(&state, req).await,
        "GET" => {
            let path = fs_path(&req)?;
            let range = range_from_headers(req.headers())?;
            let body = state.vfs.stream_file(&path, range).await?;
            Ok(body.into_response())
        }
        "HEAD" => head(&state, req).await,
        "PUT" => {
            let path = fs_path(&req)?;
            let stream: ByteStream = Box::pin(
                req.into_body()
                    .into_data_stream()
                    .map_err(|e| std::io::Error::other(e)),
            );
            state.vfs.write_file_stream(&path, stream, true).await?;
            Ok(respond(
                StatusCode::CREATED,
                Some((header::CONTENT_LENGTH, "0".to_string())),
            ))
        }
        "DELETE" => {
            let path = fs_path(&req)?;
            state.vfs.delete(&path).await?;
            Ok(respond(StatusCode::NO_CONTENT, None))
        }
        "MKCOL" => {
            let path = fs_path(&req)?;
            state.vfs.mkdir(&path).await?;
            Ok(respond(StatusCode::CREATED, None))
        }
        "MOVE" => {
            let src = fs_path(&req)?;
            let dst = parse_destination(req.headers())?;
            let overwrite = overwrite_flag(req.headers());
            state.vfs.move_path(&src, &dst, overwrite).await?;
            Ok(respond(StatusCode::NO_CONTENT, None))
        }
        "COPY" => {
            let src = fs_path(&req)?;
            let dst = parse_destination(req.headers())?;
            let overwrite = overwrite_flag(req.headers());
            state.vfs.copy_path(&src, &dst, overwrite).await?;
            let status = if overwrite {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::CREATED
            };
            Ok(respond(status, None))
        }
        "LOCK" | "UNLOCK" => Err(FsError::NotImplemented("webdav locking")),
        _ => Ok(respond(StatusCode::METHOD_NOT_ALLOWED, None)),
    }
}

async fn propfind(state: &Arc<AppState>, req: Request) -> FsResult<Response> {
    let path = fs_path(&req)?;
    let depth = req
        .headers()
        .get("Depth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("1")
        .to_lowercase();
    // Depth: infinity is downgraded to 1; unbounded remote walks are not
    // worth the blast radius.
    let list_children = depth != "0";

    let meta = state.vfs.stat_file(&path).await.map_err(|e| match e {
        FsError::NotImplemented(_) => FsError::NotFound(path.clone()),
        other => other,
    })?;

    let mut entries = vec![PropEntry {
        path: path.clone(),
        name: if meta.name.is_empty() {
            "/".to_string()
        } else {
            meta.name.clone()
        },
        is_dir: meta.is_dir,
        size: if meta.is_dir { None } else { Some(meta.size) },
        mtime: Some(meta.mtime),
    }];

    if list_children && meta.is_dir {
        match state
            .vfs
            .list_dir(&path, &ListOptions::page(1, PROPFIND_PAGE_SIZE))
            .await
        {
            Ok(listing) => {
                for item in listing.items {
                    let child_path = if path == "/" {
                        format!("/{}", item.name)
                    } else {
                        format!("{}/{}", path, item.name)
                    };
                    entries.push(PropEntry {
                        path: child_path,
                        name: item.name,
                        is_dir: item.is_dir,
                        size: if item.is_dir { None } else { Some(item.size) },
                        mtime: Some(item.mtime),
                    });
                }
            }
            Err(e) => debug!("propfind child listing of {} skipped: {}", path, e),
        }
    }

    let xml = multistatus_xml(&entries)?;
    let mut response = Response::new(Body::from(xml));
    *response.status_mut() = StatusCode::MULTI_STATUS;
    *response.headers_mut() = dav_headers();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=\"utf-8\""),
    );
    Ok(response)
}

async fn head(state: &Arc<AppState>, req: Request) -> FsResult<Response> {
    let path = fs_path(&req)?;
    let meta = state.vfs.stat_file(&path).await?;
    let mut response = respond(StatusCode::OK, None);
    if !meta.is_dir {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&meta.size.to_string()) {
            headers.insert(header::CONTENT_LENGTH, value);
        }
        if let Ok(value) = HeaderValue::from_str(&guess_mime(&meta.name)) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&etag(&path, Some(meta.size), Some(meta.mtime))) {
            headers.insert(header::ETAG, value);
        }
        if let Ok(value) = HeaderValue::from_str(&http_date(meta.mtime)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_quoted_md5_over_identity() {
        let tag = etag("/a/b.txt", Some(10), Some(99));
        assert!(tag.starts_with('"') && tag.ends_with('"'));
        assert_eq!(tag.len(), 34);
        // Stable for identical inputs, different otherwise.
        assert_eq!(tag, etag("/a/b.txt", Some(10), Some(99)));
        assert_ne!(tag, etag("/a/b.txt", Some(11), Some(99)));
    }

    #[test]
    fn http_dates_are_rfc1123_gmt() {
        assert_eq!(http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn hrefs_are_prefixed_and_encoded() {
        assert_eq!(href_for("/a/b c.txt", false), "/webdav/a/b%20c.txt");
        assert_eq!(href_for("/photos", true), "/webdav/photos/");
    }

    #[test]
    fn overwrite_defaults_to_true() {
        let mut headers = HeaderMap::new();
        assert!(overwrite_flag(&headers));
        headers.insert("Overwrite", HeaderValue::from_static("F"));
        assert!(!overwrite_flag(&headers));
        headers.insert("Overwrite", HeaderValue::from_static("T"));
        assert!(overwrite_flag(&headers));
    }

    #[test]
    fn multistatus_contains_collection_marker() {
        let xml = multistatus_xml(&[
            PropEntry {
                path: "/photos".into(),
                name: "photos".into(),
                is_dir: true,
                size: None,
                mtime: Some(0),
            },
            PropEntry {
                path: "/photos/cat.jpg".into(),
                name: "cat.jpg".into(),
                is_dir: false,
                size: Some(42),
                mtime: Some(0),
            },
        ])
        .unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains("<d:multistatus xmlns:d=\"DAV:\">"));
        assert!(text.contains("<d:collection/>"));
        assert!(text.contains("<d:getcontentlength>42</d:getcontentlength>"));
        assert!(text.contains("<d:href>/webdav/photos/</d:href>"));
    }
}
