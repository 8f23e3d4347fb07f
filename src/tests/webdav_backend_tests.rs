use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::adapter_record;
use crate::errors::FsError;
use crate::storage::webdav::WebDavBackend;
use crate::storage::{ByteRange, ListOptions, StorageBackend};

fn backend(server: &MockServer) -> WebDavBackend {
    let record = adapter_record(
        "webdav",
        "/dav",
        json!({
            "base_url": format!("{}/dav", server.uri()),
            "username": "alice",
            "password": "secret",
            "timeout": 5,
        }),
    );
    WebDavBackend::new(&record).unwrap()
}

const LISTING: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/</d:href>
    <d:propstat><d:prop>
      <d:displayname>dav</d:displayname>
      <d:resourcetype><d:collection/></d:resourcetype>
    </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/music/</d:href>
    <d:propstat><d:prop>
      <d:displayname>music</d:displayname>
      <d:resourcetype><d:collection/></d:resourcetype>
      <d:getlastmodified>Sat, 01 Feb 2025 10:00:00 GMT</d:getlastmodified>
    </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/notes.txt</d:href>
    <d:propstat><d:prop>
      <d:displayname>notes.txt</d:displayname>
      <d:resourcetype/>
      <d:getcontentlength>11</d:getcontentlength>
      <d:getlastmodified>Sun, 02 Feb 2025 11:30:00 GMT</d:getlastmodified>
    </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
  </d:response>
</d:multistatus>"#;

#[tokio::test]
async fn propfind_listing_maps_collections_and_files() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/"))
        .and(header("Depth", "1"))
        .respond_with(ResponseTemplate::new(207).set_body_raw(LISTING, "application/xml"))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    let (entries, total) = backend
        .list_dir(&root, "", &ListOptions::default())
        .await
        .unwrap();

    assert_eq!(total, 2);
    assert_eq!(entries[0].name, "music");
    assert!(entries[0].is_dir);
    assert_eq!(entries[1].name, "notes.txt");
    assert!(!entries[1].is_dir);
    assert_eq!(entries[1].size, 11);
    assert!(entries[1].mtime > 0);
}

#[tokio::test]
async fn read_file_maps_404_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dav/missing.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    assert!(matches!(
        backend.read_file(&root, "missing.txt").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn mkcol_405_means_already_there() {
    let server = MockServer::start().await;
    Mock::given(method("MKCOL"))
        .and(path("/dav/photos/"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    backend.mkdir(&root, "photos").await.unwrap();
}

#[tokio::test]
async fn copy_precondition_failure_is_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("COPY"))
        .and(path("/dav/a.txt"))
        .and(header("Overwrite", "F"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    assert!(matches!(
        backend.copy(&root, "a.txt", "b.txt", false).await,
        Err(FsError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn streaming_serves_client_range_via_upstream_segments() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/dav/data.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "10")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dav/data.bin"))
        .and(header("Range", "bytes=2-5"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 2-5/10")
                .set_body_bytes(&b"2345"[..]),
        )
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    let range = ByteRange {
        start: 2,
        end: Some(5),
    };
    let body = backend
        .stream_file(&root, "data.bin", Some(range))
        .await
        .unwrap();
    assert_eq!(body.status, axum::http::StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        body.headers
            .get(axum::http::header::CONTENT_RANGE)
            .unwrap(),
        "bytes 2-5/10"
    );

    let mut collected = Vec::new();
    let mut stream = body.body;
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, b"2345");
}

#[tokio::test]
async fn upstream_failure_before_first_byte_is_bad_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/dav/flaky.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "100")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dav/flaky.bin"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    let result = backend.stream_file(&root, "flaky.bin", None).await;
    assert!(matches!(
        result,
        Err(FsError::Upstream { status: 502, .. })
    ));
}

#[tokio::test]
async fn passthrough_when_upstream_has_no_range_support() {
    let server = MockServer::start().await;
    // HEAD gives neither a length nor range support.
    Mock::given(method("HEAD"))
        .and(path("/dav/blob"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    // The 0-0 probe is answered with a plain 200 and no Content-Range.
    Mock::given(method("GET"))
        .and(path("/dav/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(&b"entire body"[..]))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    let body = backend.stream_file(&root, "blob", None).await.unwrap();
    assert_eq!(body.status, axum::http::StatusCode::OK);
    assert_eq!(
        body.headers
            .get(axum::http::header::ACCEPT_RANGES)
            .unwrap(),
        "bytes"
    );

    let mut collected = Vec::new();
    let mut stream = body.body;
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, b"entire body");
}

#[tokio::test]
async fn stat_file_uses_depth_zero_propfind() {
    let server = MockServer::start().await;
    let body = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/notes.txt</d:href>
    <d:propstat><d:prop>
      <d:displayname>notes.txt</d:displayname>
      <d:resourcetype/>
      <d:getcontentlength>11</d:getcontentlength>
      <d:getlastmodified>Sun, 02 Feb 2025 11:30:00 GMT</d:getlastmodified>
    </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
  </d:response>
</d:multistatus>"#;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/notes.txt"))
        .and(header("Depth", "0"))
        .respond_with(ResponseTemplate::new(207).set_body_raw(body, "application/xml"))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    let meta = backend.stat_file(&root, "notes.txt").await.unwrap();
    assert_eq!(meta.name, "notes.txt");
    assert!(!meta.is_dir);
    assert_eq!(meta.size, 11);
}

#[tokio::test]
async fn write_file_stream_counts_forwarded_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/dav/upload.bin"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let root = backend.resolve_root(None);
    let chunks: crate::storage::ByteStream = Box::pin(futures::stream::iter(vec![
        Ok(Bytes::from_static(b"abc")),
        Ok(Bytes::from_static(b"defg")),
    ]));
    let size = backend
        .write_file_stream(&root, "upload.bin", chunks)
        .await
        .unwrap();
    assert_eq!(size, 7);
}
