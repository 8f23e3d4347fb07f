use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;

use super::adapter_record;
use crate::errors::FsError;
use crate::storage::local::LocalBackend;
use crate::storage::{ByteRange, ListOptions, StorageBackend, StreamBody};

fn backend(dir: &tempfile::TempDir) -> LocalBackend {
    let record = adapter_record(
        "local",
        "/local",
        json!({ "root": dir.path().to_str().unwrap() }),
    );
    LocalBackend::new(&record).unwrap()
}

async fn collect(body: StreamBody) -> Vec<u8> {
    let mut out = Vec::new();
    let mut stream = body.body;
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    backend
        .write_file(&root, "docs/nested/hello.txt", Bytes::from_static(b"hi there"))
        .await
        .unwrap();
    let data = backend.read_file(&root, "docs/nested/hello.txt").await.unwrap();
    assert_eq!(data, b"hi there");
}

#[tokio::test]
async fn read_missing_is_not_found_and_dir_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    assert!(matches!(
        backend.read_file(&root, "nope.txt").await,
        Err(FsError::NotFound(_))
    ));

    backend.mkdir(&root, "somedir").await.unwrap();
    assert!(matches!(
        backend.read_file(&root, "somedir").await,
        Err(FsError::IsADirectory(_))
    ));
}

#[tokio::test]
async fn listing_sorts_directories_first_and_paginates() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    backend.mkdir(&root, "zoo").await.unwrap();
    backend
        .write_file(&root, "alpha.txt", Bytes::from_static(b"a"))
        .await
        .unwrap();
    backend
        .write_file(&root, "Beta.txt", Bytes::from_static(b"b"))
        .await
        .unwrap();

    let (entries, total) = backend
        .list_dir(&root, "", &ListOptions::default())
        .await
        .unwrap();
    assert_eq!(total, 3);
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["zoo", "alpha.txt", "Beta.txt"]);

    let (page2, total) = backend
        .list_dir(&root, "", &ListOptions::page(2, 2))
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(page2.len(), 1);
    assert_eq!(page2[0].name, "Beta.txt");
}

#[tokio::test]
async fn listing_missing_directory_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    let (entries, total) = backend
        .list_dir(&root, "does/not/exist", &ListOptions::default())
        .await
        .unwrap();
    assert!(entries.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn mkdir_then_delete_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    backend.mkdir(&root, "a/b/c").await.unwrap();
    assert!(backend.exists(&root, "a/b/c").await.unwrap());

    backend.delete(&root, "a").await.unwrap();
    assert!(matches!(
        backend.stat_file(&root, "a").await,
        Err(FsError::NotFound(_))
    ));

    // Deleting a missing path is a no-op.
    backend.delete(&root, "a").await.unwrap();
}

#[tokio::test]
async fn move_makes_source_vanish() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    backend
        .write_file(&root, "src.txt", Bytes::from_static(b"payload"))
        .await
        .unwrap();
    backend.move_path(&root, "src.txt", "sub/dst.txt").await.unwrap();

    assert!(matches!(
        backend.stat_file(&root, "src.txt").await,
        Err(FsError::NotFound(_))
    ));
    let meta = backend.stat_file(&root, "sub/dst.txt").await.unwrap();
    assert!(!meta.is_dir);
    assert_eq!(meta.size, 7);
}

#[tokio::test]
async fn move_missing_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    assert!(matches!(
        backend.move_path(&root, "ghost.txt", "dst.txt").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn copy_refuses_overwrite_unless_asked() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    backend
        .write_file(&root, "a.txt", Bytes::from_static(b"first"))
        .await
        .unwrap();
    backend
        .write_file(&root, "b.txt", Bytes::from_static(b"second"))
        .await
        .unwrap();

    assert!(matches!(
        backend.copy(&root, "a.txt", "b.txt", false).await,
        Err(FsError::AlreadyExists(_))
    ));

    backend.copy(&root, "a.txt", "b.txt", true).await.unwrap();
    assert_eq!(backend.read_file(&root, "b.txt").await.unwrap(), b"first");
    // Source is untouched by copy.
    assert_eq!(backend.read_file(&root, "a.txt").await.unwrap(), b"first");
}

#[tokio::test]
async fn copy_directory_recursively() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    backend
        .write_file(&root, "tree/leaf/file.txt", Bytes::from_static(b"x"))
        .await
        .unwrap();
    backend.copy(&root, "tree", "tree2", false).await.unwrap();
    assert_eq!(
        backend.read_file(&root, "tree2/leaf/file.txt").await.unwrap(),
        b"x"
    );
}

#[tokio::test]
async fn streaming_honors_byte_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    backend
        .write_file(&root, "data.bin", Bytes::from_static(b"0123456789"))
        .await
        .unwrap();

    let full = backend.stream_file(&root, "data.bin", None).await.unwrap();
    assert_eq!(full.status, axum::http::StatusCode::OK);
    assert_eq!(collect(full).await, b"0123456789");

    let range = ByteRange {
        start: 2,
        end: Some(5),
    };
    let partial = backend
        .stream_file(&root, "data.bin", Some(range))
        .await
        .unwrap();
    assert_eq!(partial.status, axum::http::StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        partial
            .headers
            .get(axum::http::header::CONTENT_RANGE)
            .unwrap(),
        "bytes 2-5/10"
    );
    assert_eq!(collect(partial).await, b"2345");
}

#[tokio::test]
async fn streaming_past_eof_is_unsatisfiable() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    backend
        .write_file(&root, "small.bin", Bytes::from_static(b"abc"))
        .await
        .unwrap();
    let range = ByteRange {
        start: 10,
        end: None,
    };
    assert!(matches!(
        backend.stream_file(&root, "small.bin", Some(range)).await,
        Err(FsError::RangeNotSatisfiable)
    ));
}

#[tokio::test]
async fn write_stream_reports_size() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let root = backend.resolve_root(None);

    let chunks: crate::storage::ByteStream = Box::pin(futures::stream::iter(vec![
        Ok(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"")),
        Ok(Bytes::from_static(b"world")),
    ]));
    let size = backend
        .write_file_stream(&root, "streamed.txt", chunks)
        .await
        .unwrap();
    assert_eq!(size, 11);
    assert_eq!(
        backend.read_file(&root, "streamed.txt").await.unwrap(),
        b"hello world"
    );
}

#[tokio::test]
async fn sub_path_scopes_the_effective_root() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);

    let scoped = backend.resolve_root(Some("inner"));
    backend
        .write_file(&scoped, "file.txt", Bytes::from_static(b"scoped"))
        .await
        .unwrap();

    let full_root = backend.resolve_root(None);
    assert_eq!(
        backend.read_file(&full_root, "inner/file.txt").await.unwrap(),
        b"scoped"
    );
}
