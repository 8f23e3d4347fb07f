use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::Database;
use crate::errors::{FsError, FsResult};
use crate::models::{DirEntry, FileMeta, FsEvent, PathProbe, StorageAdapter};
use crate::processors::{ProcessorOutput, ProcessorRegistry};
use crate::services::automation;
use crate::services::task_queue::TaskQueue;
use crate::storage::registry::AdapterRegistry;
use crate::storage::{
    guess_mime, paginate, range_headers, sort_entries, ByteRange, ByteStream, ListOptions,
    StorageBackend, StreamBody,
};

pub mod path;
pub mod resolve;

pub use path::{basename, normalize_path};

/// Listing page size used when a merged cross-mount listing forces the
/// facade to fetch everything before paginating itself.
const MERGE_FETCH_SIZE: usize = 100_000;

/// The result of routing one virtual path: the persisted record, the live
/// backend, the backend-specific effective root, and the path below the
/// mount.
pub struct Resolved {
    pub record: StorageAdapter,
    pub backend: Arc<dyn StorageBackend>,
    pub root: String,
    pub rel: String,
}

#[derive(Debug, Serialize)]
pub struct Listing {
    pub items: Vec<DirEntry>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Step-by-step trace of a move/rename/copy, returned to the caller so
/// overwrite pre-checks and no-op detection stay observable.
#[derive(Debug, Serialize)]
pub struct OpTrace {
    pub src: String,
    pub dst: String,
    pub rel_src: String,
    pub rel_dst: String,
    pub overwrite: bool,
    pub dst_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_probe: Option<PathProbe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_delete: Option<String>,
    pub noop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
}

/// The operations the outside world calls, over the global virtual
/// namespace. Every path is normalized on entry; mutations on a mount root
/// are rejected; successful mutations feed the automation pipeline.
pub struct VirtualFs {
    db: Database,
    registry: Arc<AdapterRegistry>,
    queue: Arc<TaskQueue>,
    processors: Arc<ProcessorRegistry>,
}

impl VirtualFs {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        queue: Arc<TaskQueue>,
        processors: Arc<ProcessorRegistry>,
    ) -> Self {
        VirtualFs {
            db,
            registry,
            queue,
            processors,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    /// Route a virtual path to its adapter. A registry miss is retried once
    /// after a refresh to cover the start-of-process race.
    pub async fn resolve(&self, path: &str) -> FsResult<Resolved> {
        let norm = normalize_path(path)?;
        let adapters = self.db.list_enabled_adapters().await?;
        let (record, rel) = resolve::select_mount(&adapters, &norm)
            .ok_or_else(|| FsError::NotFound(format!("no storage adapter for {}", norm)))?;
        let backend = self
            .registry
            .get_or_refresh(&self.db, record.id)
            .await
            .map_err(|e| FsError::internal(e.to_string()))?
            .ok_or_else(|| {
                FsError::NotFound(format!(
                    "adapter instance {} not found or failed to load",
                    record.id
                ))
            })?;
        let root = backend.resolve_root(record.sub_path.as_deref());
        Ok(Resolved {
            record: record.clone(),
            backend,
            root,
            rel,
        })
    }

    async fn emit(&self, event: FsEvent, path: &str) {
        if let Err(e) = automation::dispatch_event(&self.db, &self.queue, event, path).await {
            warn!("automation dispatch for {} {} failed: {}", event, path, e);
        }
    }

    /// Merged virtual listing: the covering adapter's entries plus synthetic
    /// entries for adapter mounts directly beneath this path. Physical names
    /// shadow mounts. When mounts participate, pagination happens over the
    /// merged sorted set; otherwise the adapter paginates natively.
    pub async fn list_dir(&self, path: &str, opts: &ListOptions) -> FsResult<Listing> {
        let norm = normalize_path(path)?;
        let adapters = self.db.list_enabled_adapters().await?;
        let mount_names = resolve::child_mount_names(&adapters, &norm);

        let resolved = match self.resolve(&norm).await {
            Ok(resolved) => Some(resolved),
            Err(FsError::NotFound(_)) if !mount_names.is_empty() => None,
            Err(e) => return Err(e),
        };

        if mount_names.is_empty() {
            let resolved = resolved
                .ok_or_else(|| FsError::NotFound(format!("no storage adapter for {}", norm)))?;
            let (items, total) = resolved
                .backend
                .list_dir(&resolved.root, &resolved.rel, opts)
                .await?;
            return Ok(Listing {
                items,
                total,
                page: opts.page,
                page_size: opts.page_size,
            });
        }

        // Fetch everything so mounts and physical entries paginate together.
        let mut entries: Vec<DirEntry> = Vec::new();
        if let Some(resolved) = resolved {
            let fetch_all = ListOptions {
                page: 1,
                page_size: MERGE_FETCH_SIZE,
                ..*opts
            };
            let (items, _) = resolved
                .backend
                .list_dir(&resolved.root, &resolved.rel, &fetch_all)
                .await?;
            entries = items;
        }

        let covered: std::collections::HashSet<&str> =
            entries.iter().map(|e| e.name.as_str()).collect();
        let mounts: Vec<DirEntry> = mount_names
            .iter()
            .filter(|name| !covered.contains(name.as_str()))
            .map(DirEntry::mount)
            .collect();

        entries.extend(mounts);
        let total = entries.len();
        sort_entries(&mut entries, opts);
        Ok(Listing {
            items: paginate(entries, opts),
            total,
            page: opts.page,
            page_size: opts.page_size,
        })
    }

    pub async fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let resolved = self.resolve(path).await?;
        if resolved.rel.is_empty() || resolved.rel.ends_with('/') {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        resolved.backend.read_file(&resolved.root, &resolved.rel).await
    }

    pub async fn write_file(&self, path: &str, data: Bytes) -> FsResult<()> {
        let norm = normalize_path(path)?;
        let resolved = self.resolve(&norm).await?;
        if resolved.rel.is_empty() {
            return Err(FsError::InvalidArgument("cannot write a mount root".into()));
        }
        resolved
            .backend
            .write_file(&resolved.root, &resolved.rel, data)
            .await?;
        self.emit(FsEvent::FileWritten, &norm).await;
        Ok(())
    }

    pub async fn write_file_stream(
        &self,
        path: &str,
        data: ByteStream,
        overwrite: bool,
    ) -> FsResult<u64> {
        let norm = normalize_path(path)?;
        let resolved = self.resolve(&norm).await?;
        if resolved.rel.is_empty() {
            return Err(FsError::InvalidArgument("cannot write a mount root".into()));
        }
        if !overwrite {
            match resolved.backend.exists(&resolved.root, &resolved.rel).await {
                Ok(true) => return Err(FsError::AlreadyExists(norm)),
                Ok(false) => {}
                Err(FsError::NotImplemented(_)) => {}
                Err(e) => {
                    warn!("overwrite pre-check for {} failed: {}", norm, e);
                }
            }
        }
        let size = resolved
            .backend
            .write_file_stream(&resolved.root, &resolved.rel, data)
            .await?;
        self.emit(FsEvent::FileWritten, &norm).await;
        info!("wrote file stream to {} ({} bytes)", norm, size);
        Ok(size)
    }

    pub async fn mkdir(&self, path: &str) -> FsResult<()> {
        let resolved = self.resolve(path).await?;
        if resolved.rel.is_empty() {
            return Err(FsError::InvalidArgument("cannot create a mount root".into()));
        }
        resolved.backend.mkdir(&resolved.root, &resolved.rel).await
    }

    pub async fn delete(&self, path: &str) -> FsResult<()> {
        let norm = normalize_path(path)?;
        let resolved = self.resolve(&norm).await?;
        if resolved.rel.is_empty() {
            return Err(FsError::InvalidArgument("cannot delete a mount root".into()));
        }
        resolved
            .backend
            .delete(&resolved.root, &resolved.rel)
            .await?;
        self.emit(FsEvent::FileDeleted, &norm).await;
        Ok(())
    }

    pub async fn stat_file(&self, path: &str) -> FsResult<FileMeta> {
        let resolved = self.resolve(path).await?;
        resolved.backend.stat_file(&resolved.root, &resolved.rel).await
    }

    /// Range-aware streaming read. Backends without a native stream fall
    /// back to a buffered read with the range applied here.
    pub async fn stream_file(&self, path: &str, range: Option<ByteRange>) -> FsResult<StreamBody> {
        let resolved = self.resolve(path).await?;
        if resolved.rel.is_empty() || resolved.rel.ends_with('/') {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        match resolved
            .backend
            .stream_file(&resolved.root, &resolved.rel, range)
            .await
        {
            Ok(body) => Ok(body),
            Err(FsError::NotImplemented(_)) => {
                let data = resolved
                    .backend
                    .read_file(&resolved.root, &resolved.rel)
                    .await?;
                let size = data.len() as u64;
                let (status, start, end) = match range {
                    Some(range) => {
                        let (start, end) = range.clamp(size)?;
                        (StatusCode::PARTIAL_CONTENT, start, end)
                    }
                    None if size == 0 => (StatusCode::OK, 0, 0),
                    None => (StatusCode::OK, 0, size - 1),
                };
                let headers =
                    range_headers(&guess_mime(&resolved.rel), status, start, end, Some(size));
                let window = if size == 0 {
                    Bytes::new()
                } else {
                    Bytes::from(data).slice(start as usize..=end as usize)
                };
                let body: ByteStream =
                    Box::pin(futures::stream::once(async move { Ok(window) }));
                Ok(StreamBody::new(status, headers, body))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn move_path(&self, src: &str, dst: &str, overwrite: bool) -> FsResult<OpTrace> {
        self.transfer(src, dst, overwrite, TransferKind::Move).await
    }

    pub async fn rename_path(&self, src: &str, dst: &str, overwrite: bool) -> FsResult<OpTrace> {
        self.transfer(src, dst, overwrite, TransferKind::Rename).await
    }

    pub async fn copy_path(&self, src: &str, dst: &str, overwrite: bool) -> FsResult<OpTrace> {
        self.transfer(src, dst, overwrite, TransferKind::Copy).await
    }

    async fn transfer(
        &self,
        src: &str,
        dst: &str,
        overwrite: bool,
        kind: TransferKind,
    ) -> FsResult<OpTrace> {
        let src_norm = normalize_path(src)?;
        let dst_norm = normalize_path(dst)?;
        let source = self.resolve(&src_norm).await?;
        let dest = self.resolve(&dst_norm).await?;

        if source.record.id != dest.record.id {
            return Err(FsError::InvalidArgument(format!(
                "cross-adapter {} not supported",
                kind.verb()
            )));
        }
        if source.rel.is_empty() {
            return Err(FsError::InvalidArgument(format!(
                "cannot {} a mount root",
                kind.verb()
            )));
        }
        if dest.rel.is_empty() {
            return Err(FsError::InvalidArgument("invalid destination".into()));
        }

        let mut trace = OpTrace {
            src: src_norm.clone(),
            dst: dst_norm.clone(),
            rel_src: source.rel.clone(),
            rel_dst: dest.rel.clone(),
            overwrite,
            dst_exists: false,
            dst_probe: None,
            pre_delete: None,
            noop: false,
            outcome: None,
        };

        trace.dst_exists = match source.backend.exists(&dest.root, &dest.rel).await {
            Ok(exists) => exists,
            Err(FsError::NotImplemented(_)) => false,
            Err(e) => return Err(e),
        };
        trace.dst_probe = match source.backend.stat_path(&dest.root, &dest.rel).await {
            Ok(probe) => Some(probe),
            Err(_) => None,
        };

        if trace.dst_exists && !overwrite {
            let kind_str = trace
                .dst_probe
                .as_ref()
                .and_then(|p| p.is_dir)
                .map(|d| if d { "dir" } else { "file" })
                .unwrap_or("unknown");
            return Err(FsError::AlreadyExists(format!(
                "destination already exists (kind={}, rel={}, overwrite={})",
                kind_str, dest.rel, overwrite
            )));
        }
        if trace.dst_exists && overwrite {
            match source.backend.delete(&dest.root, &dest.rel).await {
                Ok(()) => trace.pre_delete = Some("ok".to_string()),
                Err(e) => {
                    trace.pre_delete = Some(format!("error: {}", e));
                    return Err(FsError::internal(format!(
                        "pre-delete before overwrite failed: {}",
                        e
                    )));
                }
            }
        }

        if source.rel == dest.rel {
            trace.noop = true;
            return Ok(trace);
        }

        let result = match kind {
            TransferKind::Move => {
                source
                    .backend
                    .move_path(&source.root, &source.rel, &dest.rel)
                    .await
            }
            TransferKind::Rename => {
                source
                    .backend
                    .rename(&source.root, &source.rel, &dest.rel)
                    .await
            }
            TransferKind::Copy => {
                source
                    .backend
                    .copy(&source.root, &source.rel, &dest.rel, overwrite)
                    .await
            }
        };
        match result {
            Ok(()) => {
                trace.outcome = Some(kind.outcome());
                info!("{} {} -> {}", kind.verb(), src_norm, dst_norm);
                Ok(trace)
            }
            Err(FsError::AlreadyExists(_)) => Err(FsError::AlreadyExists(format!(
                "destination already exists (race condition after pre-check); trace={}",
                serde_json::to_string(&trace).unwrap_or_default()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Read a file, run a processor over it, and optionally write the result
    /// back into the namespace.
    pub async fn process_file(
        &self,
        path: &str,
        processor_type: &str,
        config: &serde_json::Value,
        save_to: Option<&str>,
    ) -> FsResult<serde_json::Value> {
        let data = self.read_file(path).await?;
        let processor = self.processors.get(processor_type).ok_or_else(|| {
            FsError::InvalidArgument(format!("processor {} not found", processor_type))
        })?;
        let output = processor.process(&data, path, config).await?;
        match output {
            ProcessorOutput::File { bytes, mime } => {
                if let Some(save_to) = save_to.filter(|_| processor.descriptor().produces_file) {
                    self.write_file(save_to, Bytes::from(bytes)).await?;
                    Ok(serde_json::json!({ "saved_to": save_to }))
                } else {
                    Ok(serde_json::json!({
                        "bytes": bytes.len(),
                        "mime": mime,
                    }))
                }
            }
            ProcessorOutput::Message(message) => Ok(serde_json::json!({ "message": message })),
        }
    }
}

#[derive(Clone, Copy)]
enum TransferKind {
    Move,
    Rename,
    Copy,
}

impl TransferKind {
    fn verb(&self) -> &'static str {
        match self {
            TransferKind::Move => "move",
            TransferKind::Rename => "rename",
            TransferKind::Copy => "copy",
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            TransferKind::Move => "moved",
            TransferKind::Rename => "renamed",
            TransferKind::Copy => "copied",
        }
    }
}
