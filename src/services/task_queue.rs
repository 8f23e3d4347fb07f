use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::{FsError, FsResult};
use crate::models::{Task, TaskStatus};
use crate::processors::ProcessorOutput;
use crate::vfs::VirtualFs;

/// In-process FIFO job queue with a single cooperative worker.
///
/// Tasks live only in memory: they stay queryable by id for the process
/// lifetime and are lost on restart. That is an accepted simplicity
/// trade-off, not an oversight.
pub struct TaskQueue {
    tasks: RwLock<HashMap<Uuid, Task>>,
    pending: Mutex<VecDeque<Uuid>>,
    notify: Notify,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            tasks: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn enqueue(&self, name: &str, task_info: serde_json::Value) -> Task {
        let task = Task::new(name, task_info);
        self.tasks.write().unwrap().insert(task.id, task.clone());
        self.pending.lock().unwrap().push_back(task.id);
        self.notify.notify_one();
        info!("task {} ({}) enqueued", task.name, task.id);
        task
    }

    pub fn get_task(&self, id: Uuid) -> Option<Task> {
        self.tasks.read().unwrap().get(&id).cloned()
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks.read().unwrap().values().cloned().collect()
    }

    fn update_task(&self, id: Uuid, update: impl FnOnce(&mut Task)) {
        if let Some(task) = self.tasks.write().unwrap().get_mut(&id) {
            update(task);
        }
    }

    /// Spawn the worker if none is alive. Safe to call repeatedly.
    pub async fn start_worker(self: &Arc<Self>, vfs: Arc<VirtualFs>) {
        let mut guard = self.worker.lock().await;
        if guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let queue = self.clone();
        *guard = Some(tokio::spawn(async move {
            info!("task worker started");
            queue.worker_loop(vfs).await;
        }));
    }

    /// Cancel the worker and wait for it to wind down. Cancellation between
    /// tasks is clean; an in-flight task is aborted best-effort with no
    /// compensation.
    pub async fn stop_worker(&self) {
        let mut guard = self.worker.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            let _ = handle.await;
            info!("task worker stopped");
        }
    }

    async fn worker_loop(self: Arc<Self>, vfs: Arc<VirtualFs>) {
        loop {
            let next = self.pending.lock().unwrap().pop_front();
            let Some(id) = next else {
                self.notify.notified().await;
                continue;
            };
            self.execute(id, &vfs).await;
        }
    }

    async fn execute(&self, id: Uuid, vfs: &VirtualFs) {
        let Some(task) = self.get_task(id) else {
            return;
        };
        self.update_task(id, |t| t.status = TaskStatus::Running);
        info!("task {} ({}) started", task.name, id);

        match run_task(&task, vfs).await {
            Ok(result) => {
                self.update_task(id, |t| {
                    t.status = TaskStatus::Success;
                    t.result = Some(result);
                });
                info!("task {} ({}) succeeded", task.name, id);
            }
            Err(e) => {
                let message = e.to_string();
                self.update_task(id, |t| {
                    t.status = TaskStatus::Failed;
                    t.error = Some(message.clone());
                });
                error!("task {} ({}) failed: {}", task.name, id, message);
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch one dequeued task by name.
async fn run_task(task: &Task, vfs: &VirtualFs) -> FsResult<serde_json::Value> {
    let info = &task.task_info;
    let str_field = |key: &str| {
        info.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| FsError::InvalidArgument(format!("task info missing '{}'", key)))
    };

    match task.name.as_str() {
        "process_file" => {
            let path = str_field("path")?;
            let processor_type = str_field("processor_type")?;
            let config = info.get("config").cloned().unwrap_or(serde_json::json!({}));
            let save_to = info
                .get("save_to")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            vfs.process_file(&path, &processor_type, &config, save_to.as_deref())
                .await
        }
        "automation_task" => {
            let rule_id: Uuid = str_field("rule_id")?
                .parse()
                .map_err(|_| FsError::InvalidArgument("invalid rule id".into()))?;
            let path = str_field("path")?;
            let rule = vfs
                .database()
                .get_rule(rule_id)
                .await
                .map_err(|e| FsError::internal(e.to_string()))?
                .ok_or_else(|| FsError::NotFound(format!("automation rule {}", rule_id)))?;

            let processor = vfs.processors().get(&rule.processor_type).ok_or_else(|| {
                FsError::InvalidArgument(format!(
                    "processor {} not found for rule {}",
                    rule.processor_type, rule.id
                ))
            })?;

            let content = vfs.read_file(&path).await?;
            let output = processor
                .process(&content, &path, &rule.processor_config)
                .await?;

            let save_to = rule
                .processor_config
                .get("save_to")
                .and_then(|v| v.as_str());
            if let (ProcessorOutput::File { bytes, .. }, Some(save_to)) = (&output, save_to) {
                if processor.descriptor().produces_file {
                    vfs.write_file(save_to, Bytes::from(bytes.clone())).await?;
                }
            }
            Ok(serde_json::json!("automation task completed"))
        }
        other => Err(FsError::InvalidArgument(format!(
            "unknown task name: {}",
            other
        ))),
    }
}
