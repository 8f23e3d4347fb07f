use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task lifecycle. Status only ever moves forward:
/// pending -> running -> success | failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// An in-memory queue task. Tasks are kept for the lifetime of the process
/// so their status stays queryable; nothing survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub task_info: serde_json::Value,
}

impl Task {
    pub fn new(name: impl Into<String>, task_info: serde_json::Value) -> Self {
        Task {
            id: Uuid::new_v4(),
            name: name.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            task_info,
        }
    }
}
