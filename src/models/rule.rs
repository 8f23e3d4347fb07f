use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Filesystem events the automation pipeline reacts to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FsEvent {
    #[serde(rename = "file_written")]
    FileWritten,
    #[serde(rename = "file_deleted")]
    FileDeleted,
}

impl std::fmt::Display for FsEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsEvent::FileWritten => write!(f, "file_written"),
            FsEvent::FileDeleted => write!(f, "file_deleted"),
        }
    }
}

impl TryFrom<String> for FsEvent {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "file_written" => Ok(FsEvent::FileWritten),
            "file_deleted" => Ok(FsEvent::FileDeleted),
            _ => Err(format!("Invalid fs event: {}", value)),
        }
    }
}

/// A persisted automation rule: match filesystem events by path prefix and
/// basename regex, then run a processor with the stored config.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutomationRule {
    pub id: Uuid,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub event: FsEvent,
    pub path_pattern: Option<String>,
    pub filename_regex: Option<String>,
    pub processor_type: String,
    pub processor_config: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRule {
    pub name: String,
    pub event: FsEvent,
    pub path_pattern: Option<String>,
    pub filename_regex: Option<String>,
    pub processor_type: String,
    pub processor_config: serde_json::Value,
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRule {
    pub name: Option<String>,
    pub event: Option<FsEvent>,
    pub path_pattern: Option<String>,
    pub filename_regex: Option<String>,
    pub processor_type: Option<String>,
    pub processor_config: Option<serde_json::Value>,
    pub enabled: Option<bool>,
}
