use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted storage adapter: one backend instance mounted at an absolute
/// virtual path. `config` is opaque to everything except the backend factory,
/// which validates it against the backend's declared schema.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StorageAdapter {
    pub id: Uuid,
    pub name: String,
    pub adapter_type: String,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub mount_path: String,
    pub sub_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StorageAdapter {
    /// String config value, treating `null` and missing keys the same.
    pub fn config_str(&self, key: &str) -> Option<String> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_bool(&self, key: &str) -> bool {
        self.config
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAdapter {
    pub name: String,
    pub adapter_type: String,
    pub config: serde_json::Value,
    pub enabled: Option<bool>,
    pub mount_path: String,
    pub sub_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateAdapter {
    pub name: Option<String>,
    pub config: Option<serde_json::Value>,
    pub enabled: Option<bool>,
    pub mount_path: Option<String>,
    pub sub_path: Option<String>,
}
