mod local_backend_tests;
mod task_queue_tests;
mod watermark_tests;
mod webdav_backend_tests;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::models::StorageAdapter;

/// Adapter row fixture for constructing backends directly in tests.
pub fn adapter_record(adapter_type: &str, mount_path: &str, config: Value) -> StorageAdapter {
    StorageAdapter {
        id: Uuid::new_v4(),
        name: format!("test-{}", adapter_type),
        adapter_type: adapter_type.to_string(),
        config,
        enabled: true,
        mount_path: mount_path.to_string(),
        sub_path: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
