use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use super::StorageBackend;
use crate::db::Database;
use crate::models::{ConfigField, StorageAdapter};

type BackendFactory = fn(&StorageAdapter) -> Result<Arc<dyn StorageBackend>>;

/// Compile-time registration of one backend type: its tag, the discoverable
/// config schema, and the constructor.
pub struct BackendDescriptor {
    pub type_tag: &'static str,
    pub schema: fn() -> Vec<ConfigField>,
    pub factory: BackendFactory,
}

/// The static backend table. Adding a backend means adding a row here.
pub fn backend_descriptors() -> &'static [BackendDescriptor] {
    static DESCRIPTORS: &[BackendDescriptor] = &[
        BackendDescriptor {
            type_tag: "local",
            schema: super::local::config_schema,
            factory: super::local::factory,
        },
        BackendDescriptor {
            type_tag: "s3",
            schema: super::s3::config_schema,
            factory: super::s3::factory,
        },
        BackendDescriptor {
            type_tag: "webdav",
            schema: super::webdav::config_schema,
            factory: super::webdav::factory,
        },
        BackendDescriptor {
            type_tag: "onedrive",
            schema: super::onedrive::config_schema,
            factory: super::onedrive::factory,
        },
        BackendDescriptor {
            type_tag: "quark",
            schema: super::quark::config_schema,
            factory: super::quark::factory,
        },
        BackendDescriptor {
            type_tag: "telegram",
            schema: super::telegram::config_schema,
            factory: super::telegram::factory,
        },
    ];
    DESCRIPTORS
}

pub fn descriptor_for(type_tag: &str) -> Option<&'static BackendDescriptor> {
    backend_descriptors()
        .iter()
        .find(|d| d.type_tag == type_tag)
}

/// Live backend instances keyed by adapter id. Instances are owned here
/// exclusively; every other component borrows them via `get`. Writes are
/// rare (management API) and serialized by the lock; reads are shared.
pub struct AdapterRegistry {
    instances: RwLock<HashMap<Uuid, Arc<dyn StorageBackend>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry {
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the instance map from all enabled adapter rows. A row whose
    /// construction fails is skipped so one bad config cannot take down the
    /// rest of the namespace.
    pub async fn refresh(&self, db: &Database) -> Result<()> {
        let records = db.list_enabled_adapters().await?;
        let mut next: HashMap<Uuid, Arc<dyn StorageBackend>> = HashMap::new();
        for record in records {
            match build_instance(&record) {
                Ok(instance) => {
                    next.insert(record.id, instance);
                }
                Err(e) => {
                    warn!(
                        "skipping adapter {} ({}): construction failed: {}",
                        record.name, record.adapter_type, e
                    );
                }
            }
        }
        let count = next.len();
        *self.instances.write().unwrap() = next;
        info!("adapter registry refreshed: {} live instances", count);
        Ok(())
    }

    /// Apply one changed row: disabled rows are evicted, enabled rows are
    /// constructed and replace any previous instance. In-flight operations
    /// keep the instance they already resolved.
    pub fn upsert(&self, record: &StorageAdapter) {
        if !record.enabled {
            self.remove(record.id);
            return;
        }
        match build_instance(record) {
            Ok(instance) => {
                self.instances.write().unwrap().insert(record.id, instance);
            }
            Err(e) => {
                warn!(
                    "adapter {} ({}) failed to construct, evicting: {}",
                    record.name, record.adapter_type, e
                );
                self.remove(record.id);
            }
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.instances.write().unwrap().remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<dyn StorageBackend>> {
        self.instances.read().unwrap().get(&id).cloned()
    }

    /// A miss may just be the start-of-process race before the first refresh;
    /// retry once against the database before giving up.
    pub async fn get_or_refresh(
        &self,
        db: &Database,
        id: Uuid,
    ) -> Result<Option<Arc<dyn StorageBackend>>> {
        if let Some(instance) = self.get(id) {
            return Ok(Some(instance));
        }
        self.refresh(db).await?;
        Ok(self.get(id))
    }

    pub fn snapshot(&self) -> HashMap<Uuid, Arc<dyn StorageBackend>> {
        self.instances.read().unwrap().clone()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_instance(record: &StorageAdapter) -> Result<Arc<dyn StorageBackend>> {
    let descriptor = descriptor_for(&record.adapter_type)
        .ok_or_else(|| anyhow::anyhow!("unknown adapter type: {}", record.adapter_type))?;
    (descriptor.factory)(record)
}
