use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use crate::db::Database;

/// Read-through cache over the `settings` table with an environment
/// fallback: database row wins, then the process environment, then the
/// caller's default. Writes go to the database and update the cache in the
/// same call.
pub struct SettingsCache {
    db: Database,
    cache: Mutex<HashMap<String, String>>,
}

impl SettingsCache {
    pub fn new(db: Database) -> Self {
        SettingsCache {
            db,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.cache.lock().unwrap().get(key) {
            return Ok(Some(value.clone()));
        }
        if let Some(value) = self.db.get_setting(key).await? {
            self.cache
                .lock()
                .unwrap()
                .insert(key.to_string(), value.clone());
            return Ok(Some(value));
        }
        if let Ok(value) = std::env::var(key) {
            self.cache
                .lock()
                .unwrap()
                .insert(key.to_string(), value.clone());
            return Ok(Some(value));
        }
        Ok(None)
    }

    pub async fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.to_string()))
    }

    /// Secrets must exist somewhere; a missing one is a configuration error.
    pub async fn secret(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key)
            .await?
            .map(|v| v.into_bytes())
            .ok_or_else(|| anyhow::anyhow!("secret '{}' not found in settings or environment", key))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.set_setting(key, value).await?;
        self.cache
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn invalidate(&self) {
        self.cache.lock().unwrap().clear();
    }
}
