use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use super::Database;
use crate::models::{CreateAdapter, StorageAdapter, UpdateAdapter};

impl Database {
    pub async fn list_adapters(&self) -> Result<Vec<StorageAdapter>> {
        let rows = sqlx::query_as::<_, StorageAdapter>(
            r#"SELECT * FROM storage_adapters ORDER BY mount_path"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_enabled_adapters(&self) -> Result<Vec<StorageAdapter>> {
        let rows = sqlx::query_as::<_, StorageAdapter>(
            r#"SELECT * FROM storage_adapters WHERE enabled = TRUE ORDER BY mount_path"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_adapter(&self, id: Uuid) -> Result<Option<StorageAdapter>> {
        let row = sqlx::query_as::<_, StorageAdapter>(
            r#"SELECT * FROM storage_adapters WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn create_adapter(&self, create: &CreateAdapter) -> Result<StorageAdapter> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, StorageAdapter>(
            r#"INSERT INTO storage_adapters
                   (id, name, adapter_type, config, enabled, mount_path, sub_path, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(&create.name)
        .bind(&create.adapter_type)
        .bind(&create.config)
        .bind(create.enabled.unwrap_or(true))
        .bind(&create.mount_path)
        .bind(&create.sub_path)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_adapter(
        &self,
        id: Uuid,
        update: &UpdateAdapter,
    ) -> Result<Option<StorageAdapter>> {
        let row = sqlx::query_as::<_, StorageAdapter>(
            r#"UPDATE storage_adapters SET
                   name = COALESCE($2, name),
                   config = COALESCE($3, config),
                   enabled = COALESCE($4, enabled),
                   mount_path = COALESCE($5, mount_path),
                   sub_path = COALESCE($6, sub_path),
                   updated_at = $7
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(&update.name)
        .bind(&update.config)
        .bind(update.enabled)
        .bind(&update.mount_path)
        .bind(&update.sub_path)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_adapter(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(r#"DELETE FROM storage_adapters WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
