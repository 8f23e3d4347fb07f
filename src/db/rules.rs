use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use super::Database;
use crate::models::{AutomationRule, CreateRule, FsEvent, UpdateRule};

impl Database {
    pub async fn list_rules(&self) -> Result<Vec<AutomationRule>> {
        let rows = sqlx::query_as::<_, AutomationRule>(
            r#"SELECT * FROM automation_rules ORDER BY created_at"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Enabled rules for one event kind, in creation order. The automation
    /// matcher scans these linearly on every event.
    pub async fn list_enabled_rules_for_event(
        &self,
        event: FsEvent,
    ) -> Result<Vec<AutomationRule>> {
        let rows = sqlx::query_as::<_, AutomationRule>(
            r#"SELECT * FROM automation_rules
               WHERE event = $1 AND enabled = TRUE
               ORDER BY created_at"#,
        )
        .bind(event.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>> {
        let row =
            sqlx::query_as::<_, AutomationRule>(r#"SELECT * FROM automation_rules WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn create_rule(&self, create: &CreateRule) -> Result<AutomationRule> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, AutomationRule>(
            r#"INSERT INTO automation_rules
                   (id, name, event, path_pattern, filename_regex, processor_type,
                    processor_config, enabled, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(&create.name)
        .bind(create.event.to_string())
        .bind(&create.path_pattern)
        .bind(&create.filename_regex)
        .bind(&create.processor_type)
        .bind(&create.processor_config)
        .bind(create.enabled.unwrap_or(true))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_rule(
        &self,
        id: Uuid,
        update: &UpdateRule,
    ) -> Result<Option<AutomationRule>> {
        let row = sqlx::query_as::<_, AutomationRule>(
            r#"UPDATE automation_rules SET
                   name = COALESCE($2, name),
                   event = COALESCE($3, event),
                   path_pattern = COALESCE($4, path_pattern),
                   filename_regex = COALESCE($5, filename_regex),
                   processor_type = COALESCE($6, processor_type),
                   processor_config = COALESCE($7, processor_config),
                   enabled = COALESCE($8, enabled),
                   updated_at = $9
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(&update.name)
        .bind(update.event.map(|e| e.to_string()))
        .bind(&update.path_pattern)
        .bind(&update.filename_regex)
        .bind(&update.processor_type)
        .bind(&update.processor_config)
        .bind(update.enabled)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(r#"DELETE FROM automation_rules WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
