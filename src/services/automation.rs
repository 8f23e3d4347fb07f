use std::sync::Arc;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{AutomationRule, FsEvent};
use crate::services::task_queue::TaskQueue;
use crate::vfs::path::basename;

/// A rule matches when its path prefix covers the event path and its
/// filename regex matches at the start of the basename. An absent filter
/// always passes, so a rule with neither matches every event of its kind.
pub fn rule_matches(rule: &AutomationRule, path: &str) -> bool {
    if let Some(prefix) = rule.path_pattern.as_deref().filter(|p| !p.is_empty()) {
        if !path.starts_with(prefix) {
            return false;
        }
    }
    if let Some(pattern) = rule.filename_regex.as_deref().filter(|p| !p.is_empty()) {
        let anchored = format!(r"\A(?:{})", pattern);
        match Regex::new(&anchored) {
            Ok(regex) => {
                if !regex.is_match(basename(path)) {
                    return false;
                }
            }
            Err(e) => {
                warn!("rule {} has an invalid filename regex: {}", rule.id, e);
                return false;
            }
        }
    }
    true
}

/// Filter enabled rules for this event and enqueue one automation task per
/// match. Called synchronously after a successful mutation; the linear scan
/// over rules is intentional.
pub async fn dispatch_event(
    db: &Database,
    queue: &Arc<TaskQueue>,
    event: FsEvent,
    path: &str,
) -> Result<()> {
    let rules = db.list_enabled_rules_for_event(event).await?;
    for rule in rules.iter().filter(|r| rule_matches(r, path)) {
        debug!("rule {} matched {} for {}", rule.name, event, path);
        queue.enqueue(
            "automation_task",
            serde_json::json!({
                "rule_id": rule.id.to_string(),
                "path": path,
            }),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn rule(path_pattern: Option<&str>, filename_regex: Option<&str>) -> AutomationRule {
        AutomationRule {
            id: Uuid::new_v4(),
            name: "watermark photos".to_string(),
            event: FsEvent::FileWritten,
            path_pattern: path_pattern.map(|s| s.to_string()),
            filename_regex: filename_regex.map(|s| s.to_string()),
            processor_type: "watermark".to_string(),
            processor_config: json!({}),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn prefix_and_regex_both_must_match() {
        let r = rule(Some("/photos/"), Some(r".*\.jpg"));
        assert!(rule_matches(&r, "/photos/x.jpg"));
        assert!(rule_matches(&r, "/photos/2024/trip.jpg"));
        assert!(!rule_matches(&r, "/photos/x.png"));
        assert!(!rule_matches(&r, "/docs/x.jpg"));
    }

    #[test]
    fn absent_filters_match_everything() {
        let r = rule(None, None);
        assert!(rule_matches(&r, "/anything/at/all.bin"));
    }

    #[test]
    fn regex_is_anchored_at_the_start_of_the_basename() {
        let r = rule(None, Some(r"report"));
        assert!(rule_matches(&r, "/x/report-final.pdf"));
        assert!(!rule_matches(&r, "/x/final-report.pdf"));
    }

    #[test]
    fn invalid_regex_never_matches() {
        let r = rule(None, Some(r"([unclosed"));
        assert!(!rule_matches(&r, "/x/file.txt"));
    }
}
