use crate::models::StorageAdapter;

/// Pick the adapter whose mount path is the longest prefix of `path`.
/// Mount paths are unique across enabled adapters, so there is never a tie.
/// Returns the winning record and the relative path below its mount.
pub fn select_mount<'a>(
    adapters: &'a [StorageAdapter],
    path: &str,
) -> Option<(&'a StorageAdapter, String)> {
    let mut best: Option<&StorageAdapter> = None;
    for adapter in adapters {
        let mount = adapter.mount_path.trim_end_matches('/');
        let covers = if mount.is_empty() {
            // Root mount covers everything.
            true
        } else {
            path == mount || path.starts_with(&format!("{}/", mount))
        };
        if covers && best.map_or(true, |b| adapter.mount_path.len() > b.mount_path.len()) {
            best = Some(adapter);
        }
    }
    let best = best?;
    let rel = path[best.mount_path.trim_end_matches('/').len()..]
        .trim_start_matches('/')
        .to_string();
    Some((best, rel))
}

/// Names of adapter mounts that sit directly beneath `path`: mounts whose
/// path extends `path` by exactly one segment. These become synthetic
/// `mount` entries in directory listings.
pub fn child_mount_names(adapters: &[StorageAdapter], path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path.trim_end_matches('/'))
    };
    let mut names: Vec<String> = adapters
        .iter()
        .filter(|a| a.mount_path != path)
        .filter_map(|a| {
            let tail = a.mount_path.strip_prefix(&prefix)?;
            let tail = tail.trim_matches('/');
            if tail.is_empty() || tail.contains('/') {
                None
            } else {
                Some(tail.to_string())
            }
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn adapter(mount_path: &str) -> StorageAdapter {
        StorageAdapter {
            id: Uuid::new_v4(),
            name: format!("mount {}", mount_path),
            adapter_type: "local".to_string(),
            config: json!({"root": "/tmp"}),
            enabled: true,
            mount_path: mount_path.to_string(),
            sub_path: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn selects_longest_matching_mount() {
        let adapters = vec![adapter("/local"), adapter("/local/cloud"), adapter("/other")];

        let (picked, rel) = select_mount(&adapters, "/local/cloud/x.txt").unwrap();
        assert_eq!(picked.mount_path, "/local/cloud");
        assert_eq!(rel, "x.txt");

        let (picked, rel) = select_mount(&adapters, "/local/docs/a.txt").unwrap();
        assert_eq!(picked.mount_path, "/local");
        assert_eq!(rel, "docs/a.txt");

        let (picked, rel) = select_mount(&adapters, "/local").unwrap();
        assert_eq!(picked.mount_path, "/local");
        assert_eq!(rel, "");
    }

    #[test]
    fn prefix_must_end_on_a_segment_boundary() {
        let adapters = vec![adapter("/local")];
        assert!(select_mount(&adapters, "/localized/file").is_none());
    }

    #[test]
    fn no_adapter_for_uncovered_path() {
        let adapters = vec![adapter("/a"), adapter("/b")];
        assert!(select_mount(&adapters, "/c/d").is_none());
    }

    #[test]
    fn root_mount_covers_everything() {
        let adapters = vec![adapter("/"), adapter("/special")];
        let (picked, rel) = select_mount(&adapters, "/anything/deep").unwrap();
        assert_eq!(picked.mount_path, "/");
        assert_eq!(rel, "anything/deep");

        let (picked, _) = select_mount(&adapters, "/special/deep").unwrap();
        assert_eq!(picked.mount_path, "/special");
    }

    #[test]
    fn immediate_child_mounts_only() {
        let adapters = vec![
            adapter("/local"),
            adapter("/local/cloud"),
            adapter("/local/cloud/nested"),
            adapter("/elsewhere"),
        ];
        assert_eq!(child_mount_names(&adapters, "/local"), vec!["cloud"]);
        assert_eq!(child_mount_names(&adapters, "/local/cloud"), vec!["nested"]);
        assert_eq!(
            child_mount_names(&adapters, "/"),
            vec!["elsewhere", "local"]
        );
    }
}
