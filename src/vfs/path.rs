use crate::errors::{FsError, FsResult};

/// Normalize a virtual path: leading `/`, empty and `.` segments collapsed,
/// no trailing slash except for the root itself. `..` never crosses the
/// facade.
pub fn normalize_path(path: &str) -> FsResult<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(FsError::InvalidArgument(format!(
                    "path must not contain '..': {}",
                    path
                )))
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", segments.join("/")))
    }
}

pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Parent of a normalized path; the root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_dots() {
        assert_eq!(normalize_path("/a/b/c").unwrap(), "/a/b/c");
        assert_eq!(normalize_path("a//b/./c/").unwrap(), "/a/b/c");
        assert_eq!(normalize_path("").unwrap(), "/");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("///").unwrap(), "/");
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(normalize_path("/a/../b").is_err());
        assert!(normalize_path("..").is_err());
    }

    #[test]
    fn basename_and_parent() {
        assert_eq!(basename("/a/b/c.txt"), "c.txt");
        assert_eq!(parent("/a/b/c.txt"), "/a/b");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
    }
}
