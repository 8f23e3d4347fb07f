use serde::{Deserialize, Serialize};

/// What a directory-listing entry represents. `Mount` is synthetic: a child
/// adapter attached beneath the listed path, not a real entry of the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "dir")]
    Dir,
    #[serde(rename = "mount")]
    Mount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Seconds since epoch; 0 means the backend does not know.
    pub mtime: i64,
    pub kind: EntryKind,
    pub is_image: bool,
}

impl DirEntry {
    pub fn file(name: impl Into<String>, size: u64, mtime: i64) -> Self {
        let name = name.into();
        let is_image = crate::services::thumbnail::is_image_filename(&name);
        DirEntry {
            name,
            is_dir: false,
            size,
            mtime,
            kind: EntryKind::File,
            is_image,
        }
    }

    pub fn dir(name: impl Into<String>, mtime: i64) -> Self {
        DirEntry {
            name: name.into(),
            is_dir: true,
            size: 0,
            mtime,
            kind: EntryKind::Dir,
            is_image: false,
        }
    }

    pub fn mount(name: impl Into<String>) -> Self {
        DirEntry {
            name: name.into(),
            is_dir: true,
            size: 0,
            mtime: 0,
            kind: EntryKind::Mount,
            is_image: false,
        }
    }
}

/// Metadata for a single path, as returned by `stat_file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: i64,
    pub kind: EntryKind,
    /// Backend-specific extras (unix mode, remote file id, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Non-failing probe used by the move/copy pre-checks and their debug traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathProbe {
    pub exists: bool,
    pub is_dir: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PathProbe {
    pub fn missing() -> Self {
        PathProbe {
            exists: false,
            is_dir: None,
            detail: None,
        }
    }
}
