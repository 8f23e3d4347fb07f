use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One indexed entry, keyed by virtual path. Plain-path entries (no
/// embedding) come from the `simple` index type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    collections: HashMap<String, HashMap<String, VectorEntry>>,
}

/// Small on-disk vector store standing in for an embedded vector database:
/// a path-keyed map per collection, persisted as JSON under `data/db`, with
/// brute-force cosine search. The engine only ever calls upsert/delete/
/// search, so the interface stays swappable for a real vector DB.
pub struct VectorStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

pub const DEFAULT_COLLECTION: &str = "vector_collection";

impl VectorStore {
    pub fn open(data_dir: &str) -> Result<Self> {
        let dir = Path::new(data_dir).join("db");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("vector_store.json");
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => StoreData::default(),
        };
        Ok(VectorStore {
            path,
            data: Mutex::new(data),
        })
    }

    fn persist_locked(&self, data: &StoreData) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn ensure_collection(&self, name: &str) {
        let mut data = self.data.lock().unwrap();
        data.collections.entry(name.to_string()).or_default();
    }

    pub fn upsert(&self, collection: &str, entry: VectorEntry) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.collections
            .entry(collection.to_string())
            .or_default()
            .insert(entry.path.clone(), entry);
        self.persist_locked(&data)
    }

    pub fn delete(&self, collection: &str, path: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(entries) = data.collections.get_mut(collection) {
            if entries.remove(path).is_some() {
                debug!("removed {} from collection {}", path, collection);
            }
        }
        self.persist_locked(&data)
    }

    /// Brute-force cosine similarity over every embedded entry.
    pub fn search(&self, collection: &str, query: &[f32], top_k: usize) -> Vec<SearchHit> {
        let data = self.data.lock().unwrap();
        let Some(entries) = data.collections.get(collection) else {
            return Vec::new();
        };
        let mut hits: Vec<SearchHit> = entries
            .values()
            .filter_map(|entry| {
                let embedding = entry.embedding.as_ref()?;
                Some(SearchHit {
                    path: entry.path.clone(),
                    score: cosine_similarity(query, embedding),
                    description: entry.description.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }

    /// Substring match over indexed paths, for the simple index type.
    pub fn search_by_path(&self, collection: &str, needle: &str, limit: usize) -> Vec<SearchHit> {
        let data = self.data.lock().unwrap();
        let Some(entries) = data.collections.get(collection) else {
            return Vec::new();
        };
        let mut hits: Vec<SearchHit> = entries
            .values()
            .filter(|entry| entry.path.contains(needle))
            .map(|entry| SearchHit {
                path: entry.path.clone(),
                score: 1.0,
                description: entry.description.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.path.cmp(&b.path));
        hits.truncate(limit);
        hits
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (VectorStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path().to_str().unwrap()).unwrap();
        (store, dir)
    }

    #[test]
    fn upsert_search_delete_cycle() {
        let (s, _dir) = store();
        s.upsert(
            DEFAULT_COLLECTION,
            VectorEntry {
                path: "/a.jpg".into(),
                embedding: Some(vec![1.0, 0.0]),
                description: Some("a red square".into()),
            },
        )
        .unwrap();
        s.upsert(
            DEFAULT_COLLECTION,
            VectorEntry {
                path: "/b.jpg".into(),
                embedding: Some(vec![0.0, 1.0]),
                description: None,
            },
        )
        .unwrap();

        let hits = s.search(DEFAULT_COLLECTION, &[1.0, 0.1], 10);
        assert_eq!(hits[0].path, "/a.jpg");
        assert!(hits[0].score > hits[1].score);

        s.delete(DEFAULT_COLLECTION, "/a.jpg").unwrap();
        let hits = s.search(DEFAULT_COLLECTION, &[1.0, 0.1], 10);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn path_search_ignores_unembedded_entries_in_vector_search() {
        let (s, _dir) = store();
        s.upsert(
            DEFAULT_COLLECTION,
            VectorEntry {
                path: "/docs/readme.md".into(),
                embedding: None,
                description: None,
            },
        )
        .unwrap();

        assert!(s.search(DEFAULT_COLLECTION, &[1.0], 10).is_empty());
        let hits = s.search_by_path(DEFAULT_COLLECTION, "readme", 10);
        assert_eq!(hits.len(), 1);
    }
}
