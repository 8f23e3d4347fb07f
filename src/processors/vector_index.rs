use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;

use super::{Processor, ProcessorDescriptor, ProcessorOutput};
use crate::errors::{FsError, FsResult};
use crate::models::{ConfigField, FieldType, SelectOption};
use crate::services::ai::AiClient;
use crate::services::vector_store::{VectorEntry, VectorStore, DEFAULT_COLLECTION};

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "bmp"];
const TEXT_EXTS: &[&str] = &["txt", "md"];
const DESCRIPTION_PREVIEW: usize = 100;

/// Indexes file content into the vector store. `vector` entries get an AI
/// embedding (via an image description for images, raw text otherwise);
/// `simple` entries are path-only. Produces no replacement file.
pub struct VectorIndexProcessor {
    store: Arc<VectorStore>,
    ai: Arc<AiClient>,
}

impl VectorIndexProcessor {
    pub fn new(store: Arc<VectorStore>, ai: Arc<AiClient>) -> Self {
        VectorIndexProcessor { store, ai }
    }
}

fn extension(path: &str) -> String {
    path.rsplit('.').next().unwrap_or("").to_lowercase()
}

#[async_trait]
impl Processor for VectorIndexProcessor {
    fn descriptor(&self) -> ProcessorDescriptor {
        ProcessorDescriptor {
            type_tag: "vector_index",
            name: "Vector index",
            supported_exts: &["jpg", "jpeg", "png", "bmp", "txt", "md"],
            config_schema: vec![
                ConfigField::required("action", "Action", FieldType::Select)
                    .with_default(json!("create"))
                    .with_options(vec![
                        SelectOption {
                            value: "create",
                            label: "Create index",
                        },
                        SelectOption {
                            value: "destroy",
                            label: "Destroy index",
                        },
                    ]),
                ConfigField::required("index_type", "Index type", FieldType::Select)
                    .with_default(json!("vector"))
                    .with_options(vec![
                        SelectOption {
                            value: "vector",
                            label: "Vector index",
                        },
                        SelectOption {
                            value: "simple",
                            label: "Plain index",
                        },
                    ]),
            ],
            produces_file: false,
        }
    }

    async fn process(
        &self,
        input: &[u8],
        path: &str,
        config: &serde_json::Value,
    ) -> FsResult<ProcessorOutput> {
        let action = config
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("create");
        let index_type = config
            .get("index_type")
            .and_then(|v| v.as_str())
            .unwrap_or("vector");

        if action == "destroy" {
            self.store
                .delete(DEFAULT_COLLECTION, path)
                .map_err(|e| FsError::internal(e.to_string()))?;
            return Ok(ProcessorOutput::Message(format!(
                "{} index for {} destroyed",
                index_type, path
            )));
        }

        if index_type == "simple" {
            self.store.ensure_collection(DEFAULT_COLLECTION);
            self.store
                .upsert(
                    DEFAULT_COLLECTION,
                    VectorEntry {
                        path: path.to_string(),
                        embedding: None,
                        description: None,
                    },
                )
                .map_err(|e| FsError::internal(e.to_string()))?;
            return Ok(ProcessorOutput::Message(format!(
                "plain index for {} created",
                path
            )));
        }

        let ext = extension(path);
        let (embedding, description) = if IMAGE_EXTS.contains(&ext.as_str()) {
            let encoded = STANDARD.encode(input);
            let description = self
                .ai
                .describe_image(&encoded)
                .await
                .map_err(|e| FsError::upstream(502, e.to_string()))?;
            let embedding = self
                .ai
                .embed_text(&description)
                .await
                .map_err(|e| FsError::upstream(502, e.to_string()))?;
            (embedding, description)
        } else if TEXT_EXTS.contains(&ext.as_str()) {
            let text = String::from_utf8_lossy(input).to_string();
            let embedding = self
                .ai
                .embed_text(&text)
                .await
                .map_err(|e| FsError::upstream(502, e.to_string()))?;
            let description = if text.chars().count() > DESCRIPTION_PREVIEW {
                format!("{}...", text.chars().take(DESCRIPTION_PREVIEW).collect::<String>())
            } else {
                text
            };
            (embedding, description)
        } else {
            return Err(FsError::InvalidArgument(format!(
                "unsupported file type for vector indexing: .{}",
                ext
            )));
        };

        self.store.ensure_collection(DEFAULT_COLLECTION);
        self.store
            .upsert(
                DEFAULT_COLLECTION,
                VectorEntry {
                    path: path.to_string(),
                    embedding: Some(embedding),
                    description: Some(description.clone()),
                },
            )
            .map_err(|e| FsError::internal(e.to_string()))?;

        Ok(ProcessorOutput::Message(format!(
            "indexed {}: {}",
            path, description
        )))
    }
}
