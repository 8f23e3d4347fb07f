use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::FsResult;
use crate::models::ConfigField;

pub mod vector_index;
pub mod watermark;

/// Everything a client needs to render a processor's config form and decide
/// whether its output replaces a file.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorDescriptor {
    pub type_tag: &'static str,
    pub name: &'static str,
    pub supported_exts: &'static [&'static str],
    pub config_schema: Vec<ConfigField>,
    pub produces_file: bool,
}

/// A processor either produces replacement file bytes or a plain message.
pub enum ProcessorOutput {
    File { bytes: Vec<u8>, mime: &'static str },
    Message(String),
}

/// A pluggable content transformer, invoked on demand through the facade or
/// by the automation pipeline.
#[async_trait]
pub trait Processor: Send + Sync {
    fn descriptor(&self) -> ProcessorDescriptor;

    async fn process(
        &self,
        input: &[u8],
        path: &str,
        config: &serde_json::Value,
    ) -> FsResult<ProcessorOutput>;
}

/// Explicitly wired processor map. Construction happens once at startup;
/// lookups are read-only afterwards.
pub struct ProcessorRegistry {
    map: HashMap<&'static str, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        ProcessorRegistry {
            map: HashMap::new(),
        }
    }

    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        self.map.insert(processor.descriptor().type_tag, processor);
    }

    pub fn get(&self, type_tag: &str) -> Option<Arc<dyn Processor>> {
        self.map.get(type_tag).cloned()
    }

    pub fn descriptors(&self) -> Vec<ProcessorDescriptor> {
        let mut all: Vec<ProcessorDescriptor> =
            self.map.values().map(|p| p.descriptor()).collect();
        all.sort_by(|a, b| a.type_tag.cmp(b.type_tag));
        all
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
