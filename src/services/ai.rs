use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use crate::services::settings::SettingsCache;

const DEFAULT_API_URL: &str = "https://api.siliconflow.cn/v1/chat/completions";
const DEFAULT_VISION_MODEL: &str = "Qwen/Qwen2.5-VL-32B-Instruct";
const DEFAULT_EMBED_MODEL: &str = "Qwen/Qwen3-Embedding-8B";

/// Thin client for the external AI provider. The engine only ever needs two
/// calls: describe an image, embed a text. Endpoint, models, and key are all
/// settings-backed so they can be changed at runtime.
pub struct AiClient {
    client: reqwest::Client,
    settings: Arc<SettingsCache>,
}

impl AiClient {
    pub fn new(settings: Arc<SettingsCache>) -> Result<Self> {
        Ok(AiClient {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            settings,
        })
    }

    pub async fn describe_image(&self, image_base64: &str) -> Result<String> {
        let api_url = self.settings.get_or("AI_API_URL", DEFAULT_API_URL).await?;
        let model = self
            .settings
            .get_or("AI_VISION_MODEL", DEFAULT_VISION_MODEL)
            .await?;
        let api_key = self.settings.get_or("AI_API_KEY", "").await?;

        let payload = json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:image/jpeg;base64,{}", image_base64),
                            "detail": "high",
                        },
                    },
                    { "type": "text", "text": "Describe this image." },
                ],
            }],
        });

        let resp = self
            .client
            .post(&api_url)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        body.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("vision response missing content"))
    }

    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let api_url = self.settings.get_or("AI_API_URL", DEFAULT_API_URL).await?;
        let embed_url = api_url.replace("chat/completions", "embeddings");
        let model = self
            .settings
            .get_or("AI_EMBED_MODEL", DEFAULT_EMBED_MODEL)
            .await?;
        let api_key = self.settings.get_or("AI_API_KEY", "").await?;

        let resp = self
            .client
            .post(&embed_url)
            .bearer_auth(&api_key)
            .json(&json!({ "model": model, "input": text }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        let embedding = body
            .pointer("/data/0/embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("embedding response missing data"))?;
        Ok(embedding
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|f| f as f32)
            .collect())
    }
}
