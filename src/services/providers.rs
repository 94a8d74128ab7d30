//! Seams to the external services the pipelines depend on.

use async_trait::async_trait;

use crate::models::character::{CharacterDraft, ImageView, LoraConfig};
use crate::models::curation::{CuratedImageItem, ImageAssessment, SourceFilter, SourceImage};
use crate::services::storage::StorageError;

/// Inputs for rendering one view of a character.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub view: ImageView,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub lora: Option<LoraConfig>,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Raw encoded image bytes (PNG, JPEG or WebP).
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ProviderError>;
}

#[async_trait]
pub trait ImageClassifier: Send + Sync {
    async fn classify(&self, image_url: &str) -> Result<ImageAssessment, ProviderError>;
}

#[async_trait]
pub trait CharacterDrafter: Send + Sync {
    async fn draft(&self, item: &CuratedImageItem) -> Result<CharacterDraft, ProviderError>;
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_trending_images(&self, filter: &SourceFilter) -> Result<Vec<SourceImage>, ProviderError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key` and return its public URL.
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String, StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected provider response: {0}")]
    Parse(String),

    #[error("Malformed JSON in provider response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Slice from the first `{` to the last `}`. Model output often wraps the JSON
/// object in prose or code fences.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_from_chatty_output() {
        let text = "Sure! Here is the JSON:\n```json\n{\"a\": {\"b\": 1}}\n```\nHope it helps.";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn no_object() {
        assert_eq!(extract_json_object("no braces here"), None);
        assert_eq!(extract_json_object("} backwards {"), None);
    }
}
