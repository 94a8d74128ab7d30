//! Cloudflare Workers AI: SDXL for character views, LLaVA for candidate
//! classification and an instruct LLM for character drafts.

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::models::character::CharacterDraft;
use crate::models::curation::{CuratedImageItem, ImageAssessment};
use crate::services::providers::{
    extract_json_object, CharacterDrafter, GenerationRequest, ImageClassifier, ImageGenerator,
    ProviderError,
};

const API_BASE: &str = "https://api.cloudflare.com/client/v4/accounts";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const SDXL_STEPS: u32 = 20;

const CLASSIFY_PROMPT: &str = concat!(
    "Assess this image as reference art for an original anime-style character. ",
    "Return ONLY a JSON object with these fields: ",
    "quality_score (number from 0 to 10), gender (string), species (string), ",
    "single_character (true if exactly one character is shown), ",
    "nsfw (true if the image is sexual or explicit), description (one sentence)."
);

const DRAFT_SYSTEM_PROMPT: &str = concat!(
    "You create original characters for a chat platform. ",
    "Given a short description of reference art, answer with ONLY a JSON object with fields: ",
    "name (a fitting first name), description (two or three sentences of personality and background), ",
    "appearance_prompt (comma-separated visual tags for an image model: hair, eyes, outfit, build)."
);

/// Client for Cloudflare Workers AI models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
    image_model: String,
    vision_model: String,
    text_model: String,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

#[derive(Deserialize)]
struct TextResponse {
    result: TextResult,
}

#[derive(Deserialize)]
struct TextResult {
    response: String,
}

/// Lenient shape of the classifier answer; models drift on field types.
#[derive(Deserialize)]
struct RawAssessment {
    #[serde(default)]
    quality_score: Option<serde_json::Value>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    species: Option<String>,
    #[serde(default)]
    single_character: Option<bool>,
    #[serde(default)]
    nsfw: Option<bool>,
    #[serde(default)]
    description: Option<String>,
}

impl WorkersAiClient {
    pub fn new(
        account_id: &str,
        api_token: &str,
        image_model: &str,
        vision_model: &str,
        text_model: &str,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            image_model: image_model.to_string(),
            vision_model: vision_model.to_string(),
            text_model: text_model.to_string(),
        })
    }

    fn model_url(&self, model: &str) -> String {
        format!("{API_BASE}/{}/ai/run/{model}", self.account_id)
    }

    async fn run(&self, model: &str, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(self.model_url(model))
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ImageGenerator for WorkersAiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
        let body = serde_json::json!({
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt,
            "width": request.width,
            "height": request.height,
            "num_steps": SDXL_STEPS,
        });

        let response = self.run(&self.image_model, &body).await?;
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if is_json {
            let text = response.text().await?;
            return Err(ProviderError::Parse(format!("expected image bytes, got JSON: {text}")));
        }

        let bytes = response.bytes().await?;
        debug!(view = %request.view, size = bytes.len(), "Image generated");
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageClassifier for WorkersAiClient {
    async fn classify(&self, image_url: &str) -> Result<ImageAssessment, ProviderError> {
        let image = self.http.get(image_url).send().await?.error_for_status()?.bytes().await?;

        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(&image),
            "prompt": CLASSIFY_PROMPT,
            "max_tokens": 512,
        });

        let llava: LlavaResponse = self.run(&self.vision_model, &body).await?.json().await?;
        parse_assessment(&llava.result.description)
    }
}

#[async_trait]
impl CharacterDrafter for WorkersAiClient {
    async fn draft(&self, item: &CuratedImageItem) -> Result<CharacterDraft, ProviderError> {
        let traits = format!(
            "Reference art {}. Gender: {}. Species: {}.",
            item.source_url,
            item.gender.as_deref().unwrap_or("unspecified"),
            item.species.as_deref().unwrap_or("unspecified"),
        );
        let body = serde_json::json!({
            "messages": [
                { "role": "system", "content": DRAFT_SYSTEM_PROMPT },
                { "role": "user", "content": traits },
            ],
            "max_tokens": 512,
        });

        let text: TextResponse = self.run(&self.text_model, &body).await?.json().await?;
        parse_draft(&text.result.response)
    }
}

/// Parse the LLaVA answer into an assessment. Scores outside 0-10 are clamped.
pub fn parse_assessment(text: &str) -> Result<ImageAssessment, ProviderError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ProviderError::Parse(format!("no JSON object in classifier output: {text}")))?;
    let raw: RawAssessment = serde_json::from_str(json)?;

    let quality_score = match raw.quality_score {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ProviderError::Parse("classifier output has no quality_score".to_string()))?;

    Ok(ImageAssessment {
        quality_score: quality_score.clamp(0.0, 10.0),
        gender: raw.gender.filter(|s| !s.trim().is_empty()),
        species: raw.species.filter(|s| !s.trim().is_empty()),
        single_character: raw.single_character.unwrap_or(false),
        nsfw: raw.nsfw.unwrap_or(false),
        description: raw.description,
    })
}

pub fn parse_draft(text: &str) -> Result<CharacterDraft, ProviderError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ProviderError::Parse(format!("no JSON object in draft output: {text}")))?;
    let draft: CharacterDraft = serde_json::from_str(json)?;
    if draft.name.trim().is_empty() || draft.appearance_prompt.trim().is_empty() {
        return Err(ProviderError::Parse("draft is missing a name or appearance prompt".to_string()));
    }
    Ok(draft)
}
