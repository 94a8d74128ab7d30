use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// A view rendered by the multi-stage pipeline. Variant order is the
/// generation order.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImageView {
    Avatar,
    Front,
    Side,
    Back,
}

impl ImageView {
    /// Prompt fragment describing the framing of this view.
    pub fn framing(&self) -> &'static str {
        match self {
            ImageView::Avatar => "close-up portrait, head and shoulders, looking at viewer",
            ImageView::Front => "full body, front view, standing, neutral pose",
            ImageView::Side => "full body, side view, profile, standing",
            ImageView::Back => "full body, back view, from behind, standing",
        }
    }

    /// Output resolution (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ImageView::Avatar => (768, 768),
            _ => (768, 1152),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CharacterStatus {
    Draft,
    Ready,
}

/// LoRA adapter applied to every view of a character.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoraConfig {
    pub name: String,
    pub weight: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_word: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Character {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: String,
    /// Appearance prompt shared by all views.
    pub prompt: String,
    pub lora: Option<LoraConfig>,
    pub source_image_id: Option<Uuid>,
    pub status: CharacterStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCharacter {
    pub user_id: Uuid,
    pub name: String,
    pub description: String,
    pub prompt: String,
    pub lora: Option<LoraConfig>,
    pub source_image_id: Option<Uuid>,
}

/// Durable result of one successful stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CharacterImage {
    pub id: Uuid,
    pub character_id: Uuid,
    pub label: ImageView,
    pub image_url: String,
    pub storage_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCharacterImage {
    pub character_id: Uuid,
    pub label: ImageView,
    pub image_url: String,
    pub storage_key: String,
}

/// Character profile proposed by the LLM for a curated image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CharacterDraft {
    pub name: String,
    pub description: String,
    pub appearance_prompt: String,
    #[serde(default)]
    pub lora: Option<LoraConfig>,
}
