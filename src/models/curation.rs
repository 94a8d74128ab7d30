use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CurationStatus {
    Pending,
    Approved,
    Rejected,
    Processing,
    Completed,
}

/// Candidate image returned by the external image source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceImage {
    pub source_id: String,
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub author: Option<String>,
    pub reactions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CuratedImageItem {
    pub id: Uuid,
    pub source_url: String,
    pub source_id: String,
    pub status: CurationStatus,
    pub quality_score: Option<f64>,
    pub gender: Option<String>,
    pub species: Option<String>,
    pub rejection_reason: Option<String>,
    pub generated_character_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Raw classifier output for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAssessment {
    /// 0.0 - 10.0
    pub quality_score: f64,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub single_character: bool,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Admit/reject decision written back to a curated item.
#[derive(Debug, Clone, PartialEq)]
pub struct CurationDecision {
    pub status: CurationStatus,
    pub quality_score: f64,
    pub gender: Option<String>,
    pub species: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemFailure {
    pub item_id: Uuid,
    pub error: String,
}

/// Outcome of one `process_pending_items` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CurationSummary {
    pub processed: usize,
    pub approved: usize,
    pub rejected: usize,
    pub errors: usize,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
}

/// Query sent to the image source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceFilter {
    pub limit: usize,
    /// "Day", "Week", "Month"
    pub period: String,
    pub sort: String,
    pub allow_nsfw: bool,
}

impl Default for SourceFilter {
    fn default() -> Self {
        Self {
            limit: 50,
            period: "Day".to_string(),
            sort: "Most Reactions".to_string(),
            allow_nsfw: false,
        }
    }
}
