//! Multi-stage character image generation: avatar, front, side and back views
//! rendered in order, each persisted as soon as it succeeds.

use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::time::{timeout, Instant};
use tracing::{error, info};
use uuid::Uuid;

use crate::db::store::CharacterStore;
use crate::db::StoreError;
use crate::models::character::{Character, CharacterImage, ImageView, NewCharacterImage};
use crate::models::job::{JobProgress, StageProgress};
use crate::services::providers::{GenerationRequest, ImageGenerator, ObjectStore, ProviderError};
use crate::services::queue::ProgressSink;
use crate::services::storage::StorageError;

const NEGATIVE_PROMPT: &str =
    "lowres, bad anatomy, bad hands, extra fingers, missing fingers, blurry, watermark, text, signature, multiple characters";
const STYLE_SUFFIX: &str = "anime style, clean lineart, consistent character design, plain background";

/// What a completed run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageOutcome {
    /// Images written by this run, in stage order.
    pub generated: Vec<CharacterImage>,
    /// Views that already had an active image and were left alone.
    pub skipped: Vec<ImageView>,
}

impl StageOutcome {
    pub fn completed_stages(&self) -> usize {
        self.generated.len() + self.skipped.len()
    }
}

pub struct MultiStageGenerator {
    characters: Arc<dyn CharacterStore>,
    generator: Arc<dyn ImageGenerator>,
    storage: Arc<dyn ObjectStore>,
    stage_timeout: Duration,
}

impl MultiStageGenerator {
    pub fn new(
        characters: Arc<dyn CharacterStore>,
        generator: Arc<dyn ImageGenerator>,
        storage: Arc<dyn ObjectStore>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            characters,
            generator,
            storage,
            stage_timeout,
        }
    }

    /// Load the character and run [`MultiStageGenerator::run`].
    pub async fn generate_for_character(
        &self,
        character_id: Uuid,
        stages: &[ImageView],
        regenerate: bool,
        progress: &dyn ProgressSink,
    ) -> Result<StageOutcome, StageError> {
        let character = self
            .characters
            .get_character(character_id)
            .await?
            .ok_or(StageError::CharacterNotFound(character_id))?;
        self.run(&character, stages, regenerate, progress).await
    }

    /// Render `stages` (all views when empty) in canonical order. The first
    /// failing stage aborts the run; images of earlier stages stay persisted
    /// and are carried in the error.
    pub async fn run(
        &self,
        character: &Character,
        stages: &[ImageView],
        regenerate: bool,
        progress: &dyn ProgressSink,
    ) -> Result<StageOutcome, StageError> {
        let plan = plan_stages(stages);
        let total_stages = plan.len();

        let existing: BTreeSet<ImageView> = if regenerate {
            BTreeSet::new()
        } else {
            self.characters
                .active_images(character.id)
                .await?
                .into_iter()
                .map(|img| img.label)
                .collect()
        };

        let mut outcome = StageOutcome::default();

        for (idx, view) in plan.into_iter().enumerate() {
            let stage_index = idx + 1;

            if existing.contains(&view) {
                info!(character_id = %character.id, stage = %view, "Active image exists, skipping stage");
                outcome.skipped.push(view);
                progress.report(JobProgress::Stage(StageProgress {
                    stage_index,
                    total_stages,
                    label: view,
                    message: format!("{view} view already exists"),
                    completed_images: outcome.completed_stages(),
                }));
                continue;
            }

            let started = Instant::now();
            match self.run_stage(character, view).await {
                Ok(image) => {
                    histogram!("stage_duration_seconds", "stage" => view.to_string())
                        .record(started.elapsed().as_secs_f64());
                    info!(
                        character_id = %character.id,
                        stage = %view,
                        stage_index,
                        total_stages,
                        image_id = %image.id,
                        "Stage completed"
                    );
                    outcome.generated.push(image);
                    progress.report(JobProgress::Stage(StageProgress {
                        stage_index,
                        total_stages,
                        label: view,
                        message: format!("{view} view generated"),
                        completed_images: outcome.completed_stages(),
                    }));
                }
                Err(cause) => {
                    counter!("stage_failures_total", "stage" => view.to_string()).increment(1);
                    error!(
                        character_id = %character.id,
                        stage = %view,
                        stage_index,
                        total_stages,
                        error = %cause,
                        "Stage failed, aborting remaining stages"
                    );
                    return Err(StageError::Failed {
                        stage: view,
                        completed: outcome.generated,
                        cause,
                    });
                }
            }
        }

        Ok(outcome)
    }

    async fn run_stage(&self, character: &Character, view: ImageView) -> Result<CharacterImage, StageFailure> {
        let (width, height) = view.dimensions();
        let request = GenerationRequest {
            view,
            prompt: build_prompt(character, view),
            negative_prompt: NEGATIVE_PROMPT.to_string(),
            width,
            height,
            lora: character.lora.clone(),
        };

        let bytes = timeout(self.stage_timeout, self.generator.generate(&request))
            .await
            .map_err(|_| StageFailure::Timeout(self.stage_timeout))??;

        let format = validate_image(&bytes)?;
        let extension = format.extensions_str().first().copied().unwrap_or("bin");
        let key = format!("characters/{}/{}-{}.{}", character.id, view, Uuid::new_v4(), extension);

        let image_url = self.storage.upload(&key, bytes, format.to_mime_type()).await?;

        let image = self
            .characters
            .insert_image(&NewCharacterImage {
                character_id: character.id,
                label: view,
                image_url,
                storage_key: key,
            })
            .await?;
        Ok(image)
    }
}

/// Requested views, deduplicated, in canonical order. Empty means all views.
pub fn plan_stages(requested: &[ImageView]) -> Vec<ImageView> {
    if requested.is_empty() {
        return ImageView::iter().collect();
    }
    requested.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Positive prompt for one view of a character.
pub fn build_prompt(character: &Character, view: ImageView) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(4);
    if let Some(trigger) = character.lora.as_ref().and_then(|l| l.trigger_word.as_deref()) {
        parts.push(trigger.to_string());
    }
    parts.push(character.prompt.trim().to_string());
    parts.push(view.framing().to_string());
    parts.push(STYLE_SUFFIX.to_string());
    parts.retain(|p| !p.is_empty());
    parts.join(", ")
}

fn validate_image(bytes: &[u8]) -> Result<image::ImageFormat, StageFailure> {
    if bytes.is_empty() {
        return Err(StageFailure::InvalidImage("generator returned no data".to_string()));
    }
    match image::guess_format(bytes) {
        Ok(format @ (image::ImageFormat::Png | image::ImageFormat::Jpeg | image::ImageFormat::WebP)) => Ok(format),
        Ok(other) => Err(StageFailure::InvalidImage(format!("unsupported format {other:?}"))),
        Err(e) => Err(StageFailure::InvalidImage(e.to_string())),
    }
}

/// Why a single stage failed.
#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("generation failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to store image record: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Character not found: {0}")]
    CharacterNotFound(Uuid),

    #[error("Character store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stage {stage} failed: {cause}")]
    Failed {
        stage: ImageView,
        completed: Vec<CharacterImage>,
        #[source]
        cause: StageFailure,
    },
}

impl StageError {
    /// Images persisted before the failure.
    pub fn completed_images(&self) -> &[CharacterImage] {
        match self {
            StageError::Failed { completed, .. } => completed,
            _ => &[],
        }
    }
}
