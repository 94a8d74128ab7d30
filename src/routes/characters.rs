use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::store::CharacterStore;
use crate::models::api::{EnqueueResponse, GenerateImagesRequest};
use crate::models::job::{GenerateCharacterImages, JobOptions, JobPayload};

/// POST /api/v1/characters/{character_id}/images: queue a paid multi-view
/// generation. Credits are debited when the job runs.
pub async fn generate_images(
    State(state): State<AppState>,
    Path(character_id): Path<Uuid>,
    Json(body): Json<GenerateImagesRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), StatusCode> {
    body.validate().map_err(|e| {
        tracing::debug!(error = %e, "Rejected image generation request");
        StatusCode::UNPROCESSABLE_ENTITY
    })?;

    let character = state
        .store
        .get_character(character_id)
        .await
        .map_err(|e| {
            tracing::error!(%character_id, error = %e, "Failed to load character");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    if character.user_id != body.user_id {
        return Err(StatusCode::FORBIDDEN);
    }

    let payload = JobPayload::GenerateCharacterImages(GenerateCharacterImages {
        character_id,
        user_id: body.user_id,
        stages: body.stages,
        regenerate: body.regenerate,
    });
    let job = state
        .queue
        .enqueue(payload, JobOptions::default())
        .await
        .map_err(|e| {
            tracing::error!(%character_id, error = %e, "Failed to enqueue image generation");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse::from(&job))))
}
