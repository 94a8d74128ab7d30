use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{NaiveTime, Utc};
use garde::Validate;

use crate::app_state::AppState;
use crate::config::runtime::KNOWN_KEYS;
use crate::config::RuntimeSettings;
use crate::db::store::{BatchLogStore, SettingsStore};
use crate::models::api::{BatchGenerationRequest, CurationRunRequest, EnqueueResponse, SettingValue};
use crate::models::batch::BatchGenerationLog;
use crate::models::job::{BatchGenerate, CurationRun, JobOptions, JobPayload};

async fn enqueue(state: &AppState, payload: JobPayload) -> Result<(StatusCode, Json<EnqueueResponse>), StatusCode> {
    let job = state
        .queue
        .enqueue(payload, JobOptions::default())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to enqueue admin job");
            StatusCode::SERVICE_UNAVAILABLE
        })?;
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse::from(&job))))
}

/// POST /api/v1/admin/batch-generation
pub async fn start_batch_generation(
    State(state): State<AppState>,
    Json(body): Json<BatchGenerationRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), StatusCode> {
    body.validate().map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let payload = JobPayload::BatchGenerate(BatchGenerate {
        count: body.count,
        user_id: body.user_id.unwrap_or(state.config.system_user_id),
        specific_image_ids: body.specific_image_ids,
        max_retries: body.max_retries,
        delay_between_ms: body.delay_between_ms,
    });
    enqueue(&state, payload).await
}

/// GET /api/v1/admin/batch-generation/logs: today's runs (UTC).
pub async fn todays_batch_logs(State(state): State<AppState>) -> Result<Json<Vec<BatchGenerationLog>>, StatusCode> {
    let start = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
    let logs = state
        .store
        .logs_scheduled_between(start, start + chrono::Duration::days(1))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to list batch generation logs");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(logs))
}

/// POST /api/v1/admin/curation/run
pub async fn start_curation(
    State(state): State<AppState>,
    body: Option<Json<CurationRunRequest>>,
) -> Result<(StatusCode, Json<EnqueueResponse>), StatusCode> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    body.validate().map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let payload = JobPayload::CurationRun(CurationRun {
        fetch_limit: body.fetch_limit,
        process_limit: body.process_limit,
    });
    enqueue(&state, payload).await
}

/// GET /api/v1/admin/settings: effective runtime settings.
pub async fn get_settings(State(state): State<AppState>) -> Result<Json<RuntimeSettings>, StatusCode> {
    let fallback = RuntimeSettings::from(state.config.as_ref());
    let settings = RuntimeSettings::load(state.store.as_ref(), fallback)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to load runtime settings");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(settings))
}

/// PUT /api/v1/admin/settings/{key}
pub async fn put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<SettingValue>,
) -> Result<StatusCode, StatusCode> {
    if !KNOWN_KEYS.contains(&key.as_str()) {
        return Err(StatusCode::NOT_FOUND);
    }
    body.validate().map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    state
        .store
        .put_setting(&key, body.value.trim())
        .await
        .map_err(|e| {
            tracing::error!(key = %key, error = %e, "Failed to store setting");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    tracing::info!(key = %key, value = %body.value, "Runtime setting updated");
    Ok(StatusCode::NO_CONTENT)
}
