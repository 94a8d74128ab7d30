use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::JobStatusResponse;
use crate::models::job::{QueueCounts, QueueDefinition};

fn known_queue(name: &str) -> Result<(), StatusCode> {
    if QueueDefinition::defaults().iter().any(|d| d.name == name) {
        Ok(())
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// GET /api/v1/queues/{queue}: per-state job counts.
pub async fn queue_counts(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<QueueCounts>, StatusCode> {
    known_queue(&queue)?;
    let counts = state.queue.get_queue(&queue).counts().await.map_err(|e| {
        tracing::error!(queue = %queue, error = %e, "Failed to read queue counts");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(Json(counts))
}

/// GET /api/v1/queues/{queue}/jobs/{job_id}: state, progress and result of one job.
pub async fn job_status(
    State(state): State<AppState>,
    Path((queue, job_id)): Path<(String, Uuid)>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    known_queue(&queue)?;
    let job = state
        .queue
        .get_queue(&queue)
        .get_job(job_id)
        .await
        .map_err(|e| {
            tracing::error!(queue = %queue, %job_id, error = %e, "Failed to load job");
            StatusCode::SERVICE_UNAVAILABLE
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(job.into()))
}
