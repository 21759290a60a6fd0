//! Training job routes under `/api/train`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use raptgen_runtime::{ChildDetail, JobSearch, ParentDetail, TrainingSubmission};
use raptgen_store::ParentJob;

use super::{ApiResult, PatchPayload, UuidPayload};
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/train/device/process", get(list_devices))
        .route("/train/jobs/submit", post(submit))
        .route("/train/jobs/search", post(search))
        .route(
            "/train/jobs/items/{uuid}",
            get(get_job).patch(patch_job).delete(delete_job),
        )
        .route("/train/jobs/items/{uuid}/{index}", get(get_unit))
        .route("/train/jobs/suspend", post(suspend))
        .route("/train/jobs/resume", post(resume))
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.orchestrator.devices().names())
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TrainingSubmission>,
) -> ApiResult<Json<serde_json::Value>> {
    let uuid = state.orchestrator.submit(req)?;
    Ok(Json(serde_json::json!({ "uuid": uuid })))
}

async fn search(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JobSearch>,
) -> ApiResult<Json<Vec<ParentDetail>>> {
    let jobs = state.orchestrator.search(&req)?;
    let details = jobs
        .iter()
        .map(|job| state.orchestrator.parent_detail(&job.id))
        .collect::<raptgen_core::Result<Vec<_>>>()?;
    Ok(Json(details))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<ParentDetail>> {
    Ok(Json(state.orchestrator.parent_detail(&uuid)?))
}

async fn patch_job(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Json(req): Json<PatchPayload>,
) -> ApiResult<Json<ParentJob>> {
    Ok(Json(state.orchestrator.rename(&uuid, req.new_name()?)?))
}

async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_unit(
    State(state): State<Arc<AppState>>,
    Path((uuid, index)): Path<(String, u32)>,
) -> ApiResult<Json<ChildDetail>> {
    Ok(Json(state.orchestrator.child_detail(&uuid, index)?))
}

async fn suspend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UuidPayload>,
) -> ApiResult<Json<ParentJob>> {
    Ok(Json(state.orchestrator.suspend(&req.uuid).await?))
}

async fn resume(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UuidPayload>,
) -> ApiResult<Json<ParentJob>> {
    Ok(Json(state.orchestrator.resume(&req.uuid).await?))
}
