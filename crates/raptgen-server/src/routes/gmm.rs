//! BIC-sweep routes under `/api/gmm`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use raptgen_runtime::{SweepDetail, SweepSearch};
use raptgen_store::{NewSweepJob, SweepJob};
use serde::Deserialize;

use super::{ApiResult, PatchPayload, UuidPayload};
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/gmm/jobs/submit", post(submit))
        .route("/gmm/jobs/search", post(search))
        .route(
            "/gmm/jobs/items/{uuid}",
            get(get_sweep).patch(patch_sweep).delete(delete_sweep),
        )
        .route("/gmm/jobs/suspend", post(suspend))
        .route("/gmm/jobs/resume", post(resume))
}

#[derive(Debug, Deserialize)]
struct SweepParams {
    minimum_n_components: u32,
    maximum_n_components: u32,
    step_size: u32,
    n_trials_per_component: u32,
}

#[derive(Debug, Deserialize)]
struct SubmitSweepRequest {
    /// Work-unit whose latent coordinates are fitted.
    target: String,
    name: String,
    params: SweepParams,
}

#[derive(Debug, Deserialize)]
struct DetailQuery {
    n_components: Option<u32>,
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitSweepRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let uuid = state.orchestrator.submit_sweep(NewSweepJob {
        name: req.name,
        target_child_id: req.target,
        min_components: req.params.minimum_n_components,
        max_components: req.params.maximum_n_components,
        step_size: req.params.step_size,
        trials_per_component: req.params.n_trials_per_component,
    })?;
    Ok(Json(serde_json::json!({ "uuid": uuid })))
}

async fn search(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SweepSearch>,
) -> ApiResult<Json<Vec<SweepJob>>> {
    Ok(Json(state.orchestrator.search_sweeps(&req)?))
}

async fn get_sweep(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Query(query): Query<DetailQuery>,
) -> ApiResult<Json<SweepDetail>> {
    Ok(Json(state.orchestrator.sweep_detail(&uuid, query.n_components)?))
}

async fn patch_sweep(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Json(req): Json<PatchPayload>,
) -> ApiResult<Json<SweepJob>> {
    Ok(Json(state.orchestrator.rename_sweep(&uuid, req.new_name()?)?))
}

async fn delete_sweep(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_sweep(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn suspend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UuidPayload>,
) -> ApiResult<Json<SweepJob>> {
    Ok(Json(state.orchestrator.suspend_sweep(&req.uuid).await?))
}

async fn resume(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UuidPayload>,
) -> ApiResult<Json<SweepJob>> {
    Ok(Json(state.orchestrator.resume_sweep(&req.uuid).await?))
}
