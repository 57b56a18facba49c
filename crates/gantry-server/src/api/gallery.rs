//! Gallery management and install-job endpoints.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gantry_core::{gallery, BackendConfig, Gallery, InstallJob, JobProgress};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/models/apply", post(apply_model))
        .route("/models/jobs", get(all_job_statuses))
        .route("/models/jobs/:uuid", get(job_status))
        .route("/models/available", get(available_models))
        .route(
            "/models/galleries",
            get(list_galleries)
                .post(add_gallery)
                .delete(remove_gallery),
        )
}

#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    /// Gallery-model reference: `gallery@model` or a bare model name.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Backend-config overlay merged over the manifest defaults.
    #[serde(default)]
    pub config: Option<BackendConfig>,
}

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub uuid: String,
    pub status: String,
}

async fn apply_model(
    State(state): State<AppState>,
    Json(req): Json<ApplyRequest>,
) -> Result<Json<ApplyResponse>, ApiError> {
    let galleries = state
        .app
        .galleries
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let id = state.app.installer.enqueue(InstallJob {
        id: Uuid::new_v4(),
        model: req.id,
        name: req.name,
        galleries,
        overlay: req.config,
    });

    Ok(Json(ApplyResponse {
        uuid: id.to_string(),
        status: format!("/models/jobs/{id}"),
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<JobProgress>, ApiError> {
    let id: Uuid = uuid
        .parse()
        .map_err(|_| ApiError::bad_request("invalid job uuid"))?;
    state
        .app
        .installer
        .status(id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no install job {uuid}")))
}

async fn all_job_statuses(
    State(state): State<AppState>,
) -> Json<std::collections::HashMap<Uuid, JobProgress>> {
    Json(state.app.installer.all_statuses())
}

async fn available_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<gallery::AvailableModel>>, ApiError> {
    let galleries = state
        .app
        .galleries
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let models = gallery::list_available(&state.http, &galleries, &state.app.opts.models_path)
        .await
        .map_err(|err| state.api_error(err))?;
    Ok(Json(models))
}

async fn list_galleries(State(state): State<AppState>) -> Json<Vec<Gallery>> {
    Json(
        state
            .app
            .galleries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone(),
    )
}

async fn add_gallery(
    State(state): State<AppState>,
    Json(gallery): Json<Gallery>,
) -> Result<Json<Vec<Gallery>>, ApiError> {
    let mut galleries = state
        .app
        .galleries
        .write()
        .unwrap_or_else(|e| e.into_inner());
    if galleries.iter().any(|g| g.name == gallery.name) {
        return Err(ApiError::bad_request(format!(
            "gallery '{}' already exists",
            gallery.name
        )));
    }
    galleries.push(gallery);
    Ok(Json(galleries.clone()))
}

#[derive(Debug, Deserialize)]
struct RemoveGalleryRequest {
    name: String,
}

async fn remove_gallery(
    State(state): State<AppState>,
    Json(req): Json<RemoveGalleryRequest>,
) -> Result<Json<Vec<Gallery>>, ApiError> {
    let mut galleries = state
        .app
        .galleries
        .write()
        .unwrap_or_else(|e| e.into_inner());
    if !galleries.iter().any(|g| g.name == req.name) {
        return Err(ApiError::not_found(format!(
            "gallery '{}' is not registered",
            req.name
        )));
    }
    galleries.retain(|g| g.name != req.name);
    Ok(Json(galleries.clone()))
}
