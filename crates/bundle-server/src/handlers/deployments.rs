use axum::{Json, Extension, http::StatusCode, extract::{Path, Query, State}};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use crate::{AppState, auth::Identity, models::{Deployment, Package}, error::ApiResult};

#[derive(Deserialize, ToSchema)]
pub struct CreateDeploymentRequest { pub name: String }

/// Create a deployment; the response carries its generated deployment key
#[utoipa::path(post, path = "/apps/{app}/deployments", params(("app" = String, Path, description = "App name")), request_body = CreateDeploymentRequest, responses(
    (status = 201, body = Deployment),
    (status = 404, description = "App not found", body = crate::error::ApiErrorBody),
    (status = 409, description = "Deployment already exists", body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="info", skip(state, identity, req), fields(name=%req.name))]
pub async fn create_deployment(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path(app): Path<String>, Json(req): Json<CreateDeploymentRequest>) -> ApiResult<(StatusCode, Json<Deployment>)> {
    let deployment = state.apps.create_deployment(&identity.subject, &app, &req.name).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

#[utoipa::path(get, path = "/apps/{app}/deployments", params(("app" = String, Path, description = "App name")), responses((status = 200, body = [Deployment])))]
pub async fn list_deployments(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path(app): Path<String>) -> ApiResult<Json<Vec<Deployment>>> {
    Ok(Json(state.apps.list_deployments(&identity.subject, &app).await?))
}

#[utoipa::path(delete, path = "/apps/{app}/deployments/{deployment}", params(
    ("app" = String, Path, description = "App name"),
    ("deployment" = String, Path, description = "Deployment name")
), responses((status = 204, description = "Deleted"), (status = 404, body = crate::error::ApiErrorBody)))]
#[tracing::instrument(level="info", skip(state, identity))]
pub async fn delete_deployment(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path((app, deployment)): Path<(String, String)>) -> ApiResult<StatusCode> {
    state.apps.delete_deployment(&identity.subject, &app, &deployment).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery { pub limit: Option<i64> }

/// Packages of a deployment, newest first (default 50, max 500)
#[utoipa::path(get, path = "/apps/{app}/deployments/{deployment}/history", params(
    ("app" = String, Path, description = "App name"),
    ("deployment" = String, Path, description = "Deployment name"),
    HistoryQuery
), responses((status = 200, body = [Package]), (status = 404, body = crate::error::ApiErrorBody)))]
#[tracing::instrument(level="debug", skip(state, identity, q))]
pub async fn deployment_history(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path((app, deployment)): Path<(String, String)>, Query(q): Query<HistoryQuery>) -> ApiResult<Json<Vec<Package>>> {
    let deployment = state.apps.deployment(&identity.subject, &app, &deployment).await?;
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.repo.list_packages(deployment.id, None, limit).await?))
}
