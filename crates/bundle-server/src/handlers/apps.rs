use axum::{Json, Extension, http::StatusCode, extract::{Path, State}};
use serde::Deserialize;
use utoipa::ToSchema;
use crate::{AppState, auth::Identity, models::App, error::ApiResult};

#[derive(Deserialize, ToSchema)]
pub struct AppNameRequest { pub name: String }

/// Create an app owned by the caller
#[utoipa::path(post, path = "/apps", request_body = AppNameRequest, responses(
    (status = 201, body = App),
    (status = 409, description = "Name already taken", body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="info", skip(state, identity, req), fields(name=%req.name))]
pub async fn create_app(State(state): State<AppState>, Extension(identity): Extension<Identity>, Json(req): Json<AppNameRequest>) -> ApiResult<(StatusCode, Json<App>)> {
    let app = state.apps.create_app(&identity.subject, &req.name).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

#[utoipa::path(get, path = "/apps", responses((status = 200, body = [App])))]
pub async fn list_apps(State(state): State<AppState>, Extension(identity): Extension<Identity>) -> ApiResult<Json<Vec<App>>> {
    Ok(Json(state.apps.list_apps(&identity.subject).await?))
}

/// Rename an app
#[utoipa::path(patch, path = "/apps/{app}", params(("app" = String, Path, description = "App name")), request_body = AppNameRequest, responses(
    (status = 200, body = App),
    (status = 404, body = crate::error::ApiErrorBody),
    (status = 409, body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="info", skip(state, identity, req), fields(new_name=%req.name))]
pub async fn rename_app(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path(app): Path<String>, Json(req): Json<AppNameRequest>) -> ApiResult<Json<App>> {
    Ok(Json(state.apps.rename_app(&identity.subject, &app, &req.name).await?))
}

#[utoipa::path(delete, path = "/apps/{app}", params(("app" = String, Path, description = "App name")), responses(
    (status = 204, description = "Deleted"),
    (status = 404, body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="info", skip(state, identity))]
pub async fn delete_app(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path(app): Path<String>) -> ApiResult<StatusCode> {
    state.apps.delete_app(&identity.subject, &app).await?;
    Ok(StatusCode::NO_CONTENT)
}
