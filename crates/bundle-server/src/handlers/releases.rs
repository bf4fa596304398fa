use axum::{Json, Extension, http::StatusCode, extract::{Multipart, Path, State, multipart::Field}};
use bytes::Bytes;
use serde::Deserialize;
use utoipa::ToSchema;
use crate::{AppState, auth::Identity, models::{Package, PackageDiff}, error::{ApiError, ApiResult, ReleaseError}};
use crate::services::release::ReleaseRequest;

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Multipart release form: `package` (a `.zip` file), `description`, `isMandatory`, `packageHash`.
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
pub struct ReleaseForm {
    #[schema(value_type = String, format = Binary)]
    package: Vec<u8>,
    description: Option<String>,
    is_mandatory: Option<bool>,
    package_hash: Option<String>,
}

async fn field_text(field: Field<'_>, name: &str) -> ApiResult<String> {
    field.text().await.map_err(|e| ApiError::bad_request(format!("reading {name}: {e}")))
}

async fn read_release_form(mut multipart: Multipart, released_by: String) -> ApiResult<ReleaseRequest> {
    let mut file: Option<(String, Bytes)> = None;
    let mut description = String::new();
    let mut is_mandatory = false;
    let mut expected_hash = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))? {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("package") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(|e| ApiError::bad_request(format!("reading package: {e}")))?;
                file = Some((file_name, bytes));
            }
            Some("description") => { description = field_text(field, "description").await?; }
            Some("isMandatory") => { is_mandatory = parse_bool(&field_text(field, "isMandatory").await?); }
            Some("packageHash") => { expected_hash = Some(field_text(field, "packageHash").await?).filter(|h| !h.trim().is_empty()); }
            _ => {}
        }
    }
    let Some((file_name, bytes)) = file else { return Err(ApiError::bad_request("missing package file")); };
    if !file_name.to_ascii_lowercase().ends_with(".zip") {
        return Err(ApiError::bad_request("package must be a .zip file"));
    }
    if bytes.is_empty() { return Err(ApiError::bad_request("package is empty")); }
    Ok(ReleaseRequest { file_name, bytes, description, is_mandatory, expected_hash, released_by })
}

/// Upload a bundle as the deployment's next release
#[utoipa::path(post, path = "/apps/{app}/deployments/{deployment}/release", params(
    ("app" = String, Path, description = "App name"),
    ("deployment" = String, Path, description = "Deployment name")
), request_body(content = ReleaseForm, content_type = "multipart/form-data"), responses(
    (status = 201, body = Package),
    (status = 400, description = "Missing or invalid package", body = crate::error::ApiErrorBody),
    (status = 404, body = crate::error::ApiErrorBody),
    (status = 422, description = "Package hash mismatch", body = crate::error::ApiErrorBody),
    (status = 502, description = "Blob storage failed", body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="info", skip(state, identity, multipart))]
pub async fn release(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path((app, deployment)): Path<(String, String)>, multipart: Multipart) -> ApiResult<(StatusCode, Json<Package>)> {
    let deployment = state.apps.deployment(&identity.subject, &app, &deployment).await?;
    let req = read_release_form(multipart, identity.subject.clone()).await?;
    let package = state.engine.release(deployment.id, req).await?;
    Ok((StatusCode::CREATED, Json(package)))
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromoteRequest { pub source_deployment_name: String, pub dest_deployment_name: String }

/// Copy the source deployment's current package into the destination
#[utoipa::path(post, path = "/apps/{app}/deployments/promote", params(("app" = String, Path, description = "App name")), request_body = PromoteRequest, responses(
    (status = 201, body = Package),
    (status = 404, body = crate::error::ApiErrorBody),
    (status = 422, description = "Source and destination are the same", body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="info", skip(state, identity, req), fields(source=%req.source_deployment_name, dest=%req.dest_deployment_name))]
pub async fn promote(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path(app): Path<String>, Json(req): Json<PromoteRequest>) -> ApiResult<(StatusCode, Json<Package>)> {
    let source = state.apps.deployment(&identity.subject, &app, &req.source_deployment_name).await?;
    let dest = state.apps.deployment(&identity.subject, &app, &req.dest_deployment_name).await?;
    let package = state.engine.promote(source.id, dest.id, &identity.subject).await?;
    Ok((StatusCode::CREATED, Json(package)))
}

async fn do_rollback(state: &AppState, identity: &Identity, app: &str, deployment: &str, label: Option<&str>) -> ApiResult<(StatusCode, Json<Package>)> {
    let deployment = state.apps.deployment(&identity.subject, app, deployment).await?;
    let package = state.engine.rollback(deployment.id, label, &identity.subject).await?;
    Ok((StatusCode::CREATED, Json(package)))
}

/// Re-release the package that was current before the present one
#[utoipa::path(post, path = "/apps/{app}/deployments/{deployment}/rollback", params(
    ("app" = String, Path, description = "App name"),
    ("deployment" = String, Path, description = "Deployment name")
), responses(
    (status = 201, body = Package),
    (status = 404, body = crate::error::ApiErrorBody),
    (status = 422, description = "No previous release", body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="info", skip(state, identity))]
pub async fn rollback(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path((app, deployment)): Path<(String, String)>) -> ApiResult<(StatusCode, Json<Package>)> {
    do_rollback(&state, &identity, &app, &deployment, None).await
}

/// Re-release the package with the given label
#[utoipa::path(post, path = "/apps/{app}/deployments/{deployment}/rollback/{label}", params(
    ("app" = String, Path, description = "App name"),
    ("deployment" = String, Path, description = "Deployment name"),
    ("label" = String, Path, description = "Target label, e.g. v2")
), responses((status = 201, body = Package), (status = 404, body = crate::error::ApiErrorBody)))]
#[tracing::instrument(level="info", skip(state, identity))]
pub async fn rollback_to_label(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path((app, deployment, label)): Path<(String, String, String)>) -> ApiResult<(StatusCode, Json<Package>)> {
    do_rollback(&state, &identity, &app, &deployment, Some(&label)).await
}

/// Diff artifacts generated for one package
#[utoipa::path(get, path = "/apps/{app}/deployments/{deployment}/packages/{label}/diffs", params(
    ("app" = String, Path, description = "App name"),
    ("deployment" = String, Path, description = "Deployment name"),
    ("label" = String, Path, description = "Package label")
), responses((status = 200, body = [PackageDiff]), (status = 404, body = crate::error::ApiErrorBody)))]
pub async fn list_diffs(State(state): State<AppState>, Extension(identity): Extension<Identity>, Path((app, deployment, label)): Path<(String, String, String)>) -> ApiResult<Json<Vec<PackageDiff>>> {
    let deployment = state.apps.deployment(&identity.subject, &app, &deployment).await?;
    let package = state.repo.find_package_by_label(deployment.id, &label).await?
        .ok_or_else(|| ReleaseError::not_found(format!("package {label}")))?;
    Ok(Json(state.repo.list_package_diffs(package.id).await?))
}
