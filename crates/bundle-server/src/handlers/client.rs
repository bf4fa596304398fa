//! Device-facing endpoints. Two wire dialects share one resolver: the current
//! camelCase one and the legacy snake_case `/v0.1/public/codepush` one.
use axum::{Json, extract::{Query, State, rejection::JsonRejection}};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use crate::{AppState, error::{ApiError, ApiResult}};
use crate::services::resolver::{StatusReport, UpdateOutcome, UpdateQuery};

#[derive(Deserialize, IntoParams, Default)]
#[into_params(parameter_in = Query)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateCheckParams {
    pub deployment_key: String,
    pub app_version: String,
    pub label: String,
    pub package_hash: String,
    pub client_unique_id: String,
}

#[derive(Deserialize, IntoParams, Default)]
#[into_params(parameter_in = Query)]
#[serde(default)]
pub struct LegacyUpdateCheckParams {
    pub deployment_key: String,
    pub app_version: String,
    pub label: String,
    pub package_hash: String,
    pub client_unique_id: String,
}

impl From<UpdateCheckParams> for UpdateQuery {
    fn from(p: UpdateCheckParams) -> Self {
        Self { deployment_key: p.deployment_key, app_version: p.app_version, label: p.label, package_hash: p.package_hash, client_unique_id: p.client_unique_id }
    }
}

impl From<LegacyUpdateCheckParams> for UpdateQuery {
    fn from(p: LegacyUpdateCheckParams) -> Self {
        Self { deployment_key: p.deployment_key, app_version: p.app_version, label: p.label, package_hash: p.package_hash, client_unique_id: p.client_unique_id }
    }
}

/// Only `isAvailable` is present when there is nothing to download.
#[derive(Serialize, ToSchema, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub is_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")] pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub package_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub package_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")] pub is_mandatory: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")] pub is_disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")] pub rollout: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")] pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub package_id: Option<Uuid>,
}

impl From<UpdateOutcome> for UpdateInfo {
    fn from(outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::NotAvailable => Self {
                is_available: false, download_url: None, description: None, label: None, package_hash: None, package_size: None,
                is_mandatory: None, is_disabled: None, rollout: None, app_version: None, package_id: None,
            },
            UpdateOutcome::Available { package, app_version } => Self {
                is_available: true,
                download_url: Some(package.blob_url),
                description: Some(package.description),
                label: Some(package.label),
                package_hash: Some(package.package_hash),
                package_size: Some(package.size),
                is_mandatory: Some(package.is_mandatory),
                is_disabled: Some(package.is_disabled),
                rollout: Some(package.rollout),
                app_version: Some(app_version),
                package_id: Some(package.id),
            },
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckResponse { pub update_info: UpdateInfo }

/// Legacy shape; absent values are sent as explicit nulls.
#[derive(Serialize, ToSchema, Debug, PartialEq)]
pub struct LegacyUpdateInfo {
    pub is_available: bool,
    pub download_url: Option<String>,
    pub description: Option<String>,
    pub label: Option<String>,
    pub package_hash: Option<String>,
    pub package_size: Option<i64>,
    pub is_mandatory: Option<bool>,
    pub is_disabled: Option<bool>,
    pub target_binary_range: Option<String>,
    pub should_run_binary_version: bool,
    pub update_app_version: bool,
}

impl From<UpdateOutcome> for LegacyUpdateInfo {
    fn from(outcome: UpdateOutcome) -> Self {
        let info = UpdateInfo::from(outcome);
        Self {
            is_available: info.is_available,
            download_url: info.download_url,
            description: info.description,
            label: info.label,
            package_hash: info.package_hash,
            package_size: info.package_size,
            is_mandatory: info.is_mandatory,
            is_disabled: info.is_disabled,
            target_binary_range: info.app_version,
            should_run_binary_version: false,
            update_app_version: false,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct LegacyUpdateCheckResponse { pub update_info: LegacyUpdateInfo }

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportStatusRequest {
    pub deployment_key: String,
    pub label: String,
    pub client_unique_id: String,
    #[serde(default)] pub status: i16,
    #[serde(default, alias = "previousLabelOrAppVersion")] pub previous_label: Option<String>,
    #[serde(default)] pub previous_deployment_key: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct LegacyReportStatusRequest {
    pub deployment_key: String,
    pub label: String,
    pub client_unique_id: String,
    #[serde(default)] pub status: i16,
    #[serde(default)] pub previous_label: Option<String>,
    #[serde(default)] pub previous_deployment_key: Option<String>,
}

impl From<ReportStatusRequest> for StatusReport {
    fn from(r: ReportStatusRequest) -> Self {
        Self { deployment_key: r.deployment_key, label: r.label, client_unique_id: r.client_unique_id, status: r.status, previous_label: r.previous_label, previous_deployment_key: r.previous_deployment_key }
    }
}

impl From<LegacyReportStatusRequest> for StatusReport {
    fn from(r: LegacyReportStatusRequest) -> Self {
        Self { deployment_key: r.deployment_key, label: r.label, client_unique_id: r.client_unique_id, status: r.status, previous_label: r.previous_label, previous_deployment_key: r.previous_deployment_key }
    }
}

fn parse_report<T: Into<StatusReport>>(body: Result<Json<T>, JsonRejection>) -> ApiResult<StatusReport> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(format!("invalid input: {e}")))?;
    let report: StatusReport = body.into();
    if report.deployment_key.trim().is_empty() || report.label.trim().is_empty() || report.client_unique_id.trim().is_empty() {
        return Err(ApiError::bad_request("deploymentKey, label and clientUniqueId are required"));
    }
    Ok(report)
}

#[derive(Clone, Copy, Debug)]
enum ReportKind { Download, Deploy }

async fn record(state: &AppState, kind: ReportKind, report: StatusReport) -> Json<&'static str> {
    let result = match kind {
        ReportKind::Download => state.resolver.report_download(&report).await,
        ReportKind::Deploy => state.resolver.report_deploy(&report).await,
    };
    if let Err(e) = result {
        tracing::warn!(error=%e, ?kind, label=%report.label, "report_status.rejected");
    }
    Json("OK")
}

/// Ask whether a newer package exists for this device
#[utoipa::path(get, path = "/updateCheck", params(UpdateCheckParams), responses(
    (status = 200, body = UpdateCheckResponse),
    (status = 404, description = "Unknown deployment key", body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="debug", skip(state, q), fields(label=%q.label))]
pub async fn update_check(State(state): State<AppState>, Query(q): Query<UpdateCheckParams>) -> ApiResult<Json<UpdateCheckResponse>> {
    let outcome = state.resolver.resolve(&q.into()).await?;
    Ok(Json(UpdateCheckResponse { update_info: outcome.into() }))
}

#[utoipa::path(get, path = "/v0.1/public/codepush/update_check", params(LegacyUpdateCheckParams), responses(
    (status = 200, body = LegacyUpdateCheckResponse),
    (status = 404, description = "Unknown deployment key", body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="debug", skip(state, q), fields(label=%q.label))]
pub async fn legacy_update_check(State(state): State<AppState>, Query(q): Query<LegacyUpdateCheckParams>) -> ApiResult<Json<LegacyUpdateCheckResponse>> {
    let outcome = state.resolver.resolve(&q.into()).await?;
    Ok(Json(LegacyUpdateCheckResponse { update_info: outcome.into() }))
}

/// Record that a device downloaded a package. Always answers "OK" for well-formed input.
#[utoipa::path(post, path = "/reportStatus/download", request_body = ReportStatusRequest, responses((status = 200, body = String)))]
pub async fn report_download(State(state): State<AppState>, body: Result<Json<ReportStatusRequest>, JsonRejection>) -> ApiResult<Json<&'static str>> {
    let report = parse_report(body)?;
    Ok(record(&state, ReportKind::Download, report).await)
}

/// Record an install outcome on a device.
#[utoipa::path(post, path = "/reportStatus/deploy", request_body = ReportStatusRequest, responses((status = 200, body = String)))]
pub async fn report_deploy(State(state): State<AppState>, body: Result<Json<ReportStatusRequest>, JsonRejection>) -> ApiResult<Json<&'static str>> {
    let report = parse_report(body)?;
    Ok(record(&state, ReportKind::Deploy, report).await)
}

#[utoipa::path(post, path = "/v0.1/public/codepush/report_status/download", request_body = LegacyReportStatusRequest, responses((status = 200, body = String)))]
pub async fn legacy_report_download(State(state): State<AppState>, body: Result<Json<LegacyReportStatusRequest>, JsonRejection>) -> ApiResult<Json<&'static str>> {
    let report = parse_report(body)?;
    Ok(record(&state, ReportKind::Download, report).await)
}

#[utoipa::path(post, path = "/v0.1/public/codepush/report_status/deploy", request_body = LegacyReportStatusRequest, responses((status = 200, body = String)))]
pub async fn legacy_report_deploy(State(state): State<AppState>, body: Result<Json<LegacyReportStatusRequest>, JsonRejection>) -> ApiResult<Json<&'static str>> {
    let report = parse_report(body)?;
    Ok(record(&state, ReportKind::Deploy, report).await)
}
