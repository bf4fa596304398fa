pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod repo;
pub mod services;
pub mod storage;
pub mod telemetry;
pub mod test_support;

use axum::{Router, extract::DefaultBodyLimit, middleware, routing::{get, post, patch}};
use axum::response::Html;
use std::sync::Arc;
use tower_http::services::ServeDir;
use utoipa::OpenApi;
use handlers::{health::health, readiness::readiness};
use handlers::apps::{create_app, list_apps, rename_app, delete_app};
use handlers::deployments::{create_deployment, list_deployments, delete_deployment, deployment_history};
use handlers::releases::{release, promote, rollback, rollback_to_label, list_diffs};
use handlers::client::{update_check, report_download, report_deploy, legacy_update_check, legacy_report_download, legacy_report_deploy};
use crate::auth::{auth_layer, TokenAuth};
use crate::config::{ServerConfig, StorageMode};
use crate::repo::ReleaseRepository;
use crate::services::{apps::AppService, diff::DiffScheduler, release::ReleaseEngine, resolver::UpdateResolver};
use crate::storage::StorageManager;
use crate::telemetry::{metrics_handler, track_metrics};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn ReleaseRepository>,
    pub apps: AppService,
    pub engine: Arc<ReleaseEngine>,
    pub resolver: UpdateResolver,
    pub auth: Arc<TokenAuth>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(repo: Arc<dyn ReleaseRepository>, storage: StorageManager, scheduler: DiffScheduler, auth: TokenAuth, config: ServerConfig) -> Self {
        let engine = ReleaseEngine::new(repo.clone(), storage, scheduler, config.temp_dir.clone());
        Self {
            apps: AppService::new(repo.clone()),
            resolver: UpdateResolver::new(repo.clone()),
            engine: Arc::new(engine),
            auth: Arc::new(auth),
            config: Arc::new(config),
            repo,
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::readiness::readiness,
        handlers::apps::create_app,
        handlers::apps::list_apps,
        handlers::apps::rename_app,
        handlers::apps::delete_app,
        handlers::deployments::create_deployment,
        handlers::deployments::list_deployments,
        handlers::deployments::delete_deployment,
        handlers::deployments::deployment_history,
        handlers::releases::release,
        handlers::releases::promote,
        handlers::releases::rollback,
        handlers::releases::rollback_to_label,
        handlers::releases::list_diffs,
        handlers::client::update_check,
        handlers::client::legacy_update_check,
        handlers::client::report_download,
        handlers::client::report_deploy,
        handlers::client::legacy_report_download,
        handlers::client::legacy_report_deploy,
    ),
    components(schemas(
        error::ApiErrorBody,
        models::App, models::Deployment, models::Package, models::PackageDiff, models::ReleaseMethod,
        handlers::apps::AppNameRequest,
        handlers::deployments::CreateDeploymentRequest,
        handlers::releases::PromoteRequest, handlers::releases::ReleaseForm,
        handlers::client::UpdateInfo, handlers::client::UpdateCheckResponse,
        handlers::client::LegacyUpdateInfo, handlers::client::LegacyUpdateCheckResponse,
        handlers::client::ReportStatusRequest, handlers::client::LegacyReportStatusRequest,
        handlers::health::HealthResponse, handlers::readiness::ReadinessResponse,
    )),
    tags( (name = "bundle-server", description = "Bundle release and update API") )
)]
pub struct ApiDoc;

async fn swagger_ui() -> Html<String> {
    let html = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"/><title>Bundle Server API Docs</title>
<link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
<div id="swagger-ui"></div>
<script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
<script>
window.onload = () => { SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' }); };
</script>
</body></html>"#;
    Html(html.to_string())
}

fn openapi_doc() -> utoipa::openapi::OpenApi {
    let mut openapi = ApiDoc::openapi();
    // publisher routes take a bearer token; the derive has no per-route scheme knob
    if let Ok(mut value) = serde_json::to_value(&openapi) {
        use serde_json::json;
        value["components"]["securitySchemes"]["bearer_auth"] = json!({"type":"http","scheme":"bearer"});
        if let Ok(doc) = serde_json::from_value(value) { openapi = doc; }
    }
    openapi
}

/// Publisher routes sit behind the token layer; device and probe routes never do.
pub fn build_router(state: AppState) -> Router {
    let openapi = openapi_doc();
    let max_bundle = state.config.max_bundle_bytes;
    let publisher = Router::new()
        .route("/apps", post(create_app).get(list_apps))
        .route("/apps/:app", patch(rename_app).delete(delete_app))
        .route("/apps/:app/deployments", post(create_deployment).get(list_deployments))
        .route("/apps/:app/deployments/promote", post(promote))
        .route("/apps/:app/deployments/:deployment", axum::routing::delete(delete_deployment))
        .route("/apps/:app/deployments/:deployment/history", get(deployment_history))
        .route("/apps/:app/deployments/:deployment/release", post(release).layer(DefaultBodyLimit::max(max_bundle)))
        .route("/apps/:app/deployments/:deployment/rollback", post(rollback))
        .route("/apps/:app/deployments/:deployment/rollback/:label", post(rollback_to_label))
        .route("/apps/:app/deployments/:deployment/packages/:label/diffs", get(list_diffs))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), auth_layer));
    let client = Router::new()
        .route("/updateCheck", get(update_check))
        .route("/reportStatus/download", post(report_download))
        .route("/reportStatus/deploy", post(report_deploy))
        .route("/v0.1/public/codepush/update_check", get(legacy_update_check))
        .route("/v0.1/public/codepush/report_status/download", post(legacy_report_download))
        .route("/v0.1/public/codepush/report_status/deploy", post(legacy_report_deploy));
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(|| async move { axum::Json(openapi.clone()) }))
        .route("/swagger", get(swagger_ui))
        .merge(publisher)
        .merge(client);
    if state.config.storage.mode == StorageMode::Local {
        router = router.nest_service("/download", ServeDir::new(&state.config.storage.local_dir));
    }
    router.layer(middleware::from_fn(track_metrics)).with_state(state)
}
