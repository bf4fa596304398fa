use axum::{Json, extract::State};
use serde::Serialize;
use crate::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct ReadinessResponse { pub status: &'static str }

/// Readiness probe: pings the release repository
#[utoipa::path(get, path = "/readyz", responses(
	(status = 200, body = ReadinessResponse, description = "Service ready"),
	(status = 503, body = ReadinessResponse, description = "Dependency not ready")
))]
pub async fn readiness(State(state): State<AppState>) -> (axum::http::StatusCode, Json<ReadinessResponse>) {
	match state.repo.ping().await {
		Ok(()) => (axum::http::StatusCode::OK, Json(ReadinessResponse { status: "ready" })),
		Err(e) => {
			tracing::warn!(error=%e, "readiness_ping_failed");
			(axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(ReadinessResponse { status: "degraded" }))
		}
	}
}
