use prometheus::{TextEncoder, Encoder, Registry, IntCounter, IntCounterVec, IntGauge, opts};
use once_cell::sync::Lazy;
use axum::{response::{IntoResponse, Response}, http::StatusCode, extract::Request, middleware::Next};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("http_requests_total", "HTTP request count"), &["method", "path", "status"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static RELEASES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("releases_total", "Packages created, by release method"), &["method"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static UPDATE_CHECKS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("update_checks_total", "Update checks by outcome"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static DIFF_GENERATED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("diff_generated_total", "Diff artifacts stored").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static DIFF_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("diff_failures_total", "Diff candidates that failed and were skipped").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static DIFF_JOBS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("diff_jobs_dropped_total", "Diff jobs rejected because the queue was full or closed").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static DIFF_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("diff_queue_depth", "Diff jobs waiting for a worker").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Collapse ids, labels and deployment keys so path labels stay low-cardinality.
pub fn normalize_path(path: &str) -> String {
    let segs: Vec<&str> = path.split('/').collect();
    let mut out = Vec::with_capacity(segs.len());
    for (i, seg) in segs.iter().enumerate() {
        let prev = if i > 0 { segs[i - 1] } else { "" };
        let replaced = match prev {
            "apps" if !seg.is_empty() => ":app",
            "deployments" if !seg.is_empty() && *seg != "promote" => ":deployment",
            "packages" | "rollback" if !seg.is_empty() => ":label",
            "download" if !seg.is_empty() => ":key",
            _ => *seg,
        };
        out.push(replaced);
    }
    out.join("/")
}

/// Count every request by method, normalized path and status.
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path_label = normalize_path(req.uri().path());
    let resp = next.run(req).await;
    HTTP_REQUESTS.with_label_values(&[method.as_str(), path_label.as_str(), resp.status().as_str()]).inc();
    resp
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type","text/plain; version=0.0.4")], buf).into_response()
}

#[cfg(test)]
mod tests {
    use super::normalize_path;

    #[test]
    fn publisher_paths_collapse() {
        assert_eq!(normalize_path("/apps/myapp/deployments/Staging/release"), "/apps/:app/deployments/:deployment/release");
        assert_eq!(normalize_path("/apps/myapp/deployments/promote"), "/apps/:app/deployments/promote");
        assert_eq!(normalize_path("/apps/a/deployments/Prod/rollback/v3"), "/apps/:app/deployments/:deployment/rollback/:label");
        assert_eq!(normalize_path("/updateCheck"), "/updateCheck");
        assert_eq!(normalize_path("/download/Ab12_app.zip"), "/download/:key");
    }
}
