//! Fixtures shared by unit and integration tests: an in-memory server wired the
//! same way `main` wires the real one, bundle builders and an optional Postgres pool.
use axum::Router;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use crate::{AppState, build_router};
use crate::auth::TokenAuth;
use crate::config::{ServerConfig, StorageMode};
use crate::models::{Deployment, Package};
use crate::repo::{MemoryReleaseRepository, PgReleaseRepository};
use crate::services::diff::{DiffGenerator, DiffScheduler};
use crate::services::release::ReleaseRequest;
use crate::storage::{LocalBlobStore, StorageManager};

pub const TEST_OWNER: &str = "tester";

/// Route `tracing` output through the test harness; safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}

/// Config rooted at `root`: blobs under `root/blobs`, scratch files under `root/tmp`.
pub fn test_config(root: &Path) -> ServerConfig {
    let mut cfg = ServerConfig::default();
    cfg.temp_dir = root.join("tmp");
    cfg.storage.mode = StorageMode::Local;
    cfg.storage.local_dir = root.join("blobs");
    cfg.storage.download_url = "http://bundles.test/download".into();
    cfg
}

pub struct TestServer {
    pub state: AppState,
    pub repo: Arc<MemoryReleaseRepository>,
    pub storage: StorageManager,
    /// Same generator the pool would use, for driving diffs synchronously.
    pub diffs: DiffGenerator,
}

impl TestServer {
    /// Diff jobs are dropped; call `diffs.generate` explicitly when a test needs them.
    pub fn new(root: &Path) -> Self { Self::build(test_config(root), |_| DiffScheduler::disabled(), TokenAuth::disabled()) }

    pub fn with_auth(root: &Path, auth: TokenAuth) -> Self { Self::build(test_config(root), |_| DiffScheduler::disabled(), auth) }

    /// `make_scheduler` receives the generator so callers can start a real pool around it.
    pub fn build(config: ServerConfig, make_scheduler: impl FnOnce(&DiffGenerator) -> DiffScheduler, auth: TokenAuth) -> Self {
        let repo = Arc::new(MemoryReleaseRepository::new());
        let storage = StorageManager::new(Arc::new(LocalBlobStore::new(config.storage.local_dir.clone(), config.storage.download_url.clone())));
        let diffs = DiffGenerator::new(repo.clone(), storage.clone(), config.temp_dir.clone(), config.diff.window);
        let scheduler = make_scheduler(&diffs);
        let state = AppState::new(repo.clone(), storage.clone(), scheduler, auth, config);
        Self { state, repo, storage, diffs }
    }

    pub fn router(&self) -> Router { build_router(self.state.clone()) }

    /// Create an app owned by `TEST_OWNER` with one deployment per name.
    pub async fn seed(&self, app: &str, deployments: &[&str]) -> Vec<Deployment> {
        self.state.apps.create_app(TEST_OWNER, app).await.expect("create app");
        let mut out = Vec::new();
        for name in deployments {
            out.push(self.state.apps.create_deployment(TEST_OWNER, app, name).await.expect("create deployment"));
        }
        out
    }

    pub async fn release(&self, deployment: &Deployment, marker: &str) -> Package {
        self.state.engine.release(deployment.id, release_request(marker)).await.expect("release")
    }
}

/// Minimal but valid zip whose content is unique per `marker`.
pub fn bundle_zip(marker: &str) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        if zip.start_file("index.bundle", options).is_ok() {
            let _ = zip.write_all(format!("// bundle {marker}\n").as_bytes());
        }
        let _ = zip.finish();
    }
    buf.into_inner()
}

pub fn release_request(marker: &str) -> ReleaseRequest {
    ReleaseRequest {
        file_name: format!("{marker}.zip"),
        bytes: bundle_zip(marker).into(),
        description: format!("release {marker}"),
        is_mandatory: false,
        expected_hash: None,
        released_by: TEST_OWNER.into(),
    }
}

/// Postgres repository for `DATABASE_URL` with migrations applied, or `None` when unset
/// so database-backed tests can skip.
pub async fn pg_repo_from_env() -> Option<PgReleaseRepository> {
    let url = std::env::var("DATABASE_URL").ok().filter(|u| !u.trim().is_empty())?;
    let pool = crate::db::init_db(&url, 5).await.ok()?;
    Some(PgReleaseRepository::new(pool))
}
