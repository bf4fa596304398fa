use bundle_server::error::ReleaseError;
use bundle_server::models::ReleaseMethod;
use bundle_server::repo::ReleaseRepository;
use bundle_server::services::diff::DiffScheduler;
use bundle_server::services::release::ReleaseEngine;
use bundle_server::services::sha256_hex;
use bundle_server::storage::{BlobStore, StorageManager};
use bundle_server::test_support::{init_test_tracing, release_request, bundle_zip, TestServer, TEST_OWNER};
use std::path::Path;
use std::sync::Arc;

/// Blob store whose writes always fail.
struct UnavailableStore;

#[async_trait::async_trait]
impl BlobStore for UnavailableStore {
    async fn put(&self, _local_path: &Path, _key: &str) -> anyhow::Result<String> { anyhow::bail!("bucket unavailable") }
    fn url_for(&self, key: &str) -> String { format!("http://unavailable.test/{key}") }
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> { anyhow::bail!("no blob {key}") }
}

#[tokio::test]
async fn release_release_rollback_restores_first_content() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);

    let a = srv.release(&dep, "A").await;
    let b = srv.release(&dep, "B").await;
    assert_eq!((a.label.as_str(), b.label.as_str()), ("v1", "v2"));
    assert_ne!(a.package_hash, b.package_hash);

    let rolled = srv.state.engine.rollback(dep.id, None, TEST_OWNER).await.unwrap();
    assert_eq!(rolled.label, "v3");
    assert_eq!(rolled.package_hash, a.package_hash);
    assert_eq!(rolled.blob_url, a.blob_url);
    assert_eq!(rolled.release_method, ReleaseMethod::Rollback);
    assert_eq!(rolled.original_label.as_deref(), Some("v1"));

    let dep = srv.repo.get_deployment(dep.id).await.unwrap().unwrap();
    assert_eq!(dep.current_package_id, Some(rolled.id));
    assert_eq!(dep.label_counter, 3);
}

#[tokio::test]
async fn upload_package_carries_server_hash_and_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let pkg = srv.release(&dep, "A").await;
    assert_eq!(pkg.package_hash, sha256_hex(&bundle_zip("A")));
    assert_eq!(pkg.size as usize, bundle_zip("A").len());
    assert_eq!(pkg.release_method, ReleaseMethod::Upload);
    assert_eq!(pkg.rollout, 100);
    assert!(!pkg.is_disabled);
    assert_eq!(pkg.released_by, TEST_OWNER);
    assert!(pkg.blob_url.starts_with("http://bundles.test/download/"));
    assert!(pkg.blob_url.ends_with("_A.zip"));
    // blob actually landed in the local store
    let key = pkg.blob_url.trim_start_matches("http://bundles.test/download/");
    assert_eq!(std::fs::read(dir.path().join("blobs").join(key)).unwrap(), bundle_zip("A"));
}

#[tokio::test]
async fn mismatched_expected_hash_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let mut req = release_request("A");
    req.expected_hash = Some("0".repeat(64));
    let err = srv.state.engine.release(dep.id, req).await.unwrap_err();
    assert!(matches!(err, ReleaseError::InvalidState(_)), "got {err:?}");
    let dep = srv.repo.get_deployment(dep.id).await.unwrap().unwrap();
    assert_eq!(dep.label_counter, 0);
    assert!(dep.current_package_id.is_none());
}

#[tokio::test]
async fn matching_expected_hash_is_accepted_case_insensitively() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let mut req = release_request("A");
    req.expected_hash = Some(sha256_hex(&bundle_zip("A")).to_uppercase());
    srv.state.engine.release(dep.id, req).await.unwrap();
}

#[tokio::test]
async fn promote_copies_hash_under_destination_label() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let deps = srv.seed("demo", &["Staging", "Production"]).await;
    let (staging, production) = (&deps[0], &deps[1]);
    srv.release(production, "P").await;
    srv.release(staging, "S1").await;
    let s2 = srv.release(staging, "S2").await;

    let promoted = srv.state.engine.promote(staging.id, production.id, "bob").await.unwrap();
    assert_eq!(promoted.package_hash, s2.package_hash);
    assert_eq!(promoted.deployment_id, production.id);
    assert_eq!(promoted.label, "v2");
    assert_ne!(promoted.id, s2.id);
    assert_eq!(promoted.release_method, ReleaseMethod::Promote);
    assert_eq!(promoted.released_by, "bob");
    assert_eq!(promoted.original_label.as_deref(), Some("v2"));
    assert_eq!(promoted.original_deployment.as_deref(), Some("Staging"));

    let prod = srv.repo.get_deployment(production.id).await.unwrap().unwrap();
    assert_eq!(prod.current_package_id, Some(promoted.id));
    // source untouched
    let stg = srv.repo.get_deployment(staging.id).await.unwrap().unwrap();
    assert_eq!(stg.current_package_id, Some(s2.id));
    assert_eq!(stg.label_counter, 2);
}

#[tokio::test]
async fn promote_errors() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let deps = srv.seed("demo", &["Staging", "Production"]).await;
    let err = srv.state.engine.promote(deps[0].id, deps[1].id, TEST_OWNER).await.unwrap_err();
    assert!(matches!(err, ReleaseError::NotFound(_)), "empty source: {err:?}");
    srv.release(&deps[0], "A").await;
    let err = srv.state.engine.promote(deps[0].id, deps[0].id, TEST_OWNER).await.unwrap_err();
    assert!(matches!(err, ReleaseError::InvalidState(_)), "self promote: {err:?}");
}

#[tokio::test]
async fn rollback_needs_a_previous_release() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let err = srv.state.engine.rollback(dep.id, None, TEST_OWNER).await.unwrap_err();
    assert!(matches!(err, ReleaseError::InvalidState(_)));
    srv.release(&dep, "A").await;
    let err = srv.state.engine.rollback(dep.id, None, TEST_OWNER).await.unwrap_err();
    assert!(matches!(err, ReleaseError::InvalidState(_)));
    let dep = srv.repo.get_deployment(dep.id).await.unwrap().unwrap();
    assert_eq!(dep.label_counter, 1);
}

#[tokio::test]
async fn rollback_to_label() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let a = srv.release(&dep, "A").await;
    srv.release(&dep, "B").await;
    srv.release(&dep, "C").await;
    let back = srv.state.engine.rollback(dep.id, Some("v1"), TEST_OWNER).await.unwrap();
    assert_eq!(back.label, "v4");
    assert_eq!(back.package_hash, a.package_hash);
    let err = srv.state.engine.rollback(dep.id, Some("v42"), TEST_OWNER).await.unwrap_err();
    assert!(matches!(err, ReleaseError::NotFound(_)));
}

#[tokio::test]
async fn consecutive_rollbacks_alternate() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let a = srv.release(&dep, "A").await;
    let b = srv.release(&dep, "B").await;
    let r1 = srv.state.engine.rollback(dep.id, None, TEST_OWNER).await.unwrap();
    let r2 = srv.state.engine.rollback(dep.id, None, TEST_OWNER).await.unwrap();
    assert_eq!(r1.package_hash, a.package_hash);
    assert_eq!(r2.package_hash, b.package_hash);
    assert_eq!(r2.label, "v4");
}

#[tokio::test]
async fn every_lineage_change_appends_history() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let deps = srv.seed("demo", &["Staging", "Production"]).await;
    let a = srv.release(&deps[0], "A").await;
    let b = srv.release(&deps[0], "B").await;
    let r = srv.state.engine.rollback(deps[0].id, None, TEST_OWNER).await.unwrap();
    let p = srv.state.engine.promote(deps[0].id, deps[1].id, TEST_OWNER).await.unwrap();
    let hist: Vec<_> = srv.repo.recent_history(deps[0].id, 10).await.unwrap().into_iter().map(|h| h.package_id).collect();
    assert_eq!(hist, vec![r.id, b.id, a.id]);
    let hist: Vec<_> = srv.repo.recent_history(deps[1].id, 10).await.unwrap().into_iter().map(|h| h.package_id).collect();
    assert_eq!(hist, vec![p.id]);
}

#[tokio::test]
async fn release_to_missing_deployment_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let err = srv.state.engine.release(uuid::Uuid::new_v4(), release_request("A")).await.unwrap_err();
    assert!(matches!(err, ReleaseError::NotFound(_)));
}

#[tokio::test]
async fn file_names_with_inner_dots_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let mut req = release_request("A");
    req.file_name = "app..v2.zip".into();
    let pkg = srv.state.engine.release(dep.id, req).await.unwrap();
    assert_eq!(pkg.label, "v1");
    assert!(pkg.blob_url.ends_with("_app..v2.zip"), "{}", pkg.blob_url);
    let key = pkg.blob_url.trim_start_matches("http://bundles.test/download/");
    assert_eq!(std::fs::read(dir.path().join("blobs").join(key)).unwrap(), bundle_zip("A"));
}

#[tokio::test]
async fn failed_blob_write_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let scratch = dir.path().join("scratch");
    let engine = ReleaseEngine::new(srv.repo.clone(), StorageManager::new(Arc::new(UnavailableStore)), DiffScheduler::disabled(), &scratch);

    let err = engine.release(dep.id, release_request("A")).await.unwrap_err();
    assert!(matches!(err, ReleaseError::StorageFailure(_)), "got {err:?}");

    let dep = srv.repo.get_deployment(dep.id).await.unwrap().unwrap();
    assert_eq!(dep.label_counter, 0);
    assert!(dep.current_package_id.is_none());
    assert!(srv.repo.list_packages(dep.id, None, 10).await.unwrap().is_empty());
    assert!(srv.repo.recent_history(dep.id, 10).await.unwrap().is_empty());
    // the scratch upload is cleaned up
    assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
}
