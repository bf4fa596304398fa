use bundle_server::auth::TokenAuth;
use bundle_server::repo::ReleaseRepository;
use bundle_server::services::diff::{diff_key, DiffReport, DiffWorkerPool};
use bundle_server::test_support::{test_config, TestServer, TEST_OWNER};
use std::collections::BTreeSet;
use std::path::Path;

fn blob_path(root: &Path, url: &str) -> std::path::PathBuf {
    root.join("blobs").join(url.trim_start_matches("http://bundles.test/download/"))
}

#[tokio::test]
async fn diffs_against_each_prior_hash_once() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let a = srv.release(&dep, "A").await;
    let b = srv.release(&dep, "B").await;
    let c = srv.release(&dep, "C").await;

    let report = srv.diffs.generate(&c).await;
    assert_eq!(report, DiffReport { generated: 2, skipped: 0, failed: 0 });
    let rows = srv.repo.list_package_diffs(c.id).await.unwrap();
    let against: BTreeSet<_> = rows.iter().map(|r| r.diff_against_package_hash.clone()).collect();
    assert_eq!(against, BTreeSet::from([a.package_hash.clone(), b.package_hash.clone()]));
    for row in &rows {
        assert!(row.diff_blob_url.ends_with(&diff_key(&c, &row.diff_against_package_hash)));
        assert_eq!(std::fs::metadata(blob_path(dir.path(), &row.diff_blob_url)).unwrap().len() as i64, row.diff_size);
    }

    // re-running is a no-op
    let again = srv.diffs.generate(&c).await;
    assert_eq!(again, DiffReport { generated: 0, skipped: 2, failed: 0 });
    assert_eq!(srv.repo.list_package_diffs(c.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn diff_bundle_contains_both_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let a = srv.release(&dep, "A").await;
    let b = srv.release(&dep, "B").await;
    srv.diffs.generate(&b).await;
    let row = srv.repo.find_package_diff(b.id, &a.package_hash).await.unwrap().expect("diff row");
    let file = std::fs::File::open(blob_path(dir.path(), &row.diff_blob_url)).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut new = Vec::new();
    std::io::Read::read_to_end(&mut archive.by_name("new.zip").unwrap(), &mut new).unwrap();
    assert_eq!(new, std::fs::read(blob_path(dir.path(), &b.blob_url)).unwrap());
    let mut old = Vec::new();
    std::io::Read::read_to_end(&mut archive.by_name("old.zip").unwrap(), &mut old).unwrap();
    assert_eq!(old, std::fs::read(blob_path(dir.path(), &a.blob_url)).unwrap());
}

#[tokio::test]
async fn window_limits_how_far_back_diffs_go() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let mut packages = Vec::new();
    for marker in ["A", "B", "C", "D", "E"] { packages.push(srv.release(&dep, marker).await); }
    let newest = packages.last().unwrap();
    let candidates = srv.diffs.candidates(newest).await.unwrap();
    let labels: Vec<_> = candidates.iter().map(|p| p.label.as_str()).collect();
    assert_eq!(labels, vec!["v4", "v3", "v2"]);
    assert_eq!(srv.diffs.generate(newest).await.generated, 3);
}

#[tokio::test]
async fn same_hash_and_duplicate_hashes_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let a = srv.release(&dep, "A").await;
    srv.release(&dep, "B").await;
    // v3 carries A's hash, v4 carries B's hash
    srv.state.engine.rollback(dep.id, None, TEST_OWNER).await.unwrap();
    let v4 = srv.state.engine.rollback(dep.id, None, TEST_OWNER).await.unwrap();
    let candidates = srv.diffs.candidates(&v4).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].package_hash, a.package_hash);
    assert_eq!(candidates[0].label, "v3");
}

#[tokio::test]
async fn first_release_has_nothing_to_diff() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let a = srv.release(&dep, "A").await;
    assert_eq!(srv.diffs.generate(&a).await, DiffReport::default());
}

#[tokio::test]
async fn missing_old_blob_fails_only_that_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    let a = srv.release(&dep, "A").await;
    let b = srv.release(&dep, "B").await;
    let c = srv.release(&dep, "C").await;
    std::fs::remove_file(blob_path(dir.path(), &a.blob_url)).unwrap();

    let report = srv.diffs.generate(&c).await;
    assert_eq!(report, DiffReport { generated: 1, skipped: 0, failed: 1 });
    let rows = srv.repo.list_package_diffs(c.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].diff_against_package_hash, b.package_hash);
}

#[tokio::test]
async fn missing_new_blob_fails_every_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let srv = TestServer::new(dir.path());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    srv.release(&dep, "A").await;
    srv.release(&dep, "B").await;
    let c = srv.release(&dep, "C").await;
    std::fs::remove_file(blob_path(dir.path(), &c.blob_url)).unwrap();
    assert_eq!(srv.diffs.generate(&c).await, DiffReport { generated: 0, skipped: 0, failed: 2 });
    assert!(srv.repo.list_package_diffs(c.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_pool_drains_queued_jobs_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = None;
    let srv = TestServer::build(test_config(dir.path()), |generator| {
        let p = DiffWorkerPool::start(generator.clone(), 2, 16);
        let scheduler = p.scheduler();
        pool = Some(p);
        scheduler
    }, TokenAuth::disabled());
    let dep = srv.seed("demo", &["Staging"]).await.remove(0);
    srv.release(&dep, "A").await;
    let b = srv.release(&dep, "B").await;
    let c = srv.release(&dep, "C").await;

    pool.take().unwrap().shutdown().await;
    assert_eq!(srv.repo.list_package_diffs(b.id).await.unwrap().len(), 1);
    assert_eq!(srv.repo.list_package_diffs(c.id).await.unwrap().len(), 2);

    // releases after shutdown still succeed; their diff job is dropped
    let d = srv.release(&dep, "D").await;
    assert_eq!(d.label, "v4");
    assert!(srv.repo.list_package_diffs(d.id).await.unwrap().is_empty());
}
