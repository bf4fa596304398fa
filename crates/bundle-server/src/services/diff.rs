//! Diff artifacts between a freshly released package and its predecessors.
//!
//! Generation is best effort: each candidate succeeds or fails on its own and
//! nothing here ever surfaces to the publisher who triggered the release.
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::models::{NewPackageDiff, Package, PackageDiff};
use crate::repo::ReleaseRepository;
use crate::storage::StorageManager;
use crate::telemetry::{DIFF_FAILURES, DIFF_GENERATED, DIFF_JOBS_DROPPED, DIFF_QUEUE_DEPTH};

/// Outcome counts of one `generate` run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffReport { pub generated: usize, pub skipped: usize, pub failed: usize }

fn short(hash: &str) -> &str { hash.get(..8).unwrap_or(hash) }

/// Blob key of the diff between `new` and an older package with `old_hash`.
pub fn diff_key(new: &Package, old_hash: &str) -> String {
    format!("{}_{}_{}_diff.zip", new.id, short(&new.package_hash), short(old_hash))
}

/// Zip with the full new and old artifacts as `new.zip` and `old.zip`.
fn write_diff_bundle(path: &Path, new_bytes: &[u8], old_bytes: &[u8]) -> anyhow::Result<u64> {
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    // entries are zips already
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("new.zip", options)?;
    zip.write_all(new_bytes)?;
    zip.start_file("old.zip", options)?;
    zip.write_all(old_bytes)?;
    let file = zip.finish()?;
    Ok(file.metadata()?.len())
}

#[derive(Clone)]
pub struct DiffGenerator {
    repo: Arc<dyn ReleaseRepository>,
    storage: StorageManager,
    temp_dir: PathBuf,
    window: i64,
}

impl DiffGenerator {
    pub fn new(repo: Arc<dyn ReleaseRepository>, storage: StorageManager, temp_dir: impl Into<PathBuf>, window: usize) -> Self {
        Self { repo, storage, temp_dir: temp_dir.into(), window: window as i64 }
    }

    /// Older packages of the same deployment worth diffing against, newest first,
    /// one per distinct hash and never the new package's own hash.
    pub async fn candidates(&self, package: &Package) -> anyhow::Result<Vec<Package>> {
        if self.window <= 0 { return Ok(Vec::new()); }
        let prior = self.repo.list_packages(package.deployment_id, Some(package.label_seq), self.window).await?;
        let mut seen = HashSet::new();
        Ok(prior.into_iter()
            .filter(|p| p.package_hash != package.package_hash)
            .filter(|p| seen.insert(p.package_hash.clone()))
            .collect())
    }

    #[tracing::instrument(skip(self, package), fields(package_id=%package.id, label=%package.label))]
    pub async fn generate(&self, package: &Package) -> DiffReport {
        let mut report = DiffReport::default();
        let candidates = match self.candidates(package).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error=%e, "diff.candidates_failed");
                DIFF_FAILURES.inc();
                report.failed += 1;
                return report;
            }
        };
        let mut new_bytes: Option<Vec<u8>> = None;
        for old in &candidates {
            match self.repo.find_package_diff(package.id, &old.package_hash).await {
                Ok(Some(_)) => { report.skipped += 1; continue; }
                Ok(None) => {}
                Err(e) => {
                    warn!(error=%e, old_label=%old.label, "diff.candidate_failed");
                    DIFF_FAILURES.inc();
                    report.failed += 1;
                    continue;
                }
            }
            if new_bytes.is_none() {
                match self.fetch(&package.blob_url).await {
                    Ok(b) => new_bytes = Some(b),
                    Err(e) => {
                        // every remaining candidate needs the new artifact
                        warn!(error=%e, "diff.new_artifact_unavailable");
                        let remaining = candidates.len() - report.skipped - report.failed - report.generated;
                        DIFF_FAILURES.inc_by(remaining as u64);
                        report.failed += remaining;
                        return report;
                    }
                }
            }
            let new_ref = new_bytes.as_deref().unwrap_or_default();
            match self.diff_against(package, new_ref, old).await {
                Ok(row) => {
                    DIFF_GENERATED.inc();
                    report.generated += 1;
                    debug!(old_label=%old.label, url=%row.diff_blob_url, size=row.diff_size, "diff.stored");
                }
                Err(e) => {
                    warn!(error=%e, old_label=%old.label, "diff.candidate_failed");
                    DIFF_FAILURES.inc();
                    report.failed += 1;
                }
            }
        }
        info!(generated=report.generated, skipped=report.skipped, failed=report.failed, "diff.completed");
        report
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let backend = self.storage.backend();
        let key = backend.key_for_url(url).ok_or_else(|| anyhow::anyhow!("blob url '{url}' not served by this store"))?;
        backend.get(&key).await
    }

    async fn diff_against(&self, new: &Package, new_bytes: &[u8], old: &Package) -> anyhow::Result<PackageDiff> {
        let old_bytes = self.fetch(&old.blob_url).await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let tmp = self.temp_dir.join(format!("{}.diff.tmp", Uuid::new_v4()));
        let path = tmp.clone();
        let new_owned = new_bytes.to_vec();
        let built = tokio::task::spawn_blocking(move || write_diff_bundle(&path, &new_owned, &old_bytes)).await?;
        let size = match built {
            Ok(size) => size,
            Err(e) => { tokio::fs::remove_file(&tmp).await.ok(); return Err(e); }
        };
        let key = diff_key(new, &old.package_hash);
        let url = match self.storage.backend().put(&tmp, &key).await {
            Ok(url) => url,
            Err(e) => { tokio::fs::remove_file(&tmp).await.ok(); return Err(e); }
        };
        let row = self.repo.upsert_package_diff(NewPackageDiff {
            package_id: new.id,
            diff_against_package_hash: old.package_hash.clone(),
            diff_blob_url: url,
            diff_size: size as i64,
        }).await?;
        Ok(row)
    }
}

/// Cheap handle the release engine uses to enqueue diff work.
#[derive(Clone)]
pub struct DiffScheduler { tx: Arc<Mutex<Option<mpsc::Sender<Package>>>> }

impl DiffScheduler {
    /// A scheduler that drops every job; for callers that never want diffs.
    pub fn disabled() -> Self { Self { tx: Arc::new(Mutex::new(None)) } }

    /// Enqueue without waiting. Returns false when the job was dropped.
    pub fn submit(&self, package: Package) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            DIFF_JOBS_DROPPED.inc();
            debug!(package_id=%package.id, "diff.scheduler_closed");
            return false;
        };
        let package_id = package.id;
        match tx.try_send(package) {
            Ok(()) => { DIFF_QUEUE_DEPTH.inc(); true }
            Err(mpsc::error::TrySendError::Full(_)) => {
                DIFF_JOBS_DROPPED.inc();
                warn!(%package_id, "diff.queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                DIFF_JOBS_DROPPED.inc();
                warn!(%package_id, "diff.queue_closed");
                false
            }
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Fixed set of workers draining a bounded queue of diff jobs.
pub struct DiffWorkerPool { scheduler: DiffScheduler, workers: Vec<JoinHandle<()>> }

impl DiffWorkerPool {
    pub fn start(generator: DiffGenerator, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Package>(capacity.max(1));
        let shared = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers.max(1)).map(|worker_id| {
            let rx = shared.clone();
            let generator = generator.clone();
            tokio::spawn(async move {
                debug!(worker_id, "diff.worker_started");
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(package) = job else { break };
                    DIFF_QUEUE_DEPTH.dec();
                    generator.generate(&package).await;
                }
                debug!(worker_id, "diff.worker_stopped");
            })
        }).collect();
        info!(workers, capacity, "diff.pool_started");
        Self { scheduler: DiffScheduler { tx: Arc::new(Mutex::new(Some(tx))) }, workers: handles }
    }

    pub fn scheduler(&self) -> DiffScheduler { self.scheduler.clone() }

    /// Stop accepting jobs, then wait until every queued job has been processed.
    pub async fn shutdown(self) {
        self.scheduler.close();
        for handle in self.workers {
            if let Err(e) = handle.await { warn!(error=%e, "diff.worker_panicked"); }
        }
        info!("diff.pool_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::ReleaseMethod;

    fn package(hash: &str) -> Package {
        Package {
            id: Uuid::nil(), deployment_id: Uuid::nil(), label: "v2".into(), label_seq: 2, description: String::new(),
            package_hash: hash.into(), blob_url: String::new(), size: 0, release_method: ReleaseMethod::Upload,
            original_label: None, original_deployment: None, is_mandatory: false, is_disabled: false, rollout: 100,
            released_by: "t".into(), created_at: Utc::now(),
        }
    }

    #[test]
    fn diff_key_uses_hash_prefixes() {
        let p = package("0123456789abcdef");
        assert_eq!(diff_key(&p, "fedcba9876543210"), format!("{}_01234567_fedcba98_diff.zip", Uuid::nil()));
        assert_eq!(diff_key(&p, "abc"), format!("{}_01234567_abc_diff.zip", Uuid::nil()));
    }

    #[test]
    fn bundle_holds_both_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.zip");
        write_diff_bundle(&path, b"NEW", b"OLD").unwrap();
        let mut archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["new.zip", "old.zip"]);
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("old.zip").unwrap(), &mut buf).unwrap();
        assert_eq!(buf, "OLD");
    }

    #[tokio::test]
    async fn disabled_scheduler_drops_jobs() {
        assert!(!DiffScheduler::disabled().submit(package("aa")));
    }
}
