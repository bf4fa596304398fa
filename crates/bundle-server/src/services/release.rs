//! Release, promote and rollback: the only writers of a deployment's lineage.
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use crate::error::{ReleaseError, ReleaseResult};
use crate::models::{Deployment, NewPackage, Package, ReleaseMethod};
use crate::repo::ReleaseRepository;
use crate::services::diff::DiffScheduler;
use crate::services::{random_token, sha256_hex};
use crate::storage::StorageManager;
use crate::telemetry::RELEASES_TOTAL;

/// An uploaded artifact plus the publisher-supplied metadata.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub file_name: String,
    pub bytes: Bytes,
    pub description: String,
    pub is_mandatory: bool,
    /// Hash the publisher computed locally; must match the server's digest when present.
    pub expected_hash: Option<String>,
    pub released_by: String,
}

/// Keep only the final path component and drop anything that could escape a key.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() { "bundle.zip".to_string() } else { cleaned }
}

pub struct ReleaseEngine {
    repo: Arc<dyn ReleaseRepository>,
    storage: StorageManager,
    scheduler: DiffScheduler,
    temp_dir: PathBuf,
    locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ReleaseEngine {
    pub fn new(repo: Arc<dyn ReleaseRepository>, storage: StorageManager, scheduler: DiffScheduler, temp_dir: impl Into<PathBuf>) -> Self {
        Self { repo, storage, scheduler, temp_dir: temp_dir.into(), locks: std::sync::Mutex::new(HashMap::new()) }
    }

    fn lock_for(&self, deployment_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(deployment_id).or_default().clone()
    }

    /// Drop the caller's handle and evict the entry once the map holds the only one,
    /// so the map only tracks deployments with a write in flight.
    fn release_lock(&self, deployment_id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&deployment_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&deployment_id);
        }
    }

    async fn deployment(&self, id: Uuid) -> ReleaseResult<Deployment> {
        self.repo.get_deployment(id).await?.ok_or_else(|| ReleaseError::not_found("deployment"))
    }

    /// Append under the deployment's lock, then hand the new package to the diff pool.
    async fn commit(&self, deployment_id: Uuid, new: NewPackage) -> ReleaseResult<Package> {
        let lock = self.lock_for(deployment_id);
        let appended = {
            let _guard = lock.lock().await;
            self.repo.append_package(deployment_id, new).await
        };
        self.release_lock(deployment_id, lock);
        self.finish(appended?)
    }

    fn finish(&self, package: Package) -> ReleaseResult<Package> {
        RELEASES_TOTAL.with_label_values(&[package.release_method.as_str()]).inc();
        info!(deployment_id=%package.deployment_id, label=%package.label, method=%package.release_method, hash=%package.package_hash, "release.completed");
        self.scheduler.submit(package.clone());
        Ok(package)
    }

    #[tracing::instrument(skip(self, req), fields(file=%req.file_name, size=req.bytes.len()))]
    pub async fn release(&self, deployment_id: Uuid, req: ReleaseRequest) -> ReleaseResult<Package> {
        self.deployment(deployment_id).await?;
        let hash = sha256_hex(&req.bytes);
        if let Some(expected) = req.expected_hash.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            if !expected.eq_ignore_ascii_case(&hash) {
                return Err(ReleaseError::invalid_state(format!("package hash mismatch: expected {expected}, computed {hash}")));
            }
        }
        let key = format!("{}_{}", random_token(10), sanitize_file_name(&req.file_name));
        tokio::fs::create_dir_all(&self.temp_dir).await.map_err(ReleaseError::storage)?;
        let tmp = self.temp_dir.join(format!("{}.upload", Uuid::new_v4()));
        tokio::fs::write(&tmp, &req.bytes).await.map_err(ReleaseError::storage)?;
        let blob_url = match self.storage.backend().put(&tmp, &key).await {
            Ok(url) => url,
            Err(e) => {
                tokio::fs::remove_file(&tmp).await.ok();
                warn!(error=%e, key, "release.blob_store_failed");
                return Err(ReleaseError::storage(e));
            }
        };
        let new = NewPackage {
            description: req.description,
            package_hash: hash,
            blob_url,
            size: req.bytes.len() as i64,
            release_method: ReleaseMethod::Upload,
            original_label: None,
            original_deployment: None,
            is_mandatory: req.is_mandatory,
            is_disabled: false,
            rollout: 100,
            released_by: req.released_by,
        };
        self.commit(deployment_id, new).await
    }

    /// Copy the source deployment's current package into `dest_id` under a fresh label.
    #[tracing::instrument(skip(self))]
    pub async fn promote(&self, source_id: Uuid, dest_id: Uuid, released_by: &str) -> ReleaseResult<Package> {
        if source_id == dest_id {
            return Err(ReleaseError::invalid_state("source and destination deployment are the same"));
        }
        let source = self.deployment(source_id).await?;
        self.deployment(dest_id).await?;
        let current_id = source.current_package_id.ok_or_else(|| ReleaseError::not_found("current package of source deployment"))?;
        let current = self.repo.get_package(current_id).await?
            .ok_or_else(|| ReleaseError::not_found("current package of source deployment"))?;
        let mut new = NewPackage::cloned_from(&current, ReleaseMethod::Promote, released_by);
        new.original_deployment = Some(source.name.clone());
        self.commit(dest_id, new).await
    }

    /// Re-release an earlier package. Without `label`, the package that was current
    /// before the present one.
    #[tracing::instrument(skip(self))]
    pub async fn rollback(&self, deployment_id: Uuid, label: Option<&str>, released_by: &str) -> ReleaseResult<Package> {
        self.deployment(deployment_id).await?;
        let label = label.map(str::trim).filter(|l| !l.is_empty());
        let lock = self.lock_for(deployment_id);
        let appended = {
            let _guard = lock.lock().await;
            self.repo.append_rollback(deployment_id, label, released_by).await
        };
        self.release_lock(deployment_id, lock);
        self.finish(appended?)
    }
}
