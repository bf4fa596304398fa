use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::error::{ReleaseError, ReleaseResult};
use crate::models::{label_for, App, Deployment, DeploymentHistory, NewPackage, NewPackageDiff, Package, PackageDiff, ReleaseMethod, ReportDeploy, ReportDownload};
use super::ReleaseRepository;

#[derive(Debug, Clone)]
struct StoredApp { app: App, deleted: bool }

#[derive(Debug, Clone)]
struct StoredDeployment { deployment: Deployment, deleted: bool }

#[derive(Default)]
struct State {
    apps: HashMap<Uuid, StoredApp>,
    deployments: HashMap<Uuid, StoredDeployment>,
    // insertion order doubles as creation order
    packages: Vec<Package>,
    history: Vec<DeploymentHistory>,
    diffs: Vec<PackageDiff>,
    downloads: Vec<ReportDownload>,
    deploys: Vec<ReportDeploy>,
}

/// Process-local repository used by tests and database-less development runs.
/// One mutex guards the whole state, so every write is trivially atomic.
#[derive(Default)]
pub struct MemoryReleaseRepository { state: Mutex<State> }

impl MemoryReleaseRepository {
    pub fn new() -> Self { Self::default() }

    pub async fn download_reports(&self) -> Vec<ReportDownload> { self.state.lock().await.downloads.clone() }
    pub async fn deploy_reports(&self) -> Vec<ReportDeploy> { self.state.lock().await.deploys.clone() }
}

impl State {
    fn live_app(&self, id: Uuid) -> Option<&App> {
        self.apps.get(&id).filter(|a| !a.deleted).map(|a| &a.app)
    }

    fn live_deployment(&self, id: Uuid) -> Option<&Deployment> {
        self.deployments.get(&id)
            .filter(|d| !d.deleted && self.live_app(d.deployment.app_id).is_some())
            .map(|d| &d.deployment)
    }

    fn append(&mut self, deployment_id: Uuid, new: NewPackage) -> ReleaseResult<Package> {
        let seq = self.live_deployment(deployment_id)
            .ok_or_else(|| ReleaseError::not_found("deployment"))?
            .label_counter + 1;
        let now = Utc::now();
        let package = Package {
            id: Uuid::new_v4(),
            deployment_id,
            label: label_for(seq),
            label_seq: seq,
            description: new.description,
            package_hash: new.package_hash,
            blob_url: new.blob_url,
            size: new.size,
            release_method: new.release_method,
            original_label: new.original_label,
            original_deployment: new.original_deployment,
            is_mandatory: new.is_mandatory,
            is_disabled: new.is_disabled,
            rollout: new.rollout,
            released_by: new.released_by,
            created_at: now,
        };
        let stored = self.deployments.get_mut(&deployment_id).ok_or_else(|| ReleaseError::not_found("deployment"))?;
        stored.deployment.label_counter = seq;
        stored.deployment.current_package_id = Some(package.id);
        stored.deployment.updated_at = now;
        let history_id = self.history.len() as i64 + 1;
        self.history.push(DeploymentHistory { id: history_id, deployment_id, package_id: package.id, created_at: now });
        self.packages.push(package.clone());
        Ok(package)
    }
}

#[async_trait]
impl ReleaseRepository for MemoryReleaseRepository {
    async fn ping(&self) -> ReleaseResult<()> { Ok(()) }

    async fn create_app(&self, owner: &str, name: &str) -> ReleaseResult<App> {
        let mut st = self.state.lock().await;
        if st.apps.values().any(|a| !a.deleted && a.app.owner == owner && a.app.name == name) {
            return Err(ReleaseError::conflict(format!("{name} exists")));
        }
        let now = Utc::now();
        let app = App { id: Uuid::new_v4(), owner: owner.to_string(), name: name.to_string(), created_at: now, updated_at: now };
        st.apps.insert(app.id, StoredApp { app: app.clone(), deleted: false });
        Ok(app)
    }

    async fn find_app(&self, owner: &str, name: &str) -> ReleaseResult<Option<App>> {
        let st = self.state.lock().await;
        Ok(st.apps.values().find(|a| !a.deleted && a.app.owner == owner && a.app.name == name).map(|a| a.app.clone()))
    }

    async fn list_apps(&self, owner: &str) -> ReleaseResult<Vec<App>> {
        let st = self.state.lock().await;
        let mut apps: Vec<App> = st.apps.values().filter(|a| !a.deleted && a.app.owner == owner).map(|a| a.app.clone()).collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }

    async fn rename_app(&self, app_id: Uuid, new_name: &str) -> ReleaseResult<App> {
        let mut st = self.state.lock().await;
        let owner = st.live_app(app_id).ok_or_else(|| ReleaseError::not_found("app"))?.owner.clone();
        if st.apps.values().any(|a| !a.deleted && a.app.id != app_id && a.app.owner == owner && a.app.name == new_name) {
            return Err(ReleaseError::conflict(format!("{new_name} exists")));
        }
        let stored = st.apps.get_mut(&app_id).ok_or_else(|| ReleaseError::not_found("app"))?;
        stored.app.name = new_name.to_string();
        stored.app.updated_at = Utc::now();
        Ok(stored.app.clone())
    }

    async fn delete_app(&self, app_id: Uuid) -> ReleaseResult<()> {
        let mut st = self.state.lock().await;
        match st.apps.get_mut(&app_id) {
            Some(a) if !a.deleted => { a.deleted = true; Ok(()) }
            _ => Err(ReleaseError::not_found("app")),
        }
    }

    async fn create_deployment(&self, app_id: Uuid, name: &str, deployment_key: &str) -> ReleaseResult<Deployment> {
        let mut st = self.state.lock().await;
        if st.live_app(app_id).is_none() { return Err(ReleaseError::not_found("app")); }
        if st.deployments.values().any(|d| !d.deleted && d.deployment.app_id == app_id && d.deployment.name == name) {
            return Err(ReleaseError::conflict("deployment already exists"));
        }
        if st.deployments.values().any(|d| d.deployment.deployment_key == deployment_key) {
            return Err(ReleaseError::conflict("deployment key collision"));
        }
        let now = Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4(), app_id, name: name.to_string(), deployment_key: deployment_key.to_string(),
            label_counter: 0, current_package_id: None, created_at: now, updated_at: now,
        };
        st.deployments.insert(deployment.id, StoredDeployment { deployment: deployment.clone(), deleted: false });
        Ok(deployment)
    }

    async fn find_deployment(&self, app_id: Uuid, name: &str) -> ReleaseResult<Option<Deployment>> {
        let st = self.state.lock().await;
        Ok(st.deployments.values()
            .filter(|d| d.deployment.app_id == app_id && d.deployment.name == name)
            .find_map(|d| st.live_deployment(d.deployment.id).cloned()))
    }

    async fn find_deployment_by_key(&self, deployment_key: &str) -> ReleaseResult<Option<Deployment>> {
        let st = self.state.lock().await;
        Ok(st.deployments.values()
            .filter(|d| d.deployment.deployment_key == deployment_key)
            .find_map(|d| st.live_deployment(d.deployment.id).cloned()))
    }

    async fn get_deployment(&self, id: Uuid) -> ReleaseResult<Option<Deployment>> {
        Ok(self.state.lock().await.live_deployment(id).cloned())
    }

    async fn list_deployments(&self, app_id: Uuid) -> ReleaseResult<Vec<Deployment>> {
        let st = self.state.lock().await;
        let mut out: Vec<Deployment> = st.deployments.values()
            .filter(|d| d.deployment.app_id == app_id)
            .filter_map(|d| st.live_deployment(d.deployment.id).cloned())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn delete_deployment(&self, id: Uuid) -> ReleaseResult<()> {
        let mut st = self.state.lock().await;
        match st.deployments.get_mut(&id) {
            Some(d) if !d.deleted => { d.deleted = true; Ok(()) }
            _ => Err(ReleaseError::not_found("deployment")),
        }
    }

    async fn get_package(&self, id: Uuid) -> ReleaseResult<Option<Package>> {
        Ok(self.state.lock().await.packages.iter().find(|p| p.id == id).cloned())
    }

    async fn find_package_by_label(&self, deployment_id: Uuid, label: &str) -> ReleaseResult<Option<Package>> {
        let st = self.state.lock().await;
        Ok(st.packages.iter().find(|p| p.deployment_id == deployment_id && p.label == label).cloned())
    }

    async fn list_packages(&self, deployment_id: Uuid, before_seq: Option<i64>, limit: i64) -> ReleaseResult<Vec<Package>> {
        let st = self.state.lock().await;
        Ok(st.packages.iter().rev()
            .filter(|p| p.deployment_id == deployment_id)
            .filter(|p| before_seq.map_or(true, |s| p.label_seq < s))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn recent_history(&self, deployment_id: Uuid, limit: i64) -> ReleaseResult<Vec<DeploymentHistory>> {
        let st = self.state.lock().await;
        Ok(st.history.iter().rev()
            .filter(|h| h.deployment_id == deployment_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn append_package(&self, deployment_id: Uuid, new: NewPackage) -> ReleaseResult<Package> {
        self.state.lock().await.append(deployment_id, new)
    }

    async fn append_rollback(&self, deployment_id: Uuid, target_label: Option<&str>, released_by: &str) -> ReleaseResult<Package> {
        let mut st = self.state.lock().await;
        st.live_deployment(deployment_id).ok_or_else(|| ReleaseError::not_found("deployment"))?;
        let target_id = match target_label {
            Some(label) => st.packages.iter()
                .find(|p| p.deployment_id == deployment_id && p.label == label)
                .map(|p| p.id)
                .ok_or_else(|| ReleaseError::not_found(format!("package {label}")))?,
            None => st.history.iter().rev()
                .filter(|h| h.deployment_id == deployment_id)
                .nth(1)
                .map(|h| h.package_id)
                .ok_or_else(|| ReleaseError::invalid_state("no previous release to roll back to"))?,
        };
        let target = st.packages.iter().find(|p| p.id == target_id).cloned()
            .ok_or_else(|| ReleaseError::not_found("previous package"))?;
        st.append(deployment_id, NewPackage::cloned_from(&target, ReleaseMethod::Rollback, released_by))
    }

    async fn find_package_diff(&self, package_id: Uuid, against_hash: &str) -> ReleaseResult<Option<PackageDiff>> {
        let st = self.state.lock().await;
        Ok(st.diffs.iter().find(|d| d.package_id == package_id && d.diff_against_package_hash == against_hash).cloned())
    }

    async fn upsert_package_diff(&self, diff: NewPackageDiff) -> ReleaseResult<PackageDiff> {
        let mut st = self.state.lock().await;
        if let Some(existing) = st.diffs.iter_mut().find(|d| d.package_id == diff.package_id && d.diff_against_package_hash == diff.diff_against_package_hash) {
            existing.diff_blob_url = diff.diff_blob_url;
            existing.diff_size = diff.diff_size;
            return Ok(existing.clone());
        }
        let row = PackageDiff {
            id: Uuid::new_v4(),
            package_id: diff.package_id,
            diff_against_package_hash: diff.diff_against_package_hash,
            diff_blob_url: diff.diff_blob_url,
            diff_size: diff.diff_size,
            created_at: Utc::now(),
        };
        st.diffs.push(row.clone());
        Ok(row)
    }

    async fn list_package_diffs(&self, package_id: Uuid) -> ReleaseResult<Vec<PackageDiff>> {
        let st = self.state.lock().await;
        Ok(st.diffs.iter().filter(|d| d.package_id == package_id).cloned().collect())
    }

    async fn record_download(&self, report: ReportDownload) -> ReleaseResult<()> {
        self.state.lock().await.downloads.push(report);
        Ok(())
    }

    async fn record_deploy(&self, report: ReportDeploy) -> ReleaseResult<()> {
        self.state.lock().await.deploys.push(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(hash: &str) -> NewPackage {
        NewPackage {
            description: String::new(), package_hash: hash.into(), blob_url: format!("mem://{hash}"), size: 1,
            release_method: ReleaseMethod::Upload, original_label: None, original_deployment: None,
            is_mandatory: false, is_disabled: false, rollout: 100, released_by: "tester".into(),
        }
    }

    #[tokio::test]
    async fn append_assigns_sequential_labels_and_moves_pointer() {
        let repo = MemoryReleaseRepository::new();
        let app = repo.create_app("alice", "demo").await.unwrap();
        let dep = repo.create_deployment(app.id, "Staging", "k1").await.unwrap();
        let p1 = repo.append_package(dep.id, upload("a")).await.unwrap();
        let p2 = repo.append_package(dep.id, upload("b")).await.unwrap();
        assert_eq!((p1.label.as_str(), p2.label.as_str()), ("v1", "v2"));
        let dep = repo.get_deployment(dep.id).await.unwrap().unwrap();
        assert_eq!(dep.label_counter, 2);
        assert_eq!(dep.current_package_id, Some(p2.id));
        let hist = repo.recent_history(dep.id, 5).await.unwrap();
        assert_eq!(hist.iter().map(|h| h.package_id).collect::<Vec<_>>(), vec![p2.id, p1.id]);
    }

    #[tokio::test]
    async fn soft_deleted_rows_disappear_from_lookups() {
        let repo = MemoryReleaseRepository::new();
        let app = repo.create_app("alice", "demo").await.unwrap();
        let dep = repo.create_deployment(app.id, "Production", "key-prod").await.unwrap();
        repo.delete_app(app.id).await.unwrap();
        assert!(repo.find_deployment_by_key("key-prod").await.unwrap().is_none());
        assert!(repo.get_deployment(dep.id).await.unwrap().is_none());
        // the name is free again once the old app is gone
        repo.create_app("alice", "demo").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_names_conflict() {
        let repo = MemoryReleaseRepository::new();
        let app = repo.create_app("alice", "demo").await.unwrap();
        assert!(matches!(repo.create_app("alice", "demo").await, Err(ReleaseError::Conflict(_))));
        repo.create_app("bob", "demo").await.unwrap();
        repo.create_deployment(app.id, "Staging", "k1").await.unwrap();
        assert!(matches!(repo.create_deployment(app.id, "Staging", "k2").await, Err(ReleaseError::Conflict(_))));
    }

    #[tokio::test]
    async fn rollback_picks_its_target_under_the_state_lock() {
        let repo = MemoryReleaseRepository::new();
        let app = repo.create_app("alice", "demo").await.unwrap();
        let dep = repo.create_deployment(app.id, "Staging", "k1").await.unwrap();
        let p1 = repo.append_package(dep.id, upload("a")).await.unwrap();
        assert!(matches!(repo.append_rollback(dep.id, None, "bob").await, Err(ReleaseError::InvalidState(_))));
        repo.append_package(dep.id, upload("b")).await.unwrap();

        let back = repo.append_rollback(dep.id, None, "bob").await.unwrap();
        assert_eq!((back.label.as_str(), back.package_hash.as_str()), ("v3", "a"));
        assert_eq!(back.release_method, ReleaseMethod::Rollback);
        assert_eq!(back.original_label.as_deref(), Some("v1"));
        assert_eq!(back.released_by, "bob");

        let again = repo.append_rollback(dep.id, Some("v1"), "bob").await.unwrap();
        assert_eq!((again.label.as_str(), again.blob_url.as_str()), ("v4", p1.blob_url.as_str()));
        assert!(matches!(repo.append_rollback(dep.id, Some("v9"), "bob").await, Err(ReleaseError::NotFound(_))));
        assert_eq!(repo.get_deployment(dep.id).await.unwrap().unwrap().label_counter, 4);
    }
}
