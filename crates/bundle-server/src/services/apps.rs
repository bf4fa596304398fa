use std::sync::Arc;
use tracing::info;
use crate::error::{ReleaseError, ReleaseResult};
use crate::models::{App, Deployment};
use crate::repo::ReleaseRepository;
use crate::services::random_token;

pub const DEPLOYMENT_KEY_LEN: usize = 40;

fn clean_name(name: &str, what: &str) -> ReleaseResult<String> {
    let name = name.trim();
    if name.is_empty() { return Err(ReleaseError::invalid_state(format!("{what} name must not be empty"))); }
    if name.contains('/') { return Err(ReleaseError::invalid_state(format!("{what} name must not contain '/'"))); }
    Ok(name.to_string())
}

/// Publisher-side management of apps and their deployments. Every lookup is scoped
/// to the calling owner, so another owner's app reads as absent.
#[derive(Clone)]
pub struct AppService { repo: Arc<dyn ReleaseRepository> }

impl AppService {
    pub fn new(repo: Arc<dyn ReleaseRepository>) -> Self { Self { repo } }

    pub async fn create_app(&self, owner: &str, name: &str) -> ReleaseResult<App> {
        let name = clean_name(name, "app")?;
        let app = self.repo.create_app(owner, &name).await?;
        info!(app=%app.name, owner, "app.created");
        Ok(app)
    }

    pub async fn list_apps(&self, owner: &str) -> ReleaseResult<Vec<App>> { self.repo.list_apps(owner).await }

    pub async fn app(&self, owner: &str, name: &str) -> ReleaseResult<App> {
        self.repo.find_app(owner, name.trim()).await?.ok_or_else(|| ReleaseError::not_found("app"))
    }

    pub async fn rename_app(&self, owner: &str, name: &str, new_name: &str) -> ReleaseResult<App> {
        let new_name = clean_name(new_name, "app")?;
        let app = self.app(owner, name).await?;
        let renamed = self.repo.rename_app(app.id, &new_name).await?;
        info!(from=%app.name, to=%renamed.name, "app.renamed");
        Ok(renamed)
    }

    pub async fn delete_app(&self, owner: &str, name: &str) -> ReleaseResult<()> {
        let app = self.app(owner, name).await?;
        self.repo.delete_app(app.id).await?;
        info!(app=%app.name, "app.deleted");
        Ok(())
    }

    pub async fn create_deployment(&self, owner: &str, app_name: &str, name: &str) -> ReleaseResult<Deployment> {
        let name = clean_name(name, "deployment")?;
        let app = self.app(owner, app_name).await?;
        if self.repo.find_deployment(app.id, &name).await?.is_some() {
            return Err(ReleaseError::conflict("deployment already exists"));
        }
        let deployment = self.repo.create_deployment(app.id, &name, &random_token(DEPLOYMENT_KEY_LEN)).await?;
        info!(app=%app.name, deployment=%deployment.name, "deployment.created");
        Ok(deployment)
    }

    pub async fn list_deployments(&self, owner: &str, app_name: &str) -> ReleaseResult<Vec<Deployment>> {
        let app = self.app(owner, app_name).await?;
        self.repo.list_deployments(app.id).await
    }

    pub async fn deployment(&self, owner: &str, app_name: &str, name: &str) -> ReleaseResult<Deployment> {
        let app = self.app(owner, app_name).await?;
        self.repo.find_deployment(app.id, name.trim()).await?.ok_or_else(|| ReleaseError::not_found("deployment"))
    }

    pub async fn delete_deployment(&self, owner: &str, app_name: &str, name: &str) -> ReleaseResult<()> {
        let deployment = self.deployment(owner, app_name, name).await?;
        self.repo.delete_deployment(deployment.id).await?;
        info!(deployment=%deployment.name, "deployment.deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryReleaseRepository;

    fn service() -> AppService { AppService::new(Arc::new(MemoryReleaseRepository::new())) }

    #[tokio::test]
    async fn deployments_get_forty_char_keys() {
        let svc = service();
        svc.create_app("alice", "demo").await.unwrap();
        let d = svc.create_deployment("alice", "demo", "Staging").await.unwrap();
        assert_eq!(d.deployment_key.len(), DEPLOYMENT_KEY_LEN);
        assert_eq!(d.label_counter, 0);
        assert!(d.current_package_id.is_none());
    }

    #[tokio::test]
    async fn apps_are_scoped_to_their_owner() {
        let svc = service();
        svc.create_app("alice", "demo").await.unwrap();
        assert!(matches!(svc.app("bob", "demo").await, Err(ReleaseError::NotFound(_))));
        assert!(matches!(svc.create_deployment("bob", "demo", "Staging").await, Err(ReleaseError::NotFound(_))));
    }

    #[tokio::test]
    async fn rename_to_taken_name_conflicts() {
        let svc = service();
        svc.create_app("alice", "one").await.unwrap();
        svc.create_app("alice", "two").await.unwrap();
        assert!(matches!(svc.rename_app("alice", "one", "two").await, Err(ReleaseError::Conflict(_))));
        let renamed = svc.rename_app("alice", "one", "three").await.unwrap();
        assert_eq!(renamed.name, "three");
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let svc = service();
        assert!(matches!(svc.create_app("alice", "  ").await, Err(ReleaseError::InvalidState(_))));
    }
}
