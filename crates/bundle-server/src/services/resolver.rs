//! Client-facing decisions: which package, if any, a device should download.
use std::sync::Arc;
use tracing::debug;
use crate::error::{ReleaseError, ReleaseResult};
use crate::models::{Deployment, Package, ReportDeploy, ReportDownload};
use crate::repo::ReleaseRepository;
use crate::telemetry::UPDATE_CHECKS;

/// What the client reported about itself on an update check.
#[derive(Debug, Clone, Default)]
pub struct UpdateQuery {
    pub deployment_key: String,
    pub app_version: String,
    pub label: String,
    pub package_hash: String,
    pub client_unique_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    NotAvailable,
    /// `app_version` is the client's own version, echoed back unchanged.
    Available { package: Package, app_version: String },
}

impl UpdateOutcome {
    pub fn is_available(&self) -> bool { matches!(self, Self::Available { .. }) }
}

#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub deployment_key: String,
    pub label: String,
    pub client_unique_id: String,
    pub status: i16,
    pub previous_label: Option<String>,
    pub previous_deployment_key: Option<String>,
}

#[derive(Clone)]
pub struct UpdateResolver { repo: Arc<dyn ReleaseRepository> }

impl UpdateResolver {
    pub fn new(repo: Arc<dyn ReleaseRepository>) -> Self { Self { repo } }

    async fn deployment(&self, key: &str) -> ReleaseResult<Deployment> {
        self.repo.find_deployment_by_key(key.trim()).await?
            .ok_or_else(|| ReleaseError::not_found("deployment key"))
    }

    async fn target(&self, deployment: &Deployment, label: &str) -> ReleaseResult<Option<Package>> {
        if !label.is_empty() {
            return self.repo.find_package_by_label(deployment.id, label).await;
        }
        match deployment.current_package_id {
            Some(id) => self.repo.get_package(id).await,
            None => Ok(None),
        }
    }

    /// Read-only; repeated calls with no release in between give the same answer.
    pub async fn resolve(&self, query: &UpdateQuery) -> ReleaseResult<UpdateOutcome> {
        let deployment = match self.deployment(&query.deployment_key).await {
            Ok(d) => d,
            Err(e) => {
                UPDATE_CHECKS.with_label_values(&["unknown_key"]).inc();
                return Err(e);
            }
        };
        let label = query.label.trim();
        let Some(package) = self.target(&deployment, label).await? else {
            UPDATE_CHECKS.with_label_values(&["no_package"]).inc();
            debug!(deployment=%deployment.name, label, "update_check.no_package");
            return Ok(UpdateOutcome::NotAvailable);
        };
        if package.package_hash == query.package_hash.trim() {
            UPDATE_CHECKS.with_label_values(&["up_to_date"]).inc();
            return Ok(UpdateOutcome::NotAvailable);
        }
        UPDATE_CHECKS.with_label_values(&["available"]).inc();
        debug!(deployment=%deployment.name, label=%package.label, client=%query.client_unique_id, "update_check.available");
        Ok(UpdateOutcome::Available { package, app_version: query.app_version.clone() })
    }

    async fn reported_package(&self, key: &str, label: &str) -> ReleaseResult<Package> {
        let deployment = self.deployment(key).await?;
        self.repo.find_package_by_label(deployment.id, label.trim()).await?
            .ok_or_else(|| ReleaseError::invalid_state(format!("unknown label '{label}'")))
    }

    pub async fn report_download(&self, report: &StatusReport) -> ReleaseResult<()> {
        let package = self.reported_package(&report.deployment_key, &report.label).await?;
        self.repo.record_download(ReportDownload { package_id: package.id, client_unique_id: report.client_unique_id.clone() }).await
    }

    pub async fn report_deploy(&self, report: &StatusReport) -> ReleaseResult<()> {
        let package = self.reported_package(&report.deployment_key, &report.label).await?;
        self.repo.record_deploy(ReportDeploy {
            package_id: package.id,
            client_unique_id: report.client_unique_id.clone(),
            status: report.status,
            previous_label: report.previous_label.clone(),
            previous_deployment_key: report.previous_deployment_key.clone(),
        }).await
    }
}
