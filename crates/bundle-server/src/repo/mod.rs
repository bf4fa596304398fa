//! Persistence contract for apps, deployments and the package lineage.
//!
//! `append_package` is the only write that touches a deployment's counter and current
//! pointer; implementations must run it as one atomic step per deployment.
use async_trait::async_trait;
use uuid::Uuid;
use crate::error::ReleaseResult;
use crate::models::{App, Deployment, DeploymentHistory, NewPackage, NewPackageDiff, Package, PackageDiff, ReportDeploy, ReportDownload};

pub mod memory;
pub mod postgres;

pub use memory::MemoryReleaseRepository;
pub use postgres::PgReleaseRepository;

#[async_trait]
pub trait ReleaseRepository: Send + Sync + 'static {
    async fn ping(&self) -> ReleaseResult<()>;

    /// Fails with `Conflict` when `owner` already has a live app called `name`.
    async fn create_app(&self, owner: &str, name: &str) -> ReleaseResult<App>;
    async fn find_app(&self, owner: &str, name: &str) -> ReleaseResult<Option<App>>;
    async fn list_apps(&self, owner: &str) -> ReleaseResult<Vec<App>>;
    async fn rename_app(&self, app_id: Uuid, new_name: &str) -> ReleaseResult<App>;
    async fn delete_app(&self, app_id: Uuid) -> ReleaseResult<()>;

    /// Fails with `Conflict` when the app already has a live deployment called `name`.
    async fn create_deployment(&self, app_id: Uuid, name: &str, deployment_key: &str) -> ReleaseResult<Deployment>;
    async fn find_deployment(&self, app_id: Uuid, name: &str) -> ReleaseResult<Option<Deployment>>;
    async fn find_deployment_by_key(&self, deployment_key: &str) -> ReleaseResult<Option<Deployment>>;
    async fn get_deployment(&self, id: Uuid) -> ReleaseResult<Option<Deployment>>;
    async fn list_deployments(&self, app_id: Uuid) -> ReleaseResult<Vec<Deployment>>;
    async fn delete_deployment(&self, id: Uuid) -> ReleaseResult<()>;

    async fn get_package(&self, id: Uuid) -> ReleaseResult<Option<Package>>;
    async fn find_package_by_label(&self, deployment_id: Uuid, label: &str) -> ReleaseResult<Option<Package>>;
    /// Newest first. With `before_seq`, only packages whose `label_seq` is lower.
    async fn list_packages(&self, deployment_id: Uuid, before_seq: Option<i64>, limit: i64) -> ReleaseResult<Vec<Package>>;
    /// Newest first.
    async fn recent_history(&self, deployment_id: Uuid, limit: i64) -> ReleaseResult<Vec<DeploymentHistory>>;

    /// Assign the next label, insert the package, advance `label_counter`, point
    /// `current_package_id` at it and append a history row, all or nothing.
    async fn append_package(&self, deployment_id: Uuid, new: NewPackage) -> ReleaseResult<Package>;

    /// Clone an earlier package of the deployment as its next release, choosing the
    /// target under the same lock as the append. With `target_label`, that package
    /// (`NotFound` if absent); without, the one behind the newest history row
    /// (`InvalidState` with fewer than two rows).
    async fn append_rollback(&self, deployment_id: Uuid, target_label: Option<&str>, released_by: &str) -> ReleaseResult<Package>;

    async fn find_package_diff(&self, package_id: Uuid, against_hash: &str) -> ReleaseResult<Option<PackageDiff>>;
    /// Insert, or overwrite the row for the same `(package_id, diff_against_package_hash)`.
    async fn upsert_package_diff(&self, diff: NewPackageDiff) -> ReleaseResult<PackageDiff>;
    async fn list_package_diffs(&self, package_id: Uuid) -> ReleaseResult<Vec<PackageDiff>>;

    async fn record_download(&self, report: ReportDownload) -> ReleaseResult<()>;
    async fn record_deploy(&self, report: ReportDeploy) -> ReleaseResult<()>;
}
