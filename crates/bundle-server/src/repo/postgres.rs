use async_trait::async_trait;
use sqlx::{Pool, Postgres, Transaction};
use uuid::Uuid;
use crate::error::{ReleaseError, ReleaseResult};
use crate::models::{label_for, App, Deployment, DeploymentHistory, NewPackage, NewPackageDiff, Package, PackageDiff, ReleaseMethod, ReportDeploy, ReportDownload};
use super::ReleaseRepository;

const APP_COLS: &str = "id, owner, name, created_at, updated_at";
const DEPLOYMENT_COLS: &str = "d.id, d.app_id, d.name, d.deployment_key, d.label_counter, d.current_package_id, d.created_at, d.updated_at";
const PACKAGE_COLS: &str = "id, deployment_id, label, label_seq, description, package_hash, blob_url, size, release_method, original_label, original_deployment, is_mandatory, is_disabled, rollout, released_by, created_at";
const DIFF_COLS: &str = "id, package_id, diff_against_package_hash, diff_blob_url, diff_size, created_at";
// deployments are only visible while both they and their app are live
const LIVE_DEPLOYMENTS: &str = "deployments d JOIN apps a ON a.id = d.app_id WHERE d.deleted_at IS NULL AND a.deleted_at IS NULL";

#[derive(sqlx::FromRow)]
struct PackageRow {
    id: Uuid,
    deployment_id: Uuid,
    label: String,
    label_seq: i64,
    description: String,
    package_hash: String,
    blob_url: String,
    size: i64,
    release_method: String,
    original_label: Option<String>,
    original_deployment: Option<String>,
    is_mandatory: bool,
    is_disabled: bool,
    rollout: i16,
    released_by: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<PackageRow> for Package {
    type Error = ReleaseError;
    fn try_from(r: PackageRow) -> Result<Self, Self::Error> {
        let release_method: ReleaseMethod = r.release_method.parse().map_err(ReleaseError::invalid_state)?;
        Ok(Package {
            id: r.id,
            deployment_id: r.deployment_id,
            label: r.label,
            label_seq: r.label_seq,
            description: r.description,
            package_hash: r.package_hash,
            blob_url: r.blob_url,
            size: r.size,
            release_method,
            original_label: r.original_label,
            original_deployment: r.original_deployment,
            is_mandatory: r.is_mandatory,
            is_disabled: r.is_disabled,
            rollout: r.rollout,
            released_by: r.released_by,
            created_at: r.created_at,
        })
    }
}

fn packages(rows: Vec<PackageRow>) -> ReleaseResult<Vec<Package>> {
    rows.into_iter().map(Package::try_from).collect()
}

/// Unique violations surface as `Conflict`; everything else stays a database error.
fn map_unique(err: sqlx::Error, msg: &str) -> ReleaseError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") { return ReleaseError::conflict(msg); }
    }
    ReleaseError::Database(err)
}

/// Row-lock the live deployment and return its label counter. The lock serializes
/// lineage writes across server instances until the transaction ends.
async fn lock_counter(tx: &mut Transaction<'_, Postgres>, deployment_id: Uuid) -> ReleaseResult<i64> {
    let counter: Option<i64> = sqlx::query_scalar(
        "SELECT d.label_counter FROM deployments d JOIN apps a ON a.id = d.app_id \
         WHERE d.id=$1 AND d.deleted_at IS NULL AND a.deleted_at IS NULL FOR UPDATE OF d")
        .bind(deployment_id)
        .fetch_optional(&mut **tx).await?;
    counter.ok_or_else(|| ReleaseError::not_found("deployment"))
}

/// Insert the package as `seq`, advance the counter and current pointer, append history.
async fn insert_package(tx: &mut Transaction<'_, Postgres>, deployment_id: Uuid, seq: i64, new: &NewPackage) -> ReleaseResult<PackageRow> {
    let row = sqlx::query_as::<_, PackageRow>(&format!(
        "INSERT INTO packages (id, deployment_id, label, label_seq, description, package_hash, blob_url, size, release_method, \
         original_label, original_deployment, is_mandatory, is_disabled, rollout, released_by) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15) RETURNING {PACKAGE_COLS}"))
        .bind(Uuid::new_v4())
        .bind(deployment_id)
        .bind(label_for(seq))
        .bind(seq)
        .bind(&new.description)
        .bind(&new.package_hash)
        .bind(&new.blob_url)
        .bind(new.size)
        .bind(new.release_method.as_str())
        .bind(&new.original_label)
        .bind(&new.original_deployment)
        .bind(new.is_mandatory)
        .bind(new.is_disabled)
        .bind(new.rollout)
        .bind(&new.released_by)
        .fetch_one(&mut **tx).await?;
    sqlx::query("UPDATE deployments SET label_counter=$2, current_package_id=$3, updated_at=now() WHERE id=$1")
        .bind(deployment_id).bind(seq).bind(row.id)
        .execute(&mut **tx).await?;
    sqlx::query("INSERT INTO deployment_history (deployment_id, package_id) VALUES ($1,$2)")
        .bind(deployment_id).bind(row.id)
        .execute(&mut **tx).await?;
    Ok(row)
}

#[derive(Clone)]
pub struct PgReleaseRepository { pool: Pool<Postgres> }

impl PgReleaseRepository {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    pub fn pool(&self) -> &Pool<Postgres> { &self.pool }
}

#[async_trait]
impl ReleaseRepository for PgReleaseRepository {
    async fn ping(&self) -> ReleaseResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_app(&self, owner: &str, name: &str) -> ReleaseResult<App> {
        sqlx::query_as::<_, App>(&format!("INSERT INTO apps (id, owner, name) VALUES ($1,$2,$3) RETURNING {APP_COLS}"))
            .bind(Uuid::new_v4())
            .bind(owner)
            .bind(name)
            .fetch_one(&self.pool).await
            .map_err(|e| map_unique(e, &format!("{name} exists")))
    }

    async fn find_app(&self, owner: &str, name: &str) -> ReleaseResult<Option<App>> {
        Ok(sqlx::query_as::<_, App>(&format!("SELECT {APP_COLS} FROM apps WHERE owner=$1 AND name=$2 AND deleted_at IS NULL"))
            .bind(owner).bind(name)
            .fetch_optional(&self.pool).await?)
    }

    async fn list_apps(&self, owner: &str) -> ReleaseResult<Vec<App>> {
        Ok(sqlx::query_as::<_, App>(&format!("SELECT {APP_COLS} FROM apps WHERE owner=$1 AND deleted_at IS NULL ORDER BY name"))
            .bind(owner)
            .fetch_all(&self.pool).await?)
    }

    async fn rename_app(&self, app_id: Uuid, new_name: &str) -> ReleaseResult<App> {
        sqlx::query_as::<_, App>(&format!("UPDATE apps SET name=$2, updated_at=now() WHERE id=$1 AND deleted_at IS NULL RETURNING {APP_COLS}"))
            .bind(app_id).bind(new_name)
            .fetch_optional(&self.pool).await
            .map_err(|e| map_unique(e, &format!("{new_name} exists")))?
            .ok_or_else(|| ReleaseError::not_found("app"))
    }

    async fn delete_app(&self, app_id: Uuid) -> ReleaseResult<()> {
        let res = sqlx::query("UPDATE apps SET deleted_at=now() WHERE id=$1 AND deleted_at IS NULL")
            .bind(app_id)
            .execute(&self.pool).await?;
        if res.rows_affected() == 0 { return Err(ReleaseError::not_found("app")); }
        Ok(())
    }

    async fn create_deployment(&self, app_id: Uuid, name: &str, deployment_key: &str) -> ReleaseResult<Deployment> {
        sqlx::query_as::<_, Deployment>(
            "INSERT INTO deployments (id, app_id, name, deployment_key) VALUES ($1,$2,$3,$4) \
             RETURNING id, app_id, name, deployment_key, label_counter, current_package_id, created_at, updated_at")
            .bind(Uuid::new_v4())
            .bind(app_id)
            .bind(name)
            .bind(deployment_key)
            .fetch_one(&self.pool).await
            .map_err(|e| map_unique(e, "deployment already exists"))
    }

    async fn find_deployment(&self, app_id: Uuid, name: &str) -> ReleaseResult<Option<Deployment>> {
        Ok(sqlx::query_as::<_, Deployment>(&format!("SELECT {DEPLOYMENT_COLS} FROM {LIVE_DEPLOYMENTS} AND d.app_id=$1 AND d.name=$2"))
            .bind(app_id).bind(name)
            .fetch_optional(&self.pool).await?)
    }

    async fn find_deployment_by_key(&self, deployment_key: &str) -> ReleaseResult<Option<Deployment>> {
        Ok(sqlx::query_as::<_, Deployment>(&format!("SELECT {DEPLOYMENT_COLS} FROM {LIVE_DEPLOYMENTS} AND d.deployment_key=$1"))
            .bind(deployment_key)
            .fetch_optional(&self.pool).await?)
    }

    async fn get_deployment(&self, id: Uuid) -> ReleaseResult<Option<Deployment>> {
        Ok(sqlx::query_as::<_, Deployment>(&format!("SELECT {DEPLOYMENT_COLS} FROM {LIVE_DEPLOYMENTS} AND d.id=$1"))
            .bind(id)
            .fetch_optional(&self.pool).await?)
    }

    async fn list_deployments(&self, app_id: Uuid) -> ReleaseResult<Vec<Deployment>> {
        Ok(sqlx::query_as::<_, Deployment>(&format!("SELECT {DEPLOYMENT_COLS} FROM {LIVE_DEPLOYMENTS} AND d.app_id=$1 ORDER BY d.created_at, d.name"))
            .bind(app_id)
            .fetch_all(&self.pool).await?)
    }

    async fn delete_deployment(&self, id: Uuid) -> ReleaseResult<()> {
        let res = sqlx::query("UPDATE deployments SET deleted_at=now() WHERE id=$1 AND deleted_at IS NULL")
            .bind(id)
            .execute(&self.pool).await?;
        if res.rows_affected() == 0 { return Err(ReleaseError::not_found("deployment")); }
        Ok(())
    }

    async fn get_package(&self, id: Uuid) -> ReleaseResult<Option<Package>> {
        sqlx::query_as::<_, PackageRow>(&format!("SELECT {PACKAGE_COLS} FROM packages WHERE id=$1"))
            .bind(id)
            .fetch_optional(&self.pool).await?
            .map(Package::try_from)
            .transpose()
    }

    async fn find_package_by_label(&self, deployment_id: Uuid, label: &str) -> ReleaseResult<Option<Package>> {
        sqlx::query_as::<_, PackageRow>(&format!("SELECT {PACKAGE_COLS} FROM packages WHERE deployment_id=$1 AND label=$2"))
            .bind(deployment_id).bind(label)
            .fetch_optional(&self.pool).await?
            .map(Package::try_from)
            .transpose()
    }

    async fn list_packages(&self, deployment_id: Uuid, before_seq: Option<i64>, limit: i64) -> ReleaseResult<Vec<Package>> {
        let rows = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLS} FROM packages WHERE deployment_id=$1 AND ($2::BIGINT IS NULL OR label_seq < $2) \
             ORDER BY label_seq DESC LIMIT $3"))
            .bind(deployment_id)
            .bind(before_seq)
            .bind(limit)
            .fetch_all(&self.pool).await?;
        packages(rows)
    }

    async fn recent_history(&self, deployment_id: Uuid, limit: i64) -> ReleaseResult<Vec<DeploymentHistory>> {
        Ok(sqlx::query_as::<_, DeploymentHistory>(
            "SELECT id, deployment_id, package_id, created_at FROM deployment_history WHERE deployment_id=$1 ORDER BY id DESC LIMIT $2")
            .bind(deployment_id).bind(limit)
            .fetch_all(&self.pool).await?)
    }

    async fn append_package(&self, deployment_id: Uuid, new: NewPackage) -> ReleaseResult<Package> {
        let mut tx = self.pool.begin().await?;
        let seq = lock_counter(&mut tx, deployment_id).await? + 1;
        let row = insert_package(&mut tx, deployment_id, seq, &new).await?;
        tx.commit().await?;
        Package::try_from(row)
    }

    async fn append_rollback(&self, deployment_id: Uuid, target_label: Option<&str>, released_by: &str) -> ReleaseResult<Package> {
        let mut tx = self.pool.begin().await?;
        let seq = lock_counter(&mut tx, deployment_id).await? + 1;
        let target = match target_label {
            Some(label) => sqlx::query_as::<_, PackageRow>(&format!("SELECT {PACKAGE_COLS} FROM packages WHERE deployment_id=$1 AND label=$2"))
                .bind(deployment_id).bind(label)
                .fetch_optional(&mut *tx).await?
                .ok_or_else(|| ReleaseError::not_found(format!("package {label}")))?,
            None => sqlx::query_as::<_, PackageRow>(&format!(
                "SELECT {PACKAGE_COLS} FROM packages WHERE id = \
                 (SELECT package_id FROM deployment_history WHERE deployment_id=$1 ORDER BY id DESC LIMIT 1 OFFSET 1)"))
                .bind(deployment_id)
                .fetch_optional(&mut *tx).await?
                .ok_or_else(|| ReleaseError::invalid_state("no previous release to roll back to"))?,
        };
        let target = Package::try_from(target)?;
        let new = NewPackage::cloned_from(&target, ReleaseMethod::Rollback, released_by);
        let row = insert_package(&mut tx, deployment_id, seq, &new).await?;
        tx.commit().await?;
        Package::try_from(row)
    }

    async fn find_package_diff(&self, package_id: Uuid, against_hash: &str) -> ReleaseResult<Option<PackageDiff>> {
        Ok(sqlx::query_as::<_, PackageDiff>(&format!("SELECT {DIFF_COLS} FROM package_diffs WHERE package_id=$1 AND diff_against_package_hash=$2"))
            .bind(package_id).bind(against_hash)
            .fetch_optional(&self.pool).await?)
    }

    async fn upsert_package_diff(&self, diff: NewPackageDiff) -> ReleaseResult<PackageDiff> {
        Ok(sqlx::query_as::<_, PackageDiff>(&format!(
            "INSERT INTO package_diffs (id, package_id, diff_against_package_hash, diff_blob_url, diff_size) VALUES ($1,$2,$3,$4,$5) \
             ON CONFLICT (package_id, diff_against_package_hash) DO UPDATE SET diff_blob_url=EXCLUDED.diff_blob_url, diff_size=EXCLUDED.diff_size \
             RETURNING {DIFF_COLS}"))
            .bind(Uuid::new_v4())
            .bind(diff.package_id)
            .bind(&diff.diff_against_package_hash)
            .bind(&diff.diff_blob_url)
            .bind(diff.diff_size)
            .fetch_one(&self.pool).await?)
    }

    async fn list_package_diffs(&self, package_id: Uuid) -> ReleaseResult<Vec<PackageDiff>> {
        Ok(sqlx::query_as::<_, PackageDiff>(&format!("SELECT {DIFF_COLS} FROM package_diffs WHERE package_id=$1 ORDER BY created_at"))
            .bind(package_id)
            .fetch_all(&self.pool).await?)
    }

    async fn record_download(&self, report: ReportDownload) -> ReleaseResult<()> {
        sqlx::query("INSERT INTO log_report_download (package_id, client_unique_id) VALUES ($1,$2)")
            .bind(report.package_id).bind(&report.client_unique_id)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn record_deploy(&self, report: ReportDeploy) -> ReleaseResult<()> {
        sqlx::query("INSERT INTO log_report_deploy (package_id, client_unique_id, status, previous_label, previous_deployment_key) VALUES ($1,$2,$3,$4,$5)")
            .bind(report.package_id)
            .bind(&report.client_unique_id)
            .bind(report.status)
            .bind(&report.previous_label)
            .bind(&report.previous_deployment_key)
            .execute(&self.pool).await?;
        Ok(())
    }
}
