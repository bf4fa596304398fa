use serde::{Serialize, Deserialize};
use utoipa::ToSchema;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct App {
	pub id: Uuid,
	pub owner: String,
	pub name: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct Deployment {
	pub id: Uuid,
	pub app_id: Uuid,
	pub name: String,
	pub deployment_key: String,
	pub label_counter: i64,
	pub current_package_id: Option<Uuid>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// How a package entered its deployment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
pub enum ReleaseMethod { Upload, Promote, Rollback }

impl ReleaseMethod {
	pub fn as_str(&self) -> &'static str {
		match self { Self::Upload => "Upload", Self::Promote => "Promote", Self::Rollback => "Rollback" }
	}
}

impl fmt::Display for ReleaseMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl std::str::FromStr for ReleaseMethod {
	type Err = String;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"Upload" => Ok(Self::Upload),
			"Promote" => Ok(Self::Promote),
			"Rollback" => Ok(Self::Rollback),
			other => Err(format!("unknown release method '{other}'")),
		}
	}
}

/// One immutable point in a deployment's release history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct Package {
	pub id: Uuid,
	pub deployment_id: Uuid,
	pub label: String,
	pub label_seq: i64,
	pub description: String,
	pub package_hash: String,
	pub blob_url: String,
	pub size: i64,
	pub release_method: ReleaseMethod,
	pub original_label: Option<String>,
	pub original_deployment: Option<String>,
	pub is_mandatory: bool,
	pub is_disabled: bool,
	pub rollout: i16,
	pub released_by: String,
	pub created_at: DateTime<Utc>,
}

/// Package fields decided by the caller; label and ids are assigned by the repository
/// inside the deployment's critical section.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPackage {
	pub description: String,
	pub package_hash: String,
	pub blob_url: String,
	pub size: i64,
	pub release_method: ReleaseMethod,
	pub original_label: Option<String>,
	pub original_deployment: Option<String>,
	pub is_mandatory: bool,
	pub is_disabled: bool,
	pub rollout: i16,
	pub released_by: String,
}

impl NewPackage {
	/// Copy of an existing package's content and flags, re-attributed to `released_by`.
	pub fn cloned_from(source: &Package, method: ReleaseMethod, released_by: &str) -> Self {
		Self {
			description: source.description.clone(),
			package_hash: source.package_hash.clone(),
			blob_url: source.blob_url.clone(),
			size: source.size,
			release_method: method,
			original_label: Some(source.label.clone()),
			original_deployment: None,
			is_mandatory: source.is_mandatory,
			is_disabled: source.is_disabled,
			rollout: source.rollout,
			released_by: released_by.to_string(),
		}
	}
}

pub fn label_for(seq: i64) -> String { format!("v{seq}") }

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct PackageDiff {
	pub id: Uuid,
	pub package_id: Uuid,
	pub diff_against_package_hash: String,
	pub diff_blob_url: String,
	pub diff_size: i64,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPackageDiff {
	pub package_id: Uuid,
	pub diff_against_package_hash: String,
	pub diff_blob_url: String,
	pub diff_size: i64,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct DeploymentHistory {
	pub id: i64,
	pub deployment_id: Uuid,
	pub package_id: Uuid,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportDownload {
	pub package_id: Uuid,
	pub client_unique_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportDeploy {
	pub package_id: Uuid,
	pub client_unique_id: String,
	pub status: i16,
	pub previous_label: Option<String>,
	pub previous_deployment_key: Option<String>,
}
