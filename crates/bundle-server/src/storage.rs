use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use crate::config::{StorageConfig, StorageMode};

/// Blob sink for bundles and diff artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Move or upload the file at `local_path` under `key`; returns the retrieval URL.
    async fn put(&self, local_path: &Path, key: &str) -> anyhow::Result<String>;
    /// Retrieval URL for `key`. Pure, performs no I/O.
    fn url_for(&self, key: &str) -> String;
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
    /// Inverse of `url_for` for URLs this store issued.
    fn key_for_url(&self, url: &str) -> Option<String> {
        let prefix = self.url_for("");
        url.strip_prefix(prefix.as_str()).filter(|k| !k.is_empty()).map(str::to_string)
    }
}

/// Blobs kept in a directory and served back under `download_url`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore { pub root: PathBuf, pub download_url: String }

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, download_url: impl Into<String>) -> Self {
        Self { root: root.into(), download_url: download_url.into() }
    }

    /// Keys are relative paths made of plain components only; `a..b.zip` is fine, `../b` is not.
    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(key);
        let plain = !key.is_empty() && !key.contains('\\') && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            anyhow::bail!("invalid blob key '{key}'");
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, local_path: &Path, key: &str) -> anyhow::Result<String> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() { tokio::fs::create_dir_all(parent).await?; }
        // rename fails across filesystems; fall back to copy + remove
        if tokio::fs::rename(local_path, &dest).await.is_err() {
            tokio::fs::copy(local_path, &dest).await?;
            tokio::fs::remove_file(local_path).await.ok();
        }
        Ok(self.url_for(key))
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.download_url.trim_end_matches('/'), key)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::read(&path).await?)
    }
}

#[cfg(feature="s3")]
#[derive(Clone)]
pub struct S3BlobStore { client: aws_sdk_s3::Client, bucket: String, region: String, download_url: Option<String> }

#[cfg(feature="s3")]
impl std::fmt::Debug for S3BlobStore { fn fmt(&self, f:&mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("S3BlobStore").field("bucket", &self.bucket).finish() } }

#[cfg(feature="s3")]
impl S3BlobStore {
    pub async fn from_config(cfg: &StorageConfig) -> Self {
        use aws_config::BehaviorVersion;
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(cfg.s3_region.clone()))
            .load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(ep) = &cfg.s3_endpoint_url {
            // MinIO and friends want path-style addressing
            builder = builder.endpoint_url(ep).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Self { client, bucket: cfg.s3_bucket.clone(), region: cfg.s3_region.clone(), download_url: cfg.s3_download_url.clone() }
    }
}

#[cfg(feature="s3")]
#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, local_path: &Path, key: &str) -> anyhow::Result<String> {
        use aws_sdk_s3::primitives::ByteStream;
        let body = ByteStream::from_path(local_path).await?;
        if let Err(e) = self.client.put_object().bucket(&self.bucket).key(key).body(body).send().await {
            tracing::warn!(?e, key, "s3_put_object_failed");
            return Err(e.into());
        }
        tokio::fs::remove_file(local_path).await.ok();
        Ok(self.url_for(key))
    }

    fn url_for(&self, key: &str) -> String {
        match &self.download_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let obj = self.client.get_object().bucket(&self.bucket).key(key).send().await?;
        let data = obj.body.collect().await?;
        Ok(data.into_bytes().to_vec())
    }
}

/// Backend chosen once at startup and shared by the engine and the diff workers.
#[derive(Clone)]
pub struct StorageManager { inner: Arc<dyn BlobStore> }

impl std::fmt::Debug for StorageManager { fn fmt(&self, f:&mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("StorageManager").finish() } }

impl StorageManager {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self { Self { inner } }

    pub async fn from_config(cfg: &StorageConfig) -> anyhow::Result<Self> {
        match cfg.mode {
            StorageMode::S3 => Self::s3(cfg).await,
            StorageMode::Local => {
                tokio::fs::create_dir_all(&cfg.local_dir).await?;
                info!(dir=?cfg.local_dir, download_url=%cfg.download_url, "storage_manager.init_local");
                Ok(Self::new(Arc::new(LocalBlobStore::new(cfg.local_dir.clone(), cfg.download_url.clone()))))
            }
        }
    }

    #[cfg(feature="s3")]
    async fn s3(cfg: &StorageConfig) -> anyhow::Result<Self> {
        info!(bucket=%cfg.s3_bucket, "storage_manager.init_s3");
        Ok(Self::new(Arc::new(S3BlobStore::from_config(cfg).await)))
    }

    #[cfg(not(feature="s3"))]
    async fn s3(_cfg: &StorageConfig) -> anyhow::Result<Self> {
        anyhow::bail!("storage mode s3 requires the `s3` cargo feature")
    }

    pub fn backend(&self) -> &dyn BlobStore { self.inner.as_ref() }
}
