//! Process configuration, resolved once at startup and handed to each component.
//!
//! Sources, later wins: built-in defaults, an optional TOML file, `BUNDLE_*` environment variables.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::{Path, PathBuf}};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode { #[default] Local, S3 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat { #[default] Compact, Json }

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    /// Directory holding blobs for the local backend.
    pub local_dir: PathBuf,
    /// Public prefix under which local blobs are downloadable.
    pub download_url: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_endpoint_url: Option<String>,
    pub s3_download_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            local_dir: PathBuf::from("/tmp/bundle-server/blobs"),
            download_url: "http://127.0.0.1:3000/download".into(),
            s3_bucket: "bundles".into(),
            s3_region: "us-east-1".into(),
            s3_endpoint_url: None,
            s3_download_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Number of prior packages a new release is diffed against.
    pub window: usize,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DiffConfig {
    fn default() -> Self { Self { window: 3, workers: 2, queue_capacity: 64 } }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub temp_dir: PathBuf,
    pub max_bundle_bytes: usize,
    /// `token:subject` pairs; empty disables publisher auth.
    pub api_tokens: Vec<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub storage: StorageConfig,
    pub diff: DiffConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            database_url: None,
            db_max_connections: 5,
            temp_dir: std::env::temp_dir(),
            max_bundle_bytes: 200 * 1024 * 1024,
            api_tokens: Vec::new(),
            log_level: "info".into(),
            log_format: LogFormat::Compact,
            storage: StorageConfig::default(),
            diff: DiffConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `path` (if given and present) then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            Some(p) => { debug!(path=?p, "config.file_missing"); Self::default() }
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("read config {path:?}"))?;
        let cfg: Self = toml::from_str(&content).with_context(|| format!("parse config {path:?}"))?;
        debug!(path=?path, "config.parse.success");
        Ok(cfg)
    }

    /// Apply `BUNDLE_*` style overrides through `lookup`, so tests need not touch the real environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where F: Fn(&str) -> Option<String> {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("BUNDLE_HOST") { self.host = v; }
        if let Some(v) = get("BUNDLE_PORT") { self.port = v.parse().with_context(|| format!("BUNDLE_PORT={v}"))?; }
        if let Some(v) = get("DATABASE_URL") { self.database_url = Some(v); }
        if let Some(v) = get("BUNDLE_DB_MAX_CONNECTIONS") { self.db_max_connections = v.parse().with_context(|| format!("BUNDLE_DB_MAX_CONNECTIONS={v}"))?; }
        if let Some(v) = get("BUNDLE_TEMP_DIR") { self.temp_dir = PathBuf::from(v); }
        if let Some(v) = get("BUNDLE_MAX_BUNDLE_BYTES") { self.max_bundle_bytes = v.parse().with_context(|| format!("BUNDLE_MAX_BUNDLE_BYTES={v}"))?; }
        if let Some(v) = get("BUNDLE_API_TOKENS") {
            self.api_tokens = v.split(',').map(str::trim).filter(|t| !t.is_empty()).map(String::from).collect();
        }
        if let Some(v) = get("BUNDLE_LOG_LEVEL") { self.log_level = v; }
        if let Some(v) = get("BUNDLE_LOG_FORMAT") {
            self.log_format = if v.eq_ignore_ascii_case("json") { LogFormat::Json } else { LogFormat::Compact };
        }
        if let Some(v) = get("BUNDLE_DIFF_WINDOW") { self.diff.window = v.parse().with_context(|| format!("BUNDLE_DIFF_WINDOW={v}"))?; }
        if let Some(v) = get("BUNDLE_DIFF_WORKERS") { self.diff.workers = v.parse().with_context(|| format!("BUNDLE_DIFF_WORKERS={v}"))?; }
        if let Some(v) = get("BUNDLE_DIFF_QUEUE_CAPACITY") { self.diff.queue_capacity = v.parse().with_context(|| format!("BUNDLE_DIFF_QUEUE_CAPACITY={v}"))?; }
        if let Some(v) = get("BUNDLE_STORAGE_MODE") {
            self.storage.mode = match v.to_ascii_lowercase().as_str() {
                "s3" => StorageMode::S3,
                "local" => StorageMode::Local,
                other => anyhow::bail!("unknown BUNDLE_STORAGE_MODE '{other}'"),
            };
        }
        if let Some(v) = get("BUNDLE_LOCAL_STORAGE_DIR") { self.storage.local_dir = PathBuf::from(v); }
        if let Some(v) = get("BUNDLE_DOWNLOAD_URL") { self.storage.download_url = v; }
        if let Some(v) = get("BUNDLE_S3_BUCKET") { self.storage.s3_bucket = v; }
        if let Some(v) = get("AWS_REGION") { self.storage.s3_region = v; }
        if let Some(v) = get("BUNDLE_S3_ENDPOINT_URL") { self.storage.s3_endpoint_url = Some(v); }
        if let Some(v) = get("BUNDLE_S3_DOWNLOAD_URL") { self.storage.s3_download_url = Some(v); }
        self.diff.workers = self.diff.workers.max(1);
        self.diff.queue_capacity = self.diff.queue_capacity.max(1);
        Ok(())
    }

    pub fn listen_addr(&self) -> String { format!("{}:{}", self.host, self.port) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.diff.window, 3);
        assert_eq!(cfg.storage.mode, StorageMode::Local);
        assert!(cfg.database_url.is_none());
        assert!(cfg.api_tokens.is_empty());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env(lookup(&[
            ("BUNDLE_PORT", "8080"),
            ("BUNDLE_DIFF_WINDOW", "5"),
            ("BUNDLE_STORAGE_MODE", "S3"),
            ("BUNDLE_API_TOKENS", "t1:alice, t2:bob ,"),
            ("BUNDLE_LOG_FORMAT", "json"),
            ("DATABASE_URL", "postgres://x/y"),
        ])).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.diff.window, 5);
        assert_eq!(cfg.storage.mode, StorageMode::S3);
        assert_eq!(cfg.api_tokens, vec!["t1:alice".to_string(), "t2:bob".to_string()]);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://x/y"));
    }

    #[test]
    fn empty_values_are_ignored_and_bad_numbers_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env(lookup(&[("BUNDLE_PORT", " ")])).unwrap();
        assert_eq!(cfg.port, 3000);
        assert!(cfg.apply_env(lookup(&[("BUNDLE_PORT", "eighty")])).is_err());
        assert!(cfg.apply_env(lookup(&[("BUNDLE_STORAGE_MODE", "ftp")])).is_err());
    }

    #[test]
    fn worker_counts_never_drop_to_zero() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env(lookup(&[("BUNDLE_DIFF_WORKERS", "0"), ("BUNDLE_DIFF_QUEUE_CAPACITY", "0")])).unwrap();
        assert_eq!(cfg.diff.workers, 1);
        assert_eq!(cfg.diff.queue_capacity, 1);
    }

    #[test]
    fn toml_file_is_parsed_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "port = 4000\n[storage]\nmode = \"local\"\nlocal_dir = \"/srv/blobs\"\n[diff]\nwindow = 7\n").unwrap();
        let cfg = ServerConfig::from_file(&path).unwrap();
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.storage.local_dir, PathBuf::from("/srv/blobs"));
        assert_eq!(cfg.diff.window, 7);
        assert_eq!(cfg.diff.workers, 2);
        assert_eq!(cfg.host, "0.0.0.0");
    }

    #[test]
    #[serial_test::serial]
    fn load_layers_process_env_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "port = 4000\n[diff]\nwindow = 7\n").unwrap();
        std::env::set_var("BUNDLE_DIFF_WINDOW", "9");
        let cfg = ServerConfig::load(Some(&path));
        std::env::remove_var("BUNDLE_DIFF_WINDOW");
        let cfg = cfg.unwrap();
        assert_eq!(cfg.diff.window, 9);
        // a missing file falls back to defaults
        let cfg = ServerConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg.diff.window, 3);
    }
}
