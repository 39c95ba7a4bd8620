//! Filesystem settings, loaded from TOML and validated before use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use ossfs_backend::S3Config;

/// Environment variable consulted when no endpoint is configured.
pub const ENDPOINT_ENV: &str = "OSS_ENDPOINT";

pub const DEFAULT_BLOCK_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const DEFAULT_POOL_SIZE: usize = 20;

/// Read-cache policy for handles opened for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Every read goes to the backend.
    None,
    /// Keep only the most recently fetched span.
    Bytes,
    /// Fetch a block beyond each read and keep the span.
    #[default]
    Readahead,
    /// Fetch the whole object on first read.
    All,
}

impl std::str::FromStr for CacheType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CacheType::None),
            "bytes" => Ok(CacheType::Bytes),
            "readahead" => Ok(CacheType::Readahead),
            "all" => Ok(CacheType::All),
            other => anyhow::bail!("unknown cache type: {}", other),
        }
    }
}

/// How write handles ship their buffered blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    /// Append-at-offset; falls back to multipart when the backend lacks it.
    #[default]
    Append,
    Multipart,
}

#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub security_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("security_token", &self.security_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn is_anonymous(&self) -> bool {
        self.access_key_id.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub credentials: Credentials,
    pub default_cache_type: CacheType,
    pub default_block_size: usize,
    pub upload_strategy: UploadStrategy,
    pub multipart_threshold: u64,
    pub pool_size: usize,
    pub connect_timeout_secs: Option<u64>,
    pub retry_attempts: u32,
    pub max_concurrent_batches: usize,
    /// Where cross-container copies stage their temp files. Defaults to the
    /// system temp directory.
    pub staging_dir: Option<PathBuf>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            credentials: Credentials::default(),
            default_cache_type: CacheType::default(),
            default_block_size: DEFAULT_BLOCK_SIZE,
            upload_strategy: UploadStrategy::default(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout_secs: None,
            retry_attempts: 3,
            max_concurrent_batches: 4,
            staging_dir: None,
        }
    }
}

impl FsConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(endpoint) = &self.endpoint {
            if endpoint.trim().is_empty() {
                anyhow::bail!("endpoint must not be empty when set");
            }
        }
        if self.region.is_empty() {
            anyhow::bail!("region must not be empty");
        }
        let creds = &self.credentials;
        if creds.access_key_id.is_some() != creds.secret_access_key.is_some() {
            anyhow::bail!("access_key_id and secret_access_key must be given together");
        }
        if creds.security_token.is_some() && creds.access_key_id.is_none() {
            anyhow::bail!("security_token requires access_key_id and secret_access_key");
        }
        if self.default_block_size == 0 {
            anyhow::bail!("default_block_size must be positive");
        }
        if self.multipart_threshold == 0 {
            anyhow::bail!("multipart_threshold must be positive");
        }
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be at least 1");
        }
        if self.max_concurrent_batches == 0 {
            anyhow::bail!("max_concurrent_batches must be at least 1");
        }
        Ok(())
    }

    /// Fill a missing endpoint from [`ENDPOINT_ENV`].
    pub fn resolve_endpoint(&mut self) {
        self.apply_endpoint_fallback(std::env::var(ENDPOINT_ENV).ok());
    }

    fn apply_endpoint_fallback(&mut self, from_env: Option<String>) {
        if self.endpoint.is_none() {
            self.endpoint = from_env.filter(|e| !e.trim().is_empty());
        }
        if self.endpoint.is_none() {
            tracing::warn!(
                "OSS endpoint is not set; most operations will fail until set_endpoint is called"
            );
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    /// Settings for the HTTP backend.
    pub fn s3_config(&self) -> S3Config {
        S3Config {
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            access_key_id: self.credentials.access_key_id.clone(),
            secret_access_key: self.credentials.secret_access_key.clone(),
            security_token: self.credentials.security_token.clone(),
            connect_timeout: self.connect_timeout(),
        }
    }
}
