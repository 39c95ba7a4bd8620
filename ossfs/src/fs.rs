//! The async filesystem handle and the stage every backend call passes through.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use ossfs_backend::S3Backend;
use ossfs_common::backend::{BackendError, ObjectBackend};
use ossfs_common::error::{self, FsError};
use ossfs_common::path;

use crate::config::FsConfig;
use crate::dircache::DirCache;

const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_MAX_MS: u64 = 2_000;

pub(crate) struct FsInner {
    pub(crate) backend: Arc<dyn ObjectBackend>,
    pub(crate) config: FsConfig,
    pub(crate) cache: DirCache,
    pool: Semaphore,
}

/// Filesystem view over an object store.
///
/// Cloning is cheap; clones share the backend, the connection pool, and the
/// directory cache.
#[derive(Clone)]
pub struct OssFileSystem {
    pub(crate) inner: Arc<FsInner>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for OssFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OssFileSystem")
            .field("config", &self.inner.config)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OssFileSystem {
    /// Build a filesystem over the S3-compatible HTTP backend.
    pub fn new(mut config: FsConfig) -> Result<Self, FsError> {
        config.resolve_endpoint();
        let backend = S3Backend::new(config.s3_config()).map_err(|e| error::translate(e, path::ROOT))?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Build a filesystem over any backend.
    pub fn with_backend(config: FsConfig, backend: Arc<dyn ObjectBackend>) -> Result<Self, FsError> {
        config
            .validate()
            .map_err(|e| FsError::InvalidArgument(e.to_string()))?;
        let timeout = config.connect_timeout();
        info!(
            pool_size = config.pool_size,
            block_size = config.default_block_size,
            anonymous = backend.is_anonymous(),
            "OSS filesystem ready"
        );
        Ok(Self {
            inner: Arc::new(FsInner {
                pool: Semaphore::new(config.pool_size),
                backend,
                config,
                cache: DirCache::new(),
            }),
            timeout,
        })
    }

    /// Load a TOML configuration file and connect.
    pub fn connect(config_path: &Path) -> anyhow::Result<Self> {
        let config = FsConfig::load(config_path)?;
        Ok(Self::new(config)?)
    }

    pub fn config(&self) -> &FsConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.inner.backend
    }

    pub fn dircache(&self) -> &DirCache {
        &self.inner.cache
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// A handle sharing this filesystem whose backend calls time out after
    /// `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            timeout: Some(timeout),
        }
    }

    pub fn set_endpoint(&self, endpoint: &str) -> Result<(), FsError> {
        if endpoint.trim().is_empty() {
            return Err(FsError::InvalidArgument("not a valid endpoint".into()));
        }
        self.inner.backend.set_endpoint(endpoint);
        self.inner.cache.clear();
        Ok(())
    }

    /// `None` drops every cached listing; a path drops itself, its
    /// ancestors, and its descendants.
    pub fn invalidate_cache(&self, target: Option<&str>) {
        match target {
            None => self.inner.cache.clear(),
            Some(p) => self.inner.cache.invalidate(p),
        }
    }

    /// Run one backend call: pool permit, optional timeout, bounded retries
    /// with backoff on transient failures, then error translation.
    ///
    /// `f` receives the zero-based attempt number so transfers can shrink
    /// their chunk on retry.
    pub(crate) async fn call<T, F, Fut>(&self, op: &'static str, target: &str, mut f: F) -> Result<T, FsError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempts = self.inner.config.retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            debug!(op, path = %target, attempt, "CALL");
            let result = {
                let _permit = self
                    .inner
                    .pool
                    .acquire()
                    .await
                    .map_err(|_| FsError::InvalidOperation("connection pool closed".into()))?;
                match self.timeout {
                    Some(limit) => match tokio::time::timeout(limit, f(attempt)).await {
                        Ok(r) => r,
                        Err(_) => Err(BackendError::Request(format!("{} timed out after {:?}", op, limit))),
                    },
                    None => f(attempt).await,
                }
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = backoff_delay(attempt);
                    debug!(op, path = %target, attempt, error = %err, ?delay, "Retryable error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    debug!(op, path = %target, attempts, error = %err, "Retries exhausted");
                    return Err(FsError::Io {
                        path: target.to_string(),
                        source: err,
                    });
                }
                Err(err) => {
                    debug!(op, path = %target, error = %err, "Nonretryable error");
                    return Err(error::translate(err, target));
                }
            }
        }
    }
}

/// A spawned transfer task that panicked or was cancelled.
pub(crate) fn join_error(err: tokio::task::JoinError) -> FsError {
    FsError::Local(std::io::Error::new(std::io::ErrorKind::Other, err))
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis((base + jitter).min(BACKOFF_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ossfs_backend::{MemoryBackend, Operation};
    use ossfs_common::error::ErrorKind;

    fn setup() -> (OssFileSystem, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new().with_bucket("b"));
        let fs = OssFileSystem::with_backend(FsConfig::default(), backend.clone()).unwrap();
        (fs, backend)
    }

    async fn head(fs: &OssFileSystem) -> Result<u64, FsError> {
        let backend = fs.backend();
        fs.call("head_object", "/b/k", |_| backend.head_object("b", "k"))
            .await
            .map(|m| m.size)
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (fs, backend) = setup();
        backend.put_object("b", "k", bytes::Bytes::from_static(b"abc")).await.unwrap();
        backend.fail_next(Operation::HeadObject, 2, BackendError::Request("reset".into()));
        assert_eq!(head(&fs).await.unwrap(), 3);
        assert_eq!(backend.calls(Operation::HeadObject), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_io() {
        let (fs, backend) = setup();
        backend.fail_next(Operation::HeadObject, 5, BackendError::service(503, "ServiceUnavailable", ""));
        let err = head(&fs).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GenericIo);
        assert_eq!(err.backend_source().and_then(|e| e.status()), Some(503));
        assert_eq!(backend.calls(Operation::HeadObject), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let (fs, backend) = setup();
        let err = head(&fs).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(backend.calls(Operation::HeadObject), 1);
    }

    #[tokio::test]
    async fn test_attempt_number_is_passed() {
        let (fs, backend) = setup();
        backend.fail_next(Operation::HeadObject, 1, BackendError::Request("reset".into()));
        let mut seen = Vec::new();
        let b = fs.backend();
        let _ = fs
            .call("head_object", "/b/k", |attempt| {
                seen.push(attempt);
                b.head_object("b", "k")
            })
            .await;
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_set_endpoint_rejects_empty() {
        let (fs, backend) = setup();
        assert_eq!(fs.set_endpoint("").unwrap_err().kind(), ErrorKind::InvalidArgument);
        fs.set_endpoint("oss-cn-shanghai.aliyuncs.com").unwrap();
        assert_eq!(backend.endpoint().as_deref(), Some("oss-cn-shanghai.aliyuncs.com"));
    }

    #[test]
    fn test_with_timeout_shares_state() {
        let (fs, _) = setup();
        assert!(fs.timeout().is_none());
        let limited = fs.with_timeout(Duration::from_secs(2));
        assert_eq!(limited.timeout(), Some(Duration::from_secs(2)));
        assert!(Arc::ptr_eq(&fs.inner, &limited.inner));
    }

    #[tokio::test]
    async fn test_timed_out_call_is_retried() {
        let (fs, backend) = setup();
        backend.put_object("b", "k", bytes::Bytes::from_static(b"abcd")).await.unwrap();
        backend.reset_calls();
        backend.delay_next(Operation::HeadObject, 1, Duration::from_secs(5));
        let limited = fs.with_timeout(Duration::from_millis(50));
        let started = std::time::Instant::now();
        assert_eq!(head(&limited).await.unwrap(), 4);
        assert!(started.elapsed() < Duration::from_secs(5));
        // The stalled attempt was abandoned before it reached the store.
        assert_eq!(backend.calls(Operation::HeadObject), 1);
    }

    #[tokio::test]
    async fn test_repeated_timeouts_surface_as_io() {
        let (fs, backend) = setup();
        backend.delay_next(Operation::HeadObject, 3, Duration::from_secs(5));
        let err = head(&fs.with_timeout(Duration::from_millis(20))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GenericIo);
        assert!(matches!(err.backend_source(), Some(BackendError::Request(_))));
        assert_eq!(backend.calls(Operation::HeadObject), 0);
    }

    #[test]
    fn test_backoff_is_bounded() {
        for attempt in 0..20 {
            assert!(backoff_delay(attempt) <= Duration::from_millis(BACKOFF_MAX_MS));
        }
        assert!(backoff_delay(0) >= Duration::from_millis(BACKOFF_BASE_MS));
    }
}
