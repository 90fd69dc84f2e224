use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strata_core::{Backend, BackendType, Error, Result};
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently `RetryBackend` replays a failed call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to a quarter of the delay at random.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Few tries with short waits, for interactive commands on local disks.
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Many tries with long waits, for unattended backups to flaky mounts.
    pub fn persistent() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0 = first retry).
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let cap = self.max_backoff.as_millis() as f64;
        let scaled = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = scaled.min(cap) as u64;
        let extra = if self.jitter && millis >= 4 {
            rand::thread_rng().gen_range(0..=millis / 4)
        } else {
            0
        };
        Duration::from_millis(millis + extra)
    }
}

/// Whether a failure is worth another try.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // I/O failures below the repository are usually transient
            Error::Io(_) => true,
            Error::Backend(msg) => {
                msg.contains("timeout")
                    || msg.contains("connection")
                    || msg.contains("temporarily unavailable")
                    || msg.contains("try again")
            }
            // Existence, locking and policy answers are final
            Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::LockTimeout { .. }
            | Error::InvalidPassword
            | Error::RepositoryNotFound { .. }
            | Error::RepositoryExists { .. }
            | Error::InvalidFormatVersion { .. }
            | Error::Corrupted(_) => false,
            _ => false,
        }
    }
}

/// Run `operation`, replaying retryable failures up to `config.max_attempts` tries.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            debug!(
                operation = operation_name,
                error = %error,
                "Error is not retryable, failing immediately"
            );
            return Err(error);
        }

        attempt += 1;
        if attempt >= config.max_attempts {
            warn!(
                operation = operation_name,
                max_attempts = config.max_attempts,
                error = %error,
                "Operation failed after all retry attempts"
            );
            return Err(error);
        }

        let backoff = config.backoff_duration(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Operation failed, retrying after backoff"
        );
        sleep(backoff).await;
    }
}

/// Storage decorator that replays failed calls on its delegate, asking the
/// delegate to reconnect before each replay.
pub struct RetryBackend<B> {
    inner: B,
    config: RetryConfig,
}

impl<B: Backend> RetryBackend<B> {
    pub fn new(inner: B, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn call<'a, T, F, Fut>(&'a self, operation_name: &'static str, op: F) -> Result<T>
    where
        F: Fn(&'a B) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let failed = AtomicBool::new(false);
        let failed = &failed;
        let op = &op;
        let inner = &self.inner;
        retry_with_backoff(&self.config, operation_name, || async move {
            if failed.swap(false, Ordering::SeqCst) {
                debug!(operation = operation_name, "Reconnecting storage before retry");
                inner.reconnect().await?;
            }
            let result = op(inner).await;
            if result.is_err() {
                failed.store(true, Ordering::SeqCst);
            }
            result
        })
        .await
    }
}

#[async_trait]
impl<B: Backend> Backend for RetryBackend<B> {
    async fn init(&self) -> Result<()> {
        self.call("init", |b| b.init()).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.call("exists", |b| b.exists(path)).await
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        self.call("is_dir", |b| b.is_dir(path)).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.call("read", |b| b.read(path)).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.call("write", |b| b.write(path, data.clone())).await
    }

    async fn overwrite(&self, path: &str, data: Bytes) -> Result<()> {
        self.call("overwrite", |b| b.overwrite(path, data.clone())).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.call("delete", |b| b.delete(path)).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.call("mkdir", |b| b.mkdir(path)).await
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        self.call("list", |b| b.list(dir)).await
    }

    async fn reconnect(&self) -> Result<()> {
        self.inner.reconnect().await
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use strata_core::MemoryBackend;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Runs `retry_with_backoff` over a script of outcomes and returns the
    /// result plus the number of calls made.
    async fn replay(config: &RetryConfig, script: Vec<Result<u32>>) -> (Result<u32>, u32) {
        let calls = AtomicU32::new(0);
        let script = std::sync::Mutex::new(script.into_iter());
        let result = retry_with_backoff(config, "scripted", || {
            calls.fetch_add(1, Ordering::SeqCst);
            let next = script.lock().unwrap().next();
            async move { next.unwrap_or(Ok(0)) }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    fn io_error() -> Error {
        Error::Io(std::io::Error::other("stale file handle"))
    }

    #[tokio::test]
    async fn test_transient_failures_are_replayed() {
        let (result, calls) = replay(&fast(), vec![Err(io_error()), Err(io_error()), Ok(7)]).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let config = RetryConfig {
            max_attempts: 3,
            ..fast()
        };
        let script = (0..5).map(|_| Err(io_error())).collect();
        let (result, calls) = replay(&config, script).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_final_errors_are_not_replayed() {
        let lock_taken = Error::AlreadyExists {
            path: "chunks/lock".to_string(),
        };
        let (result, calls) = replay(&fast(), vec![Err(lock_taken), Ok(1)]).await;
        assert!(result.unwrap_err().is_already_exists());
        assert_eq!(calls, 1);

        let flaky = Error::Backend("connection refused".to_string());
        let (result, calls) = replay(&fast(), vec![Err(flaky), Ok(1)]).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let config = fast();
        let delays: Vec<u128> = (0..5).map(|n| config.backoff_duration(n).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);

        let jittered = RetryConfig {
            jitter: true,
            ..fast()
        };
        let delay = jittered.backoff_duration(1).as_millis();
        assert!((20..=25).contains(&delay));
    }

    /// Fails the first `failures` reads, counting reconnects.
    struct Flaky {
        inner: MemoryBackend,
        failures: AtomicU32,
        reconnects: AtomicU32,
    }

    #[async_trait]
    impl Backend for Flaky {
        async fn init(&self) -> Result<()> {
            self.inner.init().await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn is_dir(&self, path: &str) -> Result<bool> {
            self.inner.is_dir(path).await
        }
        async fn read(&self, path: &str) -> Result<Bytes> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Io(std::io::Error::other("connection reset")));
            }
            self.inner.read(path).await
        }
        async fn write(&self, path: &str, data: Bytes) -> Result<()> {
            self.inner.write(path, data).await
        }
        async fn overwrite(&self, path: &str, data: Bytes) -> Result<()> {
            self.inner.overwrite(path, data).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn mkdir(&self, path: &str) -> Result<()> {
            self.inner.mkdir(path).await
        }
        async fn list(&self, dir: &str) -> Result<Vec<String>> {
            self.inner.list(dir).await
        }
        async fn reconnect(&self) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn backend_type(&self) -> BackendType {
            BackendType::Memory
        }
    }

    #[tokio::test]
    async fn test_retry_backend_reconnects_between_attempts() {
        let flaky = Flaky {
            inner: MemoryBackend::new(),
            failures: AtomicU32::new(2),
            reconnects: AtomicU32::new(0),
        };
        let backend = RetryBackend::new(flaky, fast());
        backend.write("f", Bytes::from_static(b"data")).await.unwrap();

        assert_eq!(backend.read("f").await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(backend.inner().reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_backend_passes_final_errors_through() {
        let backend = RetryBackend::new(MemoryBackend::new(), fast());
        assert!(matches!(backend.read("missing").await, Err(Error::NotFound { .. })));
    }
}
