use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::backend::{Backend, join_path, normalize_path};
use crate::types::RepositorySettings;
use crate::{Error, Result};

/// Name of the marker file that exists inside a directory while it is locked.
pub const LOCK_NAME: &str = "lock";

/// Diagnostic content of a lock marker. Presence of the marker alone means
/// "locked"; this is only shown to humans deciding whether to break a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub hostname: String,
    pub pid: u32,
    pub time: String,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            time: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Advisory per-directory locks built on atomic create-new of a marker file.
pub struct LockManager {
    backend: Arc<dyn Backend>,
    timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    held: BTreeSet<String>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn Backend>, settings: &RepositorySettings) -> Self {
        Self {
            backend,
            timeout: settings.lock_timeout(),
            initial_backoff: settings.lock_initial_backoff(),
            max_backoff: settings.lock_max_backoff(),
            held: BTreeSet::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn marker_path(dirname: &str) -> String {
        join_path(dirname, LOCK_NAME)
    }

    /// Directories in the global lock order: sorted by byte value, duplicates removed.
    fn ordered(dirnames: &[String]) -> Vec<String> {
        dirnames
            .iter()
            .map(|d| normalize_path(d))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub async fn is_locked(&self, dirname: &str) -> Result<bool> {
        self.backend.exists(&Self::marker_path(dirname)).await
    }

    /// Whether this manager holds the lock on `dirname`.
    pub fn got_lock(&self, dirname: &str) -> bool {
        self.held.contains(&normalize_path(dirname))
    }

    /// Who holds the lock, if anyone.
    pub async fn holder(&self, dirname: &str) -> Result<Option<LockInfo>> {
        match self.backend.read(&Self::marker_path(dirname)).await {
            Ok(data) => Ok(serde_json::from_slice(&data).ok()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lock_one(&mut self, dirname: &str) -> Result<()> {
        let path = Self::marker_path(dirname);
        let marker = Bytes::from(serde_json::to_vec(&LockInfo::current())?);
        let started = Instant::now();
        let mut backoff = self.initial_backoff;

        loop {
            match self.backend.write(&path, marker.clone()).await {
                Ok(()) => {
                    debug!(dir = %dirname, "Acquired lock");
                    self.held.insert(dirname.to_string());
                    return Ok(());
                }
                Err(e) if e.is_already_exists() => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.timeout {
                        warn!(
                            dir = %dirname,
                            waited_ms = elapsed.as_millis() as u64,
                            "Giving up waiting for lock"
                        );
                        return Err(Error::LockTimeout { path });
                    }
                    let wait = backoff.min(self.timeout - elapsed);
                    debug!(
                        dir = %dirname,
                        backoff_ms = wait.as_millis() as u64,
                        "Lock is held, retrying after backoff"
                    );
                    sleep(wait).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lock every directory, or none of them.
    pub async fn lock(&mut self, dirnames: &[String]) -> Result<()> {
        let ordered = Self::ordered(dirnames);
        let mut acquired = Vec::new();
        for dirname in &ordered {
            if let Err(e) = self.lock_one(dirname).await {
                if let Err(release) = self.unlock(&acquired).await {
                    warn!(error = %release, "Failed to release partially acquired locks");
                }
                return Err(e);
            }
            acquired.push(dirname.clone());
        }
        Ok(())
    }

    /// Remove the markers, whether or not they are still present.
    pub async fn unlock(&mut self, dirnames: &[String]) -> Result<()> {
        for dirname in Self::ordered(dirnames).iter().rev() {
            match self.backend.delete(&Self::marker_path(dirname)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(dir = %dirname, "Lock marker was already gone");
                }
                Err(e) => return Err(e),
            }
            self.held.remove(dirname);
            debug!(dir = %dirname, "Released lock");
        }
        Ok(())
    }

    /// Remove a lock held by anyone. Returns whether a marker was removed.
    pub async fn force_unlock(&mut self, dirname: &str) -> Result<bool> {
        let dirname = normalize_path(dirname);
        self.held.remove(&dirname);
        match self.backend.delete(&Self::marker_path(&dirname)).await {
            Ok(()) => {
                info!(dir = %dirname, "Broke lock");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn settings() -> RepositorySettings {
        RepositorySettings {
            lock_timeout: 0,
            lock_initial_backoff_ms: 5,
            lock_max_backoff_ms: 20,
            ..Default::default()
        }
    }

    fn dirs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut locks = LockManager::new(backend.clone(), &settings());

        locks.lock(&dirs(&["b", "a"])).await.unwrap();
        assert!(locks.is_locked("a").await.unwrap());
        assert!(locks.got_lock("b"));
        let info = locks.holder("a").await.unwrap().unwrap();
        assert_eq!(info.pid, std::process::id());

        locks.unlock(&dirs(&["a", "b"])).await.unwrap();
        assert!(!locks.is_locked("a").await.unwrap());
        assert!(!locks.got_lock("b"));
    }

    #[tokio::test]
    async fn test_lock_is_all_or_nothing() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut first = LockManager::new(backend.clone(), &settings());
        let mut second = LockManager::new(backend.clone(), &settings());

        first.lock(&dirs(&["b"])).await.unwrap();
        let err = second.lock(&dirs(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(!second.is_locked("a").await.unwrap());
        assert!(!second.got_lock("a"));
    }

    #[tokio::test]
    async fn test_waits_for_holder_until_timeout() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut holder = LockManager::new(backend.clone(), &settings());
        let mut waiter =
            LockManager::new(backend.clone(), &settings()).with_timeout(Duration::from_millis(100));

        holder.lock(&dirs(&["d"])).await.unwrap();
        let started = Instant::now();
        assert!(waiter.lock(&dirs(&["d"])).await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(100));

        holder.unlock(&dirs(&["d"])).await.unwrap();
        waiter.lock(&dirs(&["d"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_unlock_breaks_foreign_lock() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut holder = LockManager::new(backend.clone(), &settings());
        let mut breaker = LockManager::new(backend.clone(), &settings());

        holder.lock(&dirs(&["d"])).await.unwrap();
        assert!(breaker.force_unlock("d").await.unwrap());
        assert!(!breaker.force_unlock("d").await.unwrap());
        breaker.lock(&dirs(&["d"])).await.unwrap();
    }
}
