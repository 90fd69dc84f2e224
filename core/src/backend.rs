use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Memory,
    Local,
}

/// Physical storage underneath a repository.
///
/// Paths are `/`-separated and relative to the repository root. Implementations
/// report missing paths as `Error::NotFound` and existing ones on create as
/// `Error::AlreadyExists`; the lock manager depends on `write` failing atomically
/// when the target already exists.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn is_dir(&self, path: &str) -> Result<bool>;

    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Create a new file, creating missing parent directories.
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    /// Replace a file, creating it if needed.
    async fn overwrite(&self, path: &str, data: Bytes) -> Result<()>;

    /// Remove a file, or a directory with everything below it.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Sorted names of the entries directly inside `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Re-establish a connection after a failure. Local storage has nothing to do.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    fn backend_type(&self) -> BackendType;
}

/// Normalize a repository path: no leading `/` or `./`, no trailing `/`,
/// no empty components.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_path(dir);
    if dir.is_empty() {
        normalize_path(name)
    } else {
        format!("{dir}/{}", normalize_path(name))
    }
}

/// First component of a repository path.
pub fn toplevel(path: &str) -> String {
    normalize_path(path)
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(normalize_path("/chunks//a/./b/"), "chunks/a/b");
        assert_eq!(normalize_path("."), "");
        assert_eq!(join_path("", "lock"), "lock");
        assert_eq!(join_path("client-list", "lock"), "client-list/lock");
        assert_eq!(toplevel("chunks/1/2/3"), "chunks");
        assert_eq!(toplevel("config"), "config");
    }
}
