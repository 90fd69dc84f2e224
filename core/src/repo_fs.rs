use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{Backend, toplevel};
use crate::hooks::Hooks;
use crate::Result;

/// The repository's view of its storage: every file read or written here passes
/// through the data filter chain for its toplevel directory.
#[derive(Clone)]
pub struct RepositoryFs {
    backend: Arc<dyn Backend>,
    hooks: Hooks,
}

impl RepositoryFs {
    pub fn new(backend: Arc<dyn Backend>, hooks: Hooks) -> Self {
        Self { backend, hooks }
    }

    /// The unfiltered storage, used for lock markers and the root config.
    pub fn raw(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let data = self.backend.read(path).await?;
        self.hooks.filter_read(data.to_vec(), &toplevel(path))
    }

    pub async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let filtered = self.hooks.filter_write(data.to_vec(), &toplevel(path))?;
        self.backend.write(path, Bytes::from(filtered)).await
    }

    pub async fn overwrite(&self, path: &str, data: &[u8]) -> Result<()> {
        let filtered = self.hooks.filter_write(data.to_vec(), &toplevel(path))?;
        self.backend.overwrite(path, Bytes::from(filtered)).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.backend.exists(path).await
    }

    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        self.backend.is_dir(path).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.backend.delete(path).await
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.backend.mkdir(path).await
    }

    pub async fn list(&self, dir: &str) -> Result<Vec<String>> {
        self.backend.list(dir).await
    }

    /// Create a toplevel directory the first time it is needed and run the
    /// toplevel-init hooks for it. Returns whether it was created.
    pub async fn create_and_init_toplevel(&self, dir: &str) -> Result<bool> {
        let name = toplevel(dir);
        if self.backend.exists(&name).await? {
            return Ok(false);
        }
        match self.backend.mkdir(&name).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => return Ok(false),
            Err(e) => return Err(e),
        }
        debug!(toplevel = %name, "Initialized toplevel directory");
        self.hooks.toplevel_initialized(&name)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::CompressionFilter;
    use crate::memory::MemoryBackend;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_filters_wrap_reads_and_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let fs = RepositoryFs::new(backend.clone(), Hooks::new().with_filter(CompressionFilter::default()));

        let data = vec![1u8; 1000];
        fs.write("chunks/a", &data).await.unwrap();
        let raw = backend.read("chunks/a").await.unwrap();
        assert!(raw.starts_with(b"zlib\0"));
        assert_eq!(fs.read("chunks/a").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_toplevel_init_runs_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hooks = Hooks::new().on_toplevel_init(move |name| {
            sink.lock().unwrap().push(name.to_string());
            Ok(())
        });
        let fs = RepositoryFs::new(Arc::new(MemoryBackend::new()), hooks);

        assert!(fs.create_and_init_toplevel("chunks/1/2").await.unwrap());
        assert!(!fs.create_and_init_toplevel("chunks").await.unwrap());
        assert_eq!(*seen.lock().unwrap(), vec!["chunks"]);
    }
}
