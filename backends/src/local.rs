use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use strata_core::backend::normalize_path;
use strata_core::{Backend, BackendType, Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Prefix of the temporary files `overwrite` renames into place.
const TEMP_PREFIX: &str = ".strata-tmp-";

/// Repository storage in a local directory.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let relative = normalize_path(path);
        if relative.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(relative)
        }
    }

    async fn create_parents(&self, path: &str, full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io_at(path, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| Error::io_at(&self.base_path.display().to_string(), e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| Error::io_at(path, e))
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.full_path(path)).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io_at(path, e)),
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path))
            .await
            .map_err(|e| Error::io_at(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(path);
        self.create_parents(path, &full_path).await?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await
            .map_err(|e| Error::io_at(path, e))?;
        file.write_all(&data).await.map_err(|e| Error::io_at(path, e))?;
        file.sync_all().await.map_err(|e| Error::io_at(path, e))?;
        debug!(path = %path, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn overwrite(&self, path: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(path);
        self.create_parents(path, &full_path).await?;
        let name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = full_path.with_file_name(format!(
            "{TEMP_PREFIX}{name}-{:016x}",
            rand::random::<u64>()
        ));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &full_path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::io_at(path, e));
        }
        debug!(path = %path, size = data.len(), "Replaced file");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::symlink_metadata(&full_path)
            .await
            .map_err(|e| Error::io_at(path, e))?;
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        removed.map_err(|e| Error::io_at(path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        self.create_parents(path, &full_path).await?;
        fs::create_dir(&full_path)
            .await
            .map_err(|e| Error::io_at(path, e))
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(self.full_path(dir)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io_at(dir, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io_at(dir, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(TEMP_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}
