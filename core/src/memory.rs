use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::backend::{Backend, BackendType, normalize_path};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Entry {
    Dir,
    File(Bytes),
}

/// In-memory storage backend. Thread-safe via Mutex; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Backend("memory backend mutex poisoned".to_string()))
    }

    /// Every file path currently stored, for assertions in tests.
    pub fn file_paths(&self) -> Result<Vec<String>> {
        Ok(self
            .entries()?
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::File(_)))
            .map(|(path, _)| path.clone())
            .collect())
    }

    fn create_parents(entries: &mut BTreeMap<String, Entry>, path: &str) -> Result<()> {
        let mut parent = String::new();
        let parts: Vec<&str> = path.split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(part);
            match entries.get(&parent) {
                Some(Entry::Dir) => {}
                Some(Entry::File(_)) => {
                    return Err(Error::Backend(format!("{parent}: not a directory")));
                }
                None => {
                    entries.insert(parent.clone(), Entry::Dir);
                }
            }
        }
        Ok(())
    }

    fn is_child(dir: &str, path: &str) -> bool {
        if dir.is_empty() {
            !path.contains('/')
        } else {
            path.strip_prefix(dir)
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|rest| !rest.contains('/'))
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        Ok(path.is_empty() || self.entries()?.contains_key(&path))
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        Ok(path.is_empty() || matches!(self.entries()?.get(&path), Some(Entry::Dir)))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let path = normalize_path(path);
        match self.entries()?.get(&path) {
            Some(Entry::File(data)) => Ok(data.clone()),
            Some(Entry::Dir) => Err(Error::Backend(format!("{path}: is a directory"))),
            None => Err(Error::NotFound { path }),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.entries()?;
        if entries.contains_key(&path) {
            return Err(Error::AlreadyExists { path });
        }
        Self::create_parents(&mut entries, &path)?;
        entries.insert(path, Entry::File(data));
        Ok(())
    }

    async fn overwrite(&self, path: &str, data: Bytes) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.entries()?;
        if let Some(Entry::Dir) = entries.get(&path) {
            return Err(Error::Backend(format!("{path}: is a directory")));
        }
        Self::create_parents(&mut entries, &path)?;
        entries.insert(path, Entry::File(data));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.entries()?;
        match entries.remove(&path) {
            Some(Entry::File(_)) => Ok(()),
            Some(Entry::Dir) => {
                let prefix = format!("{path}/");
                entries.retain(|key, _| !key.starts_with(&prefix));
                Ok(())
            }
            None => Err(Error::NotFound { path }),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.entries()?;
        if path.is_empty() || entries.contains_key(&path) {
            return Err(Error::AlreadyExists { path });
        }
        Self::create_parents(&mut entries, &path)?;
        entries.insert(path, Entry::Dir);
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = normalize_path(dir);
        let entries = self.entries()?;
        Ok(entries
            .keys()
            .filter(|path| Self::is_child(&dir, path))
            .map(|path| path.rsplit('/').next().unwrap_or(path).to_string())
            .collect())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_is_create_new() {
        let backend = MemoryBackend::new();
        backend.write("a/b/file", Bytes::from_static(b"one")).await.unwrap();
        let err = backend
            .write("a/b/file", Bytes::from_static(b"two"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(backend.read("a/b/file").await.unwrap(), "one");

        backend.overwrite("a/b/file", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(backend.read("a/b/file").await.unwrap(), "two");
        assert!(backend.is_dir("a/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_recursive_delete() {
        let backend = MemoryBackend::new();
        backend.write("d/x", Bytes::new()).await.unwrap();
        backend.write("d/sub/y", Bytes::new()).await.unwrap();
        backend.write("dd/z", Bytes::new()).await.unwrap();

        assert_eq!(backend.list("d").await.unwrap(), vec!["sub", "x"]);
        assert_eq!(backend.list("").await.unwrap(), vec!["d", "dd"]);
        assert!(backend.list("missing").await.unwrap().is_empty());

        backend.delete("d").await.unwrap();
        assert!(!backend.exists("d/sub/y").await.unwrap());
        assert!(backend.exists("dd/z").await.unwrap());
        assert!(backend.delete("d").await.unwrap_err().is_not_found());
    }
}
