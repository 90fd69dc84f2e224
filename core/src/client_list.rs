use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::repo_fs::RepositoryFs;
use crate::types::ClientId;
use crate::{Error, Result};

pub const CLIENT_LIST_DIR: &str = "client-list";

const CLIENT_LIST_FILE: &str = "client-list/data.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    pub encryption_key: Option<String>,
}

impl ClientRecord {
    pub fn dirname(&self) -> String {
        self.id.dirname()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ClientListData {
    clients: BTreeMap<String, ClientRecord>,
}

/// Registry of client names, their numeric ids and per-client key identifiers.
/// Changes are staged in memory until `commit`.
pub struct ClientList {
    fs: RepositoryFs,
    data: Option<ClientListData>,
    added: Vec<String>,
}

impl ClientList {
    pub fn new(fs: RepositoryFs) -> Self {
        Self {
            fs,
            data: None,
            added: Vec::new(),
        }
    }

    async fn data(&mut self) -> Result<&mut ClientListData> {
        if self.data.is_none() {
            let loaded = match self.fs.read(CLIENT_LIST_FILE).await {
                Ok(blob) => serde_json::from_slice(&blob)?,
                Err(e) if e.is_not_found() => ClientListData::default(),
                Err(e) => return Err(e),
            };
            self.data = Some(loaded);
        }
        self.data
            .as_mut()
            .ok_or_else(|| Error::Other("client list failed to load".to_string()))
    }

    pub async fn names(&mut self) -> Result<Vec<String>> {
        Ok(self.data().await?.clients.keys().cloned().collect())
    }

    pub async fn get(&mut self, name: &str) -> Result<Option<ClientRecord>> {
        Ok(self.data().await?.clients.get(name).cloned())
    }

    pub async fn require(&mut self, name: &str) -> Result<ClientRecord> {
        self.get(name).await?.ok_or_else(|| Error::ClientDoesNotExist {
            client: name.to_string(),
        })
    }

    /// Clients added since the last commit or clear.
    pub fn added_clients(&self) -> &[String] {
        &self.added
    }

    /// Register a new client. Its directory is created here, which is also
    /// how a free random id is found.
    pub async fn add_client(&mut self, name: &str) -> Result<ClientRecord> {
        if self.data().await?.clients.contains_key(name) {
            return Err(Error::ClientAlreadyExists {
                client: name.to_string(),
            });
        }
        let id = self.pick_client_id().await?;
        let record = ClientRecord {
            id,
            encryption_key: None,
        };
        self.data()
            .await?
            .clients
            .insert(name.to_string(), record.clone());
        self.added.push(name.to_string());
        info!(client = %name, client_id = %id, "Added client");
        Ok(record)
    }

    async fn pick_client_id(&mut self) -> Result<ClientId> {
        loop {
            let candidate = ClientId::random();
            let dirname = candidate.dirname();
            match self.fs.mkdir(&dirname).await {
                Ok(()) => {
                    self.fs.hooks().toplevel_initialized(&dirname)?;
                    return Ok(candidate);
                }
                Err(e) if e.is_already_exists() => {
                    debug!(client_id = %candidate, "Client id taken, picking another");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn remove_client(&mut self, name: &str) -> Result<ClientRecord> {
        let record = self
            .data()
            .await?
            .clients
            .remove(name)
            .ok_or_else(|| Error::ClientDoesNotExist {
                client: name.to_string(),
            })?;
        self.added.retain(|added| added != name);
        Ok(record)
    }

    pub async fn rename_client(&mut self, old: &str, new: &str) -> Result<()> {
        let data = self.data().await?;
        if !data.clients.contains_key(old) {
            return Err(Error::ClientDoesNotExist {
                client: old.to_string(),
            });
        }
        if data.clients.contains_key(new) {
            return Err(Error::ClientAlreadyExists {
                client: new.to_string(),
            });
        }
        if let Some(record) = data.clients.remove(old) {
            data.clients.insert(new.to_string(), record);
        }
        if let Some(added) = self.added.iter_mut().find(|added| *added == old) {
            *added = new.to_string();
        }
        Ok(())
    }

    pub async fn get_encryption_key(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self.require(name).await?.encryption_key)
    }

    pub async fn set_encryption_key(&mut self, name: &str, key_id: Option<String>) -> Result<()> {
        let record = self
            .data()
            .await?
            .clients
            .get_mut(name)
            .ok_or_else(|| Error::ClientDoesNotExist {
                client: name.to_string(),
            })?;
        record.encryption_key = key_id;
        Ok(())
    }

    /// Run add-client hooks for new names, then write the list.
    pub async fn commit(&mut self) -> Result<()> {
        self.data().await?;
        for name in &self.added {
            self.fs.hooks().client_added(name)?;
        }
        if let Some(data) = &self.data {
            let blob = serde_json::to_vec_pretty(data)?;
            self.fs.overwrite(CLIENT_LIST_FILE, &blob).await?;
        }
        debug!(added = self.added.len(), "Committed client list");
        self.clear();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data = None;
        self.added.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::memory::MemoryBackend;
    use std::sync::{Arc, Mutex};

    fn fs_with_hooks(hooks: Hooks) -> RepositoryFs {
        RepositoryFs::new(Arc::new(MemoryBackend::new()), hooks)
    }

    #[tokio::test]
    async fn test_add_commit_and_reload() {
        let added = Arc::new(Mutex::new(Vec::new()));
        let sink = added.clone();
        let fs = fs_with_hooks(Hooks::new().on_add_client(move |name| {
            sink.lock().unwrap().push(name.to_string());
            Ok(())
        }));
        let mut list = ClientList::new(fs.clone());

        let alice = list.add_client("alice").await.unwrap();
        assert!(fs.is_dir(&alice.dirname()).await.unwrap());
        assert!(matches!(
            list.add_client("alice").await,
            Err(Error::ClientAlreadyExists { .. })
        ));
        list.commit().await.unwrap();
        assert_eq!(*added.lock().unwrap(), vec!["alice"]);

        let mut reloaded = ClientList::new(fs);
        assert_eq!(reloaded.names().await.unwrap(), vec!["alice"]);
        assert_eq!(reloaded.require("alice").await.unwrap().id, alice.id);
    }

    #[tokio::test]
    async fn test_clear_discards_staged_changes() {
        let fs = fs_with_hooks(Hooks::new());
        let mut list = ClientList::new(fs);
        list.add_client("alice").await.unwrap();
        list.clear();
        assert!(list.names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_keeps_id() {
        let mut list = ClientList::new(fs_with_hooks(Hooks::new()));
        let record = list.add_client("old").await.unwrap();
        list.add_client("taken").await.unwrap();

        assert!(matches!(
            list.rename_client("old", "taken").await,
            Err(Error::ClientAlreadyExists { .. })
        ));
        list.rename_client("old", "new").await.unwrap();
        assert_eq!(list.require("new").await.unwrap().id, record.id);
        assert!(list.get("old").await.unwrap().is_none());
        assert_eq!(list.added_clients(), ["new".to_string(), "taken".to_string()]);
    }

    #[tokio::test]
    async fn test_encryption_key_ids() {
        let mut list = ClientList::new(fs_with_hooks(Hooks::new()));
        list.add_client("alice").await.unwrap();
        assert_eq!(list.get_encryption_key("alice").await.unwrap(), None);
        list.set_encryption_key("alice", Some("key-1".to_string()))
            .await
            .unwrap();
        assert_eq!(
            list.get_encryption_key("alice").await.unwrap().as_deref(),
            Some("key-1")
        );
        assert!(list.set_encryption_key("bob", None).await.is_err());
    }
}
