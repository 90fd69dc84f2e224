use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::chunk_index::ChunkIndexes;
use crate::chunk_store::{CHUNKS_DIR, ChunkStore};
use crate::chunker::Chunker;
use crate::client_list::{CLIENT_LIST_DIR, ClientList, ClientRecord};
use crate::client_tree::{
    ClientMetadataTree, GEN_ENDED, GEN_FILE_COUNT, GEN_IS_CHECKPOINT, GEN_STARTED, GEN_TOTAL_DATA,
    join_child,
};
use crate::hooks::Hooks;
use crate::lock::LockManager;
use crate::metadata::{FileKey, GenerationKey, KeyValue, Metadata};
use crate::repo_fs::RepositoryFs;
use crate::types::{
    Checksum, ChunkId, ClientId, FORMAT_VERSION, GenerationId, RepoConfig, RepositorySettings,
};
use crate::{Error, Result};

/// Unfiltered repository identity file at the root.
pub const CONFIG_FILE: &str = "config";

const REGULAR_FILE_MODE: u32 = 0o100644;

impl RepoConfig {
    /// Read the identity file of an existing repository.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryNotFound` - No identity file at the root
    /// * `Error::InvalidFormatVersion` - The repository was written by an incompatible format
    pub async fn load(backend: &dyn Backend) -> Result<Self> {
        let data = match backend.read(CONFIG_FILE).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                return Err(Error::RepositoryNotFound {
                    path: CONFIG_FILE.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let config: RepoConfig = serde_json::from_slice(&data)?;
        if config.version != FORMAT_VERSION {
            return Err(Error::InvalidFormatVersion {
                version: config.version,
            });
        }
        Ok(config)
    }
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

struct RemovedClient {
    name: String,
    dirname: String,
    locked_here: bool,
}

/// The storage engine of a snapshot backup repository.
///
/// A repository holds a client list, a chunk store with its checksum indexes,
/// and one metadata forest per client. Every mutation follows a
/// lock, mutate, commit-or-unlock cycle on the resource it touches.
///
/// # Repository Structure
///
/// ```text
/// repository/
/// ├── config          # Repository identity (unfiltered)
/// ├── client-list/    # Client names, ids and key ids
/// ├── chunks/         # Chunk blobs, sharded by id
/// ├── chunklist/      # chunk id -> checksum
/// ├── chunksums/      # checksum -> (chunk id, client) usage
/// └── client-<id>/    # One generation forest per client
/// ```
///
/// # Lock Order
///
/// Callers touching several resources lock the client list, then clients,
/// then the chunk indexes. `lock_everything` does exactly that.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use strata_core::{Hooks, MemoryBackend, Repository, RepositorySettings};
///
/// #[tokio::main]
/// async fn main() -> strata_core::Result<()> {
///     let backend = Arc::new(MemoryBackend::new());
///     let mut repo = Repository::init(backend, RepositorySettings::default(), Hooks::new()).await?;
///
///     repo.lock_client_list().await?;
///     repo.add_client("alice").await?;
///     repo.commit_client_list().await?;
///     Ok(())
/// }
/// ```
pub struct Repository {
    backend: Arc<dyn Backend>,
    fs: RepositoryFs,
    config: RepoConfig,
    settings: RepositorySettings,
    locks: LockManager,
    client_list: ClientList,
    new_client_dirs: Vec<String>,
    removed_clients: Vec<RemovedClient>,
    client_locks: BTreeMap<String, String>,
    trees: HashMap<String, ClientMetadataTree>,
    chunk_store: ChunkStore,
    chunk_indexes: ChunkIndexes,
    pending_chunk_removals: BTreeSet<ChunkId>,
    clock: fn() -> u64,
}

impl Repository {
    fn assemble(
        backend: Arc<dyn Backend>,
        config: RepoConfig,
        settings: RepositorySettings,
        hooks: Hooks,
    ) -> Self {
        let fs = RepositoryFs::new(backend.clone(), hooks);
        Self {
            locks: LockManager::new(backend.clone(), &settings),
            client_list: ClientList::new(fs.clone()),
            chunk_store: ChunkStore::new(fs.clone(), &settings),
            chunk_indexes: ChunkIndexes::new(fs.clone()),
            backend,
            fs,
            config,
            settings,
            new_client_dirs: Vec::new(),
            removed_clients: Vec::new(),
            client_locks: BTreeMap::new(),
            trees: HashMap::new(),
            pending_chunk_removals: BTreeSet::new(),
            clock: unix_now,
        }
    }

    /// Initializes a new, empty repository.
    ///
    /// # Arguments
    ///
    /// * `backend` - Storage the repository lives on
    /// * `settings` - Session tunables (lock timeouts, node size, chunk size)
    /// * `hooks` - Data filters and lifecycle callbacks
    ///
    /// # Errors
    ///
    /// Returns `Error::RepositoryExists` if the storage already holds a repository.
    pub async fn init(
        backend: Arc<dyn Backend>,
        settings: RepositorySettings,
        hooks: Hooks,
    ) -> Result<Self> {
        let config = RepoConfig {
            compression: settings.compress,
            ..RepoConfig::default()
        };
        Self::init_with_config(backend, config, settings, hooks).await
    }

    /// Like `init`, with a caller-built identity (e.g. carrying encryption parameters).
    pub async fn init_with_config(
        backend: Arc<dyn Backend>,
        config: RepoConfig,
        settings: RepositorySettings,
        hooks: Hooks,
    ) -> Result<Self> {
        backend.init().await?;
        if backend.exists(CONFIG_FILE).await? {
            return Err(Error::RepositoryExists {
                path: CONFIG_FILE.to_string(),
            });
        }
        let data = serde_json::to_vec_pretty(&config)?;
        backend.write(CONFIG_FILE, Bytes::from(data)).await?;
        info!(repo_id = %config.id, "Initialized repository");
        Ok(Self::assemble(backend, config, settings, hooks))
    }

    /// Opens an existing repository.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryNotFound` - No repository on this storage
    /// * `Error::InvalidFormatVersion` - Incompatible on-disk format
    pub async fn open(
        backend: Arc<dyn Backend>,
        settings: RepositorySettings,
        hooks: Hooks,
    ) -> Result<Self> {
        let config = RepoConfig::load(backend.as_ref()).await?;
        debug!(repo_id = %config.id, "Opened repository");
        Ok(Self::assemble(backend, config, settings, hooks))
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Replace the source of generation timestamps.
    pub fn set_clock(&mut self, clock: fn() -> u64) {
        self.clock = clock;
    }

    // Client list

    pub fn got_client_list_lock(&self) -> bool {
        self.locks.got_lock(CLIENT_LIST_DIR)
    }

    fn require_client_list_lock(&self) -> Result<()> {
        if self.got_client_list_lock() {
            Ok(())
        } else {
            Err(Error::ClientListNotLocked)
        }
    }

    pub async fn lock_client_list(&mut self) -> Result<()> {
        if self.got_client_list_lock() {
            return Err(Error::ClientListLockingFailed);
        }
        self.fs.create_and_init_toplevel(CLIENT_LIST_DIR).await?;
        match self.locks.lock(&[CLIENT_LIST_DIR.to_string()]).await {
            Ok(()) => {}
            Err(Error::LockTimeout { path }) => {
                warn!(lock = %path, "Could not lock client list");
                return Err(Error::ClientListLockingFailed);
            }
            Err(e) => return Err(e),
        }
        self.client_list.clear();
        self.new_client_dirs.clear();
        self.removed_clients.clear();
        Ok(())
    }

    /// Write client list changes, delete the directories of removed clients,
    /// and release the lock.
    pub async fn commit_client_list(&mut self) -> Result<()> {
        self.require_client_list_lock()?;
        self.client_list.commit().await?;
        for removed in std::mem::take(&mut self.removed_clients) {
            self.client_locks.remove(&removed.name);
            if self.locks.got_lock(&removed.dirname) {
                self.locks.unlock(&[removed.dirname.clone()]).await?;
            }
            self.delete_dir(&removed.dirname).await?;
            info!(client = %removed.name, dir = %removed.dirname, "Deleted client data");
        }
        self.new_client_dirs.clear();
        self.locks.unlock(&[CLIENT_LIST_DIR.to_string()]).await?;
        debug!("Committed client list");
        Ok(())
    }

    /// Discard client list changes. Directories made for clients added in
    /// this session are deleted again.
    pub async fn unlock_client_list(&mut self) -> Result<()> {
        self.require_client_list_lock()?;
        self.client_list.clear();
        for dirname in std::mem::take(&mut self.new_client_dirs) {
            if self.locks.got_lock(&dirname) {
                self.locks.unlock(&[dirname.clone()]).await?;
            }
            self.client_locks.retain(|_, dir| *dir != dirname);
            self.delete_dir(&dirname).await?;
        }
        for removed in std::mem::take(&mut self.removed_clients) {
            if removed.locked_here {
                self.client_locks.remove(&removed.name);
                self.locks.unlock(&[removed.dirname]).await?;
            }
        }
        self.trees.clear();
        self.locks.unlock(&[CLIENT_LIST_DIR.to_string()]).await
    }

    async fn delete_dir(&self, dirname: &str) -> Result<()> {
        match self.fs.delete(dirname).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn force_client_list_lock(&mut self) -> Result<bool> {
        self.locks.force_unlock(CLIENT_LIST_DIR).await
    }

    pub async fn get_client_names(&mut self) -> Result<Vec<String>> {
        self.client_list.names().await
    }

    async fn client_record(&mut self, name: &str) -> Result<ClientRecord> {
        self.client_list.require(name).await
    }

    pub async fn get_client_id(&mut self, name: &str) -> Result<ClientId> {
        Ok(self.client_record(name).await?.id)
    }

    pub async fn add_client(&mut self, name: &str) -> Result<()> {
        self.require_client_list_lock()?;
        let record = self.client_list.add_client(name).await?;
        self.new_client_dirs.push(record.dirname());
        Ok(())
    }

    /// Remove a client with all its generations. Chunks only this client used
    /// are deleted when the chunk indexes are committed; the client directory
    /// goes away when the client list is committed.
    ///
    /// # Errors
    ///
    /// * `Error::ClientListNotLocked` / `Error::ChunkIndexesNotLocked` - Required locks missing
    /// * `Error::ClientDoesNotExist` - No such client
    /// * `Error::ClientLockingFailed` - Another actor holds the client
    pub async fn remove_client(&mut self, name: &str) -> Result<()> {
        self.require_client_list_lock()?;
        self.require_chunk_indexes_lock()?;
        let record = self.client_record(name).await?;
        let dirname = record.dirname();

        let locked_here = !self.client_locks.contains_key(name);
        if locked_here {
            self.lock_client(name).await?;
        }

        let mut used = BTreeSet::new();
        {
            let tree = self.tree(name).await?;
            for generation in tree.list_generations().await? {
                used.extend(tree.list_chunks_in_generation(generation).await?);
            }
        }
        self.release_chunks(record.id, used).await?;

        self.client_list.remove_client(name).await?;
        self.trees.remove(name);
        self.removed_clients.push(RemovedClient {
            name: name.to_string(),
            dirname,
            locked_here,
        });
        info!(client = %name, "Removed client");
        Ok(())
    }

    pub async fn rename_client(&mut self, old: &str, new: &str) -> Result<()> {
        self.require_client_list_lock()?;
        self.client_list.rename_client(old, new).await?;
        if let Some(dirname) = self.client_locks.remove(old) {
            self.client_locks.insert(new.to_string(), dirname);
        }
        if let Some(tree) = self.trees.remove(old) {
            self.trees.insert(new.to_string(), tree);
        }
        info!(old = %old, new = %new, "Renamed client");
        Ok(())
    }

    pub async fn get_client_encryption_key_id(&mut self, name: &str) -> Result<Option<String>> {
        self.client_list.get_encryption_key(name).await
    }

    pub async fn set_client_encryption_key_id(
        &mut self,
        name: &str,
        key_id: Option<String>,
    ) -> Result<()> {
        self.require_client_list_lock()?;
        self.client_list.set_encryption_key(name, key_id).await
    }

    // Clients

    pub fn got_client_lock(&self, name: &str) -> bool {
        self.client_locks.contains_key(name)
    }

    fn require_client_lock(&self, name: &str) -> Result<()> {
        if self.got_client_lock(name) {
            Ok(())
        } else {
            Err(Error::ClientNotLocked {
                client: name.to_string(),
            })
        }
    }

    /// Client trees are cached on first use. A tree read without the client
    /// lock keeps showing that snapshot until the client is locked or
    /// `refresh` is called.
    async fn tree(&mut self, name: &str) -> Result<&mut ClientMetadataTree> {
        if !self.trees.contains_key(name) {
            let dirname = self.client_record(name).await?.dirname();
            let tree = ClientMetadataTree::new(self.fs.clone(), &dirname, self.settings.node_size);
            self.trees.insert(name.to_string(), tree);
        }
        self.trees.get_mut(name).ok_or_else(|| Error::ClientDoesNotExist {
            client: name.to_string(),
        })
    }

    /// Drop cached state that is not protected by a lock held here, so the
    /// next unlocked read sees commits made by other sessions since.
    pub fn refresh(&mut self) {
        let locked = &self.client_locks;
        self.trees.retain(|name, _| locked.contains_key(name));
        if !self.got_client_list_lock() {
            self.client_list.clear();
        }
        if !self.got_chunk_indexes_lock() {
            self.chunk_indexes.clear();
        }
        debug!(cached_trees = self.trees.len(), "Refreshed repository caches");
    }

    pub async fn lock_client(&mut self, name: &str) -> Result<()> {
        let dirname = self.client_record(name).await?.dirname();
        if self.got_client_lock(name) {
            return Err(Error::ClientLockingFailed {
                client: name.to_string(),
            });
        }
        match self.locks.lock(&[dirname.clone()]).await {
            Ok(()) => {}
            Err(Error::LockTimeout { path }) => {
                warn!(client = %name, lock = %path, "Could not lock client");
                return Err(Error::ClientLockingFailed {
                    client: name.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
        self.client_locks.insert(name.to_string(), dirname);
        self.trees.remove(name);
        debug!(client = %name, "Locked client");
        Ok(())
    }

    /// Discard uncommitted changes, including an unfinished generation.
    pub async fn unlock_client(&mut self, name: &str) -> Result<()> {
        self.require_client_lock(name)?;
        self.trees.remove(name);
        if let Some(dirname) = self.client_locks.remove(name) {
            self.locks.unlock(&[dirname]).await?;
        }
        Ok(())
    }

    /// Finish the current generation (if any), persist the client's forest
    /// and release the lock.
    pub async fn commit_client(&mut self, name: &str) -> Result<()> {
        self.require_client_lock(name)?;
        let now = (self.clock)();
        let tree = self.tree(name).await?;
        if let Some(generation) = tree.current_generation() {
            tree.set_generation_value(GEN_ENDED, now).await?;
            let missing_count = tree.generation_value(generation, GEN_FILE_COUNT).await?.is_none();
            let missing_total = tree.generation_value(generation, GEN_TOTAL_DATA).await?.is_none();
            if missing_count || missing_total {
                let (files, bytes) = generation_stats(tree, generation).await?;
                if missing_count {
                    tree.set_generation_value(GEN_FILE_COUNT, files).await?;
                }
                if missing_total {
                    tree.set_generation_value(GEN_TOTAL_DATA, bytes).await?;
                }
            }
            info!(client = %name, generation, "Finished generation");
        }
        tree.commit().await?;
        self.trees.remove(name);
        if let Some(dirname) = self.client_locks.remove(name) {
            self.locks.unlock(&[dirname]).await?;
        }
        debug!(client = %name, "Committed client");
        Ok(())
    }

    pub async fn force_client_lock(&mut self, name: &str) -> Result<bool> {
        let dirname = self.client_record(name).await?.dirname();
        self.client_locks.remove(name);
        self.locks.force_unlock(&dirname).await
    }

    // Generations

    pub async fn get_client_generation_ids(&mut self, name: &str) -> Result<Vec<GenerationId>> {
        let numbers = self.tree(name).await?.list_generations().await?;
        Ok(numbers
            .into_iter()
            .map(|number| GenerationId::new(name, number))
            .collect())
    }

    pub async fn start_generation(&mut self, name: &str) -> Result<GenerationId> {
        self.require_client_lock(name)?;
        let now = (self.clock)();
        let tree = self.tree(name).await?;
        if let Some(current) = tree.current_generation() {
            return Err(Error::GenerationUnfinished {
                client: name.to_string(),
                generation: current.to_string(),
            });
        }
        let number = tree.start_generation().await?;
        tree.set_generation_value(GEN_STARTED, now).await?;
        tree.set_generation_value(GEN_IS_CHECKPOINT, 0).await?;
        info!(client = %name, generation = number, "Started generation");
        Ok(GenerationId::new(name, number))
    }

    async fn require_generation(&mut self, gen_id: &GenerationId) -> Result<()> {
        if self.tree(&gen_id.client).await?.has_generation(gen_id.number).await? {
            Ok(())
        } else {
            Err(Error::GenerationDoesNotExist {
                client: gen_id.client.clone(),
                generation: gen_id.number.to_string(),
            })
        }
    }

    /// The generation must be the client's unfinished one, under our lock.
    async fn require_current(&mut self, gen_id: &GenerationId) -> Result<()> {
        self.require_client_lock(&gen_id.client)?;
        let current = self.tree(&gen_id.client).await?.current_generation();
        if current == Some(gen_id.number) {
            return Ok(());
        }
        self.require_generation(gen_id).await?;
        Err(Error::GenerationFinished {
            client: gen_id.client.clone(),
            generation: gen_id.number.to_string(),
        })
    }

    fn generation_subkey(key: GenerationKey) -> u64 {
        match key {
            GenerationKey::Started => GEN_STARTED,
            GenerationKey::Ended => GEN_ENDED,
            GenerationKey::IsCheckpoint => GEN_IS_CHECKPOINT,
            GenerationKey::FileCount => GEN_FILE_COUNT,
            GenerationKey::TotalData => GEN_TOTAL_DATA,
        }
    }

    pub async fn get_generation_key(
        &mut self,
        gen_id: &GenerationId,
        key: GenerationKey,
    ) -> Result<Option<u64>> {
        self.require_generation(gen_id).await?;
        self.tree(&gen_id.client)
            .await?
            .generation_value(gen_id.number, Self::generation_subkey(key))
            .await
    }

    pub async fn set_generation_key(
        &mut self,
        gen_id: &GenerationId,
        key: GenerationKey,
        value: u64,
    ) -> Result<()> {
        self.require_current(gen_id).await?;
        self.tree(&gen_id.client)
            .await?
            .set_generation_value(Self::generation_subkey(key), value)
            .await
    }

    /// Start and end time of a generation. The end is unset while it is unfinished.
    pub async fn get_generation_times(
        &mut self,
        gen_id: &GenerationId,
    ) -> Result<(Option<u64>, Option<u64>)> {
        let started = self.get_generation_key(gen_id, GenerationKey::Started).await?;
        let ended = self.get_generation_key(gen_id, GenerationKey::Ended).await?;
        Ok((started, ended))
    }

    pub async fn is_checkpoint(&mut self, gen_id: &GenerationId) -> Result<bool> {
        Ok(self
            .get_generation_key(gen_id, GenerationKey::IsCheckpoint)
            .await?
            .unwrap_or(0)
            != 0)
    }

    pub async fn get_generation_chunk_ids(&mut self, gen_id: &GenerationId) -> Result<BTreeSet<ChunkId>> {
        self.require_generation(gen_id).await?;
        self.tree(&gen_id.client)
            .await?
            .list_chunks_in_generation(gen_id.number)
            .await
    }

    /// Remove a finished generation. Chunks no other generation of this client
    /// uses lose this client's usage record, and unused ones are deleted when
    /// the chunk indexes are committed.
    ///
    /// # Errors
    ///
    /// * `Error::ClientNotLocked` / `Error::ChunkIndexesNotLocked` - Required locks missing
    /// * `Error::GenerationUnfinished` - The generation is the one in progress
    /// * `Error::GenerationDoesNotExist` - No such generation
    pub async fn remove_generation(&mut self, gen_id: &GenerationId) -> Result<()> {
        self.require_client_lock(&gen_id.client)?;
        self.require_chunk_indexes_lock()?;
        let client_id = self.get_client_id(&gen_id.client).await?;
        let tree = self.tree(&gen_id.client).await?;
        if tree.current_generation() == Some(gen_id.number) {
            return Err(Error::GenerationUnfinished {
                client: gen_id.client.clone(),
                generation: gen_id.number.to_string(),
            });
        }
        if !tree.has_generation(gen_id.number).await? {
            return Err(Error::GenerationDoesNotExist {
                client: gen_id.client.clone(),
                generation: gen_id.number.to_string(),
            });
        }

        let removed = tree.list_chunks_in_generation(gen_id.number).await?;
        let mut kept = BTreeSet::new();
        for other in tree.list_generations().await? {
            if other != gen_id.number {
                kept.extend(tree.list_chunks_in_generation(other).await?);
            }
        }
        tree.remove_generation(gen_id.number).await?;

        let candidates: BTreeSet<ChunkId> = removed.difference(&kept).copied().collect();
        debug!(
            generation = %gen_id,
            referenced = removed.len(),
            candidates = candidates.len(),
            "Removing generation"
        );
        self.release_chunks(client_id, candidates).await
    }

    /// Drop a client's usage of chunks; the unused ones are scheduled for deletion.
    async fn release_chunks(
        &mut self,
        client_id: ClientId,
        chunk_ids: impl IntoIterator<Item = ChunkId>,
    ) -> Result<()> {
        for chunk_id in chunk_ids {
            let unused = match self.chunk_indexes.checksum_of(chunk_id).await? {
                Some(_) => !self.chunk_indexes.remove(chunk_id, client_id).await?,
                None => true,
            };
            if unused {
                self.pending_chunk_removals.insert(chunk_id);
            }
        }
        Ok(())
    }

    pub fn make_generation_spec(&self, gen_id: &GenerationId) -> String {
        gen_id.number.to_string()
    }

    /// Resolve "latest" or a generation number for a client.
    pub async fn interpret_generation_spec(&mut self, name: &str, spec: &str) -> Result<GenerationId> {
        let ids = self.get_client_generation_ids(name).await?;
        if spec == "latest" {
            return ids.last().cloned().ok_or_else(|| Error::ClientHasNoGenerations {
                client: name.to_string(),
            });
        }
        let not_found = || Error::GenerationDoesNotExist {
            client: name.to_string(),
            generation: spec.to_string(),
        };
        let number: u64 = spec.parse().map_err(|_| not_found())?;
        ids.into_iter()
            .find(|id| id.number == number)
            .ok_or_else(not_found)
    }

    // Files

    fn file_missing(gen_id: &GenerationId, path: &str) -> Error {
        Error::FileDoesNotExistInGeneration {
            client: gen_id.client.clone(),
            generation: gen_id.number.to_string(),
            path: path.to_string(),
        }
    }

    pub async fn file_exists(&mut self, gen_id: &GenerationId, path: &str) -> Result<bool> {
        self.require_generation(gen_id).await?;
        self.tree(&gen_id.client)
            .await?
            .file_exists(gen_id.number, path)
            .await
    }

    /// Add a file with empty metadata, unless it already exists.
    pub async fn add_file(&mut self, gen_id: &GenerationId, path: &str) -> Result<()> {
        self.require_current(gen_id).await?;
        let tree = self.tree(&gen_id.client).await?;
        if !tree.file_exists(gen_id.number, path).await? {
            tree.create(path, &Metadata::default().encode()).await?;
        }
        Ok(())
    }

    pub async fn remove_file(&mut self, gen_id: &GenerationId, path: &str) -> Result<()> {
        self.require_current(gen_id).await?;
        self.tree(&gen_id.client).await?.remove(path).await
    }

    pub async fn get_file_metadata(&mut self, gen_id: &GenerationId, path: &str) -> Result<Metadata> {
        self.require_generation(gen_id).await?;
        let encoded = self
            .tree(&gen_id.client)
            .await?
            .get_metadata(gen_id.number, path)
            .await?
            .ok_or_else(|| Self::file_missing(gen_id, path))?;
        Metadata::decode(&encoded)
    }

    /// Store a file's metadata, creating the file if needed.
    pub async fn set_file_metadata(
        &mut self,
        gen_id: &GenerationId,
        path: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        self.require_current(gen_id).await?;
        self.tree(&gen_id.client)
            .await?
            .set_metadata(path, &metadata.encode())
            .await
    }

    pub async fn get_file_key(&mut self, gen_id: &GenerationId, path: &str, key: FileKey) -> Result<KeyValue> {
        Ok(self.get_file_metadata(gen_id, path).await?.get(key))
    }

    pub async fn set_file_key(
        &mut self,
        gen_id: &GenerationId,
        path: &str,
        key: FileKey,
        value: KeyValue,
    ) -> Result<()> {
        self.require_current(gen_id).await?;
        let mut metadata = self.get_file_metadata(gen_id, path).await?;
        metadata.set(key, value)?;
        self.set_file_metadata(gen_id, path, &metadata).await
    }

    async fn require_file(&mut self, gen_id: &GenerationId, path: &str) -> Result<()> {
        if self.file_exists(gen_id, path).await? {
            Ok(())
        } else {
            Err(Self::file_missing(gen_id, path))
        }
    }

    pub async fn get_file_chunk_ids(&mut self, gen_id: &GenerationId, path: &str) -> Result<Vec<ChunkId>> {
        self.require_file(gen_id, path).await?;
        self.tree(&gen_id.client)
            .await?
            .get_file_chunks(gen_id.number, path)
            .await
    }

    pub async fn set_file_chunk_ids(
        &mut self,
        gen_id: &GenerationId,
        path: &str,
        chunk_ids: &[ChunkId],
    ) -> Result<()> {
        self.require_current(gen_id).await?;
        self.require_file(gen_id, path).await?;
        self.tree(&gen_id.client)
            .await?
            .set_file_chunks(path, chunk_ids)
            .await
    }

    pub async fn append_file_chunk_id(
        &mut self,
        gen_id: &GenerationId,
        path: &str,
        chunk_id: ChunkId,
    ) -> Result<()> {
        self.require_current(gen_id).await?;
        self.require_file(gen_id, path).await?;
        self.tree(&gen_id.client)
            .await?
            .append_file_chunks(path, &[chunk_id])
            .await
    }

    pub async fn clear_file_chunk_ids(&mut self, gen_id: &GenerationId, path: &str) -> Result<()> {
        self.set_file_chunk_ids(gen_id, path, &[]).await
    }

    /// Names of the entries of a directory, sorted.
    pub async fn listdir(&mut self, gen_id: &GenerationId, path: &str) -> Result<Vec<String>> {
        self.require_generation(gen_id).await?;
        self.tree(&gen_id.client)
            .await?
            .listdir(gen_id.number, path)
            .await
    }

    /// Full paths of the entries of a directory, sorted.
    pub async fn get_file_children(&mut self, gen_id: &GenerationId, path: &str) -> Result<Vec<String>> {
        Ok(self
            .listdir(gen_id, path)
            .await?
            .into_iter()
            .map(|name| join_child(path, &name))
            .collect())
    }

    /// Store file content in the current generation: split it into chunks,
    /// reuse identical stored chunks, and record size and checksum.
    ///
    /// Requires the client lock and the chunk indexes lock.
    pub async fn put_file_content(&mut self, gen_id: &GenerationId, path: &str, data: &[u8]) -> Result<Vec<ChunkId>> {
        self.require_current(gen_id).await?;
        self.require_chunk_indexes_lock()?;
        let client_id = self.get_client_id(&gen_id.client).await?;

        let mut metadata = if self.file_exists(gen_id, path).await? {
            self.get_file_metadata(gen_id, path).await?
        } else {
            Metadata {
                mode: Some(REGULAR_FILE_MODE),
                ..Metadata::default()
            }
        };
        metadata.size = Some(data.len() as u64);
        metadata.checksum = Some(Checksum::of(data).to_hex());
        self.set_file_metadata(gen_id, path, &metadata).await?;

        let chunker = Chunker::new(self.settings.chunk_size);
        let mut chunk_ids = Vec::new();
        for chunk in chunker.chunks(data) {
            chunk_ids.push(self.store_chunk(client_id, chunk).await?);
        }
        self.tree(&gen_id.client)
            .await?
            .set_file_chunks(path, &chunk_ids)
            .await?;
        debug!(
            generation = %gen_id,
            path = %path,
            size = data.len(),
            chunks = chunk_ids.len(),
            "Stored file content"
        );
        Ok(chunk_ids)
    }

    /// Reuse a stored chunk with identical bytes, or store a new one.
    async fn store_chunk(&mut self, client_id: ClientId, content: &[u8]) -> Result<ChunkId> {
        let checksum = ChunkIndexes::prepare(content);
        for candidate in self.chunk_indexes.find(checksum).await? {
            if self.pending_chunk_removals.contains(&candidate) {
                continue;
            }
            match self.chunk_store.get_chunk_content(candidate).await {
                Ok(stored) if stored == content => {
                    self.chunk_indexes.put(candidate, checksum, client_id).await?;
                    debug!(chunk_id = %candidate, "Reused existing chunk");
                    return Ok(candidate);
                }
                Ok(_) => {
                    warn!(chunk_id = %candidate, checksum = %checksum, "Checksum collision, storing separately");
                }
                Err(Error::ChunkDoesNotExist { .. }) => {
                    warn!(chunk_id = %candidate, "Indexed chunk is missing from the store");
                }
                Err(e) => return Err(e),
            }
        }
        let chunk_id = self.chunk_store.put_chunk_content(content).await?;
        self.chunk_indexes.put(chunk_id, checksum, client_id).await?;
        Ok(chunk_id)
    }

    pub async fn get_file_content(&mut self, gen_id: &GenerationId, path: &str) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        for chunk_id in self.get_file_chunk_ids(gen_id, path).await? {
            content.extend_from_slice(&self.chunk_store.get_chunk_content(chunk_id).await?);
        }
        Ok(content)
    }

    // Chunks

    pub fn got_chunk_indexes_lock(&self) -> bool {
        Self::chunk_index_dirs()
            .iter()
            .all(|dirname| self.locks.got_lock(dirname))
    }

    fn require_chunk_indexes_lock(&self) -> Result<()> {
        if self.got_chunk_indexes_lock() {
            Ok(())
        } else {
            Err(Error::ChunkIndexesNotLocked)
        }
    }

    fn chunk_index_dirs() -> Vec<String> {
        let mut dirs = ChunkIndexes::dirnames();
        dirs.push(CHUNKS_DIR.to_string());
        dirs
    }

    pub async fn lock_chunk_indexes(&mut self) -> Result<()> {
        if self.got_chunk_indexes_lock() {
            return Err(Error::ChunkIndexesLockingFailed);
        }
        let dirs = Self::chunk_index_dirs();
        for dirname in &dirs {
            self.fs.create_and_init_toplevel(dirname).await?;
        }
        match self.locks.lock(&dirs).await {
            Ok(()) => {}
            Err(Error::LockTimeout { path }) => {
                warn!(lock = %path, "Could not lock chunk indexes");
                return Err(Error::ChunkIndexesLockingFailed);
            }
            Err(e) => return Err(e),
        }
        self.chunk_indexes.clear();
        self.pending_chunk_removals.clear();
        Ok(())
    }

    /// Persist index changes, delete chunks that lost their last user, and
    /// release the lock.
    pub async fn commit_chunk_indexes(&mut self) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        self.chunk_indexes.commit().await?;
        let removals = std::mem::take(&mut self.pending_chunk_removals);
        for chunk_id in &removals {
            match self.chunk_store.remove_chunk(*chunk_id).await {
                Ok(()) | Err(Error::ChunkDoesNotExist { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if !removals.is_empty() {
            info!(removed = removals.len(), "Deleted unused chunks");
        }
        self.locks.unlock(&Self::chunk_index_dirs()).await
    }

    pub async fn unlock_chunk_indexes(&mut self) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        self.chunk_indexes.clear();
        self.pending_chunk_removals.clear();
        self.locks.unlock(&Self::chunk_index_dirs()).await
    }

    pub async fn force_chunk_indexes_lock(&mut self) -> Result<bool> {
        let mut removed = false;
        for dirname in Self::chunk_index_dirs() {
            removed |= self.locks.force_unlock(&dirname).await?;
        }
        Ok(removed)
    }

    /// Store a chunk without indexing it. Requires the chunk indexes lock.
    pub async fn put_chunk_content(&mut self, content: &[u8]) -> Result<ChunkId> {
        self.require_chunk_indexes_lock()?;
        self.chunk_store.put_chunk_content(content).await
    }

    pub async fn get_chunk_content(&self, chunk_id: ChunkId) -> Result<Vec<u8>> {
        self.chunk_store.get_chunk_content(chunk_id).await
    }

    pub async fn has_chunk(&self, chunk_id: ChunkId) -> Result<bool> {
        self.chunk_store.has_chunk(chunk_id).await
    }

    pub async fn remove_chunk(&mut self, chunk_id: ChunkId) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        self.chunk_store.remove_chunk(chunk_id).await
    }

    pub async fn get_chunk_ids(&self) -> Result<Vec<ChunkId>> {
        self.chunk_store.get_chunk_ids().await
    }

    pub fn prepare_chunk_for_indexes(&self, content: &[u8]) -> Checksum {
        ChunkIndexes::prepare(content)
    }

    pub async fn put_chunk_into_indexes(
        &mut self,
        chunk_id: ChunkId,
        checksum: Checksum,
        client: &str,
    ) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        let client_id = self.get_client_id(client).await?;
        self.chunk_indexes.put(chunk_id, checksum, client_id).await
    }

    /// Candidate chunks with the same checksum. Compare bytes before reusing one.
    pub async fn find_chunk_ids_by_content(&mut self, content: &[u8]) -> Result<Vec<ChunkId>> {
        self.chunk_indexes.find_by_content(content).await
    }

    /// Returns whether another client still uses the chunk.
    pub async fn remove_chunk_from_indexes(&mut self, chunk_id: ChunkId, client: &str) -> Result<bool> {
        self.require_chunk_indexes_lock()?;
        let client_id = self.get_client_id(client).await?;
        self.chunk_indexes.remove(chunk_id, client_id).await
    }

    pub async fn remove_chunk_from_indexes_for_all_clients(&mut self, chunk_id: ChunkId) -> Result<()> {
        self.require_chunk_indexes_lock()?;
        self.chunk_indexes.remove_for_all_clients(chunk_id).await
    }

    pub async fn get_chunk_checksum(&mut self, chunk_id: ChunkId) -> Result<Option<Checksum>> {
        self.chunk_indexes.checksum_of(chunk_id).await
    }

    pub async fn get_indexed_chunk_ids(&mut self) -> Result<Vec<ChunkId>> {
        self.chunk_indexes.indexed_chunk_ids().await
    }

    /// Recompute a chunk's checksum and compare it with the index. `None`
    /// when the chunk is not indexed.
    pub async fn validate_chunk_content(&mut self, chunk_id: ChunkId) -> Result<Option<bool>> {
        let Some(expected) = self.chunk_indexes.checksum_of(chunk_id).await? else {
            return Ok(None);
        };
        let content = self.chunk_store.get_chunk_content(chunk_id).await?;
        Ok(Some(ChunkIndexes::prepare(&content) == expected))
    }

    // Everything at once, in lock order.

    pub async fn lock_everything(&mut self) -> Result<()> {
        self.lock_client_list().await?;
        let names = self.get_client_names().await?;
        for name in &names {
            if let Err(e) = self.lock_client(name).await {
                self.unlock_everything().await?;
                return Err(e);
            }
        }
        if let Err(e) = self.lock_chunk_indexes().await {
            self.unlock_everything().await?;
            return Err(e);
        }
        Ok(())
    }

    /// Release every lock this repository holds without committing.
    pub async fn unlock_everything(&mut self) -> Result<()> {
        if self.got_chunk_indexes_lock() {
            self.unlock_chunk_indexes().await?;
        }
        let names: Vec<String> = self.client_locks.keys().cloned().collect();
        for name in names {
            self.unlock_client(&name).await?;
        }
        if self.got_client_list_lock() {
            self.unlock_client_list().await?;
        }
        Ok(())
    }

    /// Commit every held resource: clients, then chunk indexes, then the client list.
    pub async fn commit_everything(&mut self) -> Result<()> {
        let removed: BTreeSet<String> = self.removed_clients.iter().map(|r| r.name.clone()).collect();
        let names: Vec<String> = self
            .client_locks
            .keys()
            .filter(|name| !removed.contains(*name))
            .cloned()
            .collect();
        for name in names {
            self.commit_client(&name).await?;
        }
        if self.got_chunk_indexes_lock() {
            self.commit_chunk_indexes().await?;
        }
        if self.got_client_list_lock() {
            self.commit_client_list().await?;
        }
        Ok(())
    }
}

/// Number of files and total bytes of regular files in a generation.
async fn generation_stats(tree: &mut ClientMetadataTree, generation: u64) -> Result<(u64, u64)> {
    let mut files = 0u64;
    let mut bytes = 0u64;
    for encoded in tree.metadata_records(generation).await? {
        let metadata = Metadata::decode(&encoded)?;
        files += 1;
        if metadata.is_file() {
            bytes += metadata.size.unwrap_or(0);
        }
    }
    Ok((files, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn settings() -> RepositorySettings {
        RepositorySettings {
            lock_timeout: 0,
            node_size: 8,
            chunk_size: 1024,
            ..Default::default()
        }
    }

    async fn repo() -> Repository {
        let backend = Arc::new(MemoryBackend::new());
        Repository::init(backend, settings(), Hooks::new()).await.unwrap()
    }

    async fn repo_with_clients(names: &[&str]) -> Repository {
        let mut repo = repo().await;
        repo.lock_client_list().await.unwrap();
        for name in names {
            repo.add_client(name).await.unwrap();
        }
        repo.commit_client_list().await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_init_twice_fails_and_open_reads_config() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let repo = Repository::init(backend.clone(), settings(), Hooks::new()).await.unwrap();
        let id = repo.config().id.clone();

        let again = Repository::init(backend.clone(), settings(), Hooks::new()).await;
        assert!(matches!(again, Err(Error::RepositoryExists { .. })));

        let opened = Repository::open(backend, settings(), Hooks::new()).await.unwrap();
        assert_eq!(opened.config().id, id);

        let empty = Repository::open(Arc::new(MemoryBackend::new()), settings(), Hooks::new()).await;
        assert!(matches!(empty, Err(Error::RepositoryNotFound { .. })));
    }

    #[tokio::test]
    async fn test_client_list_requires_lock() {
        let mut repo = repo().await;
        assert!(matches!(repo.add_client("alice").await, Err(Error::ClientListNotLocked)));

        repo.lock_client_list().await.unwrap();
        assert!(matches!(repo.lock_client_list().await, Err(Error::ClientListLockingFailed)));
        repo.add_client("alice").await.unwrap();
        assert!(matches!(
            repo.add_client("alice").await,
            Err(Error::ClientAlreadyExists { .. })
        ));
        repo.commit_client_list().await.unwrap();
        assert_eq!(repo.get_client_names().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_unlock_discards_added_client() {
        let mut repo = repo().await;
        repo.lock_client_list().await.unwrap();
        repo.add_client("alice").await.unwrap();
        repo.unlock_client_list().await.unwrap();

        assert!(repo.get_client_names().await.unwrap().is_empty());
        let dirs = repo.backend().list("").await.unwrap();
        assert!(!dirs.iter().any(|d| d.starts_with("client-") && d != "client-list"));
    }

    #[tokio::test]
    async fn test_rename_client() {
        let mut repo = repo_with_clients(&["alice", "bob"]).await;
        repo.lock_client_list().await.unwrap();
        assert!(matches!(
            repo.rename_client("alice", "bob").await,
            Err(Error::ClientAlreadyExists { .. })
        ));
        assert!(matches!(
            repo.rename_client("carol", "dave").await,
            Err(Error::ClientDoesNotExist { .. })
        ));
        repo.rename_client("alice", "carol").await.unwrap();
        repo.commit_client_list().await.unwrap();
        assert_eq!(repo.get_client_names().await.unwrap(), vec!["bob", "carol"]);
    }

    #[tokio::test]
    async fn test_generation_lifecycle() {
        let mut repo = repo_with_clients(&["alice"]).await;
        assert!(matches!(
            repo.start_generation("alice").await,
            Err(Error::ClientNotLocked { .. })
        ));

        repo.lock_client("alice").await.unwrap();
        let gen_id = repo.start_generation("alice").await.unwrap();
        assert!(matches!(
            repo.start_generation("alice").await,
            Err(Error::GenerationUnfinished { .. })
        ));
        repo.set_file_metadata(
            &gen_id,
            "/a",
            &Metadata {
                mode: Some(REGULAR_FILE_MODE),
                size: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        repo.commit_client("alice").await.unwrap();

        let ids = repo.get_client_generation_ids("alice").await.unwrap();
        assert_eq!(ids, vec![gen_id.clone()]);
        let (started, ended) = repo.get_generation_times(&gen_id).await.unwrap();
        assert!(started.unwrap() <= ended.unwrap());
        assert_eq!(
            repo.get_generation_key(&gen_id, GenerationKey::FileCount).await.unwrap(),
            Some(1)
        );
        assert_eq!(
            repo.get_generation_key(&gen_id, GenerationKey::TotalData).await.unwrap(),
            Some(10)
        );
        assert!(!repo.is_checkpoint(&gen_id).await.unwrap());

        repo.lock_client("alice").await.unwrap();
        assert!(matches!(
            repo.set_generation_key(&gen_id, GenerationKey::FileCount, 5).await,
            Err(Error::GenerationFinished { .. })
        ));
        repo.unlock_client("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_client_discards_generation() {
        let mut repo = repo_with_clients(&["alice"]).await;
        repo.lock_client("alice").await.unwrap();
        repo.start_generation("alice").await.unwrap();
        repo.unlock_client("alice").await.unwrap();
        assert!(repo.get_client_generation_ids("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_keys() {
        let mut repo = repo_with_clients(&["alice"]).await;
        repo.lock_client("alice").await.unwrap();
        let gen_id = repo.start_generation("alice").await.unwrap();
        repo.add_file(&gen_id, "/").await.unwrap();
        repo.add_file(&gen_id, "/f").await.unwrap();
        repo.set_file_key(&gen_id, "/f", FileKey::Username, KeyValue::Text("alice".into()))
            .await
            .unwrap();
        assert!(matches!(
            repo.set_file_key(&gen_id, "/f", FileKey::Size, KeyValue::Text("x".into())).await,
            Err(Error::InvalidKeyValue { .. })
        ));
        assert!(matches!(
            repo.get_file_key(&gen_id, "/missing", FileKey::Size).await,
            Err(Error::FileDoesNotExistInGeneration { .. })
        ));
        assert_eq!(
            repo.get_file_key(&gen_id, "/f", FileKey::Username).await.unwrap(),
            KeyValue::Text("alice".into())
        );
        assert_eq!(
            repo.get_file_key(&gen_id, "/f", FileKey::MtimeSec).await.unwrap(),
            KeyValue::Integer(0)
        );
        assert_eq!(repo.get_file_children(&gen_id, "/").await.unwrap(), vec!["/f"]);
        repo.commit_client("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_put_file_content_dedups() {
        let mut repo = repo_with_clients(&["alice"]).await;
        repo.lock_client("alice").await.unwrap();
        repo.lock_chunk_indexes().await.unwrap();
        let gen_id = repo.start_generation("alice").await.unwrap();

        let block = vec![7u8; 1024];
        let first = repo.put_file_content(&gen_id, "/a", &block).await.unwrap();
        let second = repo.put_file_content(&gen_id, "/b", &block).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(repo.get_file_content(&gen_id, "/b").await.unwrap(), block);

        let metadata = repo.get_file_metadata(&gen_id, "/a").await.unwrap();
        assert_eq!(metadata.size, Some(1024));
        assert_eq!(metadata.checksum, Some(Checksum::of(&block).to_hex()));

        repo.append_file_chunk_id(&gen_id, "/a", first[0]).await.unwrap();
        let appended = repo.get_file_chunk_ids(&gen_id, "/a").await.unwrap();
        assert_eq!(appended.len(), first.len() + 1);
        assert_eq!(appended.last(), Some(&first[0]));
        repo.clear_file_chunk_ids(&gen_id, "/b").await.unwrap();
        assert!(repo.get_file_chunk_ids(&gen_id, "/b").await.unwrap().is_empty());

        repo.commit_client("alice").await.unwrap();
        repo.commit_chunk_indexes().await.unwrap();
        assert_eq!(repo.get_chunk_ids().await.unwrap().len(), first.len());
        for chunk_id in first {
            assert_eq!(repo.validate_chunk_content(chunk_id).await.unwrap(), Some(true));
        }
    }

    #[tokio::test]
    async fn test_chunk_operations_require_index_lock() {
        let mut repo = repo_with_clients(&["alice"]).await;
        assert!(matches!(
            repo.put_chunk_content(b"x").await,
            Err(Error::ChunkIndexesNotLocked)
        ));
        repo.lock_chunk_indexes().await.unwrap();
        let chunk_id = repo.put_chunk_content(b"x").await.unwrap();
        let checksum = repo.prepare_chunk_for_indexes(b"x");
        repo.put_chunk_into_indexes(chunk_id, checksum, "alice").await.unwrap();
        assert_eq!(repo.find_chunk_ids_by_content(b"x").await.unwrap(), vec![chunk_id]);
        assert!(matches!(
            repo.find_chunk_ids_by_content(b"y").await,
            Err(Error::ChunkContentNotInIndexes)
        ));
        assert!(!repo.remove_chunk_from_indexes(chunk_id, "alice").await.unwrap());
        repo.remove_chunk(chunk_id).await.unwrap();
        assert!(matches!(
            repo.remove_chunk(chunk_id).await,
            Err(Error::ChunkDoesNotExist { .. })
        ));
        repo.unlock_chunk_indexes().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_generation_keeps_shared_chunks() {
        let mut repo = repo_with_clients(&["alice"]).await;
        let shared = vec![1u8; 1024];
        let only_first = vec![2u8; 1024];

        repo.lock_client("alice").await.unwrap();
        repo.lock_chunk_indexes().await.unwrap();
        let first = repo.start_generation("alice").await.unwrap();
        let shared_ids = repo.put_file_content(&first, "/shared", &shared).await.unwrap();
        let gone_ids = repo.put_file_content(&first, "/gone", &only_first).await.unwrap();
        repo.commit_everything().await.unwrap();

        repo.lock_client("alice").await.unwrap();
        let second = repo.start_generation("alice").await.unwrap();
        repo.remove_file(&second, "/gone").await.unwrap();
        repo.commit_client("alice").await.unwrap();

        repo.lock_client("alice").await.unwrap();
        repo.lock_chunk_indexes().await.unwrap();
        assert!(matches!(
            repo.remove_generation(&GenerationId::new("alice", 99)).await,
            Err(Error::GenerationDoesNotExist { .. })
        ));
        repo.remove_generation(&first).await.unwrap();
        repo.commit_client("alice").await.unwrap();
        repo.commit_chunk_indexes().await.unwrap();

        for chunk_id in shared_ids {
            assert!(repo.has_chunk(chunk_id).await.unwrap());
        }
        for chunk_id in gone_ids {
            assert!(!repo.has_chunk(chunk_id).await.unwrap());
        }
        assert_eq!(repo.get_client_generation_ids("alice").await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_remove_current_generation_is_refused() {
        let mut repo = repo_with_clients(&["alice"]).await;
        repo.lock_client("alice").await.unwrap();
        repo.lock_chunk_indexes().await.unwrap();
        let gen_id = repo.start_generation("alice").await.unwrap();
        assert!(matches!(
            repo.remove_generation(&gen_id).await,
            Err(Error::GenerationUnfinished { .. })
        ));
        repo.unlock_everything().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_client_releases_chunks() {
        let mut repo = repo_with_clients(&["alice", "bob"]).await;
        let common = vec![3u8; 1024];
        let private = vec![4u8; 1024];

        for name in ["alice", "bob"] {
            repo.lock_client(name).await.unwrap();
            repo.lock_chunk_indexes().await.unwrap();
            let gen_id = repo.start_generation(name).await.unwrap();
            repo.put_file_content(&gen_id, "/common", &common).await.unwrap();
            if name == "alice" {
                repo.put_file_content(&gen_id, "/private", &private).await.unwrap();
            }
            repo.commit_everything().await.unwrap();
        }
        let alice_gen = repo.interpret_generation_spec("alice", "latest").await.unwrap();
        let common_ids = repo.get_file_chunk_ids(&alice_gen, "/common").await.unwrap();
        let private_ids = repo.get_file_chunk_ids(&alice_gen, "/private").await.unwrap();

        repo.lock_everything().await.unwrap();
        repo.remove_client("alice").await.unwrap();
        repo.commit_everything().await.unwrap();

        assert_eq!(repo.get_client_names().await.unwrap(), vec!["bob"]);
        for chunk_id in common_ids {
            assert!(repo.has_chunk(chunk_id).await.unwrap());
        }
        for chunk_id in private_ids {
            assert!(!repo.has_chunk(chunk_id).await.unwrap());
        }
        assert!(!repo.got_client_list_lock());
        assert!(!repo.backend().exists("client-list/lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_interpret_generation_spec() {
        let mut repo = repo_with_clients(&["alice"]).await;
        assert!(matches!(
            repo.interpret_generation_spec("alice", "latest").await,
            Err(Error::ClientHasNoGenerations { .. })
        ));
        repo.lock_client("alice").await.unwrap();
        let gen_id = repo.start_generation("alice").await.unwrap();
        repo.commit_client("alice").await.unwrap();

        let spec = repo.make_generation_spec(&gen_id);
        assert_eq!(repo.interpret_generation_spec("alice", &spec).await.unwrap(), gen_id);
        assert_eq!(repo.interpret_generation_spec("alice", "latest").await.unwrap(), gen_id);
        assert!(matches!(
            repo.interpret_generation_spec("alice", "nope").await,
            Err(Error::GenerationDoesNotExist { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_conflict_between_sessions() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut first = Repository::init(backend.clone(), settings(), Hooks::new()).await.unwrap();
        first.lock_client_list().await.unwrap();
        first.add_client("alice").await.unwrap();
        first.commit_client_list().await.unwrap();

        let mut second = Repository::open(backend, settings(), Hooks::new()).await.unwrap();
        first.lock_client("alice").await.unwrap();
        assert!(matches!(
            second.lock_client("alice").await,
            Err(Error::ClientLockingFailed { .. })
        ));
        assert!(second.force_client_lock("alice").await.unwrap());
        second.lock_client("alice").await.unwrap();
        second.unlock_client("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_shows_commits_from_other_sessions() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut reader = Repository::init(backend.clone(), settings(), Hooks::new()).await.unwrap();
        reader.lock_client_list().await.unwrap();
        reader.add_client("alice").await.unwrap();
        reader.commit_client_list().await.unwrap();
        assert!(reader.get_client_generation_ids("alice").await.unwrap().is_empty());
        assert_eq!(reader.get_client_names().await.unwrap(), vec!["alice"]);

        let mut writer = Repository::open(backend, settings(), Hooks::new()).await.unwrap();
        writer.lock_client_list().await.unwrap();
        writer.add_client("bob").await.unwrap();
        writer.commit_client_list().await.unwrap();
        writer.lock_client("alice").await.unwrap();
        let gen_id = writer.start_generation("alice").await.unwrap();
        writer.commit_client("alice").await.unwrap();

        assert!(reader.get_client_generation_ids("alice").await.unwrap().is_empty());
        assert_eq!(reader.get_client_names().await.unwrap(), vec!["alice"]);

        reader.refresh();
        assert_eq!(reader.get_client_generation_ids("alice").await.unwrap(), vec![gen_id]);
        assert_eq!(reader.get_client_names().await.unwrap(), vec!["alice", "bob"]);
    }
}
