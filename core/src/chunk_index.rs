use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::repo_fs::RepositoryFs;
use crate::types::{Checksum, ChunkId, ClientId};
use crate::{Error, Result};

pub const CHUNK_LIST_DIR: &str = "chunklist";
pub const CHUNK_SUMS_DIR: &str = "chunksums";

const INDEX_FILE: &str = "data";

/// Forward map from chunk id to the checksum of its content.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChunkList {
    checksums: BTreeMap<ChunkId, Checksum>,
}

/// Reverse map of chunk usage: one entry per (checksum, chunk, client).
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChecksumTree {
    usage: BTreeSet<(Checksum, ChunkId, ClientId)>,
}

impl ChecksumTree {
    fn chunks_with(&self, checksum: Checksum) -> impl Iterator<Item = &(Checksum, ChunkId, ClientId)> {
        self.usage
            .range((checksum, ChunkId::MIN, ClientId::MIN)..=(checksum, ChunkId::MAX, ClientId::MAX))
    }

    fn clients_of(
        &self,
        checksum: Checksum,
        chunk_id: ChunkId,
    ) -> impl Iterator<Item = &(Checksum, ChunkId, ClientId)> {
        self.usage
            .range((checksum, chunk_id, ClientId::MIN)..=(checksum, chunk_id, ClientId::MAX))
    }
}

/// The deduplication index: which chunks have which content, and which clients
/// use them. Loaded lazily; changes stay in memory until `commit`.
pub struct ChunkIndexes {
    fs: RepositoryFs,
    chunklist: Option<ChunkList>,
    chunksums: Option<ChecksumTree>,
    dirty: bool,
}

impl ChunkIndexes {
    pub fn new(fs: RepositoryFs) -> Self {
        Self {
            fs,
            chunklist: None,
            chunksums: None,
            dirty: false,
        }
    }

    pub fn dirnames() -> Vec<String> {
        vec![CHUNK_LIST_DIR.to_string(), CHUNK_SUMS_DIR.to_string()]
    }

    async fn load<T>(fs: &RepositoryFs, dir: &str) -> Result<T>
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        let path = format!("{dir}/{INDEX_FILE}");
        match fs.read(&path).await {
            Ok(data) => Ok(bincode::deserialize(&data)?),
            Err(e) if e.is_not_found() => Ok(T::default()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_loaded(&mut self) -> Result<()> {
        if self.chunklist.is_none() {
            self.chunklist = Some(Self::load(&self.fs, CHUNK_LIST_DIR).await?);
        }
        if self.chunksums.is_none() {
            self.chunksums = Some(Self::load(&self.fs, CHUNK_SUMS_DIR).await?);
        }
        Ok(())
    }

    async fn parts(&mut self) -> Result<(&mut ChunkList, &mut ChecksumTree)> {
        self.ensure_loaded().await?;
        match (self.chunklist.as_mut(), self.chunksums.as_mut()) {
            (Some(list), Some(sums)) => Ok((list, sums)),
            _ => Err(Error::Other("chunk indexes failed to load".to_string())),
        }
    }

    pub fn prepare(content: &[u8]) -> Checksum {
        Checksum::of(content)
    }

    /// Record that `client_id` uses `chunk_id`, whose content has `checksum`.
    /// Recording the same usage twice is a no-op.
    pub async fn put(&mut self, chunk_id: ChunkId, checksum: Checksum, client_id: ClientId) -> Result<()> {
        let (list, sums) = self.parts().await?;
        list.checksums.insert(chunk_id, checksum);
        sums.usage.insert((checksum, chunk_id, client_id));
        self.dirty = true;
        Ok(())
    }

    /// Chunk ids recorded with this checksum. Callers must compare bytes before
    /// reusing one: equal checksums are only a candidate match.
    pub async fn find(&mut self, checksum: Checksum) -> Result<Vec<ChunkId>> {
        let (_, sums) = self.parts().await?;
        let ids: BTreeSet<ChunkId> = sums.chunks_with(checksum).map(|(_, id, _)| *id).collect();
        Ok(ids.into_iter().collect())
    }

    pub async fn find_by_content(&mut self, content: &[u8]) -> Result<Vec<ChunkId>> {
        let ids = self.find(Self::prepare(content)).await?;
        if ids.is_empty() {
            return Err(Error::ChunkContentNotInIndexes);
        }
        Ok(ids)
    }

    pub async fn checksum_of(&mut self, chunk_id: ChunkId) -> Result<Option<Checksum>> {
        let (list, _) = self.parts().await?;
        Ok(list.checksums.get(&chunk_id).copied())
    }

    /// Drop one client's usage of a chunk. Returns whether anyone still uses it;
    /// the forward map entry goes away together with the last user.
    pub async fn remove(&mut self, chunk_id: ChunkId, client_id: ClientId) -> Result<bool> {
        let (list, sums) = self.parts().await?;
        let Some(checksum) = list.checksums.get(&chunk_id).copied() else {
            return Ok(false);
        };
        sums.usage.remove(&(checksum, chunk_id, client_id));
        let still_used = sums.clients_of(checksum, chunk_id).next().is_some();
        if !still_used {
            list.checksums.remove(&chunk_id);
        }
        self.dirty = true;
        debug!(chunk_id = %chunk_id, client_id = %client_id, still_used, "Removed chunk usage");
        Ok(still_used)
    }

    pub async fn remove_for_all_clients(&mut self, chunk_id: ChunkId) -> Result<()> {
        let (list, sums) = self.parts().await?;
        if let Some(checksum) = list.checksums.remove(&chunk_id) {
            let users: Vec<_> = sums.clients_of(checksum, chunk_id).copied().collect();
            for entry in users {
                sums.usage.remove(&entry);
            }
            self.dirty = true;
        }
        Ok(())
    }

    pub async fn is_used(&mut self, chunk_id: ChunkId) -> Result<bool> {
        let (list, sums) = self.parts().await?;
        Ok(match list.checksums.get(&chunk_id) {
            Some(checksum) => sums.clients_of(*checksum, chunk_id).next().is_some(),
            None => false,
        })
    }

    pub async fn clients_using(&mut self, chunk_id: ChunkId) -> Result<Vec<ClientId>> {
        let (list, sums) = self.parts().await?;
        Ok(match list.checksums.get(&chunk_id) {
            Some(checksum) => sums
                .clients_of(*checksum, chunk_id)
                .map(|(_, _, client)| *client)
                .collect(),
            None => Vec::new(),
        })
    }

    /// Every chunk id in the forward map.
    pub async fn indexed_chunk_ids(&mut self) -> Result<Vec<ChunkId>> {
        let (list, _) = self.parts().await?;
        Ok(list.checksums.keys().copied().collect())
    }

    pub async fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            self.clear();
            return Ok(());
        }
        if let Some(list) = &self.chunklist {
            let data = bincode::serialize(list)?;
            self.fs.overwrite(&format!("{CHUNK_LIST_DIR}/{INDEX_FILE}"), &data).await?;
        }
        if let Some(sums) = &self.chunksums {
            let data = bincode::serialize(sums)?;
            self.fs.overwrite(&format!("{CHUNK_SUMS_DIR}/{INDEX_FILE}"), &data).await?;
        }
        debug!("Committed chunk indexes");
        self.clear();
        Ok(())
    }

    /// Forget everything not yet committed.
    pub fn clear(&mut self) {
        self.chunklist = None;
        self.chunksums = None;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::memory::MemoryBackend;
    use std::sync::Arc;

    fn indexes() -> ChunkIndexes {
        ChunkIndexes::new(RepositoryFs::new(Arc::new(MemoryBackend::new()), Hooks::new()))
    }

    #[tokio::test]
    async fn test_put_and_find() {
        let mut idx = indexes();
        let checksum = ChunkIndexes::prepare(b"xyz");
        idx.put(ChunkId::new(1), checksum, ClientId::new(7)).await.unwrap();
        idx.put(ChunkId::new(1), checksum, ClientId::new(7)).await.unwrap();

        assert_eq!(idx.find(checksum).await.unwrap(), vec![ChunkId::new(1)]);
        assert_eq!(idx.find_by_content(b"xyz").await.unwrap(), vec![ChunkId::new(1)]);
        assert!(matches!(
            idx.find_by_content(b"other").await,
            Err(Error::ChunkContentNotInIndexes)
        ));
        assert_eq!(idx.checksum_of(ChunkId::new(1)).await.unwrap(), Some(checksum));
    }

    #[tokio::test]
    async fn test_shared_chunk_survives_first_removal() {
        let mut idx = indexes();
        let checksum = ChunkIndexes::prepare(b"shared");
        let chunk = ChunkId::new(42);
        idx.put(chunk, checksum, ClientId::new(1)).await.unwrap();
        idx.put(chunk, checksum, ClientId::new(2)).await.unwrap();

        assert!(idx.remove(chunk, ClientId::new(1)).await.unwrap());
        assert_eq!(idx.clients_using(chunk).await.unwrap(), vec![ClientId::new(2)]);
        assert!(!idx.remove(chunk, ClientId::new(2)).await.unwrap());
        assert!(idx.find(checksum).await.unwrap().is_empty());
        assert_eq!(idx.checksum_of(chunk).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_persists_and_clear_discards() {
        let fs = RepositoryFs::new(Arc::new(MemoryBackend::new()), Hooks::new());
        let mut idx = ChunkIndexes::new(fs.clone());
        let checksum = ChunkIndexes::prepare(b"a");
        idx.put(ChunkId::new(1), checksum, ClientId::new(1)).await.unwrap();
        idx.commit().await.unwrap();

        idx.put(ChunkId::new(2), ChunkIndexes::prepare(b"b"), ClientId::new(1))
            .await
            .unwrap();
        idx.clear();

        let mut reopened = ChunkIndexes::new(fs);
        assert_eq!(reopened.indexed_chunk_ids().await.unwrap(), vec![ChunkId::new(1)]);
        assert!(reopened.is_used(ChunkId::new(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_for_all_clients() {
        let mut idx = indexes();
        let checksum = ChunkIndexes::prepare(b"x");
        idx.put(ChunkId::new(3), checksum, ClientId::new(1)).await.unwrap();
        idx.put(ChunkId::new(3), checksum, ClientId::new(2)).await.unwrap();
        idx.remove_for_all_clients(ChunkId::new(3)).await.unwrap();
        assert!(!idx.is_used(ChunkId::new(3)).await.unwrap());
        assert!(idx.indexed_chunk_ids().await.unwrap().is_empty());
    }
}
