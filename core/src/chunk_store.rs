use futures::stream::{self, Stream, TryStreamExt};
use std::collections::VecDeque;
use tracing::debug;

use crate::backend::join_path;
use crate::lock::LOCK_NAME;
use crate::repo_fs::RepositoryFs;
use crate::types::{ChunkId, RepositorySettings};
use crate::{Error, Result};

pub const CHUNKS_DIR: &str = "chunks";

/// Maps a numeric id onto a sharded pathname so no directory grows too large.
/// `depth` levels of directories, each named by `bits` bits of the id after
/// skipping the lowest `skip` bits, so consecutive ids share a leaf directory.
#[derive(Debug, Clone)]
pub struct IdPath {
    dirname: String,
    depth: u32,
    bits: u32,
    skip: u32,
}

impl IdPath {
    pub fn new(dirname: &str, depth: u32, bits: u32, skip: u32) -> Self {
        Self {
            dirname: dirname.to_string(),
            depth,
            bits,
            skip,
        }
    }

    pub fn convert(&self, id: u64) -> String {
        let mask = if self.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        };
        let mut path = self.dirname.clone();
        for level in 0..self.depth {
            let shift = self.skip + level * self.bits;
            let part = id.checked_shr(shift).unwrap_or(0) & mask;
            path = join_path(&path, &format!("{part:x}"));
        }
        join_path(&path, &format!("{id:016x}"))
    }
}

/// Content-agnostic blob storage keyed by chunk id.
pub struct ChunkStore {
    fs: RepositoryFs,
    idpath: IdPath,
    prev_id: Option<u64>,
}

impl ChunkStore {
    pub fn new(fs: RepositoryFs, settings: &RepositorySettings) -> Self {
        Self {
            fs,
            idpath: IdPath::new(
                CHUNKS_DIR,
                settings.idpath_depth,
                settings.idpath_bits,
                settings.idpath_skip,
            ),
            prev_id: None,
        }
    }

    fn chunk_path(&self, chunk_id: ChunkId) -> String {
        self.idpath.convert(chunk_id.value())
    }

    /// Next candidate id: random for the first chunk of a session, then
    /// sequential so a run of chunks lands in the same directory.
    fn next_candidate(&mut self) -> u64 {
        let candidate = match self.prev_id {
            Some(prev) => prev.wrapping_add(1) % u64::MAX,
            None => ChunkId::random().value(),
        };
        self.prev_id = Some(candidate);
        candidate
    }

    pub async fn put_chunk_content(&mut self, data: &[u8]) -> Result<ChunkId> {
        self.fs.create_and_init_toplevel(CHUNKS_DIR).await?;
        loop {
            let chunk_id = ChunkId::new(self.next_candidate());
            match self.fs.write(&self.chunk_path(chunk_id), data).await {
                Ok(()) => {
                    debug!(chunk_id = %chunk_id, size = data.len(), "Stored chunk");
                    return Ok(chunk_id);
                }
                Err(e) if e.is_already_exists() => {
                    debug!(chunk_id = %chunk_id, "Chunk id taken, picking a new one");
                    self.prev_id = Some(ChunkId::random().value());
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_chunk_content(&self, chunk_id: ChunkId) -> Result<Vec<u8>> {
        match self.fs.read(&self.chunk_path(chunk_id)).await {
            Err(e) if e.is_not_found() => Err(Error::ChunkDoesNotExist { chunk_id }),
            other => other,
        }
    }

    pub async fn has_chunk(&self, chunk_id: ChunkId) -> Result<bool> {
        self.fs.exists(&self.chunk_path(chunk_id)).await
    }

    pub async fn remove_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        match self.fs.delete(&self.chunk_path(chunk_id)).await {
            Err(e) if e.is_not_found() => Err(Error::ChunkDoesNotExist { chunk_id }),
            other => {
                debug!(chunk_id = %chunk_id, "Removed chunk");
                other
            }
        }
    }

    /// Every stored chunk id, yielded while walking the sharded directories.
    /// Calling this again starts a fresh walk.
    pub fn chunk_ids(&self) -> impl Stream<Item = Result<ChunkId>> + '_ {
        let depth = self.idpath.depth;
        let state = (vec![(CHUNKS_DIR.to_string(), 0u32)], VecDeque::<ChunkId>::new());
        stream::try_unfold(state, move |(mut dirs, mut ready)| async move {
            loop {
                if let Some(chunk_id) = ready.pop_front() {
                    return Ok::<_, Error>(Some((chunk_id, (dirs, ready))));
                }
                let Some((dir, level)) = dirs.pop() else {
                    return Ok(None);
                };
                let names = self.fs.list(&dir).await?;
                if level < depth {
                    for name in names.into_iter().rev().filter(|n| n != LOCK_NAME) {
                        dirs.push((join_path(&dir, &name), level + 1));
                    }
                } else {
                    ready.extend(
                        names
                            .iter()
                            .filter(|n| n.len() == 16)
                            .filter_map(|n| u64::from_str_radix(n, 16).ok())
                            .map(ChunkId::new),
                    );
                }
            }
        })
    }

    pub async fn get_chunk_ids(&self) -> Result<Vec<ChunkId>> {
        self.chunk_ids().try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::memory::MemoryBackend;
    use std::sync::Arc;

    fn store() -> ChunkStore {
        let fs = RepositoryFs::new(Arc::new(MemoryBackend::new()), Hooks::new());
        ChunkStore::new(fs, &RepositorySettings::default())
    }

    #[test]
    fn test_idpath_shards_by_skipped_bits() {
        let idpath = IdPath::new("chunks", 3, 12, 13);
        assert_eq!(idpath.convert(0), "chunks/0/0/0/0000000000000000");
        let id = (0xabcu64 << 13) | (0x123u64 << 25) | 0x1fff;
        assert_eq!(idpath.convert(id), format!("chunks/abc/123/0/{id:016x}"));
        assert_eq!(idpath.convert(1), "chunks/0/0/0/0000000000000001");
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let mut store = store();
        let id = store.put_chunk_content(b"xyz").await.unwrap();
        assert!(store.has_chunk(id).await.unwrap());
        assert_eq!(store.get_chunk_content(id).await.unwrap(), b"xyz");

        store.remove_chunk(id).await.unwrap();
        assert!(!store.has_chunk(id).await.unwrap());
        assert!(matches!(
            store.get_chunk_content(id).await,
            Err(Error::ChunkDoesNotExist { .. })
        ));
        assert!(matches!(
            store.remove_chunk(id).await,
            Err(Error::ChunkDoesNotExist { .. })
        ));
    }

    #[tokio::test]
    async fn test_ids_are_sequential_and_listed() {
        let mut store = store();
        let first = store.put_chunk_content(b"a").await.unwrap();
        let second = store.put_chunk_content(b"b").await.unwrap();
        assert_eq!(second.value(), (first.value() + 1) % u64::MAX);

        let mut ids = store.get_chunk_ids().await.unwrap();
        ids.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_collision_picks_fresh_id() {
        let mut store = store();
        let first = store.put_chunk_content(b"a").await.unwrap();
        store.prev_id = Some(first.value().wrapping_sub(1));
        let second = store.put_chunk_content(b"b").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.get_chunk_content(first).await.unwrap(), b"a");
        assert_eq!(store.get_chunk_content(second).await.unwrap(), b"b");
    }
}
