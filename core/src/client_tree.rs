use std::collections::{BTreeSet, HashSet};

use crate::repo_fs::RepositoryFs;
use crate::tree::{Forest, Key};
use crate::types::ChunkId;
use crate::{Error, Result};

const PREFIX_FS_META: u8 = 0;
const PREFIX_CHUNK_REF: u8 = 1;
const PREFIX_GEN_META: u8 = 2;

const FILE_NAME: u8 = 0;
const FILE_CHUNKS: u8 = 1;
const FILE_METADATA: u8 = 3;
const DIR_CONTENTS: u8 = 4;

/// Main key under which generation bookkeeping values live.
const GEN_MAIN: u64 = 0;

pub const GEN_ID: u64 = 0;
pub const GEN_STARTED: u64 = 1;
pub const GEN_ENDED: u64 = 2;
pub const GEN_IS_CHECKPOINT: u64 = 3;
pub const GEN_FILE_COUNT: u64 = 4;
pub const GEN_TOTAL_DATA: u64 = 5;

/// Split an absolute path into its parent and last component. The root is its
/// own parent.
pub fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return ("/".to_string(), String::new());
    }
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(i) => (trimmed[..i].to_string(), trimmed[i + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

pub fn join_child(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn hash_prefix(data: &[u8]) -> [u8; 4] {
    let hash = blake3::hash(data);
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.as_bytes()[..4]);
    out
}

/// Default file id of a path: four hash bytes of the parent, four of the
/// basename, so entries of one directory cluster together in the tree.
pub fn default_file_id(path: &str) -> u64 {
    let (parent, base) = split_path(path);
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&hash_prefix(parent.as_bytes()));
    bytes[4..].copy_from_slice(&hash_prefix(base.as_bytes()));
    u64::from_be_bytes(bytes)
}

fn fs_key(file_id: u64, subtype: u8, subkey: u64) -> Key {
    Key::new(PREFIX_FS_META, file_id, subtype, subkey)
}

fn chunk_ref_key(chunk_id: ChunkId, file_id: u64) -> Key {
    Key::new(PREFIX_CHUNK_REF, chunk_id.value(), 0, file_id)
}

fn gen_key(subkey: u64) -> Key {
    Key::new(PREFIX_GEN_META, GEN_MAIN, 0, subkey)
}

fn decode_chunk_group(value: &[u8]) -> Vec<ChunkId> {
    value
        .chunks_exact(8)
        .map(|raw| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            ChunkId::new(u64::from_be_bytes(buf))
        })
        .collect()
}

fn encode_chunk_group(ids: &[ChunkId]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.value().to_be_bytes()).collect()
}

/// Per-client forest of generation trees holding file metadata, chunk lists,
/// directory listings and chunk back-references. Generation numbers are tree ids.
pub struct ClientMetadataTree {
    fs: RepositoryFs,
    dirname: String,
    node_size: usize,
    forest: Option<Forest>,
    current: Option<u64>,
}

impl ClientMetadataTree {
    pub fn new(fs: RepositoryFs, dirname: &str, node_size: usize) -> Self {
        Self {
            fs,
            dirname: dirname.to_string(),
            node_size,
            forest: None,
            current: None,
        }
    }

    fn chunks_per_key(&self) -> usize {
        (self.node_size / 4).max(1)
    }

    async fn forest(&mut self) -> Result<&mut Forest> {
        if self.forest.is_none() {
            let forest = Forest::open(self.fs.clone(), &self.dirname, self.node_size).await?;
            self.forest = Some(forest);
        }
        self.forest
            .as_mut()
            .ok_or_else(|| Error::Other("client forest failed to open".to_string()))
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.current
    }

    fn require_current(&self) -> Result<u64> {
        self.current
            .ok_or_else(|| Error::Other(format!("{}: no generation in progress", self.dirname)))
    }

    pub async fn list_generations(&mut self) -> Result<Vec<u64>> {
        Ok(self.forest().await?.tree_ids())
    }

    pub async fn has_generation(&mut self, generation: u64) -> Result<bool> {
        Ok(self.forest().await?.has_tree(generation))
    }

    /// Start a new generation as a copy of the latest one. Bookkeeping values
    /// are not inherited.
    pub async fn start_generation(&mut self) -> Result<u64> {
        let forest = self.forest().await?;
        let previous = forest.tree_ids().last().copied();
        let generation = forest.new_tree(previous)?;
        forest
            .remove_range(generation, &gen_key(0), &gen_key(u64::MAX))
            .await?;
        forest
            .insert(generation, gen_key(GEN_ID), generation.to_be_bytes().to_vec())
            .await?;
        self.current = Some(generation);
        Ok(generation)
    }

    pub async fn set_generation_value(&mut self, subkey: u64, value: u64) -> Result<()> {
        let generation = self.require_current()?;
        self.forest()
            .await?
            .insert(generation, gen_key(subkey), value.to_be_bytes().to_vec())
            .await
    }

    pub async fn generation_value(&mut self, generation: u64, subkey: u64) -> Result<Option<u64>> {
        let value = self.forest().await?.lookup(generation, &gen_key(subkey)).await?;
        Ok(value.and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok().map(u64::from_be_bytes)))
    }

    pub async fn get_file_id(&mut self, generation: u64, path: &str) -> Result<Option<u64>> {
        let default_id = default_file_id(path);
        let records = self
            .forest()
            .await?
            .lookup_range(
                generation,
                &fs_key(default_id, FILE_NAME, 0),
                &fs_key(default_id, FILE_NAME, u64::MAX),
            )
            .await?;
        Ok(records
            .into_iter()
            .find(|(_, name)| name.as_slice() == path.as_bytes())
            .map(|(key, _)| key.subkey()))
    }

    async fn set_file_id(&mut self, generation: u64, path: &str) -> Result<u64> {
        if let Some(file_id) = self.get_file_id(generation, path).await? {
            return Ok(file_id);
        }
        let default_id = default_file_id(path);
        let forest = self.forest().await?;
        let taken: HashSet<u64> = forest
            .lookup_range(
                generation,
                &fs_key(default_id, FILE_NAME, 0),
                &fs_key(default_id, FILE_NAME, u64::MAX),
            )
            .await?
            .into_iter()
            .map(|(key, _)| key.subkey())
            .collect();
        let mut file_id = default_id;
        while taken.contains(&file_id) {
            file_id = rand::random::<u64>();
        }
        forest
            .insert(
                generation,
                fs_key(default_id, FILE_NAME, file_id),
                path.as_bytes().to_vec(),
            )
            .await?;
        Ok(file_id)
    }

    pub async fn get_metadata(&mut self, generation: u64, path: &str) -> Result<Option<Vec<u8>>> {
        let Some(file_id) = self.get_file_id(generation, path).await? else {
            return Ok(None);
        };
        self.forest()
            .await?
            .lookup(generation, &fs_key(file_id, FILE_METADATA, 0))
            .await
    }

    pub async fn file_exists(&mut self, generation: u64, path: &str) -> Result<bool> {
        Ok(self.get_metadata(generation, path).await?.is_some())
    }

    /// Add or update `path` in the current generation and link it into its
    /// parent's listing. Writing identical metadata is a no-op.
    pub async fn create(&mut self, path: &str, encoded: &[u8]) -> Result<()> {
        let generation = self.require_current()?;
        let file_id = self.set_file_id(generation, path).await?;
        self.forest()
            .await?
            .insert(generation, fs_key(file_id, FILE_METADATA, 0), encoded.to_vec())
            .await?;

        let (parent, basename) = split_path(path);
        if parent != path {
            let parent_id = self.set_file_id(generation, &parent).await?;
            self.forest()
                .await?
                .insert(
                    generation,
                    fs_key(parent_id, DIR_CONTENTS, file_id),
                    basename.into_bytes(),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn set_metadata(&mut self, path: &str, encoded: &[u8]) -> Result<()> {
        self.create(path, encoded).await
    }

    /// Remove `path` and everything below it from the current generation.
    /// Removing a missing path does nothing.
    pub async fn remove(&mut self, path: &str) -> Result<()> {
        let generation = self.require_current()?;
        let mut order = Vec::new();
        let mut pending = vec![path.to_string()];
        while let Some(entry) = pending.pop() {
            for child in self.listdir(generation, &entry).await? {
                pending.push(join_child(&entry, &child));
            }
            order.push(entry);
        }
        for entry in order.iter().rev() {
            self.remove_one(generation, entry).await?;
        }
        Ok(())
    }

    async fn remove_one(&mut self, generation: u64, path: &str) -> Result<()> {
        let Some(file_id) = self.get_file_id(generation, path).await? else {
            return Ok(());
        };
        let chunk_ids = self.get_file_chunks(generation, path).await?;
        let forest = self.forest().await?;
        for chunk_id in chunk_ids {
            forest.remove(generation, &chunk_ref_key(chunk_id, file_id)).await?;
        }
        forest
            .remove_range(
                generation,
                &fs_key(file_id, FILE_CHUNKS, 0),
                &fs_key(file_id, DIR_CONTENTS, u64::MAX),
            )
            .await?;
        forest
            .remove(generation, &fs_key(default_file_id(path), FILE_NAME, file_id))
            .await?;

        let (parent, _) = split_path(path);
        if parent != path {
            if let Some(parent_id) = self.get_file_id(generation, &parent).await? {
                self.forest()
                    .await?
                    .remove(generation, &fs_key(parent_id, DIR_CONTENTS, file_id))
                    .await?;
            }
        }
        Ok(())
    }

    /// Names of the entries in directory `dir`, sorted.
    pub async fn listdir(&mut self, generation: u64, dir: &str) -> Result<Vec<String>> {
        let Some(dir_id) = self.get_file_id(generation, dir).await? else {
            return Ok(Vec::new());
        };
        let records = self
            .forest()
            .await?
            .lookup_range(
                generation,
                &fs_key(dir_id, DIR_CONTENTS, 0),
                &fs_key(dir_id, DIR_CONTENTS, u64::MAX),
            )
            .await?;
        let mut names: Vec<String> = records
            .into_iter()
            .map(|(_, name)| String::from_utf8_lossy(&name).into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn get_file_chunks(&mut self, generation: u64, path: &str) -> Result<Vec<ChunkId>> {
        let Some(file_id) = self.get_file_id(generation, path).await? else {
            return Ok(Vec::new());
        };
        let groups = self
            .forest()
            .await?
            .lookup_range(
                generation,
                &fs_key(file_id, FILE_CHUNKS, 0),
                &fs_key(file_id, FILE_CHUNKS, u64::MAX),
            )
            .await?;
        Ok(groups
            .iter()
            .flat_map(|(_, value)| decode_chunk_group(value))
            .collect())
    }

    async fn require_file_id(&mut self, generation: u64, path: &str) -> Result<u64> {
        self.get_file_id(generation, path)
            .await?
            .ok_or_else(|| Error::Other(format!("{path}: not in generation {generation}")))
    }

    pub async fn set_file_chunks(&mut self, path: &str, chunk_ids: &[ChunkId]) -> Result<()> {
        let generation = self.require_current()?;
        let file_id = self.require_file_id(generation, path).await?;
        let old = self.get_file_chunks(generation, path).await?;
        let forest = self.forest().await?;
        for chunk_id in old {
            forest.remove(generation, &chunk_ref_key(chunk_id, file_id)).await?;
        }
        forest
            .remove_range(
                generation,
                &fs_key(file_id, FILE_CHUNKS, 0),
                &fs_key(file_id, FILE_CHUNKS, u64::MAX),
            )
            .await?;
        self.append_file_chunks(path, chunk_ids).await
    }

    /// Append chunk ids, topping up the last group before starting new ones.
    pub async fn append_file_chunks(&mut self, path: &str, chunk_ids: &[ChunkId]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let generation = self.require_current()?;
        let file_id = self.require_file_id(generation, path).await?;
        let per_key = self.chunks_per_key();
        let forest = self.forest().await?;

        let groups = forest
            .lookup_range(
                generation,
                &fs_key(file_id, FILE_CHUNKS, 0),
                &fs_key(file_id, FILE_CHUNKS, u64::MAX),
            )
            .await?;
        let (mut index, mut group) = match groups.last() {
            Some((key, value)) if value.len() / 8 < per_key => {
                (key.subkey(), decode_chunk_group(value))
            }
            Some((key, _)) => (key.subkey() + 1, Vec::new()),
            None => (0, Vec::new()),
        };

        for chunk_id in chunk_ids {
            group.push(*chunk_id);
            if group.len() == per_key {
                forest
                    .insert(generation, fs_key(file_id, FILE_CHUNKS, index), encode_chunk_group(&group))
                    .await?;
                index += 1;
                group.clear();
            }
            forest
                .insert(generation, chunk_ref_key(*chunk_id, file_id), Vec::new())
                .await?;
        }
        if !group.is_empty() {
            forest
                .insert(generation, fs_key(file_id, FILE_CHUNKS, index), encode_chunk_group(&group))
                .await?;
        }
        Ok(())
    }

    pub async fn chunk_in_use(&mut self, generation: u64, chunk_id: ChunkId) -> Result<bool> {
        let forest = self.forest().await?;
        Ok(!forest
            .range_is_empty(
                generation,
                &chunk_ref_key(chunk_id, 0),
                &chunk_ref_key(chunk_id, u64::MAX),
            )
            .await?)
    }

    pub async fn list_chunks_in_generation(&mut self, generation: u64) -> Result<BTreeSet<ChunkId>> {
        let refs = self
            .forest()
            .await?
            .lookup_range(
                generation,
                &Key::new(PREFIX_CHUNK_REF, 0, 0, 0),
                &Key::new(PREFIX_CHUNK_REF, u64::MAX, u8::MAX, u64::MAX),
            )
            .await?;
        Ok(refs.into_iter().map(|(key, _)| ChunkId::new(key.main())).collect())
    }

    /// Encoded metadata of every file in a generation.
    pub async fn metadata_records(&mut self, generation: u64) -> Result<Vec<Vec<u8>>> {
        let records = self
            .forest()
            .await?
            .lookup_range(
                generation,
                &fs_key(0, 0, 0),
                &fs_key(u64::MAX, u8::MAX, u64::MAX),
            )
            .await?;
        Ok(records
            .into_iter()
            .filter(|(key, _)| key.subtype() == FILE_METADATA)
            .map(|(_, value)| value)
            .collect())
    }

    pub async fn remove_generation(&mut self, generation: u64) -> Result<()> {
        self.forest().await?.remove_tree(generation)?;
        if self.current == Some(generation) {
            self.current = None;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        if let Some(forest) = self.forest.as_mut() {
            forest.commit().await?;
        }
        self.discard();
        Ok(())
    }

    /// Forget staged changes and cached state.
    pub fn discard(&mut self) {
        self.forest = None;
        self.current = None;
    }
}
