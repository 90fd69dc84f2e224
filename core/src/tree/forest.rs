use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::node::{Key, Node, NodeId};
use crate::repo_fs::RepositoryFs;
use crate::{Error, Result};

const FOREST_FILE: &str = "forest";
const NODES_DIR: &str = "nodes";
const MIN_NODE_SIZE: usize = 4;
const CACHE_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRecord {
    pub id: u64,
    pub root: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForestMeta {
    trees: Vec<TreeRecord>,
    refcounts: BTreeMap<NodeId, u32>,
    next_node_id: NodeId,
    next_tree_id: u64,
}

impl Default for ForestMeta {
    fn default() -> Self {
        Self {
            trees: Vec::new(),
            refcounts: BTreeMap::new(),
            next_node_id: 1,
            next_tree_id: 1,
        }
    }
}

/// A set of copy-on-write B+trees sharing nodes through reference counts.
///
/// Persisted nodes are never modified. A write shadows every node on the path
/// from the root to the leaf that is either already persisted or shared with
/// another tree, so cloning a tree is O(1) and older trees stay intact.
/// Nothing reaches storage before `commit`; dropping the forest discards all
/// staged changes.
pub struct Forest {
    fs: RepositoryFs,
    dirname: String,
    max_entries: usize,
    meta: ForestMeta,
    nodes: HashMap<NodeId, Arc<Node>>,
    dirty: HashSet<NodeId>,
    freed: Vec<NodeId>,
}

impl Forest {
    pub async fn open(fs: RepositoryFs, dirname: &str, max_entries: usize) -> Result<Self> {
        let meta_path = format!("{dirname}/{FOREST_FILE}");
        let meta = match fs.read(&meta_path).await {
            Ok(blob) => bincode::deserialize(&blob)?,
            Err(e) if e.is_not_found() => ForestMeta::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            fs,
            dirname: dirname.to_string(),
            max_entries: max_entries.max(MIN_NODE_SIZE),
            meta,
            nodes: HashMap::new(),
            dirty: HashSet::new(),
            freed: Vec::new(),
        })
    }

    fn node_path(&self, id: NodeId) -> String {
        format!("{}/{NODES_DIR}/{:x}/{id:016x}", self.dirname, id >> 10)
    }

    pub fn tree_ids(&self) -> Vec<u64> {
        self.meta.trees.iter().map(|t| t.id).collect()
    }

    pub fn has_tree(&self, tree: u64) -> bool {
        self.meta.trees.iter().any(|t| t.id == tree)
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.freed.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn staged_node_count(&self) -> usize {
        self.dirty.len()
    }

    fn tree_index(&self, tree: u64) -> Result<usize> {
        self.meta
            .trees
            .iter()
            .position(|t| t.id == tree)
            .ok_or_else(|| Error::Other(format!("no tree {tree} in {}", self.dirname)))
    }

    fn refcount(&self, id: NodeId) -> u32 {
        self.meta.refcounts.get(&id).copied().unwrap_or(0)
    }

    fn incref(&mut self, id: NodeId) {
        *self.meta.refcounts.entry(id).or_insert(0) += 1;
    }

    /// Drop one reference. Unreferenced nodes created in this session vanish
    /// at once; persisted ones are released at commit.
    fn decref(&mut self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            match self.refcount(id) {
                count if count > 1 => {
                    self.meta.refcounts.insert(id, count - 1);
                    continue;
                }
                _ => {
                    self.meta.refcounts.remove(&id);
                }
            }
            if self.dirty.remove(&id) {
                if let Some(node) = self.nodes.remove(&id) {
                    if let Node::Index { children, .. } = &*node {
                        pending.extend(children.iter().copied());
                    }
                }
            } else {
                self.freed.push(id);
            }
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = self.meta.next_node_id;
        self.meta.next_node_id += 1;
        self.nodes.insert(id, Arc::new(node));
        self.dirty.insert(id);
        id
    }

    async fn get_node(&mut self, id: NodeId) -> Result<Arc<Node>> {
        if let Some(node) = self.nodes.get(&id) {
            return Ok(node.clone());
        }
        let blob = self.fs.read(&self.node_path(id)).await.map_err(|e| {
            if e.is_not_found() {
                Error::Corrupted(format!("{}: node {id:016x} is missing", self.dirname))
            } else {
                e
            }
        })?;
        let node: Arc<Node> = Arc::new(bincode::deserialize(&blob)?);
        self.nodes.insert(id, node.clone());
        Ok(node)
    }

    /// Drop clean nodes from the cache once it grows large. Only called
    /// between operations, since a write needs its whole path loaded.
    fn trim_cache(&mut self) {
        if self.nodes.len() >= CACHE_LIMIT {
            let dirty = &self.dirty;
            self.nodes.retain(|id, _| dirty.contains(id));
        }
    }

    fn cached(&self, id: NodeId) -> Result<Arc<Node>> {
        self.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Other(format!("node {id:016x} is not loaded")))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .map(Arc::make_mut)
            .ok_or_else(|| Error::Other(format!("node {id:016x} is not loaded")))
    }

    /// Start a new tree, empty or sharing every node of `from`.
    pub fn new_tree(&mut self, from: Option<u64>) -> Result<u64> {
        let root = match from {
            Some(tree) => self.meta.trees[self.tree_index(tree)?].root,
            None => self.alloc(Node::empty_leaf()),
        };
        self.incref(root);
        let id = self.meta.next_tree_id;
        self.meta.next_tree_id += 1;
        self.meta.trees.push(TreeRecord { id, root });
        debug!(dir = %self.dirname, tree = id, ?from, "Created tree");
        Ok(id)
    }

    pub fn remove_tree(&mut self, tree: u64) -> Result<()> {
        let idx = self.tree_index(tree)?;
        let record = self.meta.trees.remove(idx);
        self.decref(record.root);
        debug!(dir = %self.dirname, tree, "Removed tree");
        Ok(())
    }

    /// Root-to-leaf path for `key`: node ids with the child slot taken at each index node.
    async fn descend(&mut self, root: NodeId, key: &Key) -> Result<Vec<(NodeId, usize)>> {
        let mut path = Vec::new();
        let mut id = root;
        loop {
            let node = self.get_node(id).await?;
            match &*node {
                Node::Leaf { .. } => {
                    path.push((id, 0));
                    return Ok(path);
                }
                Node::Index { keys, children } => {
                    if children.is_empty() {
                        return Err(Error::Corrupted(format!("empty index node {id:016x}")));
                    }
                    let slot = Node::child_slot(keys, key).unwrap_or(0);
                    path.push((id, slot));
                    id = children[slot];
                }
            }
        }
    }

    fn needs_shadow(&self, id: NodeId) -> bool {
        !self.dirty.contains(&id) || self.refcount(id) > 1
    }

    /// Shadow every node on `path` that is persisted or shared, relinking
    /// parents (or the tree root) to the private copies.
    fn make_writable(&mut self, tree_idx: usize, path: &mut [(NodeId, usize)]) -> Result<()> {
        for level in 0..path.len() {
            let id = path[level].0;
            if !self.needs_shadow(id) {
                continue;
            }
            let copy = (*self.cached(id)?).clone();
            if let Node::Index { children, .. } = &copy {
                for child in children {
                    self.incref(*child);
                }
            }
            let new_id = self.alloc(copy);
            self.incref(new_id);
            if level == 0 {
                self.meta.trees[tree_idx].root = new_id;
            } else {
                let (parent, slot) = path[level - 1];
                if let Node::Index { children, .. } = self.node_mut(parent)? {
                    children[slot] = new_id;
                }
            }
            self.decref(id);
            path[level].0 = new_id;
        }
        Ok(())
    }

    pub async fn lookup(&mut self, tree: u64, key: &Key) -> Result<Option<Vec<u8>>> {
        self.trim_cache();
        let mut id = self.meta.trees[self.tree_index(tree)?].root;
        loop {
            let node = self.get_node(id).await?;
            match &*node {
                Node::Leaf { entries } => {
                    return Ok(entries
                        .binary_search_by(|(k, _)| k.cmp(key))
                        .ok()
                        .map(|i| entries[i].1.clone()));
                }
                Node::Index { keys, children } => match Node::child_slot(keys, key) {
                    Some(slot) => id = children[slot],
                    None => return Ok(None),
                },
            }
        }
    }

    /// All entries with `min <= key <= max`, in key order.
    pub async fn lookup_range(&mut self, tree: u64, min: &Key, max: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        self.trim_cache();
        let mut found = Vec::new();
        let mut stack = vec![self.meta.trees[self.tree_index(tree)?].root];
        while let Some(id) = stack.pop() {
            let node = self.get_node(id).await?;
            match &*node {
                Node::Leaf { entries } => {
                    let start = entries.partition_point(|(k, _)| k < min);
                    for (k, v) in &entries[start..] {
                        if k > max {
                            break;
                        }
                        found.push((*k, v.clone()));
                    }
                }
                Node::Index { keys, children } => {
                    for i in (0..children.len()).rev() {
                        if keys[i] > *max {
                            continue;
                        }
                        if i + 1 < keys.len() && keys[i + 1] <= *min {
                            continue;
                        }
                        stack.push(children[i]);
                    }
                }
            }
        }
        Ok(found)
    }

    pub async fn count_range(&mut self, tree: u64, min: &Key, max: &Key) -> Result<usize> {
        Ok(self.lookup_range(tree, min, max).await?.len())
    }

    pub async fn range_is_empty(&mut self, tree: u64, min: &Key, max: &Key) -> Result<bool> {
        Ok(self.count_range(tree, min, max).await? == 0)
    }

    pub async fn insert(&mut self, tree: u64, key: Key, value: Vec<u8>) -> Result<()> {
        self.trim_cache();
        let idx = self.tree_index(tree)?;
        let root = self.meta.trees[idx].root;
        let mut path = self.descend(root, &key).await?;
        let leaf = path[path.len() - 1].0;
        if let Node::Leaf { entries } = &*self.cached(leaf)? {
            if let Ok(i) = entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                if entries[i].1 == value {
                    return Ok(());
                }
            }
        }

        self.make_writable(idx, &mut path)?;
        let leaf = path[path.len() - 1].0;
        if let Node::Leaf { entries } = self.node_mut(leaf)? {
            match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(i) => entries[i].1 = value,
                Err(i) => entries.insert(i, (key, value)),
            }
        }
        for &(id, slot) in &path[..path.len() - 1] {
            if let Node::Index { keys, .. } = self.node_mut(id)? {
                if key < keys[slot] {
                    keys[slot] = key;
                }
            }
        }

        let mut level = path.len() - 1;
        loop {
            let id = path[level].0;
            if self.cached(id)?.len() <= self.max_entries {
                break;
            }
            let (first, upper) = self.node_mut(id)?.split();
            let upper_id = self.alloc(upper);
            self.incref(upper_id);
            if level == 0 {
                let lower_first = self.cached(id)?.first_key().unwrap_or(first);
                let new_root = self.alloc(Node::Index {
                    keys: vec![lower_first, first],
                    children: vec![id, upper_id],
                });
                self.incref(new_root);
                self.meta.trees[idx].root = new_root;
                break;
            }
            let (parent, slot) = path[level - 1];
            if let Node::Index { keys, children } = self.node_mut(parent)? {
                keys.insert(slot + 1, first);
                children.insert(slot + 1, upper_id);
            }
            level -= 1;
        }
        Ok(())
    }

    /// Remove one key. Returns whether it was present; an absent key changes nothing.
    pub async fn remove(&mut self, tree: u64, key: &Key) -> Result<bool> {
        self.trim_cache();
        let idx = self.tree_index(tree)?;
        let root = self.meta.trees[idx].root;
        let mut path = self.descend(root, key).await?;
        let leaf = path[path.len() - 1].0;
        let present = match &*self.cached(leaf)? {
            Node::Leaf { entries } => entries.binary_search_by(|(k, _)| k.cmp(key)).is_ok(),
            Node::Index { .. } => false,
        };
        if !present {
            return Ok(false);
        }

        self.make_writable(idx, &mut path)?;
        let leaf = path[path.len() - 1].0;
        if let Node::Leaf { entries } = self.node_mut(leaf)? {
            if let Ok(i) = entries.binary_search_by(|(k, _)| k.cmp(key)) {
                entries.remove(i);
            }
        }

        let mut level = path.len() - 1;
        while level > 0 && self.cached(path[level].0)?.is_empty() {
            let (parent, slot) = path[level - 1];
            let child = path[level].0;
            if let Node::Index { keys, children } = self.node_mut(parent)? {
                keys.remove(slot);
                children.remove(slot);
            }
            self.decref(child);
            level -= 1;
        }
        self.collapse_root(idx).await?;
        Ok(true)
    }

    pub async fn remove_range(&mut self, tree: u64, min: &Key, max: &Key) -> Result<usize> {
        let keys: Vec<Key> = self
            .lookup_range(tree, min, max)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in &keys {
            self.remove(tree, key).await?;
        }
        Ok(keys.len())
    }

    /// Replace an index root that has one child by that child, and an index
    /// root with no children by an empty leaf.
    async fn collapse_root(&mut self, idx: usize) -> Result<()> {
        loop {
            let root = self.meta.trees[idx].root;
            let node = self.get_node(root).await?;
            let replacement = match &*node {
                Node::Index { children, .. } if children.len() == 1 => children[0],
                Node::Index { children, .. } if children.is_empty() => {
                    self.alloc(Node::empty_leaf())
                }
                _ => return Ok(()),
            };
            self.incref(replacement);
            self.meta.trees[idx].root = replacement;
            self.decref(root);
        }
    }

    /// Persist new nodes, then the forest metadata, then delete released nodes.
    pub async fn commit(&mut self) -> Result<()> {
        let mut garbage = Vec::new();
        let mut seen = HashSet::new();
        while let Some(id) = self.freed.pop() {
            if !seen.insert(id) || self.meta.refcounts.contains_key(&id) {
                continue;
            }
            let node = self.get_node(id).await?;
            if let Node::Index { children, .. } = &*node {
                for child in children {
                    self.decref(*child);
                }
            }
            self.nodes.remove(&id);
            garbage.push(id);
        }

        let dirty: Vec<NodeId> = self.dirty.drain().collect();
        for id in &dirty {
            let blob = bincode::serialize(&*self.cached(*id)?)?;
            self.fs.overwrite(&self.node_path(*id), &blob).await?;
        }

        let blob = bincode::serialize(&self.meta)?;
        self.fs
            .overwrite(&format!("{}/{FOREST_FILE}", self.dirname), &blob)
            .await?;

        for id in &garbage {
            match self.fs.delete(&self.node_path(*id)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        debug!(
            dir = %self.dirname,
            written = dirty.len(),
            deleted = garbage.len(),
            trees = self.meta.trees.len(),
            "Committed forest"
        );
        Ok(())
    }
}
