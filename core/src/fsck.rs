use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::client_tree::join_child;
use crate::metadata::{GenerationKey, Metadata};
use crate::repository::Repository;
use crate::types::{Checksum, ChunkId, GenerationId};
use crate::Result;

/// What to check and whether to repair.
#[derive(Debug, Clone, Default)]
pub struct FsckSettings {
    /// Remove orphan chunks and dangling index records. Locks everything.
    pub fix: bool,
    pub ignore_chunks: bool,
    pub ignore_clients: Vec<String>,
    pub last_generation_only: bool,
    pub skip_generations: bool,
    pub skip_dirs: bool,
    pub skip_files: bool,
}

impl FsckSettings {
    /// Orphans can only be identified when every generation was walked.
    fn walks_everything(&self) -> bool {
        !self.ignore_chunks
            && self.ignore_clients.is_empty()
            && !self.last_generation_only
            && !self.skip_generations
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsckIssue {
    pub context: String,
    pub message: String,
}

impl fmt::Display for FsckIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.message)
    }
}

#[derive(Debug, Default)]
pub struct FsckReport {
    pub errors: Vec<FsckIssue>,
    pub warnings: Vec<FsckIssue>,
    pub items_done: u64,
    pub chunks_checked: u64,
    pub orphans_removed: u64,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

type FileRef = (GenerationId, String);

#[derive(Debug, Clone)]
enum WorkItem {
    Repository,
    ClientList,
    Client { name: String },
    GenerationIdsAreDifferent { client: String, ids: Vec<GenerationId> },
    Generation { gen_id: GenerationId },
    Directory { gen_id: GenerationId, path: String },
    File { gen_id: GenerationId, path: String },
    Chunk { chunk_id: ChunkId, file: Option<FileRef> },
    FileChecksum { file: FileRef, expected: String },
    ChunkIndexes,
    ExtraChunks,
}

impl WorkItem {
    fn context(&self) -> String {
        match self {
            WorkItem::Repository => "repository".to_string(),
            WorkItem::ClientList => "client list".to_string(),
            WorkItem::Client { name } => format!("client {name}"),
            WorkItem::GenerationIdsAreDifferent { client, .. } => format!("client {client}"),
            WorkItem::Generation { gen_id } => format!("generation {gen_id}"),
            WorkItem::Directory { gen_id, path } | WorkItem::File { gen_id, path } => {
                format!("{gen_id} {path}")
            }
            WorkItem::Chunk { chunk_id, .. } => format!("chunk {chunk_id}"),
            WorkItem::FileChecksum { file, .. } => format!("{} {}", file.0, file.1),
            WorkItem::ChunkIndexes => "chunk indexes".to_string(),
            WorkItem::ExtraChunks => "chunk store".to_string(),
        }
    }

    /// Items whose failure leaves the reachable chunk set incomplete.
    fn is_structural(&self) -> bool {
        matches!(
            self,
            WorkItem::Repository
                | WorkItem::ClientList
                | WorkItem::Client { .. }
                | WorkItem::Generation { .. }
        )
    }
}

/// Repository integrity checker and garbage collector.
///
/// Work is a queue of items. Items produced while processing one item run
/// before the rest of the queue, so the walk is depth-first and memory stays
/// proportional to tree depth. The orphan-chunk pass always runs last.
pub struct Fsck<'a> {
    repo: &'a mut Repository,
    settings: FsckSettings,
    queue: VecDeque<WorkItem>,
    report: FsckReport,
    referenced: HashSet<ChunkId>,
    checked_chunks: HashSet<ChunkId>,
    hashers: HashMap<FileRef, blake3::Hasher>,
    walk_failed: bool,
    locked: bool,
}

impl<'a> Fsck<'a> {
    pub fn new(repo: &'a mut Repository, settings: FsckSettings) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(WorkItem::Repository);
        queue.push_back(WorkItem::ExtraChunks);
        Self {
            repo,
            settings,
            queue,
            report: FsckReport::default(),
            referenced: HashSet::new(),
            checked_chunks: HashSet::new(),
            hashers: HashMap::new(),
            walk_failed: false,
            locked: false,
        }
    }

    pub fn report(&self) -> &FsckReport {
        &self.report
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    fn error(&mut self, context: String, message: impl Into<String>) {
        let issue = FsckIssue {
            context,
            message: message.into(),
        };
        error!(context = %issue.context, "{}", issue.message);
        self.report.errors.push(issue);
    }

    fn warning(&mut self, context: String, message: impl Into<String>) {
        let issue = FsckIssue {
            context,
            message: message.into(),
        };
        warn!(context = %issue.context, "{}", issue.message);
        self.report.warnings.push(issue);
    }

    /// Process one work item. Returns false once the queue is empty.
    pub async fn step(&mut self) -> Result<bool> {
        if self.settings.fix && !self.locked {
            self.repo.lock_everything().await?;
            self.locked = true;
        }
        let Some(item) = self.queue.pop_front() else {
            return Ok(false);
        };
        let context = item.context();
        match self.check(&item).await {
            Ok(produced) => {
                for next in produced.into_iter().rev() {
                    self.queue.push_front(next);
                }
            }
            Err(e) => {
                if item.is_structural() {
                    self.walk_failed = true;
                }
                self.error(context, e.to_string());
            }
        }
        self.report.items_done += 1;
        Ok(true)
    }

    /// Commit repairs (if any) and hand back the report.
    pub async fn finish(self) -> Result<FsckReport> {
        if self.locked {
            self.repo.commit_everything().await?;
        }
        info!(
            errors = self.report.errors.len(),
            warnings = self.report.warnings.len(),
            items = self.report.items_done,
            "Fsck finished"
        );
        Ok(self.report)
    }

    pub async fn run(mut self) -> Result<FsckReport> {
        while self.step().await? {}
        self.finish().await
    }

    async fn check(&mut self, item: &WorkItem) -> Result<Vec<WorkItem>> {
        debug!(item = %item.context(), "Checking");
        match item {
            WorkItem::Repository => self.check_repository(),
            WorkItem::ClientList => self.check_client_list().await,
            WorkItem::Client { name } => self.check_client(name).await,
            WorkItem::GenerationIdsAreDifferent { client, ids } => {
                self.check_generation_ids(client, ids);
                Ok(Vec::new())
            }
            WorkItem::Generation { gen_id } => self.check_generation(gen_id).await,
            WorkItem::Directory { gen_id, path } => self.check_directory(gen_id, path).await,
            WorkItem::File { gen_id, path } => self.check_file(gen_id, path).await,
            WorkItem::Chunk { chunk_id, file } => {
                self.check_chunk(*chunk_id, file.as_ref()).await?;
                Ok(Vec::new())
            }
            WorkItem::FileChecksum { file, expected } => {
                self.check_file_checksum(file, expected);
                Ok(Vec::new())
            }
            WorkItem::ChunkIndexes => {
                self.check_chunk_indexes().await?;
                Ok(Vec::new())
            }
            WorkItem::ExtraChunks => {
                self.check_extra_chunks().await?;
                Ok(Vec::new())
            }
        }
    }

    fn check_repository(&mut self) -> Result<Vec<WorkItem>> {
        let mut items = vec![WorkItem::ClientList];
        if !self.settings.ignore_chunks {
            items.push(WorkItem::ChunkIndexes);
        }
        Ok(items)
    }

    async fn check_client_list(&mut self) -> Result<Vec<WorkItem>> {
        let mut ids = HashMap::new();
        let mut items = Vec::new();
        for name in self.repo.get_client_names().await? {
            let id = self.repo.get_client_id(&name).await?;
            if let Some(other) = ids.insert(id, name.clone()) {
                self.error(
                    "client list".to_string(),
                    format!("clients {other} and {name} share id {id}"),
                );
            }
            if self.settings.ignore_clients.contains(&name) {
                continue;
            }
            items.push(WorkItem::Client { name });
        }
        Ok(items)
    }

    async fn check_client(&mut self, name: &str) -> Result<Vec<WorkItem>> {
        let ids = self.repo.get_client_generation_ids(name).await?;
        let mut items = vec![WorkItem::GenerationIdsAreDifferent {
            client: name.to_string(),
            ids: ids.clone(),
        }];
        if ids.is_empty() {
            self.warning(format!("client {name}"), "has no generations");
        }
        if self.settings.skip_generations {
            return Ok(items);
        }
        let selected: Vec<GenerationId> = if self.settings.last_generation_only {
            ids.last().cloned().into_iter().collect()
        } else {
            ids
        };
        items.extend(selected.into_iter().map(|gen_id| WorkItem::Generation { gen_id }));
        Ok(items)
    }

    fn check_generation_ids(&mut self, client: &str, ids: &[GenerationId]) {
        let unique: BTreeSet<u64> = ids.iter().map(|id| id.number).collect();
        if unique.len() != ids.len() {
            self.error(format!("client {client}"), "generation ids are not unique");
        }
    }

    async fn check_generation(&mut self, gen_id: &GenerationId) -> Result<Vec<WorkItem>> {
        let context = format!("generation {gen_id}");
        for key in [
            GenerationKey::Started,
            GenerationKey::Ended,
            GenerationKey::FileCount,
            GenerationKey::TotalData,
        ] {
            if self.repo.get_generation_key(gen_id, key).await?.is_none() {
                self.error(context.clone(), format!("has no {key}"));
            }
        }
        if let (Some(started), Some(ended)) = self.repo.get_generation_times(gen_id).await? {
            if started > ended {
                self.error(context.clone(), "ended before it started");
            }
        }
        let chunk_ids = self.repo.get_generation_chunk_ids(gen_id).await?;
        self.referenced.extend(chunk_ids);

        if self.settings.skip_dirs {
            return Ok(Vec::new());
        }
        Ok(vec![WorkItem::Directory {
            gen_id: gen_id.clone(),
            path: "/".to_string(),
        }])
    }

    async fn check_directory(&mut self, gen_id: &GenerationId, path: &str) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        for name in self.repo.listdir(gen_id, path).await? {
            let child = join_child(path, &name);
            let metadata = match self.repo.get_file_metadata(gen_id, &child).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    self.error(format!("{gen_id} {child}"), e.to_string());
                    continue;
                }
            };
            if metadata.is_dir() {
                items.push(WorkItem::Directory {
                    gen_id: gen_id.clone(),
                    path: child,
                });
            } else if !self.settings.skip_files {
                items.push(WorkItem::File {
                    gen_id: gen_id.clone(),
                    path: child,
                });
            }
        }
        Ok(items)
    }

    async fn check_file(&mut self, gen_id: &GenerationId, path: &str) -> Result<Vec<WorkItem>> {
        let metadata: Metadata = self.repo.get_file_metadata(gen_id, path).await?;
        if !metadata.is_file() || self.settings.ignore_chunks {
            return Ok(Vec::new());
        }
        let chunk_ids = self.repo.get_file_chunk_ids(gen_id, path).await?;
        let file = (gen_id.clone(), path.to_string());
        let mut items: Vec<WorkItem> = chunk_ids
            .into_iter()
            .map(|chunk_id| WorkItem::Chunk {
                chunk_id,
                file: Some(file.clone()),
            })
            .collect();
        if let Some(expected) = metadata.checksum {
            self.hashers.insert(file.clone(), blake3::Hasher::new());
            items.push(WorkItem::FileChecksum { file, expected });
        }
        Ok(items)
    }

    async fn check_chunk(&mut self, chunk_id: ChunkId, file: Option<&FileRef>) -> Result<()> {
        let context = format!("chunk {chunk_id}");
        let content = match self.repo.get_chunk_content(chunk_id).await {
            Ok(content) => content,
            Err(e) => {
                if let Some(file) = file {
                    self.hashers.remove(file);
                }
                self.error(context, format!("referenced but unreadable: {e}"));
                return Ok(());
            }
        };
        if let Some(hasher) = file.and_then(|file| self.hashers.get_mut(file)) {
            hasher.update(&content);
        }
        if !self.checked_chunks.insert(chunk_id) {
            return Ok(());
        }
        self.report.chunks_checked += 1;
        match self.repo.get_chunk_checksum(chunk_id).await? {
            Some(expected) if Checksum::of(&content) != expected => {
                self.error(context, "content does not match its checksum");
            }
            Some(_) => {}
            None => self.warning(context, "not in the chunk indexes"),
        }
        Ok(())
    }

    fn check_file_checksum(&mut self, file: &FileRef, expected: &str) {
        // A missing hasher means a chunk was unreadable, already reported.
        let Some(hasher) = self.hashers.remove(file) else {
            return;
        };
        let actual = Checksum::from_hasher(&hasher).to_hex();
        if actual != expected {
            self.error(
                format!("{} {}", file.0, file.1),
                "file content does not match its checksum",
            );
        }
    }

    async fn check_chunk_indexes(&mut self) -> Result<()> {
        for chunk_id in self.repo.get_indexed_chunk_ids().await? {
            if self.repo.has_chunk(chunk_id).await? {
                continue;
            }
            let context = format!("chunk {chunk_id}");
            if self.settings.fix {
                self.repo
                    .remove_chunk_from_indexes_for_all_clients(chunk_id)
                    .await?;
                self.warning(context, "indexed but missing, dropped from indexes");
            } else {
                self.error(context, "indexed but missing from the chunk store");
            }
        }
        Ok(())
    }

    async fn check_extra_chunks(&mut self) -> Result<()> {
        if !self.settings.walks_everything() {
            debug!("Partial walk, not looking for orphan chunks");
            return Ok(());
        }
        if self.walk_failed {
            self.warning(
                "chunk store".to_string(),
                "walk was incomplete, not looking for orphan chunks",
            );
            return Ok(());
        }
        for chunk_id in self.repo.get_chunk_ids().await? {
            if self.referenced.contains(&chunk_id) {
                continue;
            }
            let context = format!("chunk {chunk_id}");
            if self.settings.fix {
                self.repo
                    .remove_chunk_from_indexes_for_all_clients(chunk_id)
                    .await?;
                self.repo.remove_chunk(chunk_id).await?;
                self.report.orphans_removed += 1;
                info!(chunk_id = %chunk_id, "Removed orphan chunk");
            } else {
                self.error(context, "not used by any generation");
            }
        }
        Ok(())
    }
}
