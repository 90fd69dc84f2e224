use anyhow::{Result, anyhow};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use strata_core::client_tree::join_child;
use strata_core::{GenerationId, GenerationKey, Metadata, OwnerCache, Repository};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{Context, format_size, unlock_on_error};

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Paths to backup")]
    paths: Vec<String>,

    #[arg(long, help = "Client name")]
    client: Option<String>,

    #[arg(long, help = "Exclude paths containing this text")]
    exclude: Vec<String>,

    #[arg(long, help = "Stay on same filesystem")]
    one_file_system: bool,

    #[arg(long, help = "Commit a checkpoint generation after this many bytes")]
    checkpoint_bytes: Option<u64>,

    #[arg(long, help = "Dry run - don't actually backup")]
    dry_run: bool,
}

#[derive(Debug, Default)]
struct BackupStats {
    files: u64,
    unchanged: u64,
    bytes: u64,
    since_checkpoint: u64,
    checkpoints: u64,
}

impl BackupCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        if self.paths.is_empty() {
            return Err(anyhow!("At least one path must be specified"));
        }
        let roots = self
            .paths
            .iter()
            .map(|p| {
                std::fs::canonicalize(p).map_err(|e| anyhow!("Cannot back up {p}: {e}"))
            })
            .collect::<Result<Vec<PathBuf>>>()?;

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );

        if self.dry_run {
            println!("DRY RUN - no data will be written");
            let mut stats = BackupStats::default();
            for root in &roots {
                for entry in self.walk(root) {
                    stats.files += 1;
                    if entry.file_type().is_file() {
                        stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                    }
                    pb.set_message(format!("Scanned {} entries", stats.files));
                }
            }
            pb.finish_and_clear();
            println!(
                "Would back up {} entries, {}",
                stats.files,
                format_size(stats.bytes)
            );
            return Ok(());
        }

        let client = ctx.client(self.client.as_deref())?;
        let mut repo = ctx.open().await?;
        repo.lock_client(&client).await?;
        let locked = repo.lock_chunk_indexes().await;
        unlock_on_error(&mut repo, locked).await?;

        let outcome = self.backup(&mut repo, &client, &roots, &pb).await;
        let (gen_id, stats) = unlock_on_error(&mut repo, outcome).await?;
        pb.finish_and_clear();

        let committed = repo.commit_everything().await;
        unlock_on_error(&mut repo, committed).await?;

        info!(
            generation = %gen_id,
            files = stats.files,
            unchanged = stats.unchanged,
            bytes = stats.bytes,
            checkpoints = stats.checkpoints,
            "Backup finished"
        );
        println!(
            "Generation {} of {}: {} entries ({} unchanged), {} read",
            repo.make_generation_spec(&gen_id),
            client,
            stats.files,
            stats.unchanged,
            format_size(stats.bytes)
        );
        Ok(())
    }

    async fn backup(
        &self,
        repo: &mut Repository,
        client: &str,
        roots: &[PathBuf],
        pb: &ProgressBar,
    ) -> Result<(GenerationId, BackupStats)> {
        let mut gen_id = repo.start_generation(client).await?;
        let mut owners = OwnerCache::new();
        let mut stats = BackupStats::default();
        let mut seen = HashSet::new();

        for root in roots {
            for ancestor in root.ancestors().skip(1).collect::<Vec<_>>().into_iter().rev() {
                let path = tree_path(ancestor);
                if !repo.file_exists(&gen_id, &path).await? {
                    let metadata = Metadata::from_path(ancestor, &mut owners)?;
                    repo.set_file_metadata(&gen_id, &path, &metadata).await?;
                }
                seen.insert(path);
            }

            for entry in self.walk(root) {
                let path = tree_path(entry.path());
                pb.set_message(format!("{} entries, {}: {path}", stats.files, format_size(stats.bytes)));
                self.backup_entry(repo, &gen_id, entry.path(), &path, &mut owners, &mut stats)
                    .await?;
                seen.insert(path);

                if let Some(limit) = self.checkpoint_bytes {
                    if stats.since_checkpoint >= limit {
                        gen_id = checkpoint(repo, client, &gen_id).await?;
                        stats.since_checkpoint = 0;
                        stats.checkpoints += 1;
                    }
                }
            }
            remove_vanished(repo, &gen_id, &tree_path(root), &seen).await?;
        }
        Ok((gen_id, stats))
    }

    async fn backup_entry(
        &self,
        repo: &mut Repository,
        gen_id: &GenerationId,
        local: &Path,
        path: &str,
        owners: &mut OwnerCache,
        stats: &mut BackupStats,
    ) -> Result<()> {
        let metadata = match Metadata::from_path(local, owners) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %path, error = %e, "Skipping unreadable entry");
                return Ok(());
            }
        };
        stats.files += 1;

        let previous = if repo.file_exists(gen_id, path).await? {
            Some(repo.get_file_metadata(gen_id, path).await?)
        } else {
            None
        };
        if let Some(previous) = &previous {
            if previous.kind() != metadata.kind() {
                repo.remove_file(gen_id, path).await?;
            } else if metadata.is_file() && unchanged(previous, &metadata) {
                stats.unchanged += 1;
                return Ok(());
            }
        }

        repo.set_file_metadata(gen_id, path, &metadata).await?;
        if metadata.is_file() {
            let content = match tokio::fs::read(local).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path, error = %e, "Could not read file content");
                    repo.clear_file_chunk_ids(gen_id, path).await?;
                    return Ok(());
                }
            };
            let chunks = repo.put_file_content(gen_id, path, &content).await?;
            debug!(path = %path, chunks = chunks.len(), "Backed up file");
            stats.bytes += content.len() as u64;
            stats.since_checkpoint += content.len() as u64;
        }
        Ok(())
    }

    fn walk<'a>(&'a self, root: &Path) -> impl Iterator<Item = walkdir::DirEntry> + 'a {
        WalkDir::new(root)
            .follow_links(false)
            .same_file_system(self.one_file_system)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.should_exclude(entry.path()))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping entry");
                    None
                }
            })
    }

    fn should_exclude(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.exclude.iter().any(|pattern| path_str.contains(pattern.as_str()))
    }
}

fn tree_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// A regular file whose size, inode and modification time match the previous
/// generation keeps its chunks.
fn unchanged(previous: &Metadata, current: &Metadata) -> bool {
    previous.size == current.size
        && previous.ino == current.ino
        && previous.mtime_sec == current.mtime_sec
        && previous.mtime_nsec == current.mtime_nsec
        && previous.checksum.is_some()
}

/// Commit the current generation as a checkpoint and continue in a new one.
async fn checkpoint(
    repo: &mut Repository,
    client: &str,
    gen_id: &GenerationId,
) -> Result<GenerationId> {
    repo.set_generation_key(gen_id, GenerationKey::IsCheckpoint, 1)
        .await?;
    repo.commit_everything().await?;
    info!(generation = %gen_id, "Committed checkpoint");
    repo.lock_client(client).await?;
    repo.lock_chunk_indexes().await?;
    Ok(repo.start_generation(client).await?)
}

/// Drop entries below `root` that were carried over from the previous
/// generation but no longer exist locally.
async fn remove_vanished(
    repo: &mut Repository,
    gen_id: &GenerationId,
    root: &str,
    seen: &HashSet<String>,
) -> Result<()> {
    let mut pending = vec![root.to_string()];
    while let Some(dir) = pending.pop() {
        if !repo.file_exists(gen_id, &dir).await? || !repo.get_file_metadata(gen_id, &dir).await?.is_dir() {
            continue;
        }
        for name in repo.listdir(gen_id, &dir).await? {
            let path = join_child(&dir, &name);
            if seen.contains(&path) {
                pending.push(path);
            } else {
                debug!(path = %path, "Removing vanished entry");
                repo.remove_file(gen_id, &path).await?;
            }
        }
    }
    Ok(())
}
