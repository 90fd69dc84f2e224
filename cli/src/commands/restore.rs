use anyhow::{Result, anyhow};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use strata_core::{FileKind, GenerationId, Metadata, Repository};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{Context, format_size, resolve_generation};

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Directory to restore into")]
    target: PathBuf,

    #[arg(help = "Paths within the generation to restore", default_value = "/")]
    paths: Vec<String>,

    #[arg(long, help = "Client name")]
    client: Option<String>,

    #[arg(short, long, help = "Generation number or \"latest\"")]
    generation: Option<String>,
}

#[derive(Debug, Default)]
pub struct RestoreStats {
    pub restored: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes: u64,
}

impl RestoreCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let client = ctx.client(self.client.as_deref())?;
        let mut repo = ctx.open().await?;
        let gen_id = resolve_generation(&mut repo, &client, self.generation.as_deref()).await?;
        fs::create_dir_all(&self.target).await?;

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );

        let mut stats = RestoreStats::default();
        for path in &self.paths {
            restore_tree(&mut repo, &gen_id, path, &self.target, &pb, &mut stats).await?;
        }
        pb.finish_and_clear();

        info!(
            generation = %gen_id,
            restored = stats.restored,
            skipped = stats.skipped,
            failed = stats.failed,
            "Restore finished"
        );
        println!(
            "Restored {} entries ({}) of generation {} into {}",
            stats.restored,
            format_size(stats.bytes),
            repo.make_generation_spec(&gen_id),
            self.target.display()
        );
        if stats.skipped > 0 {
            println!("Skipped {} special files", stats.skipped);
        }
        if stats.failed > 0 {
            return Err(anyhow!("{} entries could not be restored", stats.failed));
        }
        Ok(())
    }
}

/// Where a path of the generation lands below `target`.
pub fn local_path(target: &Path, path: &str) -> PathBuf {
    target.join(path.trim_start_matches('/'))
}

/// Recreate `source` and everything below it under `target`. Directory
/// modes and times are applied after their contents are written.
pub async fn restore_tree(
    repo: &mut Repository,
    gen_id: &GenerationId,
    source: &str,
    target: &Path,
    pb: &ProgressBar,
    stats: &mut RestoreStats,
) -> Result<()> {
    let mut pending = vec![source.to_string()];
    let mut dirs = Vec::new();
    while let Some(path) = pending.pop() {
        pb.set_message(format!("{} entries: {path}", stats.restored));
        let metadata = repo.get_file_metadata(gen_id, &path).await?;
        let local = local_path(target, &path);

        match restore_entry(repo, gen_id, &path, &metadata, &local).await {
            Ok(Some(bytes)) => {
                stats.restored += 1;
                stats.bytes += bytes;
            }
            Ok(None) => {
                stats.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to restore");
                stats.failed += 1;
                continue;
            }
        }

        if metadata.is_dir() {
            pending.extend(repo.get_file_children(gen_id, &path).await?);
            dirs.push((local, metadata));
        }
    }

    for (local, metadata) in dirs.iter().rev() {
        if let Err(e) = apply_metadata(local, metadata) {
            warn!(path = %local.display(), error = %e, "Could not set directory metadata");
            stats.failed += 1;
        }
    }
    Ok(())
}

/// Bytes written for the entry, or `None` for kinds that are not restored.
async fn restore_entry(
    repo: &mut Repository,
    gen_id: &GenerationId,
    path: &str,
    metadata: &Metadata,
    local: &Path,
) -> Result<Option<u64>> {
    match metadata.kind() {
        FileKind::Directory => {
            fs::create_dir_all(local).await?;
            Ok(Some(0))
        }
        FileKind::Regular => {
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent).await?;
            }
            let content = repo.get_file_content(gen_id, path).await?;
            fs::write(local, &content).await?;
            apply_metadata(local, metadata)?;
            debug!(path = %path, size = content.len(), "Restored file");
            Ok(Some(content.len() as u64))
        }
        FileKind::Symlink => {
            let target = metadata
                .target
                .as_deref()
                .ok_or_else(|| anyhow!("symlink {path} has no recorded target"))?;
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent).await?;
            }
            match fs::remove_file(local).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::symlink(target, local).await?;
            Ok(Some(0))
        }
        FileKind::Other => {
            debug!(path = %path, "Skipping special file");
            Ok(None)
        }
    }
}

/// Set modification time, then permission bits. The time goes first so a
/// mode without read access cannot block it.
fn apply_metadata(local: &Path, metadata: &Metadata) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mtime) = metadata.mtime_sec.and_then(|sec| system_time(sec, metadata.mtime_nsec.unwrap_or(0))) {
        std::fs::File::open(local)?.set_modified(mtime)?;
    }
    if let Some(mode) = metadata.mode {
        std::fs::set_permissions(local, std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

pub fn system_time(sec: i64, nsec: u32) -> Option<SystemTime> {
    let whole = Duration::from_secs(sec.unsigned_abs());
    let base = if sec >= 0 {
        UNIX_EPOCH.checked_add(whole)?
    } else {
        UNIX_EPOCH.checked_sub(whole)?
    };
    base.checked_add(Duration::from_nanos(u64::from(nsec)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::sync::Arc;
    use strata_core::{Hooks, MemoryBackend, RepositorySettings};

    pub(crate) const MTIME: i64 = 1_650_000_000;

    fn meta(mode: u32) -> Metadata {
        Metadata {
            mode: Some(mode),
            mtime_sec: Some(MTIME),
            mtime_nsec: Some(0),
            ..Default::default()
        }
    }

    /// A generation holding `/docs/a.txt`, `/docs/empty` and `/link`.
    pub(crate) async fn backed_up() -> (Repository, GenerationId) {
        let settings = RepositorySettings {
            lock_timeout: 0,
            node_size: 8,
            chunk_size: 1024,
            ..Default::default()
        };
        let mut repo = Repository::init(Arc::new(MemoryBackend::new()), settings, Hooks::new())
            .await
            .unwrap();
        repo.lock_client_list().await.unwrap();
        repo.add_client("alice").await.unwrap();
        repo.commit_client_list().await.unwrap();
        repo.lock_client("alice").await.unwrap();
        repo.lock_chunk_indexes().await.unwrap();

        let gen_id = repo.start_generation("alice").await.unwrap();
        repo.set_file_metadata(&gen_id, "/", &meta(0o040755)).await.unwrap();
        repo.set_file_metadata(&gen_id, "/docs", &meta(0o040750)).await.unwrap();
        repo.set_file_metadata(&gen_id, "/docs/a.txt", &meta(0o100640)).await.unwrap();
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        repo.put_file_content(&gen_id, "/docs/a.txt", &content).await.unwrap();
        repo.set_file_metadata(&gen_id, "/docs/empty", &meta(0o100600)).await.unwrap();
        repo.put_file_content(&gen_id, "/docs/empty", &[]).await.unwrap();
        let link = Metadata {
            target: Some("docs/a.txt".to_string()),
            ..meta(0o120777)
        };
        repo.set_file_metadata(&gen_id, "/link", &link).await.unwrap();
        repo.commit_everything().await.unwrap();
        (repo, gen_id)
    }

    #[tokio::test]
    async fn test_restore_recreates_tree() {
        let (mut repo, gen_id) = backed_up().await;
        let target = tempfile::tempdir().unwrap();
        let mut stats = RestoreStats::default();
        restore_tree(&mut repo, &gen_id, "/", target.path(), &ProgressBar::hidden(), &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.restored, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.bytes, 5000);

        let file = target.path().join("docs/a.txt");
        let expected = repo.get_file_content(&gen_id, "/docs/a.txt").await.unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), expected);
        let st = std::fs::metadata(&file).unwrap();
        assert_eq!(st.permissions().mode() & 0o7777, 0o640);
        assert_eq!(st.mtime(), MTIME);
        assert_eq!(std::fs::read(target.path().join("docs/empty")).unwrap(), Vec::<u8>::new());

        let docs = std::fs::metadata(target.path().join("docs")).unwrap();
        assert!(docs.is_dir());
        assert_eq!(docs.permissions().mode() & 0o7777, 0o750);
        assert_eq!(docs.mtime(), MTIME);

        let link = target.path().join("link");
        assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("docs/a.txt"));
        assert_eq!(std::fs::read(&link).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_restore_subtree_and_missing_path() {
        let (mut repo, gen_id) = backed_up().await;
        let target = tempfile::tempdir().unwrap();
        let mut stats = RestoreStats::default();
        let pb = ProgressBar::hidden();
        restore_tree(&mut repo, &gen_id, "/docs", target.path(), &pb, &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.restored, 3);
        assert!(target.path().join("docs/a.txt").is_file());
        assert!(!target.path().join("link").exists());

        let missing = restore_tree(&mut repo, &gen_id, "/nope", target.path(), &pb, &mut stats).await;
        assert!(missing.is_err());
    }

    #[test]
    fn test_system_time_before_epoch() {
        let before = system_time(-2, 500_000_000).unwrap();
        assert_eq!(UNIX_EPOCH.duration_since(before).unwrap(), Duration::from_millis(1500));
        assert_eq!(system_time(3, 0).unwrap(), UNIX_EPOCH + Duration::from_secs(3));
    }
}
