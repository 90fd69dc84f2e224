use anyhow::{Result, anyhow};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use strata_core::{Checksum, FileKind, GenerationId, Metadata, Repository};
use tracing::{debug, info};

use super::restore::local_path;
use super::{Context, resolve_generation};

#[derive(Args)]
pub struct VerifyCommand {
    #[arg(help = "Paths within the generation to check", default_value = "/")]
    paths: Vec<String>,

    #[arg(long, help = "Client name")]
    client: Option<String>,

    #[arg(short, long, help = "Generation number or \"latest\"")]
    generation: Option<String>,

    #[arg(long, help = "Directory the generation was restored into", default_value = "/")]
    root: PathBuf,
}

/// One way a live entry differs from its backed up version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    pub path: String,
    pub problem: String,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.problem)
    }
}

impl VerifyCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let client = ctx.client(self.client.as_deref())?;
        let mut repo = ctx.open().await?;
        let gen_id = resolve_generation(&mut repo, &client, self.generation.as_deref()).await?;

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );
        let mut checked = 0;
        let mut differences = Vec::new();
        for path in &self.paths {
            let (count, found) = verify_tree(&mut repo, &gen_id, path, &self.root, &pb).await?;
            checked += count;
            differences.extend(found);
        }
        pb.finish_and_clear();

        for difference in &differences {
            println!("{difference}");
        }
        info!(generation = %gen_id, checked, differences = differences.len(), "Verify finished");
        if differences.is_empty() {
            println!("Verified {checked} entries of generation {}", repo.make_generation_spec(&gen_id));
            Ok(())
        } else {
            Err(anyhow!("{} of {checked} entries differ", differences.len()))
        }
    }
}

/// Compare `source` and everything below it with the live files under
/// `root`. Returns how many entries were checked and what differs.
pub async fn verify_tree(
    repo: &mut Repository,
    gen_id: &GenerationId,
    source: &str,
    root: &Path,
    pb: &ProgressBar,
) -> Result<(u64, Vec<Difference>)> {
    let mut checked = 0;
    let mut differences = Vec::new();
    let mut pending = vec![source.to_string()];
    while let Some(path) = pending.pop() {
        pb.set_message(format!("{checked} entries: {path}"));
        let metadata = repo.get_file_metadata(gen_id, &path).await?;
        checked += 1;
        let local = local_path(root, &path);
        if let Some(problem) = compare(repo, gen_id, &path, &metadata, &local).await? {
            debug!(path = %path, problem = %problem, "Entry differs");
            differences.push(Difference {
                path: path.clone(),
                problem,
            });
        }
        if metadata.is_dir() && local.is_dir() {
            pending.extend(repo.get_file_children(gen_id, &path).await?);
        }
    }
    Ok((checked, differences))
}

async fn compare(
    repo: &mut Repository,
    gen_id: &GenerationId,
    path: &str,
    metadata: &Metadata,
    local: &Path,
) -> Result<Option<String>> {
    let st = match std::fs::symlink_metadata(local) {
        Ok(st) => st,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Some("missing".to_string())),
        Err(e) => return Ok(Some(format!("unreadable: {e}"))),
    };
    let kind = metadata.kind();
    if FileKind::from_mode(st.mode()) != kind {
        return Ok(Some(format!("expected {kind:?}, found {:?}", FileKind::from_mode(st.mode()))));
    }

    if kind == FileKind::Symlink {
        let live = std::fs::read_link(local)?.to_string_lossy().into_owned();
        if metadata.target.as_deref() != Some(live.as_str()) {
            return Ok(Some(format!("symlink points to {live}")));
        }
        return Ok(None);
    }

    if let Some(mode) = metadata.mode {
        if mode & 0o7777 != st.mode() & 0o7777 {
            return Ok(Some(format!("mode {:o}, expected {:o}", st.mode() & 0o7777, mode & 0o7777)));
        }
    }
    // Directory times move whenever an entry is added or removed.
    if kind != FileKind::Directory {
        if let Some(sec) = metadata.mtime_sec {
            let nsec = metadata.mtime_nsec.map_or(st.mtime_nsec(), i64::from);
            if (sec, nsec) != (st.mtime(), st.mtime_nsec()) {
                return Ok(Some("modification time differs".to_string()));
            }
        }
    }

    if kind == FileKind::Regular {
        if let Some(size) = metadata.size {
            if size != st.size() {
                return Ok(Some(format!("size {}, expected {size}", st.size())));
            }
        }
        let live = tokio::fs::read(local).await?;
        let same = match &metadata.checksum {
            Some(checksum) => Checksum::of(&live).to_hex() == *checksum,
            None => repo.get_file_content(gen_id, path).await? == live,
        };
        if !same {
            return Ok(Some("content differs".to_string()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::restore::tests::{MTIME, backed_up};
    use crate::commands::restore::{RestoreStats, restore_tree, system_time};

    #[tokio::test]
    async fn test_restored_generation_verifies_until_changed() {
        let (mut repo, gen_id) = backed_up().await;
        let target = tempfile::tempdir().unwrap();
        let pb = ProgressBar::hidden();
        let mut stats = RestoreStats::default();
        restore_tree(&mut repo, &gen_id, "/", target.path(), &pb, &mut stats)
            .await
            .unwrap();

        let (checked, differences) = verify_tree(&mut repo, &gen_id, "/", target.path(), &pb).await.unwrap();
        assert_eq!(checked, 5);
        assert!(differences.is_empty(), "{differences:?}");

        // Same size and time, different bytes.
        let file = target.path().join("docs/a.txt");
        let mut content = std::fs::read(&file).unwrap();
        content[100] ^= 0xff;
        std::fs::write(&file, &content).unwrap();
        let mtime = system_time(MTIME, 0).unwrap();
        std::fs::File::open(&file).unwrap().set_modified(mtime).unwrap();
        std::fs::remove_file(target.path().join("link")).unwrap();

        let (_, differences) = verify_tree(&mut repo, &gen_id, "/", target.path(), &pb).await.unwrap();
        assert_eq!(
            differences,
            vec![
                Difference {
                    path: "/link".to_string(),
                    problem: "missing".to_string(),
                },
                Difference {
                    path: "/docs/a.txt".to_string(),
                    problem: "content differs".to_string(),
                },
            ]
        );
    }
}
