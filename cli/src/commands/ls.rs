use anyhow::Result;
use clap::Args;
use strata_core::{FileKind, Metadata};
use strata_core::client_tree::join_child;

use super::{Context, format_time, resolve_generation};

#[derive(Args)]
pub struct LsCommand {
    #[arg(help = "Client name")]
    client: Option<String>,

    #[arg(help = "Path within the generation", default_value = "/")]
    path: String,

    #[arg(short, long, help = "Generation number or \"latest\"")]
    generation: Option<String>,

    #[arg(short, long, help = "List subdirectories recursively")]
    recursive: bool,

    #[arg(short, long, help = "Show mode, owner, size and modification time")]
    long: bool,
}

impl LsCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let client = ctx.client(self.client.as_deref())?;
        let mut repo = ctx.open().await?;
        let gen_id = resolve_generation(&mut repo, &client, self.generation.as_deref()).await?;

        let mut pending = vec![self.path.clone()];
        while let Some(dir) = pending.pop() {
            let metadata = repo.get_file_metadata(&gen_id, &dir).await?;
            if !metadata.is_dir() {
                self.print_entry(&dir, &metadata);
                continue;
            }
            if self.recursive || dir != self.path {
                println!("\n{dir}:");
            }
            let mut subdirs = Vec::new();
            for name in repo.listdir(&gen_id, &dir).await? {
                let path = join_child(&dir, &name);
                let child = repo.get_file_metadata(&gen_id, &path).await?;
                self.print_entry(&name, &child);
                if self.recursive && child.is_dir() {
                    subdirs.push(path);
                }
            }
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(())
    }

    fn print_entry(&self, name: &str, metadata: &Metadata) {
        if !self.long {
            println!("{name}");
            return;
        }
        let target = metadata
            .target
            .as_deref()
            .map(|t| format!(" -> {t}"))
            .unwrap_or_default();
        println!(
            "{} {:<8} {:<8} {:>12} {} {name}{target}",
            mode_string(metadata),
            metadata.username.as_deref().unwrap_or("-"),
            metadata.groupname.as_deref().unwrap_or("-"),
            metadata.size.unwrap_or(0),
            format_time(metadata.mtime_sec.map(|s| s.max(0) as u64)),
        );
    }
}

/// `ls -l` style permission string.
fn mode_string(metadata: &Metadata) -> String {
    let mode = metadata.mode.unwrap_or(0);
    let kind = match metadata.kind() {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::Regular => '-',
        FileKind::Other => '?',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_string() {
        let file = Metadata {
            mode: Some(0o100644),
            ..Default::default()
        };
        assert_eq!(mode_string(&file), "-rw-r--r--");
        let dir = Metadata {
            mode: Some(0o040755),
            ..Default::default()
        };
        assert_eq!(mode_string(&dir), "drwxr-xr-x");
    }
}
