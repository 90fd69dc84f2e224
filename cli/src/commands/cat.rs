use anyhow::{Result, anyhow};
use clap::Args;
use tokio::io::AsyncWriteExt;

use super::{Context, resolve_generation};

#[derive(Args)]
pub struct CatCommand {
    #[arg(help = "Client name")]
    client: String,

    #[arg(help = "Paths of the files to print")]
    paths: Vec<String>,

    #[arg(short, long, help = "Generation number or \"latest\"")]
    generation: Option<String>,
}

impl CatCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        if self.paths.is_empty() {
            return Err(anyhow!("At least one path must be specified"));
        }
        let mut repo = ctx.open().await?;
        let gen_id = resolve_generation(&mut repo, &self.client, self.generation.as_deref()).await?;

        let mut stdout = tokio::io::stdout();
        for path in &self.paths {
            let metadata = repo.get_file_metadata(&gen_id, path).await?;
            if !metadata.is_file() {
                return Err(anyhow!("{path} is not a regular file"));
            }
            for chunk_id in repo.get_file_chunk_ids(&gen_id, path).await? {
                let content = repo.get_chunk_content(chunk_id).await?;
                stdout.write_all(&content).await?;
            }
        }
        stdout.flush().await?;
        Ok(())
    }
}
