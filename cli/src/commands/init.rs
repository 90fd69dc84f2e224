use anyhow::Result;
use clap::Args;
use strata_core::types::RepoConfig;
use strata_core::{CompressionFilter, EncryptionConfig, Hooks, Repository};
use tracing::info;

use super::Context;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Encrypt repository data with a password")]
    encrypt: bool,

    #[arg(long, help = "Compress repository data")]
    compress: bool,

    #[arg(long, help = "Clients to register right away")]
    client: Vec<String>,
}

impl InitCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        info!(repo = %ctx.repo_path.display(), "Initializing repository");

        let compress = self.compress || ctx.settings.compress;
        let mut hooks = Hooks::new();
        if compress {
            hooks = hooks.with_filter(CompressionFilter::default());
        }
        let encryption = if self.encrypt {
            let password = ctx.password()?;
            let (encryption, filter) = EncryptionConfig::generate(&password)?;
            hooks = hooks.with_filter(filter);
            Some(encryption)
        } else {
            None
        };

        let config = RepoConfig {
            compression: compress,
            encryption,
            ..RepoConfig::default()
        };
        let mut repo =
            Repository::init_with_config(ctx.backend(), config, ctx.settings.clone(), hooks).await?;

        if !self.client.is_empty() {
            repo.lock_client_list().await?;
            for name in &self.client {
                let added = repo.add_client(name).await;
                super::unlock_on_error(&mut repo, added).await?;
            }
            repo.commit_client_list().await?;
        }

        println!(
            "Initialized repository {} at {}",
            repo.config().id,
            ctx.repo_path.display()
        );
        Ok(())
    }
}
