use anyhow::Result;
use clap::Args;
use tracing::info;

use super::{Context, unlock_on_error};

#[derive(Args)]
pub struct ClientsCommand {
    #[arg(long, help = "Show each client's encryption key id")]
    keys: bool,
}

impl ClientsCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let mut repo = ctx.open().await?;
        let names = repo.get_client_names().await?;
        if names.is_empty() {
            println!("No clients");
            return Ok(());
        }
        for name in names {
            if self.keys {
                let key = repo.get_client_encryption_key_id(&name).await?;
                println!("{name}\t{}", key.as_deref().unwrap_or("-"));
            } else {
                println!("{name}");
            }
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct AddClientCommand {
    #[arg(help = "Client names")]
    names: Vec<String>,

    #[arg(long, help = "Encryption key id to record for the clients")]
    key_id: Option<String>,
}

impl AddClientCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let mut repo = ctx.open().await?;
        repo.lock_client_list().await?;
        for name in &self.names {
            let added = repo.add_client(name).await;
            unlock_on_error(&mut repo, added).await?;
            if let Some(key_id) = &self.key_id {
                let set = repo
                    .set_client_encryption_key_id(name, Some(key_id.clone()))
                    .await;
                unlock_on_error(&mut repo, set).await?;
            }
        }
        repo.commit_client_list().await?;
        info!(clients = self.names.len(), "Added clients");
        Ok(())
    }
}

#[derive(Args)]
pub struct RemoveClientCommand {
    #[arg(help = "Client names")]
    names: Vec<String>,
}

impl RemoveClientCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let mut repo = ctx.open().await?;
        repo.lock_client_list().await?;
        let locked = repo.lock_chunk_indexes().await;
        unlock_on_error(&mut repo, locked).await?;
        for name in &self.names {
            let removed = repo.remove_client(name).await;
            unlock_on_error(&mut repo, removed).await?;
            println!("Removed client {name}");
        }
        let committed = repo.commit_everything().await;
        unlock_on_error(&mut repo, committed).await
    }
}

#[derive(Args)]
pub struct RenameClientCommand {
    #[arg(help = "Current client name")]
    old: String,

    #[arg(help = "New client name")]
    new: String,
}

impl RenameClientCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let mut repo = ctx.open().await?;
        repo.lock_client_list().await?;
        let renamed = repo.rename_client(&self.old, &self.new).await;
        unlock_on_error(&mut repo, renamed).await?;
        repo.commit_client_list().await?;
        println!("Renamed client {} to {}", self.old, self.new);
        Ok(())
    }
}
