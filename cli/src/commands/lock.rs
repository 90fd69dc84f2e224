use anyhow::Result;
use clap::Args;
use tracing::warn;

use super::Context;

#[derive(Args)]
pub struct ForceLockCommand {
    #[arg(help = "Clients whose locks to remove (default: all)")]
    clients: Vec<String>,
}

impl ForceLockCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let mut repo = ctx.open().await?;
        let mut removed = Vec::new();

        if repo.force_client_list_lock().await? {
            removed.push("client list".to_string());
        }
        let clients = if self.clients.is_empty() {
            repo.get_client_names().await?
        } else {
            self.clients.clone()
        };
        for client in clients {
            if repo.force_client_lock(&client).await? {
                removed.push(format!("client {client}"));
            }
        }
        if repo.force_chunk_indexes_lock().await? {
            removed.push("chunk indexes".to_string());
        }

        if removed.is_empty() {
            println!("No locks found");
        }
        for what in removed {
            warn!(lock = %what, "Removed lock");
            println!("Removed lock on {what}");
        }
        Ok(())
    }
}
