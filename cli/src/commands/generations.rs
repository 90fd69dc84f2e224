use anyhow::{Result, anyhow};
use clap::Args;
use serde::Serialize;
use strata_core::GenerationKey;

use super::{Context, format_size, format_time};

#[derive(Args)]
pub struct GenerationsCommand {
    #[arg(help = "Client name")]
    client: Option<String>,

    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,

    #[arg(long, help = "Show latest N generations")]
    latest: Option<usize>,
}

#[derive(Serialize)]
struct GenerationInfo {
    id: String,
    started: Option<u64>,
    ended: Option<u64>,
    checkpoint: bool,
    files: Option<u64>,
    bytes: Option<u64>,
}

impl GenerationsCommand {
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let client = ctx.client(self.client.as_deref())?;
        let mut repo = ctx.open().await?;

        let mut ids = repo.get_client_generation_ids(&client).await?;
        if let Some(n) = self.latest {
            let skip = ids.len().saturating_sub(n);
            ids.drain(..skip);
        }

        let mut generations = Vec::with_capacity(ids.len());
        for gen_id in &ids {
            let (started, ended) = repo.get_generation_times(gen_id).await?;
            generations.push(GenerationInfo {
                id: repo.make_generation_spec(gen_id),
                started,
                ended,
                checkpoint: repo.is_checkpoint(gen_id).await?,
                files: repo.get_generation_key(gen_id, GenerationKey::FileCount).await?,
                bytes: repo.get_generation_key(gen_id, GenerationKey::TotalData).await?,
            });
        }

        match self.format.as_deref().unwrap_or("table") {
            "json" => println!("{}", serde_json::to_string_pretty(&generations)?),
            "table" => print_table(&client, &generations),
            other => return Err(anyhow!("Unknown output format: {other}")),
        }
        Ok(())
    }
}

fn print_table(client: &str, generations: &[GenerationInfo]) {
    if generations.is_empty() {
        println!("Client {client} has no generations");
        return;
    }
    println!(
        "{:<8} {:<20} {:<20} {:>8} {:>12}",
        "ID", "Started", "Ended", "Files", "Data"
    );
    println!("{}", "-".repeat(72));
    for generation in generations {
        let id = if generation.checkpoint {
            format!("{}*", generation.id)
        } else {
            generation.id.clone()
        };
        println!(
            "{:<8} {:<20} {:<20} {:>8} {:>12}",
            id,
            format_time(generation.started),
            format_time(generation.ended),
            generation
                .files
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
            generation
                .bytes
                .map(format_size)
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    if generations.iter().any(|g| g.checkpoint) {
        println!("\n* checkpoint");
    }
}
