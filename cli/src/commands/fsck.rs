use anyhow::{Result, anyhow};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use strata_core::{Fsck, FsckReport, FsckSettings, Repository};

use super::{Context, unlock_on_error};

#[derive(Args)]
pub struct FsckCommand {
    #[arg(long, help = "Remove orphan chunks and dangling index records")]
    fix: bool,

    #[arg(long, help = "Do not read chunk contents")]
    ignore_chunks: bool,

    #[arg(long, help = "Clients to leave out of the check")]
    ignore_client: Vec<String>,

    #[arg(long, help = "Only check the newest generation of each client")]
    last_generation_only: bool,

    #[arg(long, help = "Do not check generations")]
    skip_generations: bool,

    #[arg(long, help = "Do not descend into directories")]
    skip_dirs: bool,

    #[arg(long, help = "Do not check file contents")]
    skip_files: bool,
}

impl FsckCommand {
    fn settings(&self) -> FsckSettings {
        FsckSettings {
            fix: self.fix,
            ignore_chunks: self.ignore_chunks,
            ignore_clients: self.ignore_client.clone(),
            last_generation_only: self.last_generation_only,
            skip_generations: self.skip_generations,
            skip_dirs: self.skip_dirs,
            skip_files: self.skip_files,
        }
    }

    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let mut repo = ctx.open().await?;

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );

        let outcome = check(&mut repo, self.settings(), &pb).await;
        pb.finish_and_clear();
        let report = unlock_on_error(&mut repo, outcome).await?;

        for warning in &report.warnings {
            println!("warning: {warning}");
        }
        for error in &report.errors {
            println!("error: {error}");
        }
        println!(
            "Checked {} items and {} chunks: {} errors, {} warnings",
            report.items_done,
            report.chunks_checked,
            report.errors.len(),
            report.warnings.len()
        );
        if report.orphans_removed > 0 {
            println!("Removed {} unused chunks", report.orphans_removed);
        }
        if report.is_clean() {
            Ok(())
        } else {
            Err(anyhow!("Repository has {} errors", report.errors.len()))
        }
    }
}

async fn check(
    repo: &mut Repository,
    settings: FsckSettings,
    pb: &ProgressBar,
) -> strata_core::Result<FsckReport> {
    let mut fsck = Fsck::new(repo, settings);
    while fsck.step().await? {
        let report = fsck.report();
        pb.set_message(format!(
            "{} items checked, {} queued, {} errors",
            report.items_done,
            fsck.remaining(),
            report.errors.len()
        ));
    }
    fsck.finish().await
}
