mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    Context,
    backup::BackupCommand,
    cat::CatCommand,
    clients::{AddClientCommand, ClientsCommand, RemoveClientCommand, RenameClientCommand},
    forget::ForgetCommand,
    fsck::FsckCommand,
    generations::GenerationsCommand,
    init::InitCommand,
    lock::ForceLockCommand,
    ls::LsCommand,
    restore::RestoreCommand,
    verify::VerifyCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Snapshot backups with chunk-level deduplication",
    long_about = "Strata keeps generations of filesystem trees for several clients in one \
                  repository, storing identical data only once"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "STRATA_REPO", help = "Repository path")]
    repo: Option<PathBuf>,

    #[arg(long, env = "STRATA_PASSWORD", help = "Repository password")]
    password: Option<String>,

    #[arg(long, env = "STRATA_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "STRATA_LOCK_TIMEOUT", help = "Seconds to wait for a lock")]
    lock_timeout: Option<u64>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "List clients")]
    Clients(ClientsCommand),

    #[command(about = "Add a client")]
    AddClient(AddClientCommand),

    #[command(about = "Remove a client and all its generations")]
    RemoveClient(RemoveClientCommand),

    #[command(about = "Rename a client")]
    RenameClient(RenameClientCommand),

    #[command(about = "List generations of a client")]
    Generations(GenerationsCommand),

    #[command(about = "List files in a generation")]
    Ls(LsCommand),

    #[command(about = "Back up local paths as a new generation")]
    Backup(BackupCommand),

    #[command(about = "Write a backed up file to stdout")]
    Cat(CatCommand),

    #[command(about = "Restore a generation into a local directory")]
    Restore(RestoreCommand),

    #[command(about = "Compare a generation with the live filesystem")]
    Verify(VerifyCommand),

    #[command(about = "Remove named generations, or those a retention policy does not keep")]
    Forget(ForgetCommand),

    #[command(about = "Check repository integrity")]
    Fsck(FsckCommand),

    #[command(about = "Remove stale lock markers left by crashed runs")]
    ForceLock(ForceLockCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let ctx = Context::new(&cli)?;
    debug!(repo = %ctx.repo_path.display(), "Starting strata");

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(&ctx).await,
        Commands::Clients(ref cmd) => cmd.run(&ctx).await,
        Commands::AddClient(ref cmd) => cmd.run(&ctx).await,
        Commands::RemoveClient(ref cmd) => cmd.run(&ctx).await,
        Commands::RenameClient(ref cmd) => cmd.run(&ctx).await,
        Commands::Generations(ref cmd) => cmd.run(&ctx).await,
        Commands::Ls(ref cmd) => cmd.run(&ctx).await,
        Commands::Backup(ref cmd) => cmd.run(&ctx).await,
        Commands::Cat(ref cmd) => cmd.run(&ctx).await,
        Commands::Restore(ref cmd) => cmd.run(&ctx).await,
        Commands::Verify(ref cmd) => cmd.run(&ctx).await,
        Commands::Forget(ref cmd) => cmd.run(&ctx).await,
        Commands::Fsck(ref cmd) => cmd.run(&ctx).await,
        Commands::ForceLock(ref cmd) => cmd.run(&ctx).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("strata={level},strata_core={level},strata_backends={level}")));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {e}");
    }
}
