pub mod backup;
pub mod cat;
pub mod clients;
pub mod forget;
pub mod fsck;
pub mod generations;
pub mod init;
pub mod lock;
pub mod ls;
pub mod restore;
pub mod verify;

use anyhow::{Result, anyhow};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use strata_backends::{LocalBackend, RetryBackend, RetryConfig};
use strata_core::types::RepoConfig;
use strata_core::{
    Backend, CompressionFilter, GenerationId, Hooks, Repository, RepositorySettings,
};
use tracing::{debug, info, warn};

use crate::Cli;
use crate::config::CliConfig;

/// Everything a command needs to reach the repository, resolved from flags,
/// environment and the configuration file.
pub struct Context {
    pub repo_path: PathBuf,
    pub settings: RepositorySettings,
    pub config: CliConfig,
    password: Option<String>,
}

impl Context {
    pub fn new(cli: &Cli) -> Result<Self> {
        let config = CliConfig::load(cli.config.as_deref())?;
        let repo_path = cli
            .repo
            .clone()
            .or_else(|| config.repo.clone())
            .ok_or_else(|| anyhow!("Repository path required (--repo or STRATA_REPO)"))?;
        let mut settings = config.repository.clone();
        if let Some(timeout) = cli.lock_timeout {
            settings.lock_timeout = timeout;
        }
        Ok(Self {
            repo_path,
            settings,
            config,
            password: cli.password.clone(),
        })
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::new(RetryBackend::new(
            LocalBackend::new(&self.repo_path),
            RetryConfig::default(),
        ))
    }

    /// The password from `--password`/`STRATA_PASSWORD`, else ask on the terminal.
    pub fn password(&self) -> Result<String> {
        self.password
            .clone()
            .or_else(|| {
                print!("Enter repository password: ");
                io::stdout().flush().ok()?;
                rpassword::read_password().ok()
            })
            .ok_or_else(|| anyhow!("Password required"))
    }

    /// Open the repository with the filters its identity file asks for.
    pub async fn open(&self) -> Result<Repository> {
        let backend = self.backend();
        let repo_config = RepoConfig::load(backend.as_ref()).await?;
        let mut hooks = Hooks::new();
        if repo_config.compression {
            hooks = hooks.with_filter(CompressionFilter::default());
        }
        if let Some(encryption) = &repo_config.encryption {
            let password = self.password()?;
            hooks = hooks.with_filter(encryption.unlock(&password)?);
        }
        info!(repo = %self.repo_path.display(), "Opening repository");
        Ok(Repository::open(backend, self.settings.clone(), hooks).await?)
    }

    /// Client named on the command line, else the configured default.
    pub fn client(&self, arg: Option<&str>) -> Result<String> {
        arg.map(str::to_string)
            .or_else(|| self.config.client.clone())
            .ok_or_else(|| anyhow!("Client name required"))
    }
}

/// Resolve a generation argument, defaulting to the newest generation.
pub async fn resolve_generation(
    repo: &mut Repository,
    client: &str,
    spec: Option<&str>,
) -> Result<GenerationId> {
    let spec = spec.unwrap_or("latest");
    let gen_id = repo.interpret_generation_spec(client, spec).await?;
    debug!(client = %client, spec = %spec, generation = %gen_id, "Resolved generation");
    Ok(gen_id)
}

/// Release whatever `repo` still holds after `result` failed, keeping the
/// original error.
pub async fn unlock_on_error<T, E>(repo: &mut Repository, result: std::result::Result<T, E>) -> Result<T>
where
    E: Into<anyhow::Error>,
{
    if result.is_err() {
        if let Err(e) = repo.unlock_everything().await {
            warn!(error = %e, "Failed to release locks");
        }
    }
    result.map_err(Into::into)
}

pub fn format_time(secs: Option<u64>) -> String {
    secs.and_then(|s| chrono::DateTime::from_timestamp(s as i64, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
