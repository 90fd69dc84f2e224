use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_core::RepositorySettings;
use tracing::debug;

/// Contents of `config.toml`. Command line flags and `STRATA_*` variables
/// take precedence over everything here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Repository directory used when `--repo` is not given.
    pub repo: Option<PathBuf>,
    /// Client name used when a command's client argument is omitted.
    pub client: Option<String>,
    /// Generations kept by `forget` when no policy is given on the command line.
    pub keep: Option<String>,
    pub repository: RepositorySettings,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "strata").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the file named by `--config`, else the per-user default. A missing
    /// default file is not an error; a missing explicit file is.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        if !required && !path.exists() {
            debug!(path = %path.display(), "No configuration file");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let config: CliConfig = toml::from_str(&text)
            .with_context(|| format!("Invalid configuration {}", path.display()))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
repo = "/srv/backup"
client = "web1"
keep = "7d,4w"

[repository]
lock_timeout = 5
chunk_size = 65536
"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.repo, Some(PathBuf::from("/srv/backup")));
        assert_eq!(config.client.as_deref(), Some("web1"));
        assert_eq!(config.repository.lock_timeout, 5);
        assert_eq!(config.repository.chunk_size, 65536);
        assert_eq!(config.repository.node_size, RepositorySettings::default().node_size);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(CliConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
