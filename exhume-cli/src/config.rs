//! CLI configuration.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

/// Settings persisted between runs in `config.toml` under the
/// platform's config directory.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory extracted backups are written under.
    pub output_path: Option<PathBuf>,
}

impl Config {
    /// Reads the config file, seeding it with defaults the first time
    /// the tool runs.
    pub fn load() -> Result<Self> {
        let path = config_file()?;
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let config = Config::default();
                config.write_to(&path)?;
                Ok(config)
            }
            Err(err) => {
                Err(err).with_context(|| format!("could not read config file {}", path.display()))
            }
        }
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("could not write config file {}", path.display()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_path: BaseDirs::new().map(|dirs| dirs.home_dir().join("exhume")),
        }
    }
}

fn config_file() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "exhume")
        .context("could not locate a config directory for this platform")?;
    Ok(dirs.config_dir().join("config.toml"))
}
