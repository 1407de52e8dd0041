//! The few slurm.conf settings the stack depends on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_SLURM_CONF: &str = "/etc/slurm/slurm.conf";
pub const DEFAULT_PLUGIN_DIR: &str = "/usr/local/lib/slurm";
const PLUGSTACK_FILE: &str = "plugstack.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path of the plugin stack configuration.
    pub plugstack: PathBuf,
    /// `:` separated plugin search path.
    pub plugin_dir: String,
}

impl Config {
    fn defaults(conf_path: &Path) -> Self {
        let dir = conf_path.parent().unwrap_or_else(|| Path::new("/"));
        Config {
            plugstack: dir.join(PLUGSTACK_FILE),
            plugin_dir: DEFAULT_PLUGIN_DIR.to_string(),
        }
    }

    /// Reads the configuration named by `$SLURM_CONF`, or the default one.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os("SLURM_CONF")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SLURM_CONF));
        Self::load(&path)
    }

    /// Reads `path`. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text, path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                Ok(Self::defaults(path))
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parses slurm.conf `Key=Value` lines. Keys are case-insensitive and
    /// unknown keys are ignored.
    pub fn parse(text: &str, conf_path: &Path) -> Self {
        let mut config = Self::defaults(conf_path);

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => continue,
            };
            if value.is_empty() {
                continue;
            }

            if key.eq_ignore_ascii_case("PlugStackConfig") {
                config.plugstack = PathBuf::from(value);
            } else if key.eq_ignore_ascii_case("PluginDir") {
                config.plugin_dir = value.to_string();
            }
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults(Path::new(DEFAULT_SLURM_CONF))
    }
}
