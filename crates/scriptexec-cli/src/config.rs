//! Configuration loading and types

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{WrapErr, eyre};
use scriptexec_exec::Connection;
use serde::Deserialize;

/// Top-level configuration for the scriptexec CLI
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Named connections
    #[serde(default)]
    pub connections: BTreeMap<String, Connection>,
    /// File this configuration was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            connections: BTreeMap::new(),
            source: None,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&content).wrap_err_with(|| format!("cannot parse {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be loaded
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("SCRIPTEXEC_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let paths = [
            Some(PathBuf::from("scriptexec.toml")),
            dirs::config_dir().map(|p| p.join("scriptexec/scriptexec.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(Config::default())
    }

    /// Look up a named connection; `local` is always available
    ///
    /// # Errors
    /// Returns error if no connection has that name
    pub fn connection(&self, name: &str) -> eyre::Result<Connection> {
        if let Some(connection) = self.connections.get(name) {
            return Ok(connection.clone());
        }
        if name.eq_ignore_ascii_case("local") {
            return Ok(Connection::local());
        }
        Err(eyre!("no connection named {name:?}"))
    }
}
