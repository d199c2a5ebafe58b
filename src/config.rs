//! Service configuration.
//!
//! A configuration is read from a TOML or YAML file, overlaid once with
//! a `.env` file, the process environment and command line flags, and then
//! shared as an immutable `Arc<Config>` for the lifetime of the process.

use crate::error::{DataApiError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Configuration file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Environment file read from the working directory when present
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Environment variable prefix for extra cluster connection strings
const MONGO_URI_PREFIX: &str = "MONGO_URI_";

/// Server section of the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

/// Logging section of the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format: text or json
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Actions slower than this are reported as slow (milliseconds)
    #[serde(default = "default_slow_action_ms")]
    pub slow_action_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            slow_action_ms: default_slow_action_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_slow_action_ms() -> u64 {
    1000
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    /// Pick a format from the file extension, defaulting to YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Cluster name to connection URI
    #[serde(default, rename = "mongoClusters")]
    pub mongo_clusters: BTreeMap<String, String>,
    /// Secret granting read access
    #[serde(default, rename = "readOnly")]
    pub read_only: Option<String>,
    /// Secret granting read and write access
    #[serde(default, rename = "readWrite")]
    pub read_write: Option<String>,
}

impl Config {
    /// Parse configuration text in the given format
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Toml => {
                toml::from_str(content).map_err(|e| DataApiError::Config(e.to_string()))
            }
            ConfigFormat::Yaml => {
                // An empty YAML document deserializes to unit, not a map
                if content.trim().is_empty() {
                    return Ok(Config::default());
                }
                serde_yaml::from_str(content).map_err(|e| DataApiError::Config(e.to_string()))
            }
        }
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DataApiError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::parse(&content, ConfigFormat::from_path(path)).map_err(|e| match e {
            DataApiError::Config(msg) => {
                DataApiError::Config(format!("'{}': {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Load the configuration file.
    ///
    /// An explicit path must exist. Without one, `config.yaml` is used when
    /// present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    /// Overlay environment variables.
    ///
    /// `READ_ONLY_KEY` and `READ_WRITE_KEY` replace the secrets when set,
    /// `MONGO_URI_<NAME>` adds cluster `<name>` (lower-cased) and `PORT`
    /// replaces the listen port.
    pub fn with_env<I>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "READ_ONLY_KEY" => self.read_only = Some(value),
                "READ_WRITE_KEY" => self.read_write = Some(value),
                "PORT" => {
                    self.server.port = value.parse().map_err(|_| {
                        DataApiError::Config(format!("invalid PORT '{}'", value))
                    })?;
                }
                _ => {
                    if let Some(name) = key.strip_prefix(MONGO_URI_PREFIX) {
                        if !name.is_empty() {
                            self.mongo_clusters.insert(name.to_lowercase(), value);
                        }
                    }
                }
            }
        }
        Ok(self)
    }

    /// Read `KEY=value` pairs from a dotenv file, to be passed to
    /// [`Config::with_env`] before the process environment
    pub fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
        let invalid =
            |e: dotenvy::Error| DataApiError::Config(format!("'{}': {}", path.display(), e));
        dotenvy::from_path_iter(path)
            .map_err(invalid)?
            .map(|item| item.map_err(invalid))
            .collect()
    }

    /// Configured cluster names in sorted order
    pub fn cluster_names(&self) -> Vec<String> {
        self.mongo_clusters.keys().cloned().collect()
    }

    /// Listen address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
