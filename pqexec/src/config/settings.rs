//! Configuration settings for a connection pool

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::defaults;
use crate::error::{Error, Result};

/// Settings needed to build a [`Pool`](crate::Pool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connection string, passed verbatim to the driver
    #[serde(default)]
    pub conninfo: String,

    /// Maximum number of live connections
    #[serde(default = "default_size")]
    pub size: usize,

    /// Log level (trace, debug, info, warn, error) for binaries and tests
    /// that install a subscriber. Can be overridden by RUST_LOG env var
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_size() -> usize {
    defaults::POOL_SIZE
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            conninfo: String::new(),
            size: default_size(),
            log_level: None,
        }
    }
}

impl PoolConfig {
    /// Create a default config for the given connection string
    pub fn with_conninfo(conninfo: impl Into<String>) -> Self {
        Self {
            conninfo: conninfo.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load configuration using config-rs (file + environment variables)
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name(defaults::CONFIG_FILE).required(false));
        }

        // Override with environment variables (PQEXEC_*)
        builder = builder.add_source(Environment::with_prefix(defaults::ENV_PREFIX).try_parsing(true));

        let config: PoolConfig = builder.build()?.try_deserialize()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.conninfo.trim().is_empty() {
            return Err(Error::Config("conninfo is required".into()));
        }
        if self.size == 0 {
            return Err(Error::Config("size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.size, defaults::POOL_SIZE);
        assert!(config.conninfo.is_empty());
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_validation() {
        assert!(PoolConfig::default().validate().is_err());

        let mut config = PoolConfig::with_conninfo("host=localhost dbname=app");
        assert!(config.validate().is_ok());

        config.size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_content = r#"
            conninfo = "host=db port=5432"
            size = 4
            log_level = "debug"
        "#;
        let config: PoolConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.conninfo, "host=db port=5432");
        assert_eq!(config.size, 4);
        assert_eq!(config.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "conninfo = \"dbname=test\"").unwrap();
        writeln!(file, "size = 3").unwrap();

        let config = PoolConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.conninfo, "dbname=test");
        assert_eq!(config.size, 3);

        let parsed = PoolConfig::from_file(file.path()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_file() {
        let err = PoolConfig::from_file(Path::new("/nonexistent/pqexec.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
