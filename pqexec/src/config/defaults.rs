//! Default configuration values - single source of truth

/// Default number of pooled connections
pub const POOL_SIZE: usize = 10;

/// Default config file name, looked up without extension
pub const CONFIG_FILE: &str = "pqexec";

/// Prefix for environment overrides (`PQEXEC_CONNINFO`, `PQEXEC_SIZE`, ...)
pub const ENV_PREFIX: &str = "PQEXEC";
