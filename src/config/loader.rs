//! Configuration Loader
//!
//! Layers built-in defaults, an optional TOML file and `RELAY__SECTION__KEY`
//! environment variables, then validates the merged result.

use super::RelayConfig;
use crate::error::{RelayError, RelayResult};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming a config file when none is passed explicitly.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG_PATH";
pub const ENV_PREFIX: &str = "RELAY";
const ENV_SEPARATOR: &str = "__";

impl RelayConfig {
    /// Load configuration for this process.
    ///
    /// `path` wins over `RELAY_CONFIG_PATH`; with neither, only defaults and
    /// environment overrides apply.
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);
        load_layers(path.as_deref(), environment)
    }
}

/// Merge defaults, file and environment sources into a validated config.
pub fn load_layers(path: Option<&Path>, environment: Environment) -> RelayResult<RelayConfig> {
    let mut builder = Config::builder().add_source(Config::try_from(&RelayConfig::default())?);

    if let Some(path) = path {
        if !path.is_file() {
            return Err(RelayError::Configuration(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        debug!(path = %path.display(), "Loading relay configuration file");
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    let config: RelayConfig = builder
        .add_source(environment)
        .build()?
        .try_deserialize()?;

    config.validate()?;

    debug!(
        node_id = %config.node.node_id,
        backend = ?config.storage.backend,
        staleness_ms = config.router.staleness_threshold_ms,
        "Relay configuration loaded"
    );
    Ok(config)
}
