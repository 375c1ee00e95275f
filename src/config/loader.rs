//! Configuration loading functionality
//!
//! Reads the JSON configuration file through the `config` crate and validates it.

use std::path::Path;

use log::{debug, info};

use crate::common::{ProxyError, Result};
use crate::config::types::AppConfig;
use crate::config::validator::validate_config;

/// Load and validate a configuration file
///
/// # Parameters
///
/// * `path` - JSON configuration file
///
/// # Returns
///
/// The parsed configuration
///
/// # Errors
///
/// Returns `ProxyError::Config` if the file cannot be read, parsed or validated.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path = path.as_ref();
    info!("Loading configuration from {}", path.display());

    let source = ::config::Config::builder()
        .add_source(::config::File::from(path).format(::config::FileFormat::Json))
        .build()
        .map_err(|e| ProxyError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

    let config: AppConfig = source
        .try_deserialize()
        .map_err(|e| ProxyError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

    validate_config(&config)?;
    debug!(
        "Loaded {} instance(s), {} keystore(s), {} root certificate(s)",
        config.instances.len(),
        config.keystores.len(),
        config.root_certs.len()
    );

    Ok(config)
}

/// Parse a configuration from a JSON string
pub fn parse_config(json: &str) -> Result<AppConfig> {
    let source = ::config::Config::builder()
        .add_source(::config::File::from_str(json, ::config::FileFormat::Json))
        .build()
        .map_err(|e| ProxyError::Config(format!("Failed to read configuration: {}", e)))?;

    let config: AppConfig = source
        .try_deserialize()
        .map_err(|e| ProxyError::Config(format!("Failed to parse configuration: {}", e)))?;

    validate_config(&config)?;
    Ok(config)
}
