//! Configuration validator
//!
//! Structural checks that need no keystore or network access. Certificate
//! material is checked later, when an adapter is built.

use std::collections::HashSet;

use log::warn;

use crate::common::{parse_socket_addr, ProxyError, Result};
use crate::config::cipher::{parse_cipher_suites, parse_version};
use crate::config::types::{AppConfig, InstanceConfig, KeyStoreConfig, KeyStoreLoader};
use crate::protocol::ProtocolType;

/// Validate the whole configuration file
pub fn validate_config(config: &AppConfig) -> Result<()> {
    match config.log.level.as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        level => {
            warn!("Invalid log level: {}. Using default: info", level);
        }
    }

    let mut keystore_names = HashSet::new();
    for keystore in &config.keystores {
        let name = keystore.name.as_deref().unwrap_or_default();
        if name.is_empty() {
            return Err(ProxyError::Config("top-level keystore requires a name".to_string()));
        }
        if !keystore_names.insert(name) {
            return Err(ProxyError::Config(format!("duplicate keystore name: {}", name)));
        }
        validate_keystore_ref(keystore)?;
    }

    let mut root_names = HashSet::new();
    for root in &config.root_certs {
        if !root_names.insert(root.name.as_str()) {
            return Err(ProxyError::Config(format!("duplicate root certificate name: {}", root.name)));
        }
    }

    let mut instance_names = HashSet::new();
    for instance in &config.instances {
        validate_instance(instance)?;
        if !instance_names.insert(instance.name.as_str()) {
            return Err(ProxyError::Config(format!("duplicate instance name: {}", instance.name)));
        }
    }

    Ok(())
}

/// Validate one instance
pub fn validate_instance(config: &InstanceConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(ProxyError::Config("instance name is required".to_string()));
    }
    if config.listen.trim().is_empty() {
        return Err(ProxyError::Config(format!("instance {}: listen address is required", config.name)));
    }
    if config.target.trim().is_empty() {
        return Err(ProxyError::Config(format!("instance {}: target address is required", config.name)));
    }
    parse_socket_addr(&config.listen)
        .map_err(|e| ProxyError::Config(format!("instance {}: {}", config.name, e)))?;

    if config.buffer_size == 0 {
        return Err(ProxyError::Config(format!(
            "instance {}: buffer size must be greater than 0",
            config.name
        )));
    }
    if config.timeout.dial == 0 || config.timeout.handshake == 0 {
        return Err(ProxyError::Config(format!(
            "instance {}: dial and handshake timeouts must be greater than 0",
            config.name
        )));
    }
    if config.http.is_some() && !config.instance_type.is_http() {
        warn!(
            "instance {}: http rules are ignored for type {}",
            config.name, config.instance_type
        );
    }

    for protocol in [ProtocolType::Tlcp, ProtocolType::Tls] {
        let settings = config.settings(protocol);
        parse_cipher_suites(protocol, &settings.cipher_suites)?;

        let min = settings.min_version.as_deref().map(|v| parse_version(protocol, v)).transpose()?;
        let max = settings.max_version.as_deref().map(|v| parse_version(protocol, v)).transpose()?;
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(ProxyError::Config(format!(
                    "instance {}: {} min-version is above max-version",
                    config.name, protocol
                )));
            }
        }

        if let Some(keystore) = &settings.keystore {
            validate_keystore_ref(keystore)?;
        }
    }

    Ok(())
}

fn validate_keystore_ref(keystore: &KeyStoreConfig) -> Result<()> {
    match keystore.loader {
        KeyStoreLoader::Named if keystore.param("name").is_none() => Err(ProxyError::Config(
            "named keystore reference requires params.name".to_string(),
        )),
        KeyStoreLoader::File
            if keystore.param("sign-cert").or_else(|| keystore.param("cert")).is_none() =>
        {
            Err(ProxyError::Config(
                "file keystore requires params.sign-cert (or params.cert)".to_string(),
            ))
        }
        _ => Ok(()),
    }
}
