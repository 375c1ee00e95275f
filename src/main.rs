//! TLCP Channel command line tool
//!
//! Loads the configuration file, starts every enabled instance and runs until
//! Ctrl+C. On Unix, SIGHUP re-reads the file and applies it to the running
//! instances.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use tlcp_channel::common::{init_logger, Result};
use tlcp_channel::config::{load_config, AppConfig, InstanceConfig, DEFAULT_CONFIG_FILE};
use tlcp_channel::instance::{Instance, InstanceManager, Status};
use tlcp_channel::security::{KeyStoreManager, RootCertManager};
use tlcp_channel::{APP_NAME, VERSION};

/// TLCP/TLS proxy channel with automatic protocol detection
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Configuration file
    #[clap(short, long, env = "TLCPCHAN_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level, overrides the configuration file
    #[clap(long)]
    log_level: Option<String>,

    /// Validate the configuration and certificates, then exit
    #[clap(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    init_logger(args.log_level.as_deref().unwrap_or(&config.log.level));
    info!("Starting {} v{}", APP_NAME, VERSION);

    let manager = InstanceManager::new(Arc::new(KeyStoreManager::new()), Arc::new(RootCertManager::new()));
    register_certificates(&config, &manager)?;
    for instance in &config.instances {
        manager.create(instance)?;
    }

    if args.check {
        info!(
            "Configuration {} is valid: {} instance(s)",
            args.config.display(),
            manager.len()
        );
        return Ok(());
    }

    let errors = manager.start_all().await;
    if !errors.is_empty() {
        warn!("{} instance(s) failed to start", errors.len());
    }

    info!("{} ready, press Ctrl+C to stop", APP_NAME);
    run_until_shutdown(&manager, &args.config).await?;

    info!("Shutting down");
    manager.stop_all().await;
    info!("Shutdown complete");
    Ok(())
}

/// Register the keystores and root certificates declared at top level
fn register_certificates(config: &AppConfig, manager: &InstanceManager) -> Result<()> {
    for keystore in &config.keystores {
        manager.keystores().load(keystore)?;
    }
    for root in &config.root_certs {
        let count = manager.rootcerts().load_file(root.name.clone(), &root.path)?;
        info!("Loaded {} root certificate(s) as {}", count, root.name);
    }
    Ok(())
}

#[cfg(unix)]
async fn run_until_shutdown(manager: &InstanceManager, path: &Path) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading {}", path.display());
                if let Err(e) = reload(manager, path).await {
                    error!("Reload failed, keeping the running configuration: {}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn run_until_shutdown(_manager: &InstanceManager, _path: &Path) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Apply the configuration file to the running instances
///
/// Changed instances are reloaded, or restarted when their type, protocol or
/// listen address changed. New instances are created and started; instances
/// no longer in the file are stopped and removed.
async fn reload(manager: &InstanceManager, path: &Path) -> Result<()> {
    let config = load_config(path)?;
    register_certificates(&config, manager)?;

    for instance_config in &config.instances {
        let outcome = match manager.get(&instance_config.name) {
            Some(instance) => apply(&instance, instance_config).await,
            None => match manager.create(instance_config) {
                Ok(instance) if instance_config.enabled => instance.start().await,
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = outcome {
            warn!("[{}] {}", instance_config.name, e);
        }
    }

    let declared: HashSet<&str> = config.instances.iter().map(|i| i.name.as_str()).collect();
    for instance in manager.list() {
        if declared.contains(instance.name()) {
            continue;
        }
        instance.stop().await?;
        manager.delete(instance.name())?;
    }

    info!("Configuration reloaded: {} instance(s)", manager.len());
    Ok(())
}

async fn apply(instance: &Instance, config: &InstanceConfig) -> Result<()> {
    let current = instance.config();
    if !config.enabled {
        return instance.stop().await;
    }
    if *current == *config && instance.status() == Status::Running {
        return Ok(());
    }

    let needs_restart = current.instance_type != config.instance_type
        || current.protocol != config.protocol
        || current.listen != config.listen;
    if needs_restart || instance.status() != Status::Running {
        instance.restart(config.clone()).await
    } else {
        instance.reload(config.clone()).await
    }
}
