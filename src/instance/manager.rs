//! Instance registry

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};

use crate::common::{ProxyError, Result};
use crate::config::InstanceConfig;
use crate::security::{KeyStoreManager, RootCertManager};
use super::instance::Instance;
use super::status::Status;

/// Name-keyed registry of instances
///
/// The registry lock only guards the map; lifecycle operations run on
/// instances taken out of it.
#[derive(Debug)]
pub struct InstanceManager {
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    keystores: Arc<KeyStoreManager>,
    rootcerts: Arc<RootCertManager>,
}

impl InstanceManager {
    /// Empty registry building instances against the given certificate registries
    pub fn new(keystores: Arc<KeyStoreManager>, rootcerts: Arc<RootCertManager>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            keystores,
            rootcerts,
        }
    }

    pub fn keystores(&self) -> &Arc<KeyStoreManager> {
        &self.keystores
    }

    pub fn rootcerts(&self) -> &Arc<RootCertManager> {
        &self.rootcerts
    }

    /// Build and register a stopped instance
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::AlreadyExists` if the name is taken, leaving the
    /// registry untouched, or the instance build error.
    pub fn create(&self, config: &InstanceConfig) -> Result<Arc<Instance>> {
        if self.contains(&config.name) {
            return Err(ProxyError::AlreadyExists(config.name.clone()));
        }

        let instance = Arc::new(Instance::new(config, Arc::clone(&self.keystores), Arc::clone(&self.rootcerts))?);

        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        // Another create may have won while the proxy was being built
        if instances.contains_key(&config.name) {
            return Err(ProxyError::AlreadyExists(config.name.clone()));
        }
        instances.insert(config.name.clone(), Arc::clone(&instance));
        info!("Created {} instance {}", config.instance_type, config.name);
        Ok(instance)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Every registered instance, sorted by name
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut list: Vec<Arc<Instance>> = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    pub fn len(&self) -> usize {
        self.instances.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister a stopped instance
    ///
    /// The instance is retired under its lifecycle lock, so a concurrent
    /// start either finishes first and blocks the delete or fails afterwards.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` for unknown names and
    /// `ProxyError::InvalidState` while the instance is running or busy.
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        let instance = instances
            .get(name)
            .ok_or_else(|| ProxyError::NotFound(format!("instance {}", name)))?;
        instance.retire()?;
        instances.remove(name);
        info!("Deleted instance {}", name);
        Ok(())
    }

    /// Start every enabled instance that is not running
    ///
    /// Failures do not stop the batch; they are returned together.
    pub async fn start_all(&self) -> Vec<ProxyError> {
        let mut errors = Vec::new();
        for instance in self.list() {
            if !instance.config().enabled {
                debug!("Instance {} is disabled, not starting", instance.name());
                continue;
            }
            if instance.status() == Status::Running {
                continue;
            }
            if let Err(e) = instance.start().await {
                warn!("Instance {} failed to start: {}", instance.name(), e);
                errors.push(e);
            }
        }
        errors
    }

    /// Stop every instance
    pub async fn stop_all(&self) {
        for instance in self.list() {
            if let Err(e) = instance.stop().await {
                warn!("Instance {} failed to stop: {}", instance.name(), e);
            }
        }
    }
}
