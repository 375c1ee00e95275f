//! Proxy instance
//!
//! An [`Instance`] is the unit of configuration and lifecycle: one listen
//! address, one target, one proxy of the configured kind. It tracks the
//! lifecycle status and can swap its proxy for a freshly built one on restart.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::common::{ProxyError, Result};
use crate::config::{InstanceConfig, InstanceType};
use crate::protocol::ProtocolType;
use crate::proxy::{ClientProxy, HealthCheckResult, HttpClientProxy, HttpServerProxy, Proxy, ServerProxy};
use crate::security::{KeyStoreManager, RootCertManager};
use crate::stats::{StatsCollector, StatsSnapshot};
use super::status::Status;

/// Build the proxy matching `config.instance_type`
///
/// # Errors
///
/// Returns the validation or adapter build error of the configuration.
pub fn create_proxy(
    config: &InstanceConfig,
    keystores: &Arc<KeyStoreManager>,
    rootcerts: &Arc<RootCertManager>,
    stats: Arc<StatsCollector>,
) -> Result<Arc<dyn Proxy>> {
    let keystores = Arc::clone(keystores);
    let rootcerts = Arc::clone(rootcerts);
    let proxy: Arc<dyn Proxy> = match config.instance_type {
        InstanceType::Server => Arc::new(ServerProxy::new(config, keystores, rootcerts, stats)?),
        InstanceType::Client => Arc::new(ClientProxy::new(config, keystores, rootcerts, stats)?),
        InstanceType::HttpServer => Arc::new(HttpServerProxy::new(config, keystores, rootcerts, stats)?),
        InstanceType::HttpClient => Arc::new(HttpClientProxy::new(config, keystores, rootcerts, stats)?),
    };
    Ok(proxy)
}

#[derive(Debug)]
struct InstanceState {
    status: Status,
    proxy: Arc<dyn Proxy>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Held for the duration of a lifecycle operation
#[derive(Debug, Default)]
struct Lifecycle {
    /// Set once the instance was removed from its registry
    retired: bool,
}

/// One named proxy and its lifecycle
///
/// Lifecycle operations are serialized per instance; readers never wait for
/// them.
#[derive(Debug)]
pub struct Instance {
    name: String,
    keystores: Arc<KeyStoreManager>,
    rootcerts: Arc<RootCertManager>,
    stats: Arc<StatsCollector>,
    ops: tokio::sync::Mutex<Lifecycle>,
    state: RwLock<InstanceState>,
}

impl Instance {
    /// Build a stopped instance
    ///
    /// # Parameters
    ///
    /// * `config` - Instance configuration
    /// * `keystores` - Keystore registry
    /// * `rootcerts` - Root certificate registry
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` (or a keystore lookup error) when the
    /// configuration cannot be turned into a proxy. Nothing is bound.
    pub fn new(config: &InstanceConfig, keystores: Arc<KeyStoreManager>, rootcerts: Arc<RootCertManager>) -> Result<Self> {
        let stats = Arc::new(StatsCollector::new(config.name.clone()));
        let proxy = create_proxy(config, &keystores, &rootcerts, Arc::clone(&stats))?;
        Ok(Self {
            name: config.name.clone(),
            keystores,
            rootcerts,
            stats,
            ops: tokio::sync::Mutex::new(Lifecycle::default()),
            state: RwLock::new(InstanceState {
                status: Status::Created,
                proxy,
                started_at: None,
                last_error: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_type(&self) -> InstanceType {
        self.config().instance_type
    }

    pub fn protocol(&self) -> ProtocolType {
        self.config().protocol
    }

    pub fn status(&self) -> Status {
        self.read(|state| state.status)
    }

    /// Configuration currently in effect
    pub fn config(&self) -> Arc<InstanceConfig> {
        self.proxy().config()
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Collector shared by every proxy this instance builds
    pub fn stats_collector(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.stats)
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.proxy().local_addr()
    }

    /// When the current run started
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.read(|state| state.started_at)
    }

    /// Message of the last failed start or restart
    pub fn last_error(&self) -> Option<String> {
        self.read(|state| state.last_error.clone())
    }

    /// Start the proxy
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::AlreadyRunning` while running; the listener and
    /// status are left untouched. A bind failure moves the instance to
    /// [`Status::Error`] and is returned.
    pub async fn start(&self) -> Result<()> {
        let ops = self.ops.lock().await;
        self.ensure_registered(&ops)?;
        if self.status() == Status::Running {
            return Err(ProxyError::AlreadyRunning(self.name.clone()));
        }
        self.launch().await
    }

    /// Stop the proxy and wait for its connections
    ///
    /// Stopping an instance that is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.halt().await
    }

    /// Apply a configuration to the running proxy
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotRunning` unless running, and the proxy's
    /// `ProxyError::Reload` when the configuration is rejected. The instance
    /// keeps running with its previous configuration in both cases.
    pub async fn reload(&self, config: InstanceConfig) -> Result<()> {
        let _ops = self.ops.lock().await;
        if self.status() != Status::Running {
            return Err(ProxyError::NotRunning(self.name.clone()));
        }
        self.proxy().reload(config).inspect_err(|e| {
            warn!("[{}] reload rejected: {}", self.name, e);
        })
    }

    /// Stop, rebuild the proxy from `config` and start it again
    ///
    /// The only way to change the type, protocol or listen address of an
    /// instance. Statistics carry over.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidState` if `config` names another instance.
    /// Build and start failures move the instance to [`Status::Error`].
    pub async fn restart(&self, config: InstanceConfig) -> Result<()> {
        let ops = self.ops.lock().await;
        self.ensure_registered(&ops)?;
        if config.name != self.name {
            return Err(ProxyError::InvalidState(format!(
                "instance {} cannot be restarted as {}",
                self.name, config.name
            )));
        }

        self.halt().await?;
        match create_proxy(&config, &self.keystores, &self.rootcerts, Arc::clone(&self.stats)) {
            Ok(proxy) => self.write(|state| state.proxy = proxy),
            Err(e) => {
                warn!("[{}] restart failed: {}", self.name, e);
                self.write(|state| {
                    state.status = Status::Error;
                    state.last_error = Some(e.to_string());
                });
                return Err(e);
            }
        }
        info!("[{}] restarting as {} ({})", self.name, config.instance_type, config.protocol);
        self.launch().await
    }

    /// Mark the instance as removed from its registry
    ///
    /// A retired instance never starts again.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidState` while the instance is running or
    /// another lifecycle operation is in progress.
    pub(crate) fn retire(&self) -> Result<()> {
        let mut ops = self
            .ops
            .try_lock()
            .map_err(|_| ProxyError::InvalidState(format!("instance {} is busy", self.name)))?;
        if self.status() == Status::Running {
            return Err(ProxyError::InvalidState(format!("instance {} is running, stop it first", self.name)));
        }
        ops.retired = true;
        Ok(())
    }

    fn ensure_registered(&self, ops: &Lifecycle) -> Result<()> {
        if ops.retired {
            return Err(ProxyError::InvalidState(format!("instance {} was deleted", self.name)));
        }
        Ok(())
    }

    /// Probe the target with `protocol`
    ///
    /// The probe is bounded by the dial plus handshake timeouts.
    pub async fn check_health(&self, protocol: ProtocolType) -> HealthCheckResult {
        let proxy = self.proxy();
        let config = proxy.config();
        let limit = config.timeout.dial() + config.timeout.handshake();
        proxy.check_health(protocol, limit).await
    }

    async fn launch(&self) -> Result<()> {
        let proxy = self.proxy();
        match proxy.start().await {
            Ok(()) => {
                self.write(|state| {
                    state.status = Status::Running;
                    state.started_at = Some(Utc::now());
                    state.last_error = None;
                });
                Ok(())
            }
            Err(e) => {
                warn!("[{}] start failed: {}", self.name, e);
                self.write(|state| {
                    state.status = Status::Error;
                    state.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    async fn halt(&self) -> Result<()> {
        self.proxy().stop().await?;
        self.write(|state| {
            if state.status == Status::Running {
                state.status = Status::Stopped;
                state.started_at = None;
            }
        });
        Ok(())
    }

    fn proxy(&self) -> Arc<dyn Proxy> {
        self.read(|state| Arc::clone(&state.proxy))
    }

    fn read<T>(&self, f: impl FnOnce(&InstanceState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self, f: impl FnOnce(&mut InstanceState)) {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyStoreConfig;
    use crate::security::testutil::tls_keystore;

    fn registries() -> (Arc<KeyStoreManager>, Arc<RootCertManager>) {
        let keystores = KeyStoreManager::new();
        keystores.register(tls_keystore("site").1);
        (Arc::new(keystores), Arc::new(RootCertManager::new()))
    }

    fn server_config(name: &str, listen: &str) -> InstanceConfig {
        let mut config = InstanceConfig::new(name, InstanceType::Server, listen, "127.0.0.1:9");
        config.tls.keystore = Some(KeyStoreConfig::named("site"));
        config
    }

    fn instance(config: &InstanceConfig) -> Instance {
        let (keystores, rootcerts) = registries();
        Instance::new(config, keystores, rootcerts).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let inst = instance(&server_config("life", "127.0.0.1:0"));
        assert_eq!(inst.status(), Status::Created);
        assert_eq!(inst.local_addr(), None);

        inst.start().await.unwrap();
        assert_eq!(inst.status(), Status::Running);
        assert!(inst.started_at().is_some());
        let addr = inst.local_addr().unwrap();

        assert!(matches!(inst.start().await, Err(ProxyError::AlreadyRunning(_))));
        assert_eq!(inst.status(), Status::Running);
        assert_eq!(inst.local_addr(), Some(addr));

        inst.stop().await.unwrap();
        inst.stop().await.unwrap();
        assert_eq!(inst.status(), Status::Stopped);
        assert_eq!(inst.started_at(), None);

        inst.start().await.unwrap();
        assert_eq!(inst.status(), Status::Running);
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_sets_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let inst = instance(&server_config("busy", &taken.local_addr().unwrap().to_string()));

        assert!(matches!(inst.start().await, Err(ProxyError::Listen(_))));
        assert_eq!(inst.status(), Status::Error);
        assert!(inst.last_error().is_some());
    }

    #[tokio::test]
    async fn test_reload_requires_running() {
        let config = server_config("idle", "127.0.0.1:0");
        let inst = instance(&config);
        assert!(matches!(inst.reload(config.clone()).await, Err(ProxyError::NotRunning(_))));

        inst.start().await.unwrap();
        let mut retarget = config.clone();
        retarget.target = "127.0.0.1:10".to_string();
        inst.reload(retarget.clone()).await.unwrap();
        assert_eq!(*inst.config(), retarget);

        let mut broken = retarget.clone();
        broken.protocol = ProtocolType::Tlcp;
        assert!(inst.reload(broken).await.is_err());
        assert_eq!(*inst.config(), retarget);
        assert_eq!(inst.status(), Status::Running);
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_changes_protocol() {
        let config = server_config("swap", "127.0.0.1:0");
        let inst = instance(&config);
        inst.start().await.unwrap();
        let collector = inst.stats_collector();

        let mut fixed = config.clone();
        fixed.protocol = ProtocolType::Tls;
        inst.restart(fixed.clone()).await.unwrap();
        assert_eq!(inst.status(), Status::Running);
        assert_eq!(*inst.config(), fixed);
        assert_eq!(inst.protocol(), ProtocolType::Tls);
        assert!(Arc::ptr_eq(&collector, &inst.stats_collector()));

        let mut renamed = fixed.clone();
        renamed.name = "other".to_string();
        assert!(matches!(inst.restart(renamed).await, Err(ProxyError::InvalidState(_))));
        inst.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_with_bad_config_sets_error() {
        let config = server_config("bad", "127.0.0.1:0");
        let inst = instance(&config);
        inst.start().await.unwrap();

        let mut broken = config.clone();
        broken.protocol = ProtocolType::Tlcp;
        assert!(inst.restart(broken).await.is_err());
        assert_eq!(inst.status(), Status::Error);
        assert_eq!(inst.local_addr(), None);

        // The previous proxy is still usable
        inst.start().await.unwrap();
        assert_eq!(inst.status(), Status::Running);
        inst.stop().await.unwrap();
    }
}
