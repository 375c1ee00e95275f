//! Proxy engine shared by every instance type
//!
//! [`ProxyCore`] owns the swappable adapter snapshot, the statistics collector
//! and the accept-loop lifecycle. The concrete proxies only supply the
//! listener wrapping and a per-connection handler.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::common::{bind_listener, ProxyError, Result, Transferred};
use crate::config::{validate_instance, InstanceConfig};
use crate::protocol::ProtocolType;
use crate::security::{KeyStoreManager, RootCertManager};
use crate::stats::{ConnectionGuard, StatsCollector};
use super::adapter::{HealthCheckResult, TlcpAdapter};
use super::auto::{AdapterSource, ProtocolConn, ProtocolListener};
use super::cache::ProtocolCache;
use super::pipe::cancelled;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything a connection needs from one configuration generation
///
/// Replaced as a whole on reload; connections keep the generation they
/// started with.
#[derive(Debug)]
pub struct ProxySnapshot {
    /// Protocol contexts built from the configuration
    pub adapter: Arc<TlcpAdapter>,
    /// Per-target protocol cache (client role, `auto` only)
    pub cache: ProtocolCache,
}

impl ProxySnapshot {
    /// Build a new generation from `config`
    pub fn build(config: &InstanceConfig, keystores: &KeyStoreManager, rootcerts: &RootCertManager) -> Result<Self> {
        Ok(Self {
            adapter: Arc::new(TlcpAdapter::build(config, keystores, rootcerts)?),
            cache: ProtocolCache::default(),
        })
    }

    /// Configuration of this generation
    pub fn config(&self) -> &Arc<InstanceConfig> {
        self.adapter.config()
    }
}

/// Operations shared by the four proxy kinds
pub trait Proxy: Send + Sync + fmt::Debug {
    /// Bind the listener and spawn the accept loop
    ///
    /// Fails with `ProxyError::AlreadyRunning` while running and with
    /// `ProxyError::Listen` when the address cannot be bound.
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Stop accepting and wait for every connection to finish
    ///
    /// Stopping a stopped proxy is a no-op.
    fn stop(&self) -> BoxFuture<'_, Result<()>>;

    /// Swap in a configuration without touching the listener
    ///
    /// On failure the current configuration stays active.
    fn reload(&self, config: InstanceConfig) -> Result<()>;

    /// Whether the accept loop is running
    fn is_running(&self) -> bool;

    /// Current configuration
    fn config(&self) -> Arc<InstanceConfig>;

    /// Statistics collector
    fn stats(&self) -> Arc<StatsCollector>;

    /// Bound address while running
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Probe the target with `protocol`
    fn check_health(&self, protocol: ProtocolType, limit: Duration) -> BoxFuture<'_, HealthCheckResult>;
}

/// Implement [`Proxy`] for a type with a `core: ProxyCore` field and a
/// `launch(&self)` method starting it
macro_rules! impl_proxy {
    ($proxy:ty) => {
        impl $crate::proxy::Proxy for $proxy {
            fn start(&self) -> ::futures::future::BoxFuture<'_, $crate::Result<()>> {
                Box::pin(self.launch())
            }

            fn stop(&self) -> ::futures::future::BoxFuture<'_, $crate::Result<()>> {
                Box::pin(self.core.stop())
            }

            fn reload(&self, config: $crate::config::InstanceConfig) -> $crate::Result<()> {
                self.core.reload(config)
            }

            fn is_running(&self) -> bool {
                self.core.is_running()
            }

            fn config(&self) -> ::std::sync::Arc<$crate::config::InstanceConfig> {
                self.core.config()
            }

            fn stats(&self) -> ::std::sync::Arc<$crate::stats::StatsCollector> {
                self.core.stats()
            }

            fn local_addr(&self) -> Option<::std::net::SocketAddr> {
                self.core.local_addr()
            }

            fn check_health(
                &self,
                protocol: $crate::protocol::ProtocolType,
                limit: ::std::time::Duration,
            ) -> ::futures::future::BoxFuture<'_, $crate::proxy::HealthCheckResult> {
                self.core.check_health(protocol, limit)
            }
        }
    };
}
pub(crate) use impl_proxy;

/// Source of accepted connections
pub(crate) trait Acceptor: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Conn = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        async move {
            let (stream, peer) = TcpListener::accept(self).await?;
            let _ = stream.set_nodelay(true);
            Ok((stream, peer))
        }
    }
}

impl<A: AdapterSource> Acceptor for ProtocolListener<A> {
    type Conn = ProtocolConn<TcpStream>;

    fn accept(&self) -> impl Future<Output = io::Result<(ProtocolConn<TcpStream>, SocketAddr)>> + Send {
        ProtocolListener::accept(self)
    }
}

/// Per-connection context handed to handlers
#[derive(Debug, Clone)]
pub(crate) struct ConnContext {
    /// Remote address
    pub peer: SocketAddr,
    /// Listener address the connection arrived on
    pub local: SocketAddr,
    /// Configuration generation current at accept time
    pub snapshot: Arc<ProxySnapshot>,
    /// Shutdown signal of the proxy
    pub shutdown: watch::Receiver<bool>,
    /// Statistics of the owning proxy
    pub stats: Arc<StatsCollector>,
}

impl ConnContext {
    /// Instance name
    pub fn instance(&self) -> &str {
        &self.snapshot.config().name
    }

    /// Publish the outcome of a pipe
    ///
    /// Bytes from the client side count as received, bytes back to it as sent.
    pub fn record_transfer(&self, started: Instant, outcome: &Result<Transferred>) {
        let transferred = match outcome {
            Ok(transferred) => *transferred,
            Err(ProxyError::Pipe { transferred, .. }) => *transferred,
            Err(_) => return,
        };
        self.stats.add_bytes_received(transferred.a_to_b);
        self.stats.add_bytes_sent(transferred.b_to_a);
        self.stats.record_latency(started.elapsed());
        debug!(
            "[{}] {} closed: {} bytes in, {} bytes out, {:?}",
            self.instance(),
            self.peer,
            transferred.a_to_b,
            transferred.b_to_a,
            started.elapsed()
        );
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Lifecycle and shared state of one proxy
pub(crate) struct ProxyCore {
    snapshot: Arc<ArcSwap<ProxySnapshot>>,
    keystores: Arc<KeyStoreManager>,
    rootcerts: Arc<RootCertManager>,
    stats: Arc<StatsCollector>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCore")
            .field("adapter", &self.snapshot.load().adapter)
            .field("running", &self.is_running())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl ProxyCore {
    /// Build the first configuration generation
    ///
    /// # Errors
    ///
    /// Returns the adapter build error; nothing is started.
    pub fn new(
        config: &InstanceConfig,
        keystores: Arc<KeyStoreManager>,
        rootcerts: Arc<RootCertManager>,
        stats: Arc<StatsCollector>,
    ) -> Result<Self> {
        validate_instance(config)?;
        let snapshot = ProxySnapshot::build(config, &keystores, &rootcerts)?;
        Ok(Self {
            snapshot: Arc::new(ArcSwap::from_pointee(snapshot)),
            keystores,
            rootcerts,
            stats,
            lifecycle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        })
    }

    /// Live snapshot handle, for listeners that follow reloads
    pub fn live(&self) -> Arc<ArcSwap<ProxySnapshot>> {
        Arc::clone(&self.snapshot)
    }

    /// Current generation
    pub fn snapshot(&self) -> Arc<ProxySnapshot> {
        self.snapshot.load_full()
    }

    pub fn config(&self) -> Arc<InstanceConfig> {
        Arc::clone(self.snapshot.load().config())
    }

    pub fn stats(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind, wrap and spawn the accept loop
    ///
    /// # Parameters
    ///
    /// * `wrap` - Turns the bound listener into the acceptor of this proxy kind
    /// * `handler` - Serves one accepted connection
    pub async fn start<A, W, H, F>(&self, wrap: W, handler: H) -> Result<()>
    where
        A: Acceptor,
        W: FnOnce(TcpListener) -> A + Send,
        H: Fn(A::Conn, ConnContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut lifecycle = self.lifecycle.lock().await;
        let config = self.config();
        if lifecycle.is_some() {
            return Err(ProxyError::AlreadyRunning(config.name.clone()));
        }

        let listener = bind_listener(&config.listen)?;
        let local = listener.local_addr()?;
        let (shutdown, signal) = watch::channel(false);

        let accept_loop = AcceptLoop {
            acceptor: wrap(listener),
            handler,
            local,
            snapshot: Arc::clone(&self.snapshot),
            stats: Arc::clone(&self.stats),
            shutdown: signal,
        };
        let accept_task = tokio::spawn(accept_loop.run());

        *lifecycle = Some(Running { shutdown, accept_task });
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        self.running.store(true, Ordering::Release);

        info!(
            "[{}] {} proxy listening on {} ({}) -> {}",
            config.name, config.instance_type, local, config.protocol, config.target
        );
        Ok(())
    }

    /// Signal shutdown and wait for the accept loop and every connection
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            debug!("[{}] stop requested while not running", self.config().name);
            return Ok(());
        };

        info!("[{}] stopping", self.config().name);
        running.shutdown.send_replace(true);
        if let Err(e) = running.accept_task.await {
            error!("[{}] accept loop failed: {}", self.config().name, e);
        }

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.running.store(false, Ordering::Release);
        info!("[{}] stopped", self.config().name);
        Ok(())
    }

    /// Build a new generation and swap it in
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Reload` when the name, type, protocol or listen
    /// address changed, or when validation or the adapter build fails. The
    /// current generation stays active in every error case.
    pub fn reload(&self, config: InstanceConfig) -> Result<()> {
        let current = self.config();
        if config.name != current.name {
            return Err(ProxyError::Reload(format!(
                "instance name cannot change ({} -> {})",
                current.name, config.name
            )));
        }
        if config.instance_type != current.instance_type
            || config.protocol != current.protocol
            || config.listen != current.listen
        {
            return Err(ProxyError::Reload(format!(
                "{}: type, protocol and listen address require a restart",
                current.name
            )));
        }

        validate_instance(&config).map_err(|e| ProxyError::Reload(format!("{}: {}", current.name, e)))?;
        let snapshot = ProxySnapshot::build(&config, &self.keystores, &self.rootcerts)
            .map_err(|e| ProxyError::Reload(format!("{}: {}", current.name, e)))?;

        self.snapshot.store(Arc::new(snapshot));
        info!("[{}] configuration reloaded (target {})", current.name, config.target);
        Ok(())
    }

    pub fn check_health(&self, protocol: ProtocolType, limit: Duration) -> BoxFuture<'static, HealthCheckResult> {
        let adapter = Arc::clone(&self.snapshot.load().adapter);
        Box::pin(async move { adapter.check_health(protocol, limit).await })
    }
}

struct AcceptLoop<A, H> {
    acceptor: A,
    handler: H,
    local: SocketAddr,
    snapshot: Arc<ArcSwap<ProxySnapshot>>,
    stats: Arc<StatsCollector>,
    shutdown: watch::Receiver<bool>,
}

impl<A, H, F> AcceptLoop<A, H>
where
    A: Acceptor,
    H: Fn(A::Conn, ConnContext) -> F + Send + Sync + 'static,
    F: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(self) {
        let AcceptLoop {
            acceptor,
            handler,
            local,
            snapshot,
            stats,
            mut shutdown,
        } = self;
        let name = snapshot.load().config().name.clone();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                accepted = acceptor.accept() => match accepted {
                    Ok((conn, peer)) => {
                        debug!("[{}] accepted connection from {}", name, peer);
                        let ctx = ConnContext {
                            peer,
                            local,
                            snapshot: snapshot.load_full(),
                            shutdown: shutdown.clone(),
                            stats: Arc::clone(&stats),
                        };
                        let guard = ConnectionGuard::new(Arc::clone(&stats));
                        let mut cancel = shutdown.clone();
                        let serve = handler(conn, ctx);

                        tasks.spawn(async move {
                            let _guard = guard;
                            tokio::select! {
                                biased;
                                result = serve => result.map_err(|e| (peer, e)),
                                _ = cancelled(&mut cancel) => Ok(()),
                            }
                        });
                    }
                    Err(e) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        warn!("[{}] accept failed: {}", name, e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record_outcome(&name, &stats, joined);
                }
            }
        }

        // Close the listener before draining
        drop(acceptor);
        debug!("[{}] accept loop stopped, waiting for {} connection(s)", name, tasks.len());
        while let Some(joined) = tasks.join_next().await {
            record_outcome(&name, &stats, joined);
        }
    }
}

fn record_outcome(
    name: &str,
    stats: &StatsCollector,
    joined: std::result::Result<std::result::Result<(), (SocketAddr, ProxyError)>, JoinError>,
) {
    match joined {
        Ok(Ok(())) => {}
        // Resets and idle timeouts mid-stream are not proxy failures
        Ok(Err((peer, e @ ProxyError::Pipe { .. }))) => debug!("[{}] {}: {}", name, peer, e),
        Ok(Err((peer, e))) => {
            stats.increment_errors();
            warn!("[{}] {}: {}", name, peer, e);
        }
        Err(e) if e.is_panic() => {
            stats.increment_errors();
            error!("[{}] connection task panicked: {}", name, e);
        }
        Err(e) => debug!("[{}] connection task cancelled: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceType, KeyStoreConfig};
    use crate::security::testutil::tls_keystore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn new_core(config: &InstanceConfig) -> ProxyCore {
        let keystores = KeyStoreManager::new();
        keystores.register(tls_keystore("site").1);
        ProxyCore::new(
            config,
            Arc::new(keystores),
            Arc::new(RootCertManager::new()),
            Arc::new(StatsCollector::new(config.name.clone())),
        )
        .unwrap()
    }

    fn plain_config() -> InstanceConfig {
        let mut config = InstanceConfig::new("core", InstanceType::Server, "127.0.0.1:0", "127.0.0.1:9");
        config.protocol = ProtocolType::Tls;
        config.tls.keystore = Some(KeyStoreConfig::named("site"));
        config
    }

    async fn echo(mut stream: TcpStream, _ctx: ConnContext) -> Result<()> {
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await?;
        stream.write_all(&buf[..n]).await?;
        Ok(())
    }

    async fn failing(_stream: TcpStream, _ctx: ConnContext) -> Result<()> {
        Err(ProxyError::Dial("unreachable".to_string()))
    }

    async fn reset_mid_stream(_stream: TcpStream, _ctx: ConnContext) -> Result<()> {
        Err(ProxyError::Pipe {
            source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer"),
            transferred: Transferred { a_to_b: 4, b_to_a: 0 },
        })
    }

    async fn panicking(_stream: TcpStream, _ctx: ConnContext) -> Result<()> {
        panic!("handler fault");
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_twice() {
        let core = new_core(&plain_config());
        core.start(|l| l, echo).await.unwrap();
        let addr = core.local_addr().unwrap();
        assert!(core.is_running());

        assert!(matches!(core.start(|l| l, echo).await, Err(ProxyError::AlreadyRunning(_))));
        assert_eq!(core.local_addr(), Some(addr));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        drop(stream);

        core.stop().await.unwrap();
        core.stop().await.unwrap();
        assert!(!core.is_running());
        assert_eq!(core.local_addr(), None);
        assert_eq!(core.stats().snapshot().active_connections, 0);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_counted() {
        let core = new_core(&plain_config());
        core.start(|l| l, failing).await.unwrap();
        let addr = core.local_addr().unwrap();
        TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        core.stop().await.unwrap();

        let core2 = new_core(&plain_config());
        core2.start(|l| l, panicking).await.unwrap();
        let addr = core2.local_addr().unwrap();
        TcpStream::connect(addr).await.unwrap();
        TcpStream::connect(addr).await.unwrap();
        // Still accepting after a handler fault
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(core2.is_running());
        core2.stop().await.unwrap();

        let snapshot = core.stats().snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.active_connections, 0);
        let snapshot = core2.stats().snapshot();
        assert_eq!(snapshot.errors, 2);
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[tokio::test]
    async fn test_pipe_errors_are_not_counted() {
        let core = new_core(&plain_config());
        core.start(|l| l, reset_mid_stream).await.unwrap();
        let addr = core.local_addr().unwrap();
        TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        core.stop().await.unwrap();

        let snapshot = core.stats().snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.errors, 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_idle_connections() {
        async fn idle(mut stream: TcpStream, ctx: ConnContext) -> Result<()> {
            let mut shutdown = ctx.shutdown.clone();
            cancelled(&mut shutdown).await;
            stream.shutdown().await?;
            Ok(())
        }

        let core = new_core(&plain_config());
        core.start(|l| l, idle).await.unwrap();
        let addr = core.local_addr().unwrap();
        let _held = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(core.stats().snapshot().active_connections, 1);

        tokio::time::timeout(Duration::from_secs(5), core.stop()).await.unwrap().unwrap();
        assert_eq!(core.stats().snapshot().active_connections, 0);
    }

    #[tokio::test]
    async fn test_reload_rules() {
        let core = new_core(&plain_config());

        let mut retarget = plain_config();
        retarget.target = "127.0.0.1:10".to_string();
        core.reload(retarget.clone()).unwrap();
        assert_eq!(*core.config(), retarget);

        let mut moved = retarget.clone();
        moved.listen = "127.0.0.1:1".to_string();
        assert!(matches!(core.reload(moved), Err(ProxyError::Reload(_))));

        let mut renamed = retarget.clone();
        renamed.name = "other".to_string();
        assert!(matches!(core.reload(renamed), Err(ProxyError::Reload(_))));

        let mut broken = retarget.clone();
        broken.tls.keystore = None;
        assert!(matches!(core.reload(broken), Err(ProxyError::Reload(_))));
        assert_eq!(*core.config(), retarget);
    }

    #[test]
    fn test_snapshot_cache_is_fresh_after_reload() {
        let core = new_core(&plain_config());
        core.snapshot().cache.insert("a:1", ProtocolType::Tls);
        assert_eq!(core.snapshot().cache.len(), 1);

        core.reload(plain_config()).unwrap();
        assert!(core.snapshot().cache.is_empty());
    }
}
