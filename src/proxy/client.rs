//! Client proxy
//!
//! Accepts plain TCP locally and forwards it to the target over TLCP or TLS.
//! In `auto` mode the protocol of each target is detected once and cached.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use tokio::net::{TcpListener, TcpStream};

use crate::common::Result;
use crate::config::InstanceConfig;
use crate::protocol::ProtocolType;
use crate::security::{KeyStoreManager, RootCertManager};
use crate::stats::StatsCollector;
use super::adapter::SecureStream;
use super::engine::{impl_proxy, ConnContext, ProxyCore, ProxySnapshot};
use super::pipe::{pipe, PipeOptions};

/// Dial `target` with the protocol the snapshot resolves for it
///
/// A fixed protocol is used as is. In `auto` mode a fresh cache entry decides;
/// without one, TLCP is attempted first and the outcome is cached: TLCP on
/// success, TLS otherwise.
pub(crate) async fn dial_resolved(snapshot: &ProxySnapshot, target: &str) -> Result<SecureStream> {
    let adapter = &snapshot.adapter;
    let protocol = match adapter.protocol() {
        ProtocolType::Auto => snapshot.cache.get(target),
        fixed => Some(fixed),
    };
    if let Some(protocol) = protocol {
        return adapter.dial(target, protocol).await;
    }

    match adapter.dial(target, ProtocolType::Tlcp).await {
        Ok(stream) => {
            snapshot.cache.insert(target, ProtocolType::Tlcp);
            Ok(stream)
        }
        Err(e) => {
            debug!("TLCP detection against {} failed, using TLS: {}", target, e);
            snapshot.cache.insert(target, ProtocolType::Tls);
            adapter.dial(target, ProtocolType::Tls).await
        }
    }
}

/// Plain TCP in, TLCP/TLS out
#[derive(Debug)]
pub struct ClientProxy {
    core: ProxyCore,
}

impl ClientProxy {
    /// Create a stopped client proxy
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` for unusable client settings, such as a
    /// TLCP ECDHE suite without mutual authentication.
    pub fn new(
        config: &InstanceConfig,
        keystores: Arc<KeyStoreManager>,
        rootcerts: Arc<RootCertManager>,
        stats: Arc<StatsCollector>,
    ) -> Result<Self> {
        Ok(Self {
            core: ProxyCore::new(config, keystores, rootcerts, stats)?,
        })
    }

    /// Forget every detected target protocol
    pub fn clear_protocol_cache(&self) {
        self.core.snapshot().cache.clear();
    }

    /// Cached protocol of `target`, if still fresh
    pub fn cached_protocol(&self, target: &str) -> Option<ProtocolType> {
        self.core.snapshot().cache.get(target)
    }
}

async fn serve(inbound: TcpStream, ctx: ConnContext) -> Result<()> {
    let started = Instant::now();
    let config = Arc::clone(ctx.snapshot.config());

    let outbound = dial_resolved(&ctx.snapshot, &config.target).await?;
    debug!("[{}] {} -> {} over {}", config.name, ctx.peer, config.target, outbound.protocol());

    let outcome = pipe(ctx.shutdown.clone(), inbound, outbound, PipeOptions::from_config(&config)).await;
    ctx.record_transfer(started, &outcome);
    outcome.map(drop)
}

impl ClientProxy {
    fn launch(&self) -> impl Future<Output = Result<()>> + Send + '_ {
        self.core.start(|listener: TcpListener| listener, serve)
    }
}

impl_proxy!(ClientProxy);
