//! Server proxy
//!
//! Terminates TLCP/TLS on the listener and forwards the decrypted stream to
//! the target over plain TCP.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use tokio::net::TcpStream;

use crate::common::{connect_with_timeout, Result};
use crate::config::InstanceConfig;
use crate::security::{KeyStoreManager, RootCertManager};
use crate::stats::StatsCollector;
use super::auto::{ProtocolConn, ProtocolListener};
use super::engine::{impl_proxy, ConnContext, ProxyCore};
use super::pipe::{pipe, PipeOptions};

/// TLCP/TLS in, plain TCP out
#[derive(Debug)]
pub struct ServerProxy {
    core: ProxyCore,
}

impl ServerProxy {
    /// Create a stopped server proxy
    ///
    /// # Parameters
    ///
    /// * `config` - Instance configuration
    /// * `keystores` - Keystore registry consulted now and on every reload
    /// * `rootcerts` - Root certificate registry
    /// * `stats` - Collector the proxy reports to
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` if the declared protocol has no keystore.
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
}

/// Handshake, dial the target and pipe
async fn serve(mut conn: ProtocolConn<TcpStream>, ctx: ConnContext) -> Result<()> {
    let started = Instant::now();
    let protocol = conn.handshake().await?;

    let config = Arc::clone(conn.adapter().config());
    let target = connect_with_timeout(&config.target, config.timeout.dial()).await?;
    debug!("[{}] {} -> {} over {}", config.name, ctx.peer, config.target, protocol);

    let outcome = pipe(ctx.shutdown.clone(), conn, target, PipeOptions::from_config(&config)).await;
    ctx.record_transfer(started, &outcome);
    outcome.map(drop)
}

impl ServerProxy {
    fn launch(&self) -> impl Future<Output = Result<()>> + Send + '_ {
        let live = self.core.live();
        self.core.start(move |listener| ProtocolListener::new(listener, live), serve)
    }
}

impl_proxy!(ServerProxy);
