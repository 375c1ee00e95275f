//! Protocol adapter
//!
//! Turns one [`InstanceConfig`] plus the keystore and root-certificate
//! registries into the protocol contexts an instance needs: accept contexts
//! for the server role, dial contexts for the client role. An adapter is
//! immutable; reloading builds a new one.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::common::{connect_with_timeout, split_host_port, ProxyError, Result};
use crate::config::{cipher, AuthMode, InstanceConfig, ProtocolSettings};
use crate::protocol::ProtocolType;
use crate::security::{KeyStore, KeyStoreManager, RootCertManager, RootCertPool};
use crate::tls::{self, ntls, ClientContext, ServerContext};
use super::auto::ProtocolListener;

enum Contexts {
    Server {
        tlcp: Option<ServerContext>,
        tls: Option<ServerContext>,
    },
    Client {
        tlcp: Option<ClientContext>,
        tls: Option<ClientContext>,
    },
}

/// Ready-to-use protocol contexts of one instance configuration
pub struct TlcpAdapter {
    config: Arc<InstanceConfig>,
    contexts: Contexts,
}

impl fmt::Debug for TlcpAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (role, tlcp, tls) = match &self.contexts {
            Contexts::Server { tlcp, tls } => ("server", tlcp.is_some(), tls.is_some()),
            Contexts::Client { tlcp, tls } => ("client", tlcp.is_some(), tls.is_some()),
        };
        f.debug_struct("TlcpAdapter")
            .field("instance", &self.config.name)
            .field("protocol", &self.config.protocol)
            .field("role", &role)
            .field("tlcp", &tlcp)
            .field("tls", &tls)
            .finish()
    }
}

/// Outcome of a health probe against the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HealthCheckResult {
    /// Protocol probed
    pub protocol: ProtocolType,
    /// Whether connect and handshake succeeded
    pub success: bool,
    /// Time spent, in milliseconds
    pub latency_ms: u64,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reject client configurations that cannot work
///
/// TLCP ECDHE key exchange needs the client's encryption certificate, so those
/// suites are only usable with mutual authentication.
pub fn validate_client_config(config: &InstanceConfig) -> Result<()> {
    if !config.protocol.allows_tlcp() {
        return Ok(());
    }
    let suites = cipher::parse_cipher_suites(ProtocolType::Tlcp, &config.tlcp.cipher_suites)?;
    if config.tlcp.auth != AuthMode::Mutual {
        if let Some(suite) = suites.iter().find(|s| s.is_ecdhe()) {
            return Err(ProxyError::Config(format!(
                "{}: TLCP cipher suite {} requires mutual authentication (auth is {})",
                config.name, suite.name, config.tlcp.auth
            )));
        }
    }
    Ok(())
}

fn load_keystore(keystores: &KeyStoreManager, settings: &ProtocolSettings) -> Result<Option<Arc<KeyStore>>> {
    settings.keystore.as_ref().map(|ks| keystores.load(ks)).transpose()
}

fn root_pool(rootcerts: &RootCertManager, names: &[String]) -> Result<Option<RootCertPool>> {
    if names.is_empty() {
        return Ok(None);
    }
    rootcerts.get_pool(names).map(Some)
}

impl TlcpAdapter {
    /// Build the contexts for `config`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` when the declared protocol has no keystore
    /// (for `auto`, when neither protocol has one), and passes on keystore,
    /// root-certificate and OpenSSL failures.
    pub fn build(config: &InstanceConfig, keystores: &KeyStoreManager, rootcerts: &RootCertManager) -> Result<Self> {
        let contexts = if config.instance_type.is_server_role() {
            Self::build_server(config, keystores, rootcerts)?
        } else {
            Self::build_client(config, keystores, rootcerts)?
        };

        debug!("Adapter built for {} ({} {})", config.name, config.instance_type, config.protocol);
        Ok(Self {
            config: Arc::new(config.clone()),
            contexts,
        })
    }

    fn build_server(
        config: &InstanceConfig,
        keystores: &KeyStoreManager,
        rootcerts: &RootCertManager,
    ) -> Result<Contexts> {
        let protocol = config.protocol;
        let client_ca = root_pool(rootcerts, &config.client_ca)?;

        let tlcp_keystore = match protocol.allows_tlcp() {
            true => load_keystore(keystores, &config.tlcp)?,
            false => None,
        };
        let tls_keystore = match protocol.allows_tls() {
            true => load_keystore(keystores, &config.tls)?,
            false => None,
        };

        match (protocol, &tlcp_keystore, &tls_keystore) {
            (ProtocolType::Tlcp, None, _) => {
                return Err(ProxyError::Config(format!("{}: protocol tlcp requires a TLCP keystore", config.name)))
            }
            (ProtocolType::Tls, _, None) => {
                return Err(ProxyError::Config(format!("{}: protocol tls requires a TLS keystore", config.name)))
            }
            (ProtocolType::Auto, None, None) => {
                return Err(ProxyError::Config(format!(
                    "{}: protocol auto requires a TLCP or TLS keystore",
                    config.name
                )))
            }
            _ => {}
        }

        let tlcp = tlcp_keystore
            .map(|ks| tls::build_tlcp_server(&config.tlcp, &ks, client_ca.as_ref()))
            .transpose()?;
        let tls = tls_keystore
            .map(|ks| tls::build_tls_server(&config.tls, &ks, client_ca.as_ref()))
            .transpose()?;

        Ok(Contexts::Server { tlcp, tls })
    }

    fn build_client(
        config: &InstanceConfig,
        keystores: &KeyStoreManager,
        rootcerts: &RootCertManager,
    ) -> Result<Contexts> {
        validate_client_config(config)?;
        let protocol = config.protocol;
        let server_ca = root_pool(rootcerts, &config.server_ca)?;

        let client_keystore = |settings: &ProtocolSettings| match settings.auth {
            AuthMode::Mutual => load_keystore(keystores, settings),
            _ => Ok(None),
        };

        let tlcp = if protocol.allows_tlcp() {
            let keystore = client_keystore(&config.tlcp)?;
            Some(tls::build_tlcp_client(&config.tlcp, keystore.as_deref(), server_ca.as_ref())?)
        } else {
            None
        };
        let tls = if protocol.allows_tls() {
            let keystore = client_keystore(&config.tls)?;
            Some(tls::build_tls_client(&config.tls, keystore.as_deref(), server_ca.as_ref())?)
        } else {
            None
        };

        Ok(Contexts::Client { tlcp, tls })
    }

    /// Configuration the adapter was built from
    pub fn config(&self) -> &Arc<InstanceConfig> {
        &self.config
    }

    /// Declared protocol
    pub fn protocol(&self) -> ProtocolType {
        self.config.protocol
    }

    /// Whether this adapter accepts (server role) rather than dials
    pub fn is_server(&self) -> bool {
        matches!(self.contexts, Contexts::Server { .. })
    }

    /// Handshake deadline
    pub fn handshake_timeout(&self) -> Duration {
        self.config.timeout.handshake()
    }

    /// Accept context for a classified protocol
    pub fn server_context(&self, protocol: ProtocolType) -> Option<&ServerContext> {
        match (&self.contexts, protocol) {
            (Contexts::Server { tlcp, .. }, ProtocolType::Tlcp) => tlcp.as_ref(),
            (Contexts::Server { tls, .. }, ProtocolType::Tls) => tls.as_ref(),
            _ => None,
        }
    }

    /// Dial context for a concrete protocol
    pub fn client_context(&self, protocol: ProtocolType) -> Option<&ClientContext> {
        match (&self.contexts, protocol) {
            (Contexts::Client { tlcp, .. }, ProtocolType::Tlcp) => tlcp.as_ref(),
            (Contexts::Client { tls, .. }, ProtocolType::Tls) => tls.as_ref(),
            _ => None,
        }
    }

    /// Wrap a bound listener so accepted connections speak the declared protocol
    ///
    /// The listener keeps this adapter; a live proxy instead builds a
    /// [`ProtocolListener`] over its swappable state.
    pub fn wrap_listener(self: &Arc<Self>, listener: TcpListener) -> ProtocolListener<Arc<TlcpAdapter>> {
        ProtocolListener::new(listener, Arc::clone(self))
    }

    /// Server name sent when dialing
    fn server_name(&self, addr: &str) -> String {
        match &self.config.sni {
            Some(sni) if !sni.is_empty() => sni.clone(),
            _ => split_host_port(addr).0,
        }
    }

    /// Connect to `addr` and run the client handshake
    ///
    /// `Auto` tries TLCP first and falls back to TLS.
    ///
    /// # Errors
    ///
    /// `ProxyError::Dial` when the target cannot be reached (or, for `Auto`,
    /// when both attempts failed), `ProxyError::Handshake` when a fixed-protocol
    /// handshake fails.
    pub async fn dial(&self, addr: &str, protocol: ProtocolType) -> Result<SecureStream> {
        match protocol {
            ProtocolType::Tlcp | ProtocolType::Tls => self.dial_with(addr, protocol).await,
            ProtocolType::Auto => match self.dial_with(addr, ProtocolType::Tlcp).await {
                Ok(stream) => Ok(stream),
                Err(tlcp_err) => {
                    debug!("TLCP dial to {} failed, trying TLS: {}", addr, tlcp_err);
                    self.dial_with(addr, ProtocolType::Tls).await.map_err(|tls_err| {
                        ProxyError::Dial(format!("{}: tlcp: {}; tls: {}", addr, tlcp_err, tls_err))
                    })
                }
            },
        }
    }

    async fn dial_with(&self, addr: &str, protocol: ProtocolType) -> Result<SecureStream> {
        let ctx = self
            .client_context(protocol)
            .ok_or_else(|| ProxyError::Dial(format!("no {} client context for {}", protocol, self.config.name)))?;
        if protocol == ProtocolType::Tlcp && !ntls::AVAILABLE {
            return Err(ProxyError::Handshake(ntls::UNAVAILABLE_REASON.to_string()));
        }

        let tcp = connect_with_timeout(addr, self.config.timeout.dial()).await?;
        let server_name = self.server_name(addr);
        let handshake_timeout = self.handshake_timeout();

        let stream = timeout(handshake_timeout, ctx.connect(&server_name, tcp))
            .await
            .map_err(|_| {
                ProxyError::Handshake(format!("{} handshake with {} timed out after {:?}", protocol, addr, handshake_timeout))
            })??;

        debug!("{} connection to {} established", protocol, addr);
        Ok(SecureStream { protocol, inner: stream })
    }

    /// Probe the configured target with one protocol
    pub async fn check_health(&self, protocol: ProtocolType, limit: Duration) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = match protocol {
            ProtocolType::Auto => Err(ProxyError::Config("health check needs tlcp or tls".to_string())),
            _ if self.is_server() => Err(ProxyError::Config(
                "health check needs a client-role instance".to_string(),
            )),
            _ => timeout(limit, self.dial_with(&self.config.target, protocol))
                .await
                .unwrap_or_else(|_| Err(ProxyError::Dial(format!("timed out after {:?}", limit))))
                .map(drop),
        };

        let result = HealthCheckResult {
            protocol,
            success: outcome.is_ok(),
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error: outcome.err().map(|e| e.to_string()),
        };
        info!(
            "Health check {} {} -> {}: {}",
            self.config.name,
            protocol,
            self.config.target,
            if result.success { "ok" } else { "failed" }
        );
        result
    }
}

/// Client connection after a successful handshake
pub struct SecureStream {
    protocol: ProtocolType,
    inner: SslStream<TcpStream>,
}

impl fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStream")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl SecureStream {
    /// Protocol the handshake ran
    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    /// Underlying TLS stream
    pub fn get_ref(&self) -> &SslStream<TcpStream> {
        &self.inner
    }

    /// Unwrap the TLS stream
    pub fn into_inner(self) -> SslStream<TcpStream> {
        self.inner
    }
}

impl AsyncRead for SecureStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
