//! Client-side protocol contexts

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use log::{debug, info, warn};
use openssl::ssl::{SslConnector, SslMethod, SslSession, SslSessionCacheMode, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};
use crate::config::cipher::TLCP_CIPHER_SUITES;
use crate::config::{AuthMode, CipherSuite, ProtocolSettings};
use crate::protocol::ProtocolType;
use crate::security::{KeyStore, RootCertPool};
use super::acceptor::{apply_tls_settings, tlcp_suites};
use super::ntls;

/// Dial-side context of one protocol
pub struct ClientContext {
    protocol: ProtocolType,
    connector: SslConnector,
    verify_hostname: bool,
    sessions: Option<Mutex<HashMap<String, SslSession>>>,
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("protocol", &self.protocol)
            .field("verify_hostname", &self.verify_hostname)
            .field("session_cache", &self.sessions.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientContext {
    fn new(protocol: ProtocolType, connector: SslConnector, settings: &ProtocolSettings) -> Self {
        Self {
            protocol,
            connector,
            verify_hostname: !settings.insecure_skip_verify,
            sessions: settings.session_cache.then(|| Mutex::new(HashMap::new())),
        }
    }

    /// Protocol this context speaks (`Tlcp` or `Tls`)
    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    /// Run the client handshake on `stream`
    ///
    /// `server_name` is sent as SNI and checked against the server certificate
    /// unless verification is disabled. A session from a previous handshake to
    /// the same name is offered for resumption.
    pub async fn connect<S>(&self, server_name: &str, stream: S) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.protocol == ProtocolType::Tlcp && !ntls::AVAILABLE {
            return Err(ProxyError::Handshake(ntls::UNAVAILABLE_REASON.to_string()));
        }

        let mut config = self.connector.configure()?;
        config.set_verify_hostname(self.verify_hostname);
        let mut ssl = config.into_ssl(server_name)?;

        if let Some(session) = self.cached_session(server_name) {
            // SAFETY: the session was produced by a handshake on this same
            // context, which is what set_session requires.
            unsafe { ssl.set_session(&session)? };
        }

        let mut stream = SslStream::new(ssl, stream)?;
        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|e| ProxyError::Handshake(format!("{} connect to {} failed: {}", self.protocol, server_name, e)))?;

        if stream.ssl().session_reused() {
            debug!("{} session resumed for {}", self.protocol, server_name);
        }
        self.store_session(server_name, &stream);
        Ok(stream)
    }

    fn cached_session(&self, server_name: &str) -> Option<SslSession> {
        let sessions = self.sessions.as_ref()?;
        sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_name)
            .cloned()
    }

    fn store_session<S>(&self, server_name: &str, stream: &SslStream<S>) {
        let (Some(sessions), Some(session)) = (self.sessions.as_ref(), stream.ssl().session()) else {
            return;
        };
        sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_name.to_string(), session.to_owned());
    }
}

fn require_client_keystore<'a>(
    protocol: ProtocolType,
    settings: &ProtocolSettings,
    keystore: Option<&'a KeyStore>,
) -> Result<Option<&'a KeyStore>> {
    match (settings.auth, keystore) {
        (AuthMode::Mutual, None) => Err(ProxyError::Config(format!(
            "{} mutual authentication requires a client keystore",
            protocol
        ))),
        (AuthMode::Mutual, Some(keystore)) => Ok(Some(keystore)),
        (_, keystore) => Ok(keystore),
    }
}

fn apply_server_verification(
    builder: &mut openssl::ssl::SslConnectorBuilder,
    settings: &ProtocolSettings,
    server_ca: Option<&RootCertPool>,
) -> Result<()> {
    if settings.insecure_skip_verify {
        warn!("Server certificate verification disabled");
        builder.set_verify(SslVerifyMode::NONE);
        return Ok(());
    }
    if let Some(pool) = server_ca.filter(|p| !p.is_empty()) {
        builder.set_cert_store(pool.to_store()?);
    }
    builder.set_verify(SslVerifyMode::PEER);
    Ok(())
}

fn session_cache_mode(enabled: bool) -> SslSessionCacheMode {
    if enabled {
        SslSessionCacheMode::CLIENT
    } else {
        SslSessionCacheMode::OFF
    }
}

/// Build the TLS dial context
///
/// Without `server_ca` the system trust store is used.
pub fn build_tls_client(
    settings: &ProtocolSettings,
    keystore: Option<&KeyStore>,
    server_ca: Option<&RootCertPool>,
) -> Result<ClientContext> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;

    apply_server_verification(&mut builder, settings, server_ca)?;
    if let Some(keystore) = require_client_keystore(ProtocolType::Tls, settings, keystore)? {
        let key = keystore.sign();
        builder.set_certificate(key.certificate())?;
        for cert in key.intermediates() {
            builder.add_extra_chain_cert(cert.clone())?;
        }
        builder.set_private_key(key.private_key())?;
        builder.check_private_key()?;
    }
    apply_tls_settings(&mut builder, settings)?;
    builder.set_session_cache_mode(session_cache_mode(settings.session_cache));

    info!("TLS client context ready (auth {})", settings.auth);
    Ok(ClientContext::new(ProtocolType::Tls, builder.build(), settings))
}

/// Cipher list offered by a TLCP client
///
/// ECDHE suites need the client encryption certificate, so without mutual
/// authentication the default offer is limited to the ECC suites.
pub(crate) fn tlcp_client_suites(settings: &ProtocolSettings) -> Result<Vec<CipherSuite>> {
    if settings.cipher_suites.is_empty() && settings.auth != AuthMode::Mutual {
        return Ok(TLCP_CIPHER_SUITES.iter().filter(|s| !s.is_ecdhe()).copied().collect());
    }
    tlcp_suites(settings)
}

/// Build the TLCP dial context
///
/// # Errors
///
/// Returns `ProxyError::Config` when an ECDHE suite is configured without
/// mutual authentication, or mutual authentication lacks a keystore with both
/// pairs.
pub fn build_tlcp_client(
    settings: &ProtocolSettings,
    keystore: Option<&KeyStore>,
    server_ca: Option<&RootCertPool>,
) -> Result<ClientContext> {
    let suites = tlcp_client_suites(settings)?;
    if settings.auth != AuthMode::Mutual {
        if let Some(suite) = suites.iter().find(|s| s.is_ecdhe()) {
            return Err(ProxyError::Config(format!(
                "TLCP cipher suite {} requires mutual authentication",
                suite.name
            )));
        }
    }

    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    apply_server_verification(&mut builder, settings, server_ca)?;

    match require_client_keystore(ProtocolType::Tlcp, settings, keystore)? {
        Some(keystore) => {
            let enc = keystore.enc().ok_or_else(|| {
                ProxyError::Config(format!(
                    "TLCP keystore {} has no encryption certificate",
                    keystore.name()
                ))
            })?;
            ntls::configure(&mut builder, Some(keystore.sign()), Some(enc))?;
        }
        None => ntls::configure(&mut builder, None, None)?,
    }
    ntls::set_cipher_list(&mut builder, &suites)?;
    builder.set_session_cache_mode(session_cache_mode(settings.session_cache));

    info!("TLCP client context ready (auth {})", settings.auth);
    Ok(ClientContext::new(ProtocolType::Tlcp, builder.build(), settings))
}
