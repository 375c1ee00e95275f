//! Server-side protocol contexts

use std::fmt;
use std::pin::Pin;

use log::{debug, info};
use openssl::ssl::{
    Ssl, SslAcceptor, SslContext, SslContextBuilder, SslMethod, SslSessionCacheMode, SslVerifyMode,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};
use crate::config::cipher::{self, TLCP_CIPHER_SUITES};
use crate::config::{AuthMode, CipherSuite, ProtocolSettings};
use crate::protocol::ProtocolType;
use crate::security::{CertifiedKey, KeyStore, RootCertPool};
use super::ntls;

/// Accept-side context of one protocol
pub struct ServerContext {
    protocol: ProtocolType,
    context: SslContext,
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Protocol this context speaks (`Tlcp` or `Tls`)
    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    /// Run the server handshake on `stream`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Handshake` if the peer fails the handshake or TLCP
    /// is requested from a build without NTLS support.
    pub async fn accept<S>(&self, stream: S) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.protocol == ProtocolType::Tlcp && !ntls::AVAILABLE {
            return Err(ProxyError::Handshake(ntls::UNAVAILABLE_REASON.to_string()));
        }

        let ssl = Ssl::new(&self.context)?;
        let mut stream = SslStream::new(ssl, stream)?;

        Pin::new(&mut stream)
            .accept()
            .await
            .map_err(|e| ProxyError::Handshake(format!("{} accept failed: {}", self.protocol, e)))?;

        if let Some(cert) = stream.ssl().peer_certificate() {
            debug!("{} client certificate subject: {:?}", self.protocol, cert.subject_name());
        }
        Ok(stream)
    }
}

fn apply_client_auth(builder: &mut SslContextBuilder, auth: AuthMode, client_ca: Option<&RootCertPool>) -> Result<()> {
    match auth {
        AuthMode::Mutual => {
            let pool = client_ca.filter(|p| !p.is_empty()).ok_or_else(|| {
                ProxyError::Config("mutual authentication requires client-ca".to_string())
            })?;
            for cert in pool.certificates() {
                builder.add_client_ca(cert)?;
            }
            builder.set_cert_store(pool.to_store()?);
            builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        }
        AuthMode::OneWay | AuthMode::None => {
            builder.set_verify(SslVerifyMode::NONE);
        }
    }
    Ok(())
}

fn session_cache_mode(enabled: bool) -> SslSessionCacheMode {
    if enabled {
        SslSessionCacheMode::SERVER
    } else {
        SslSessionCacheMode::OFF
    }
}

/// Apply cipher and version settings of the TLS vocabulary
pub(crate) fn apply_tls_settings(builder: &mut SslContextBuilder, settings: &ProtocolSettings) -> Result<()> {
    let suites: Vec<CipherSuite> = cipher::parse_cipher_suites(ProtocolType::Tls, &settings.cipher_suites)?;
    let (tls13, legacy): (Vec<&CipherSuite>, Vec<&CipherSuite>) = suites.iter().partition(|s| s.tls13);

    if !legacy.is_empty() {
        let list = legacy.iter().map(|s| s.openssl_name).collect::<Vec<_>>().join(":");
        builder.set_cipher_list(&list)?;
    }
    if !tls13.is_empty() {
        let list = tls13.iter().map(|s| s.openssl_name).collect::<Vec<_>>().join(":");
        builder.set_ciphersuites(&list)?;
    }

    if let Some(min) = &settings.min_version {
        builder.set_min_proto_version(cipher::ssl_version(cipher::parse_version(ProtocolType::Tls, min)?))?;
    }
    if let Some(max) = &settings.max_version {
        builder.set_max_proto_version(cipher::ssl_version(cipher::parse_version(ProtocolType::Tls, max)?))?;
    }
    Ok(())
}

/// Resolve the TLCP cipher list, falling back to every known suite
pub(crate) fn tlcp_suites(settings: &ProtocolSettings) -> Result<Vec<CipherSuite>> {
    for version in settings.min_version.iter().chain(settings.max_version.iter()) {
        cipher::parse_version(ProtocolType::Tlcp, version)?;
    }
    if settings.cipher_suites.is_empty() {
        Ok(TLCP_CIPHER_SUITES.to_vec())
    } else {
        cipher::parse_cipher_suites(ProtocolType::Tlcp, &settings.cipher_suites)
    }
}

fn install_chain(builder: &mut SslContextBuilder, key: &CertifiedKey) -> Result<()> {
    builder.set_certificate(key.certificate())?;
    for cert in key.intermediates() {
        builder.add_extra_chain_cert(cert.clone())?;
    }
    builder.set_private_key(key.private_key())?;
    builder.check_private_key()?;
    Ok(())
}

/// Build the TLS accept context
pub fn build_tls_server(
    settings: &ProtocolSettings,
    keystore: &KeyStore,
    client_ca: Option<&RootCertPool>,
) -> Result<ServerContext> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    install_chain(&mut acceptor, keystore.sign())?;
    apply_tls_settings(&mut acceptor, settings)?;
    apply_client_auth(&mut acceptor, settings.auth, client_ca)?;
    acceptor.set_session_cache_mode(session_cache_mode(settings.session_cache));

    info!("TLS server context ready (keystore {}, auth {})", keystore.name(), settings.auth);
    Ok(ServerContext {
        protocol: ProtocolType::Tls,
        context: acceptor.build().into_context(),
    })
}

/// Build the TLCP accept context
///
/// The keystore must carry both the signing and the encryption pair.
pub fn build_tlcp_server(
    settings: &ProtocolSettings,
    keystore: &KeyStore,
    client_ca: Option<&RootCertPool>,
) -> Result<ServerContext> {
    let enc = keystore.enc().ok_or_else(|| {
        ProxyError::Config(format!(
            "TLCP keystore {} has no encryption certificate",
            keystore.name()
        ))
    })?;

    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
    ntls::configure(&mut builder, Some(keystore.sign()), Some(enc))?;
    ntls::set_cipher_list(&mut builder, &tlcp_suites(settings)?)?;
    apply_client_auth(&mut builder, settings.auth, client_ca)?;
    builder.set_session_cache_mode(session_cache_mode(settings.session_cache));

    if !ntls::AVAILABLE {
        info!("TLCP server context built without NTLS: TLCP handshakes will be refused");
    }
    info!("TLCP server context ready (keystore {}, auth {})", keystore.name(), settings.auth);
    Ok(ServerContext {
        protocol: ProtocolType::Tlcp,
        context: builder.build(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::testutil::{tlcp_keystore, tls_keystore};

    #[test]
    fn test_build_tls_server() {
        let (_, keystore) = tls_keystore("site");
        let ctx = build_tls_server(&ProtocolSettings::default(), &keystore, None).unwrap();
        assert_eq!(ctx.protocol(), ProtocolType::Tls);
    }

    #[test]
    fn test_mutual_requires_client_ca() {
        let (ca, keystore) = tls_keystore("site");
        let settings = ProtocolSettings {
            auth: AuthMode::Mutual,
            ..Default::default()
        };
        assert!(matches!(
            build_tls_server(&settings, &keystore, None),
            Err(ProxyError::Config(_))
        ));

        let pool = RootCertPool::new(vec![ca]);
        assert!(build_tls_server(&settings, &keystore, Some(&pool)).is_ok());
    }

    #[test]
    fn test_tls_settings_applied() {
        let (_, keystore) = tls_keystore("site");
        let settings = ProtocolSettings {
            min_version: Some("1.2".into()),
            max_version: Some("1.3".into()),
            cipher_suites: vec![
                "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256".into(),
                "TLS_AES_128_GCM_SHA256".into(),
            ],
            session_cache: false,
            ..Default::default()
        };
        assert!(build_tls_server(&settings, &keystore, None).is_ok());

        let bad = ProtocolSettings {
            cipher_suites: vec!["ECC_SM4_CBC_SM3".into()],
            ..Default::default()
        };
        assert!(build_tls_server(&bad, &keystore, None).is_err());
    }

    #[test]
    fn test_tlcp_server_needs_enc_pair() {
        let (_, tls_only) = tls_keystore("plain");
        assert!(matches!(
            build_tlcp_server(&ProtocolSettings::default(), &tls_only, None),
            Err(ProxyError::Config(_))
        ));

        let (_, gm) = tlcp_keystore("gm");
        let ctx = build_tlcp_server(&ProtocolSettings::default(), &gm, None).unwrap();
        assert_eq!(ctx.protocol(), ProtocolType::Tlcp);
    }
}
