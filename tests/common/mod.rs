//! Shared fixtures for integration tests
//!
//! Certificates are generated per test and written to a temporary directory,
//! then loaded through the same registries the binary uses.

#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tlcp_channel::config::{InstanceConfig, InstanceType, KeyStoreConfig, ProtocolSettings};
use tlcp_channel::security::{KeyStoreManager, RootCertManager, RootCertPool};
use tlcp_channel::tls::build_tls_client;

/// Generated certificate material and the registries holding it
pub struct Pki {
    pub dir: TempDir,
    pub ca: X509,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub keystores: Arc<KeyStoreManager>,
    pub rootcerts: Arc<RootCertManager>,
}

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn certificate(cn: &str, serial: u32, key: &PKey<Private>, issuer: Option<(&X509, &PKey<Private>)>) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(7).unwrap()).unwrap();

    match issuer {
        None => {
            builder.set_issuer_name(&name).unwrap();
            builder
                .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
                .unwrap();
            builder
                .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().unwrap())
                .unwrap();
            builder.sign(key, MessageDigest::sha256()).unwrap();
        }
        Some((ca, ca_key)) => {
            builder.set_issuer_name(ca.subject_name()).unwrap();
            builder
                .append_extension(KeyUsage::new().critical().digital_signature().key_agreement().build().unwrap())
                .unwrap();
            builder
                .append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build().unwrap())
                .unwrap();
            let san = SubjectAlternativeName::new()
                .dns("localhost")
                .ip("127.0.0.1")
                .build(&builder.x509v3_context(Some(ca), None))
                .unwrap();
            builder.append_extension(san).unwrap();
            builder.sign(ca_key, MessageDigest::sha256()).unwrap();
        }
    }
    builder.build()
}

/// CA plus a `localhost` leaf, registered as keystore `site` and root `root`
pub fn pki() -> Pki {
    let dir = tempfile::tempdir().unwrap();
    let ca_key = ec_key();
    let ca = certificate("tlcpchan integration root", 1, &ca_key, None);
    let key = ec_key();
    let leaf = certificate("localhost", 2, &key, Some((&ca, &ca_key)));

    let cert_path = dir.path().join("site.crt");
    let key_path = dir.path().join("site.key");
    let ca_path = dir.path().join("root.crt");
    fs::write(&cert_path, leaf.to_pem().unwrap()).unwrap();
    fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    fs::write(&ca_path, ca.to_pem().unwrap()).unwrap();

    let keystores = KeyStoreManager::new();
    let mut site = KeyStoreConfig::default();
    site.name = Some("site".to_string());
    site.params.insert("cert".to_string(), cert_path.to_string_lossy().into_owned());
    site.params.insert("key".to_string(), key_path.to_string_lossy().into_owned());
    keystores.load(&site).unwrap();

    let rootcerts = RootCertManager::new();
    rootcerts.load_file("root", &ca_path).unwrap();

    Pki {
        dir,
        ca,
        cert_path,
        key_path,
        ca_path,
        keystores: Arc::new(keystores),
        rootcerts: Arc::new(rootcerts),
    }
}

/// Server instance on an ephemeral port using keystore `site`
pub fn server_config(name: &str, target: SocketAddr) -> InstanceConfig {
    let mut config = InstanceConfig::new(name, InstanceType::Server, "127.0.0.1:0", target.to_string());
    config.tls.keystore = Some(KeyStoreConfig::named("site"));
    config
}

/// Client instance on an ephemeral port trusting root `root`
pub fn client_config(name: &str, target: SocketAddr) -> InstanceConfig {
    let mut config = InstanceConfig::new(name, InstanceType::Client, "127.0.0.1:0", target.to_string());
    config.server_ca = vec!["root".to_string()];
    config
}

/// Plain TCP echo server
pub async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Send `payload` over TLS to `addr` and return what comes back
pub async fn tls_roundtrip(addr: SocketAddr, ca: &X509, payload: &[u8]) -> Vec<u8> {
    let pool = RootCertPool::new(vec![ca.clone()]);
    let client = build_tls_client(&ProtocolSettings::default(), None, Some(&pool)).unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = client.connect("localhost", tcp).await.unwrap();

    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    stream.shutdown().await.unwrap();
    buf
}

/// Send `payload` over plain TCP to `addr` and return what comes back
pub async fn plain_roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    stream.shutdown().await.unwrap();
    buf
}
