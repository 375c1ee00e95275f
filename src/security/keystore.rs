//! Keystores
//!
//! A keystore is a loaded certificate chain plus private key. TLCP keystores
//! carry a second pair: the signing pair authenticates the peer, the encryption
//! pair is used for key exchange.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::common::{ProxyError, Result};
use crate::config::{KeyStoreConfig, KeyStoreLoader};
use crate::protocol::ProtocolType;

/// Certificate chain (leaf first) with the leaf's private key
#[derive(Clone)]
pub struct CertifiedKey {
    chain: Vec<X509>,
    key: PKey<Private>,
}

impl CertifiedKey {
    /// Pair a chain with its key, checking that the key belongs to the leaf
    pub fn new(chain: Vec<X509>, key: PKey<Private>) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| ProxyError::KeyStore("certificate chain is empty".to_string()))?;

        if !leaf.public_key()?.public_eq(&key) {
            return Err(ProxyError::KeyStore(
                "private key does not match the certificate".to_string(),
            ));
        }

        Ok(Self { chain, key })
    }

    /// Parse PEM encoded certificate chain and private key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = X509::stack_from_pem(cert_pem)
            .map_err(|e| ProxyError::KeyStore(format!("invalid certificate PEM: {}", e)))?;
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| ProxyError::KeyStore(format!("invalid private key PEM: {}", e)))?;
        Self::new(chain, key)
    }

    /// Read PEM files
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(cert_path: P, key_path: Q) -> Result<Self> {
        let read = |path: &Path| {
            fs::read(path).map_err(|e| {
                ProxyError::KeyStore(format!("failed to read {}: {}", path.display(), e))
            })
        };
        Self::from_pem(&read(cert_path.as_ref())?, &read(key_path.as_ref())?)
    }

    /// Leaf certificate
    pub fn certificate(&self) -> &X509 {
        &self.chain[0]
    }

    /// Certificates after the leaf
    pub fn intermediates(&self) -> &[X509] {
        &self.chain[1..]
    }

    /// Private key of the leaf
    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }
}

impl fmt::Debug for CertifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedKey")
            .field("subject", &self.certificate().subject_name())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Named certificate bundle
#[derive(Debug, Clone)]
pub struct KeyStore {
    name: String,
    protocol: ProtocolType,
    sign: CertifiedKey,
    enc: Option<CertifiedKey>,
}

impl KeyStore {
    /// Standard TLS keystore
    pub fn tls(name: impl Into<String>, key: CertifiedKey) -> Self {
        Self {
            name: name.into(),
            protocol: ProtocolType::Tls,
            sign: key,
            enc: None,
        }
    }

    /// TLCP keystore with signing and encryption pairs
    pub fn tlcp(name: impl Into<String>, sign: CertifiedKey, enc: CertifiedKey) -> Self {
        Self {
            name: name.into(),
            protocol: ProtocolType::Tlcp,
            sign,
            enc: Some(enc),
        }
    }

    /// Registry name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol this keystore was built for
    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    /// Signing (or only) pair
    pub fn sign(&self) -> &CertifiedKey {
        &self.sign
    }

    /// Encryption pair, TLCP only
    pub fn enc(&self) -> Option<&CertifiedKey> {
        self.enc.as_ref()
    }

    /// Load from `file` loader parameters
    ///
    /// `sign-cert`/`sign-key` (aliases `cert`/`key`) are required. `enc-cert` and
    /// `enc-key` make it a TLCP keystore.
    pub fn from_params(name: &str, params: &KeyStoreConfig) -> Result<Self> {
        let param = |primary: &str, alias: &str| {
            params
                .param(primary)
                .or_else(|| params.param(alias))
                .ok_or_else(|| ProxyError::KeyStore(format!("keystore {}: missing param {}", name, primary)))
        };

        let sign = CertifiedKey::load(param("sign-cert", "cert")?, param("sign-key", "key")?)?;

        match (params.param("enc-cert"), params.param("enc-key")) {
            (Some(cert), Some(key)) => Ok(Self::tlcp(name, sign, CertifiedKey::load(cert, key)?)),
            (None, None) => Ok(Self::tls(name, sign)),
            _ => Err(ProxyError::KeyStore(format!(
                "keystore {}: enc-cert and enc-key must be given together",
                name
            ))),
        }
    }
}

/// Registry of loaded keystores
#[derive(Debug, Default)]
pub struct KeyStoreManager {
    stores: RwLock<HashMap<String, Arc<KeyStore>>>,
}

impl KeyStoreManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a keystore under its own name
    pub fn register(&self, keystore: KeyStore) -> Arc<KeyStore> {
        let keystore = Arc::new(keystore);
        info!("Registered {} keystore {}", keystore.protocol(), keystore.name());
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(keystore.name().to_string(), Arc::clone(&keystore));
        keystore
    }

    /// Look a keystore up by name
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` if nothing is registered under `name`.
    pub fn get_keystore(&self, name: &str) -> Result<Arc<KeyStore>> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("keystore {}", name)))
    }

    /// Remove a keystore; instances already built keep their copy
    pub fn remove(&self, name: &str) -> Option<Arc<KeyStore>> {
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolve a keystore declaration
    ///
    /// `named` references are looked up; `file` declarations are loaded and,
    /// when they carry a name, registered.
    pub fn load(&self, config: &KeyStoreConfig) -> Result<Arc<KeyStore>> {
        match config.loader {
            KeyStoreLoader::Named => {
                let name = config.param("name").ok_or_else(|| {
                    ProxyError::Config("named keystore reference requires params.name".to_string())
                })?;
                self.get_keystore(name)
            }
            KeyStoreLoader::File => {
                let name = config.name.as_deref().unwrap_or("inline");
                let keystore = KeyStore::from_params(name, config)?;
                debug!("Loaded keystore {} from files", name);
                match config.name {
                    Some(_) => Ok(self.register(keystore)),
                    None => Ok(Arc::new(keystore)),
                }
            }
        }
    }
}
