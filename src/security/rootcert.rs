//! Trusted root certificates

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use log::info;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::X509;

use crate::common::{ProxyError, Result};

/// Set of trusted certificates selected for one instance
///
/// The same pool verifies TLS and TLCP peers; SM2 roots and RSA/ECDSA roots
/// live side by side in one OpenSSL store.
#[derive(Debug, Clone, Default)]
pub struct RootCertPool {
    certs: Vec<X509>,
}

impl RootCertPool {
    /// Pool from certificates
    pub fn new(certs: Vec<X509>) -> Self {
        Self { certs }
    }

    /// Number of certificates
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Certificates in the pool
    pub fn certificates(&self) -> &[X509] {
        &self.certs
    }

    /// Build an OpenSSL verification store
    pub fn to_store(&self) -> Result<X509Store> {
        let mut builder = X509StoreBuilder::new()?;
        for cert in &self.certs {
            builder.add_cert(cert.clone())?;
        }
        Ok(builder.build())
    }
}

/// Registry of named root certificates
#[derive(Debug, Default)]
pub struct RootCertManager {
    roots: RwLock<BTreeMap<String, Vec<X509>>>,
}

impl RootCertManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register certificates under `name`, replacing previous ones
    pub fn add(&self, name: impl Into<String>, certs: Vec<X509>) {
        let name = name.into();
        info!("Registered root certificate {} ({} cert(s))", name, certs.len());
        self.roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, certs);
    }

    /// Register every certificate of a PEM bundle
    pub fn add_pem(&self, name: impl Into<String>, pem: &[u8]) -> Result<usize> {
        let certs = X509::stack_from_pem(pem)
            .map_err(|e| ProxyError::KeyStore(format!("invalid root certificate PEM: {}", e)))?;
        if certs.is_empty() {
            return Err(ProxyError::KeyStore("no certificate in PEM bundle".to_string()));
        }
        let count = certs.len();
        self.add(name, certs);
        Ok(count)
    }

    /// Read a PEM bundle from disk
    pub fn load_file<P: AsRef<Path>>(&self, name: impl Into<String>, path: P) -> Result<usize> {
        let path = path.as_ref();
        let pem = fs::read(path)
            .map_err(|e| ProxyError::KeyStore(format!("failed to read {}: {}", path.display(), e)))?;
        self.add_pem(name, &pem)
    }

    /// Remove a root
    pub fn remove(&self, name: &str) -> bool {
        self.roots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Collect the named roots into a pool
    ///
    /// An empty `names` list selects every registered root.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` for the first unknown name.
    pub fn get_pool(&self, names: &[String]) -> Result<RootCertPool> {
        let roots = self.roots.read().unwrap_or_else(PoisonError::into_inner);

        if names.is_empty() {
            return Ok(RootCertPool::new(roots.values().flatten().cloned().collect()));
        }

        let mut certs = Vec::new();
        for name in names {
            let found = roots
                .get(name)
                .ok_or_else(|| ProxyError::NotFound(format!("root certificate {}", name)))?;
            certs.extend(found.iter().cloned());
        }
        Ok(RootCertPool::new(certs))
    }
}
