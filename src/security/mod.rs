//! Certificate material
//!
//! Keystores (certificate chain plus key, and for TLCP a second encryption pair)
//! and trusted root certificate pools, both kept in name-keyed registries that
//! protocol adapters consult when they are built.

pub mod keystore;
pub mod rootcert;

#[cfg(test)]
pub(crate) mod testutil;

pub use keystore::{CertifiedKey, KeyStore, KeyStoreManager};
pub use rootcert::{RootCertManager, RootCertPool};
