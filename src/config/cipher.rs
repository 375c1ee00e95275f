//! Cipher-suite and version vocabularies
//!
//! TLCP and TLS name their suites and versions differently. Configuration files
//! use the registry names (or their numeric ids); OpenSSL wants its own names.

use openssl::ssl::SslVersion;

use crate::common::{ProxyError, Result};
use crate::protocol::ProtocolType;

/// Record-layer version of TLCP (GB/T 38636)
pub const TLCP_VERSION: u16 = 0x0101;

/// One supported cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    /// Registry name used in configuration files
    pub name: &'static str,
    /// Two-byte suite id
    pub id: u16,
    /// Name understood by OpenSSL / Tongsuo
    pub openssl_name: &'static str,
    /// TLS 1.3 suites are configured separately from the cipher list
    pub tls13: bool,
}

impl CipherSuite {
    /// Whether the suite uses ephemeral ECDH key exchange
    pub fn is_ecdhe(&self) -> bool {
        self.name.contains("ECDHE")
    }
}

const fn suite(name: &'static str, id: u16, openssl_name: &'static str, tls13: bool) -> CipherSuite {
    CipherSuite { name, id, openssl_name, tls13 }
}

/// Suites of the TLCP vocabulary
pub const TLCP_CIPHER_SUITES: &[CipherSuite] = &[
    suite("ECDHE_SM4_CBC_SM3", 0xE011, "ECDHE-SM2-SM4-CBC-SM3", false),
    suite("ECC_SM4_CBC_SM3", 0xE013, "ECC-SM2-SM4-CBC-SM3", false),
    suite("ECDHE_SM4_GCM_SM3", 0xE051, "ECDHE-SM2-SM4-GCM-SM3", false),
    suite("ECC_SM4_GCM_SM3", 0xE053, "ECC-SM2-SM4-GCM-SM3", false),
];

/// Suites of the TLS vocabulary
pub const TLS_CIPHER_SUITES: &[CipherSuite] = &[
    suite("TLS_RSA_WITH_AES_128_CBC_SHA", 0x002F, "AES128-SHA", false),
    suite("TLS_RSA_WITH_AES_256_CBC_SHA", 0x0035, "AES256-SHA", false),
    suite("TLS_RSA_WITH_AES_128_CBC_SHA256", 0x003C, "AES128-SHA256", false),
    suite("TLS_RSA_WITH_AES_128_GCM_SHA256", 0x009C, "AES128-GCM-SHA256", false),
    suite("TLS_RSA_WITH_AES_256_GCM_SHA384", 0x009D, "AES256-GCM-SHA384", false),
    suite("TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA", 0xC009, "ECDHE-ECDSA-AES128-SHA", false),
    suite("TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA", 0xC00A, "ECDHE-ECDSA-AES256-SHA", false),
    suite("TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA", 0xC013, "ECDHE-RSA-AES128-SHA", false),
    suite("TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA", 0xC014, "ECDHE-RSA-AES256-SHA", false),
    suite("TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256", 0xC023, "ECDHE-ECDSA-AES128-SHA256", false),
    suite("TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256", 0xC027, "ECDHE-RSA-AES128-SHA256", false),
    suite("TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256", 0xC02B, "ECDHE-ECDSA-AES128-GCM-SHA256", false),
    suite("TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384", 0xC02C, "ECDHE-ECDSA-AES256-GCM-SHA384", false),
    suite("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", 0xC02F, "ECDHE-RSA-AES128-GCM-SHA256", false),
    suite("TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384", 0xC030, "ECDHE-RSA-AES256-GCM-SHA384", false),
    suite("TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256", 0xCCA8, "ECDHE-RSA-CHACHA20-POLY1305", false),
    suite("TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256", 0xCCA9, "ECDHE-ECDSA-CHACHA20-POLY1305", false),
    suite("TLS_AES_128_GCM_SHA256", 0x1301, "TLS_AES_128_GCM_SHA256", true),
    suite("TLS_AES_256_GCM_SHA384", 0x1302, "TLS_AES_256_GCM_SHA384", true),
    suite("TLS_CHACHA20_POLY1305_SHA256", 0x1303, "TLS_CHACHA20_POLY1305_SHA256", true),
];

fn vocabulary(protocol: ProtocolType) -> &'static [CipherSuite] {
    match protocol {
        ProtocolType::Tlcp => TLCP_CIPHER_SUITES,
        ProtocolType::Tls | ProtocolType::Auto => TLS_CIPHER_SUITES,
    }
}

/// Parse `0x1234` or `4660`
fn parse_numeric(s: &str) -> Option<u16> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Resolve configured cipher-suite names in the vocabulary of `protocol`
///
/// # Errors
///
/// Returns `ProxyError::Config` naming the first unknown entry.
pub fn parse_cipher_suites(protocol: ProtocolType, names: &[String]) -> Result<Vec<CipherSuite>> {
    let table = vocabulary(protocol);

    names
        .iter()
        .map(|name| {
            let found = match parse_numeric(name) {
                Some(id) => table.iter().find(|s| s.id == id),
                None => table.iter().find(|s| s.name.eq_ignore_ascii_case(name.trim())),
            };
            found.copied().ok_or_else(|| {
                ProxyError::Config(format!("unknown {} cipher suite: {}", protocol, name))
            })
        })
        .collect()
}

/// Parse a version name into its wire value
///
/// TLS accepts `1.0` to `1.3`; TLCP only `1.1`. Numeric forms are accepted too.
pub fn parse_version(protocol: ProtocolType, s: &str) -> Result<u16> {
    let trimmed = s.trim();
    let version = match (protocol, trimmed) {
        (ProtocolType::Tlcp, "1.1") => Some(TLCP_VERSION),
        (ProtocolType::Tlcp, _) => parse_numeric(trimmed).filter(|v| *v == TLCP_VERSION),
        (_, "1.0") => Some(0x0301),
        (_, "1.1") => Some(0x0302),
        (_, "1.2") => Some(0x0303),
        (_, "1.3") => Some(0x0304),
        _ => parse_numeric(trimmed).filter(|v| (0x0301..=0x0304).contains(v)),
    };

    version.ok_or_else(|| ProxyError::Config(format!("unknown {} version: {}", protocol, s)))
}

/// OpenSSL's name for a TLS wire version
pub fn ssl_version(version: u16) -> Option<SslVersion> {
    match version {
        0x0301 => Some(SslVersion::TLS1),
        0x0302 => Some(SslVersion::TLS1_1),
        0x0303 => Some(SslVersion::TLS1_2),
        0x0304 => Some(SslVersion::TLS1_3),
        _ => None,
    }
}
