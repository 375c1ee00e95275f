//! Protocol identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::ProxyError;

/// Transport security protocol of an instance or a connection
///
/// `Auto` is only meaningful in configuration: a classified connection is
/// always `Tlcp` or `Tls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolType {
    /// Detect per connection (server) or per target (client)
    #[default]
    Auto,
    /// National commercial-cryptography transport protocol
    Tlcp,
    /// Standard TLS
    Tls,
}

impl ProtocolType {
    /// Protocol name as used in configuration files and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Auto => "auto",
            ProtocolType::Tlcp => "tlcp",
            ProtocolType::Tls => "tls",
        }
    }

    /// Whether connections of this type may run the TLCP handshake
    pub fn allows_tlcp(&self) -> bool {
        matches!(self, ProtocolType::Auto | ProtocolType::Tlcp)
    }

    /// Whether connections of this type may run the TLS handshake
    pub fn allows_tls(&self) -> bool {
        matches!(self, ProtocolType::Auto | ProtocolType::Tls)
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "tlcp" => Ok(Self::Tlcp),
            "tls" => Ok(Self::Tls),
            _ => Err(ProxyError::Config(format!(
                "Invalid protocol: {}. Valid values are: auto, tlcp, tls",
                s
            ))),
        }
    }
}

impl Serialize for ProtocolType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProtocolType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
