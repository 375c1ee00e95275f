//! Configuration types
//!
//! This module contains the configuration types used throughout the application.
//! Every instance is described by one [`InstanceConfig`]; proxies receive it as an
//! immutable snapshot and never mutate it in place.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::ProxyError;
use crate::protocol::ProtocolType;
use super::defaults;

/// Deserialize any `FromStr` type from a string, ignoring case where the type does
fn deserialize_from_str<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// Kind of proxy an instance runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceType {
    /// Terminate TLCP/TLS, forward plain TCP
    Server,
    /// Accept plain TCP, originate TLCP/TLS
    Client,
    /// Terminate TLCP/TLS, forward HTTP requests
    HttpServer,
    /// Accept plain HTTP, forward requests over TLCP/TLS
    HttpClient,
}

impl InstanceType {
    /// Name as used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Server => "server",
            InstanceType::Client => "client",
            InstanceType::HttpServer => "http-server",
            InstanceType::HttpClient => "http-client",
        }
    }

    /// Whether the instance terminates the secure protocol on its listener
    pub fn is_server_role(&self) -> bool {
        matches!(self, InstanceType::Server | InstanceType::HttpServer)
    }

    /// Whether the instance speaks HTTP rather than raw TCP
    pub fn is_http(&self) -> bool {
        matches!(self, InstanceType::HttpServer | InstanceType::HttpClient)
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceType {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            "http-server" => Ok(Self::HttpServer),
            "http-client" => Ok(Self::HttpClient),
            _ => Err(ProxyError::Config(format!(
                "Invalid instance type: {}. Valid values are: server, client, http-server, http-client",
                s
            ))),
        }
    }
}

impl Serialize for InstanceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for InstanceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_from_str(deserializer)
    }
}

/// Peer authentication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthMode {
    /// No certificate checks on the peer
    None,
    /// Only the server presents a certificate
    #[default]
    OneWay,
    /// Both sides present certificates
    Mutual,
}

impl AuthMode {
    /// Name as used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::OneWay => "one-way",
            AuthMode::Mutual => "mutual",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "" | "one-way" => Ok(Self::OneWay),
            "mutual" => Ok(Self::Mutual),
            _ => Err(ProxyError::Config(format!(
                "Invalid auth mode: {}. Valid values are: none, one-way, mutual",
                s
            ))),
        }
    }
}

impl Serialize for AuthMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_from_str(deserializer)
    }
}

/// How a keystore reference is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyStoreLoader {
    /// Load PEM files listed in `params`
    #[default]
    File,
    /// Refer to a keystore registered under `params.name`
    Named,
}

impl fmt::Display for KeyStoreLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStoreLoader::File => f.write_str("file"),
            KeyStoreLoader::Named => f.write_str("named"),
        }
    }
}

impl FromStr for KeyStoreLoader {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "file" => Ok(Self::File),
            "named" => Ok(Self::Named),
            _ => Err(ProxyError::Config(format!(
                "Invalid keystore type: {}. Valid values are: file, named",
                s
            ))),
        }
    }
}

impl Serialize for KeyStoreLoader {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KeyStoreLoader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_from_str(deserializer)
    }
}

/// Keystore declaration, either top-level (named) or inline in an instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeyStoreConfig {
    /// Registry name; required at top level, optional inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Loader type
    #[serde(rename = "type", default)]
    pub loader: KeyStoreLoader,

    /// Loader parameters (`sign-cert`, `sign-key`, `enc-cert`, `enc-key`, `name`)
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl KeyStoreConfig {
    /// Reference to a keystore registered elsewhere
    pub fn named(name: impl Into<String>) -> Self {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), name.into());
        Self {
            name: None,
            loader: KeyStoreLoader::Named,
            params,
        }
    }

    /// Parameter lookup
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// Per-protocol security settings
///
/// The same shape is used for the `tlcp` and `tls` sections; cipher and version
/// names are interpreted in each protocol's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProtocolSettings {
    /// Peer authentication mode
    #[serde(default)]
    pub auth: AuthMode,

    /// Lowest accepted protocol version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,

    /// Highest accepted protocol version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,

    /// Cipher-suite allow-list; empty keeps the library defaults
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// Session cache toggle
    #[serde(default = "defaults::session_cache")]
    pub session_cache: bool,

    /// Skip server certificate verification (client role)
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Keystore holding this protocol's certificate(s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore: Option<KeyStoreConfig>,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            auth: AuthMode::default(),
            min_version: None,
            max_version: None,
            cipher_suites: Vec::new(),
            session_cache: defaults::session_cache(),
            insecure_skip_verify: false,
            keystore: None,
        }
    }
}

/// Timeouts, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimeoutConfig {
    /// Outbound connect timeout
    #[serde(default = "defaults::dial_timeout")]
    pub dial: u64,

    /// Handshake deadline, counted from the end of classification
    #[serde(default = "defaults::handshake_timeout")]
    pub handshake: u64,

    /// Idle read timeout while piping; unset means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<u64>,

    /// Idle write timeout while piping; unset means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial: defaults::dial_timeout(),
            handshake: defaults::handshake_timeout(),
            read: None,
            write: None,
        }
    }
}

impl TimeoutConfig {
    /// Dial timeout as a `Duration`
    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial)
    }

    /// Handshake timeout as a `Duration`
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake)
    }

    /// Read idle timeout, if any
    pub fn read(&self) -> Option<Duration> {
        self.read.map(Duration::from_secs)
    }

    /// Write idle timeout, if any
    pub fn write(&self) -> Option<Duration> {
        self.write.map(Duration::from_secs)
    }
}

/// Header rewrite rules
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HeaderRules {
    /// Headers appended to existing values
    #[serde(default)]
    pub add: BTreeMap<String, String>,

    /// Headers removed
    #[serde(default)]
    pub remove: Vec<String>,

    /// Headers replaced
    #[serde(default)]
    pub set: BTreeMap<String, String>,
}

impl HeaderRules {
    /// Whether there is nothing to apply
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.set.is_empty()
    }
}

/// HTTP settings for the http-server / http-client instance types
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpConfig {
    /// Rules applied to requests before forwarding
    #[serde(default)]
    pub request_headers: HeaderRules,

    /// Rules applied to responses before returning them
    #[serde(default)]
    pub response_headers: HeaderRules,
}

/// Configuration of one proxy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceConfig {
    /// Unique instance name
    pub name: String,

    /// Instance type
    #[serde(rename = "type")]
    pub instance_type: InstanceType,

    /// Transport protocol
    #[serde(default)]
    pub protocol: ProtocolType,

    /// Listen address (`host:port` or `:port`)
    pub listen: String,

    /// Target address (`host:port`)
    pub target: String,

    /// Whether `start_all` starts this instance
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// TLCP settings
    #[serde(default)]
    pub tlcp: ProtocolSettings,

    /// TLS settings
    #[serde(default)]
    pub tls: ProtocolSettings,

    /// Root certificates used to verify clients (server role)
    #[serde(default)]
    pub client_ca: Vec<String>,

    /// Root certificates used to verify servers (client role)
    #[serde(default)]
    pub server_ca: Vec<String>,

    /// Server name sent by the client role; defaults to the target host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,

    /// Timeouts
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Copy buffer size in bytes
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,

    /// HTTP header rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,
}

impl InstanceConfig {
    /// New configuration with every optional field at its default
    pub fn new(
        name: impl Into<String>,
        instance_type: InstanceType,
        listen: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instance_type,
            protocol: ProtocolType::default(),
            listen: listen.into(),
            target: target.into(),
            enabled: defaults::enabled(),
            tlcp: ProtocolSettings::default(),
            tls: ProtocolSettings::default(),
            client_ca: Vec::new(),
            server_ca: Vec::new(),
            sni: None,
            timeout: TimeoutConfig::default(),
            buffer_size: defaults::buffer_size(),
            http: None,
        }
    }

    /// Settings section of a concrete protocol
    ///
    /// `Auto` has no section of its own and maps to the TLS one.
    pub fn settings(&self, protocol: ProtocolType) -> &ProtocolSettings {
        match protocol {
            ProtocolType::Tlcp => &self.tlcp,
            ProtocolType::Tls | ProtocolType::Auto => &self.tls,
        }
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// Named root certificate file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RootCertConfig {
    /// Registry name referenced by `client-ca` / `server-ca`
    pub name: String,

    /// PEM file, may hold several certificates
    pub path: PathBuf,
}

/// Whole configuration file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    /// Logging
    #[serde(default)]
    pub log: LogConfig,

    /// Keystores registered at startup
    #[serde(default)]
    pub keystores: Vec<KeyStoreConfig>,

    /// Root certificates registered at startup
    #[serde(default)]
    pub root_certs: Vec<RootCertConfig>,

    /// Proxy instances
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}
