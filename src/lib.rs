//! TLCP Channel: TLCP/TLS proxy with automatic protocol detection
//!
//! This library implements a transport proxy that bridges the TLCP national
//! cryptography protocol, standard TLS and plain TCP/HTTP. A single listener
//! can serve both secure stacks by classifying each connection from its first
//! record header.
//!
//! # Main Features
//!
//! - Server, client, HTTP server and HTTP client proxies
//! - Per-connection TLCP/TLS auto-detection on inbound listeners
//! - Per-target protocol detection and caching on outbound dials
//! - Hot reload through an atomic configuration swap
//! - Lock-free traffic statistics mirrored to the `metrics` facade
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tlcp_channel::config::{InstanceConfig, InstanceType, KeyStoreConfig};
//! use tlcp_channel::instance::InstanceManager;
//! use tlcp_channel::security::{KeyStoreManager, RootCertManager};
//!
//! #[tokio::main]
//! async fn main() -> tlcp_channel::Result<()> {
//!     let keystores = Arc::new(KeyStoreManager::new());
//!     let mut site = KeyStoreConfig::default();
//!     site.name = Some("site".to_string());
//!     site.params.insert("cert".to_string(), "certs/server.crt".to_string());
//!     site.params.insert("key".to_string(), "certs/server.key".to_string());
//!     keystores.load(&site)?;
//!
//!     let manager = InstanceManager::new(keystores, Arc::new(RootCertManager::new()));
//!     let mut config = InstanceConfig::new("gateway", InstanceType::Server, "0.0.0.0:8443", "127.0.0.1:8080");
//!     config.tls.keystore = Some(KeyStoreConfig::named("site"));
//!
//!     let instance = manager.create(&config)?;
//!     instance.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop_all().await;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod instance;
pub mod protocol;
pub mod proxy;
pub mod security;
pub mod stats;
pub mod tls;

// Re-export commonly used structures and functions for convenience
pub use common::{parse_socket_addr, ProxyError, Result};
pub use instance::{Instance, InstanceManager, Status};
pub use protocol::ProtocolType;
pub use proxy::Proxy;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
