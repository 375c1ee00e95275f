//! Configuration module
//!
//! Declarative configuration of the channel: the file layout ([`AppConfig`]),
//! per-instance settings ([`InstanceConfig`]), defaults, loading, validation and
//! the cipher/version vocabularies of both protocol stacks.
//!
//! # Example
//!
//! ```no_run
//! use tlcp_channel::config::{load_config, InstanceConfig, InstanceType};
//!
//! # fn main() -> tlcp_channel::Result<()> {
//! let config = load_config("config.json")?;
//! for instance in &config.instances {
//!     println!("{} ({}) {} -> {}", instance.name, instance.instance_type, instance.listen, instance.target);
//! }
//!
//! let adhoc = InstanceConfig::new("local", InstanceType::Client, "127.0.0.1:9000", "example.com:443");
//! assert!(adhoc.enabled);
//! # Ok(())
//! # }
//! ```

pub mod cipher;
pub mod defaults;
pub mod loader;
pub mod types;
pub mod validator;

pub use cipher::{parse_cipher_suites, parse_version, CipherSuite, TLCP_VERSION};
pub use defaults::DEFAULT_CONFIG_FILE;
pub use loader::{load_config, parse_config};
pub use types::{
    AppConfig, AuthMode, HeaderRules, HttpConfig, InstanceConfig, InstanceType, KeyStoreConfig,
    KeyStoreLoader, LogConfig, ProtocolSettings, RootCertConfig, TimeoutConfig,
};
pub use validator::{validate_config, validate_instance};
