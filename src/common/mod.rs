//! Common module
//!
//! This module contains shared errors, logging setup and network helpers used
//! throughout the application.

pub mod error;
pub mod log;
pub mod net;

// Re-export commonly used types and functions
pub use error::{ProxyError, Result, Transferred};
pub use log::init_logger;
pub use net::{bind_listener, connect_with_timeout, parse_socket_addr, split_host_port};
