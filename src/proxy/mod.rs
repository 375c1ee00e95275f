//! Proxy engine
//!
//! This module implements the four proxy kinds and the machinery they share:
//! the protocol adapter building TLCP/TLS contexts from an instance
//! configuration, the auto-classifying listener, the accept loop with its
//! shutdown barrier, and the bidirectional connection pipe.
//!
//! | Kind            | Inbound          | Outbound         |
//! |-----------------|------------------|------------------|
//! | `server`        | TLCP / TLS       | plain TCP        |
//! | `client`        | plain TCP        | TLCP / TLS       |
//! | `http-server`   | TLCP / TLS HTTP  | plain HTTP       |
//! | `http-client`   | plain HTTP       | TLCP / TLS HTTP  |

pub mod adapter;
pub mod auto;
pub mod cache;
pub mod client;
mod engine;
pub mod http;
pub mod pipe;
pub mod server;
pub mod vars;

pub use adapter::{validate_client_config, HealthCheckResult, SecureStream, TlcpAdapter};
pub use auto::{AdapterSource, ProtocolConn, ProtocolListener};
pub use cache::ProtocolCache;
pub use client::ClientProxy;
pub use engine::{Proxy, ProxySnapshot};
pub use self::http::{HttpClientProxy, HttpServerProxy};
pub use pipe::{is_normal_close, pipe, PipeOptions};
pub use server::ServerProxy;
pub use vars::Variables;
