//! Protocol contexts
//!
//! Builds OpenSSL contexts for both sides of a channel. TLS uses the linked
//! OpenSSL directly; TLCP goes through the Tongsuo NTLS API (see [`ntls`]).

pub mod acceptor;
pub mod connector;
pub mod ntls;

pub use acceptor::{build_tlcp_server, build_tls_server, ServerContext};
pub use connector::{build_tlcp_client, build_tls_client, ClientContext};
